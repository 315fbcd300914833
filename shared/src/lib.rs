//! Shared components for the confocal scan engine.
//!
//! Currently this is the persistence layer: a [`PersistenceSink`] trait that
//! the scan controller writes its products through, a filesystem-backed
//! [`DirectorySink`], and an in-memory [`RecordingSink`] for tests.

pub mod persistence;

pub use persistence::{
    DirectorySink, PersistError, PersistResult, PersistenceSink, RecordingSink, SavedProduct,
};
