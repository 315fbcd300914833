//! Trigger demultiplexing of ramp-mode acquisition blocks.
//!
//! A ramp line is one go/return cycle recorded on two channels: photodiode
//! intensity and the stage's trigger output. The trigger is high while the
//! spot is inside the scanned range, once per direction, so the forward
//! ("gone") and backward ("back") profiles are cut out between trigger
//! edges and then box-averaged down to the pixel count.

use ndarray::{s, Array1, ArrayView1, ArrayView2};

use crate::error::DemuxError;

/// First-difference magnitude that counts as a trigger edge (V).
pub const EDGE_THRESHOLD: f64 = 1.5;

/// Trigger edge positions.
///
/// An edge index `i` refers to the first difference `t[i+1] - t[i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Edges {
    pub rising: Vec<usize>,
    pub falling: Vec<usize>,
}

/// Forward and backward intensity segments of one line, in acquisition order.
#[derive(Debug, Clone, PartialEq)]
pub struct LineProfile {
    pub gone: Array1<f64>,
    pub back: Array1<f64>,
}

impl LineProfile {
    /// Box-average both segments to `bins` points.
    pub fn binned(&self, bins: usize) -> Result<LineProfile, DemuxError> {
        Ok(LineProfile {
            gone: box_average(self.gone.view(), bins)?,
            back: box_average(self.back.view(), bins)?,
        })
    }
}

/// Rising and falling edges of `trigger`.
pub fn find_edges(trigger: ArrayView1<f64>) -> Edges {
    let mut edges = Edges::default();
    for (i, pair) in trigger.iter().zip(trigger.iter().skip(1)).enumerate() {
        let diff = pair.1 - pair.0;
        if diff > EDGE_THRESHOLD {
            edges.rising.push(i);
        } else if diff < -EDGE_THRESHOLD {
            edges.falling.push(i);
        }
    }
    edges
}

fn first_after(edges: &[usize], bound: f64) -> Option<usize> {
    edges.iter().copied().find(|&e| e as f64 > bound)
}

/// Split one go/return record into its gone and back segments.
///
/// With `L` the record length: `r0` is the first rising edge, `f0` the
/// first falling edge more than `L/6` after `r0`, `r1` the first rising edge
/// more than `L/3` after `r0` and `f1` the first falling edge more than `L/3`
/// after `f0`. The result is `gone = samples[r0..f0]`,
/// `back = samples[r1..f1]`.
pub fn demux(
    samples: ArrayView1<f64>,
    trigger: ArrayView1<f64>,
) -> Result<LineProfile, DemuxError> {
    if samples.len() != trigger.len() {
        return Err(DemuxError::LengthMismatch {
            samples: samples.len(),
            trigger: trigger.len(),
        });
    }

    let len = trigger.len();
    let edges = find_edges(trigger);
    let missing = |which| DemuxError::MissingEdge {
        which,
        rising: edges.rising.len(),
        falling: edges.falling.len(),
        len,
    };

    let l = len as f64;
    let r0 = *edges.rising.first().ok_or_else(|| missing("first rising"))?;
    let f0 = first_after(&edges.falling, r0 as f64 + l / 6.0)
        .ok_or_else(|| missing("forward falling"))?;
    let r1 = first_after(&edges.rising, r0 as f64 + l / 3.0)
        .ok_or_else(|| missing("return rising"))?;
    let f1 = first_after(&edges.falling, f0 as f64 + l / 3.0)
        .ok_or_else(|| missing("return falling"))?;
    if r1 >= f1 {
        return Err(missing("return falling"));
    }

    Ok(LineProfile {
        gone: samples.slice(s![r0..f0]).to_owned(),
        back: samples.slice(s![r1..f1]).to_owned(),
    })
}

/// Demux a `(2, n)` block whose rows are `[intensity, trigger]`.
pub fn demux_block(block: ArrayView2<f64>) -> Result<LineProfile, DemuxError> {
    if block.nrows() != 2 {
        return Err(DemuxError::ChannelCount {
            expected: 2,
            got: block.nrows(),
        });
    }
    demux(block.row(0), block.row(1))
}

/// Average `profile` into exactly `bins` points.
///
/// Chunks are `floor(len / bins)` samples long; the remainder at the end is
/// discarded.
pub fn box_average(profile: ArrayView1<f64>, bins: usize) -> Result<Array1<f64>, DemuxError> {
    let len = profile.len();
    if bins == 0 || len < bins {
        return Err(DemuxError::TooShort { len, bins });
    }
    let chunk = len / bins;
    Ok(Array1::from_iter((0..bins).map(|i| {
        profile.slice(s![i * chunk..(i + 1) * chunk]).sum() / chunk as f64
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array1;

    /// Trigger with edges at the given first-difference indices.
    fn trigger_with(len: usize, windows: &[(usize, usize)]) -> Array1<f64> {
        let mut trigger = Array1::zeros(len);
        for &(rise, fall) in windows {
            trigger.slice_mut(s![rise + 1..=fall]).fill(5.0);
        }
        trigger
    }

    #[test]
    fn test_find_edges() {
        let trigger = trigger_with(1000, &[(10, 200), (400, 700)]);
        let edges = find_edges(trigger.view());
        assert_eq!(edges.rising, vec![10, 400]);
        assert_eq!(edges.falling, vec![200, 700]);
    }

    #[test]
    fn test_demux_pairs_edges() {
        let samples = Array1::from_iter((0..1000).map(|i| i as f64));
        let trigger = trigger_with(1000, &[(10, 200), (400, 700)]);
        let profile = demux(samples.view(), trigger.view()).unwrap();

        assert_eq!(profile.gone.len(), 190);
        assert_eq!(profile.back.len(), 300);
        assert_relative_eq!(profile.gone[0], 10.0);
        assert_relative_eq!(profile.gone[189], 199.0);
        assert_relative_eq!(profile.back[0], 400.0);
        assert_relative_eq!(profile.back[299], 699.0);
    }

    #[test]
    fn test_demux_ignores_glitch_edges() {
        // A short glitch right after the first rise must not close the forward window
        let samples = Array1::from_iter((0..1000).map(|i| i as f64));
        let trigger = trigger_with(1000, &[(10, 20), (22, 200), (400, 700)]);
        let profile = demux(samples.view(), trigger.view()).unwrap();
        assert_relative_eq!(profile.gone[0], 10.0);
        assert_eq!(profile.gone.len(), 190);
    }

    #[test]
    fn test_demux_missing_edges() {
        let samples = Array1::zeros(1000);
        let flat = Array1::zeros(1000);
        assert!(matches!(
            demux(samples.view(), flat.view()),
            Err(DemuxError::MissingEdge { which: "first rising", .. })
        ));

        let one_window = trigger_with(1000, &[(10, 200)]);
        assert!(matches!(
            demux(samples.view(), one_window.view()),
            Err(DemuxError::MissingEdge { rising: 1, falling: 1, .. })
        ));
    }

    #[test]
    fn test_demux_length_mismatch() {
        let samples = Array1::zeros(10);
        let trigger = Array1::zeros(12);
        assert_eq!(
            demux(samples.view(), trigger.view()),
            Err(DemuxError::LengthMismatch {
                samples: 10,
                trigger: 12
            })
        );
    }

    #[test]
    fn test_demux_block_checks_channels() {
        let block = ndarray::Array2::<f64>::zeros((3, 100));
        assert_eq!(
            demux_block(block.view()),
            Err(DemuxError::ChannelCount {
                expected: 2,
                got: 3
            })
        );
    }

    #[test]
    fn test_box_average_exact_length() {
        for len in [34, 35, 100, 190, 299, 1001] {
            let profile = Array1::from_iter((0..len).map(|i| i as f64));
            let binned = box_average(profile.view(), 34).unwrap();
            assert_eq!(binned.len(), 34);
        }
    }

    #[test]
    fn test_box_average_drops_tail() {
        let profile = Array1::from(vec![1.0, 3.0, 5.0, 7.0, 100.0]);
        let binned = box_average(profile.view(), 2).unwrap();
        assert_relative_eq!(binned[0], 2.0);
        assert_relative_eq!(binned[1], 6.0);
    }

    #[test]
    fn test_box_average_too_short() {
        let profile = Array1::from(vec![1.0, 2.0]);
        assert_eq!(
            box_average(profile.view(), 3),
            Err(DemuxError::TooShort { len: 2, bins: 3 })
        );
    }
}
