//! Matte quality scoring, weighted toward the transition band between
//! foreground and background where refinement matters most.

use crate::error::{MattingError, MattingResult};
use ndarray::{Array2, ArrayView2, Zip};

/// Ground-truth values inside `(th, 1 - th)` count as transition
pub const TRANSITION_THRESHOLD: f32 = 0.05;
/// Side of the square structuring element used to close the transition band
pub const CLOSING_SIZE: usize = 5;
/// Weight of the transition band relative to the rest of the frame
pub const TRANSITION_WEIGHT: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LossKind {
    /// Mean absolute error
    L1,
    /// Mean squared error
    Mse,
}

impl LossKind {
    fn apply(self, diff: f32) -> f32 {
        match self {
            Self::L1 => diff.abs(),
            Self::Mse => diff * diff,
        }
    }
}

/// Loss breakdown for one predicted matte
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct MatteScore {
    pub transition: f32,
    pub outside: f32,
    pub weighted: f32,
    /// Fraction of pixels in the transition band
    pub coverage: f32,
}

/// Pixels where the ground truth is neither clearly foreground nor
/// background, closed with a `size` x `size` square
pub fn transition_region(truth: ArrayView2<f32>, threshold: f32, size: usize) -> Array2<bool> {
    let band = truth.mapv(|v| v > threshold && v < 1.0 - threshold);
    erode(&dilate(&band, size), size)
}

fn dilate(mask: &Array2<bool>, size: usize) -> Array2<bool> {
    morph(mask, size, false)
}

fn erode(mask: &Array2<bool>, size: usize) -> Array2<bool> {
    morph(mask, size, true)
}

/// Square min/max filter; pixels beyond the border never set or clear a value
fn morph(mask: &Array2<bool>, size: usize, all: bool) -> Array2<bool> {
    let (h, w) = mask.dim();
    let before = (size.saturating_sub(1) / 2) as isize;
    let after = (size / 2) as isize;

    Array2::from_shape_fn((h, w), |(y, x)| {
        let mut hit = all;
        for dy in -before..=after {
            for dx in -before..=after {
                let (sy, sx) = (y as isize + dy, x as isize + dx);
                if sy < 0 || sx < 0 || sy >= h as isize || sx >= w as isize {
                    continue;
                }
                let v = mask[[sy as usize, sx as usize]];
                if all && !v {
                    return false;
                }
                if !all && v {
                    hit = true;
                }
            }
        }
        hit
    })
}

/// Transition-weighted loss between a predicted matte and its ground truth
pub fn weighted_matte_loss(
    predicted: ArrayView2<f32>,
    truth: ArrayView2<f32>,
    kind: LossKind,
) -> MattingResult<MatteScore> {
    if predicted.dim() != truth.dim() {
        return Err(MattingError::validation(format!(
            "prediction {:?} and ground truth {:?} differ in size",
            predicted.dim(),
            truth.dim()
        )));
    }

    let region = transition_region(truth, TRANSITION_THRESHOLD, CLOSING_SIZE);

    let (mut inside_sum, mut inside_n, mut outside_sum, mut outside_n) = (0.0f64, 0usize, 0.0f64, 0usize);
    Zip::from(&predicted)
        .and(&truth)
        .and(&region)
        .for_each(|&p, &t, &in_band| {
            let loss = kind.apply(p - t) as f64;
            if in_band {
                inside_sum += loss;
                inside_n += 1;
            } else {
                outside_sum += loss;
                outside_n += 1;
            }
        });

    // An empty region contributes nothing
    let mean = |sum: f64, n: usize| if n == 0 { 0.0 } else { (sum / n as f64) as f32 };
    let transition = mean(inside_sum, inside_n);
    let outside = mean(outside_sum, outside_n);

    Ok(MatteScore {
        transition,
        outside,
        weighted: transition * TRANSITION_WEIGHT + outside,
        coverage: inside_n as f32 / region.len().max(1) as f32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_fills_small_gaps_in_the_band() {
        let mut truth = Array2::<f32>::zeros((9, 9));
        // a band at column 3 and 5 with a hard gap at column 4
        for y in 0..9 {
            truth[[y, 3]] = 0.5;
            truth[[y, 5]] = 0.5;
        }
        let raw = truth.mapv(|v| v > 0.05 && v < 0.95);
        assert!(!raw[[4, 4]]);

        let region = transition_region(truth.view(), TRANSITION_THRESHOLD, CLOSING_SIZE);
        assert!(region[[4, 4]]);
        assert!(region[[4, 3]]);
        assert!(!region[[4, 0]]);
    }

    #[test]
    fn hard_mattes_have_no_transition_band() {
        let truth = Array2::from_shape_fn((6, 6), |(_, x)| if x < 3 { 0.0 } else { 1.0 });
        let region = transition_region(truth.view(), TRANSITION_THRESHOLD, CLOSING_SIZE);
        assert!(region.iter().all(|&v| !v));
    }

    #[test]
    fn transition_errors_weigh_ten_times_more() {
        let truth = Array2::from_shape_fn((9, 9), |(y, x)| if (y, x) == (4, 4) { 0.5 } else { 0.0 });
        // closing an isolated pixel keeps just that pixel
        let region = transition_region(truth.view(), TRANSITION_THRESHOLD, CLOSING_SIZE);
        assert_eq!(region.iter().filter(|&&v| v).count(), 1);

        let mut predicted = truth.clone();
        predicted[[4, 4]] = 0.7;
        predicted[[0, 0]] = 0.4;

        let score = weighted_matte_loss(predicted.view(), truth.view(), LossKind::L1).unwrap();
        assert!((score.transition - 0.2).abs() < 1e-6);
        assert!((score.outside - 0.4 / 80.0).abs() < 1e-6);
        assert!((score.weighted - (2.0 + 0.4 / 80.0)).abs() < 1e-5);
        assert!((score.coverage - 1.0 / 81.0).abs() < 1e-6);

        let mse = weighted_matte_loss(predicted.view(), truth.view(), LossKind::Mse).unwrap();
        assert!((mse.transition - 0.04).abs() < 1e-6);
    }

    #[test]
    fn rejects_mismatched_sizes() {
        let a = Array2::<f32>::zeros((4, 4));
        let b = Array2::<f32>::zeros((4, 5));
        assert!(weighted_matte_loss(a.view(), b.view(), LossKind::L1).is_err());
    }
}
