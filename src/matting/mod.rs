//! Per-request coordination of the tracker and the refiner.
//!
//! A request is validated up front, then turned into a [`MatteStream`] that
//! pulls one tracked frame at a time, refines it and hands the result to the
//! caller. Nothing is computed for frames the caller never asks for.

mod prompt;

pub use prompt::{parse_points, ProtocolVersion};

use crate::error::{MattingError, MattingResult};
use crate::frames::FrameSource;
use crate::imaging::{self, ChannelOrder};
use crate::refiner::{aligned, MattingRefiner};
use crate::tracking::{self, FrameResult, ObjectTracker, TrackStream};
use image::imageops::FilterType;
use ndarray::{Array2, Zip};
use tokio_util::sync::CancellationToken;

/// Segmentation probability below which `zero_mask` clears the matte
pub const CUTOUT_THRESHOLD: f32 = 0.5;

/// Frames `start..finish` of a session; `finish` is exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameWindow {
    pub start: usize,
    pub finish: usize,
}

impl FrameWindow {
    pub fn new(start: usize, finish: usize, frame_count: usize) -> MattingResult<Self> {
        if start > finish {
            return Err(MattingError::validation(format!(
                "start frame {start} is after finish frame {finish}"
            )));
        }
        if finish > frame_count {
            return Err(MattingError::validation(format!(
                "finish frame {finish} is beyond the {frame_count} frames of the session"
            )));
        }
        Ok(Self { start, finish })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.finish - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.finish
    }
}

/// Rescale raw mask scores to `[0, 1]`
///
/// A spatially constant mask cannot be stretched; it becomes all foreground
/// when the constant score is positive and all background otherwise.
pub fn normalize_mask(mut mask: Array2<f32>) -> MattingResult<Array2<f32>> {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in mask.iter() {
        if !v.is_finite() {
            return Err(MattingError::model("coarse mask contains non-finite scores"));
        }
        min = min.min(v);
        max = max.max(v);
    }
    if mask.is_empty() {
        return Ok(mask);
    }

    if max == min {
        let fill = if max > 0.0 { 1.0 } else { 0.0 };
        mask.fill(fill);
        return Ok(mask);
    }

    let range = max - min;
    mask.mapv_inplace(|v| (v - min) / range);
    Ok(mask)
}

/// Hard background: matte values where the segmentation is below the
/// cutout threshold become exactly zero
pub fn apply_cutout(alpha: &mut Array2<f32>, segmentation: &Array2<f32>) {
    Zip::from(alpha).and(segmentation).for_each(|a, &s| {
        if s < CUTOUT_THRESHOLD {
            *a = 0.0;
        }
    });
}

#[derive(Debug, Clone, Default)]
pub struct MattingOptions {
    /// Resolution the refiner runs at; the frame resolution when unset.
    /// Rounded up to what the refiner accepts.
    pub refine_resolution: Option<(u32, u32)>,
    /// Resolution of the emitted matte; the frame resolution when unset
    pub output_resolution: Option<(u32, u32)>,
    pub zero_mask: bool,
}

/// A validated matting request, points already in working pixels
#[derive(Debug, Clone)]
pub struct MattingJob {
    pub points: Vec<tracking::PromptPoint>,
    pub window: FrameWindow,
    pub options: MattingOptions,
}

impl MattingJob {
    /// Validate raw request fields against the session's frames
    pub fn prepare(
        frames: &dyn FrameSource,
        native_resolution: (u32, u32),
        points: &[[f32; 2]],
        protocol: ProtocolVersion,
        start: usize,
        finish: usize,
        options: MattingOptions,
    ) -> MattingResult<Self> {
        let window = FrameWindow::new(start, finish, frames.len())?;
        let points = protocol.normalize(points, native_resolution, frames.resolution())?;
        for size in [options.refine_resolution, options.output_resolution].into_iter().flatten() {
            if size.0 == 0 || size.1 == 0 {
                return Err(MattingError::validation(format!(
                    "resolution {}x{} is empty",
                    size.0, size.1
                )));
            }
        }
        Ok(Self {
            points,
            window,
            options,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MatteResult {
    pub frame_index: usize,
    /// Continuous matte, shape (H, W)
    pub alpha: Array2<f32>,
    /// Normalized coarse mask at the same resolution
    pub segmentation: Array2<f32>,
}

impl MatteResult {
    /// Segmentation thresholded to exact 0 / 1
    pub fn binary_mask(&self) -> Array2<f32> {
        self.segmentation
            .mapv(|s| if s >= CUTOUT_THRESHOLD { 1.0 } else { 0.0 })
    }
}

/// Shared, immutable pipeline: one tracker and one refiner serving every
/// request
pub struct MattingOrchestrator<T: ObjectTracker> {
    tracker: T,
    refiner: MattingRefiner,
}

impl<T: ObjectTracker> MattingOrchestrator<T> {
    pub fn new(tracker: T, refiner: MattingRefiner) -> Self {
        Self { tracker, refiner }
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    /// Start a request
    ///
    /// The prompt frame is tracked immediately; an empty window never touches
    /// the tracker.
    pub fn run<'a>(
        &'a self,
        frames: &'a dyn FrameSource,
        job: &MattingJob,
        cancel: CancellationToken,
    ) -> MattingResult<MatteStream<'a, T>> {
        let _span = tracing::debug_span!("matting_run", start = job.window.start).entered();

        if cancel.is_cancelled() {
            return Err(MattingError::Cancelled);
        }

        let track = if job.window.is_empty() {
            tracing::debug!("Empty frame window at {}", job.window.start);
            None
        } else {
            Some(tracking::track(&self.tracker, frames, &job.points, job.window.start)?)
        };

        Ok(MatteStream {
            refiner: &self.refiner,
            frames,
            track,
            finish: job.window.finish,
            options: job.options.clone(),
            cancel,
        })
    }
}

/// Lazily refined frames of one request, in increasing frame order
pub struct MatteStream<'a, T: ObjectTracker> {
    refiner: &'a MattingRefiner,
    frames: &'a dyn FrameSource,
    track: Option<TrackStream<'a, T>>,
    finish: usize,
    options: MattingOptions,
    cancel: CancellationToken,
}

impl<'a, T: ObjectTracker> MatteStream<'a, T> {
    fn refine(&self, tracked: FrameResult) -> MattingResult<MatteResult> {
        let index = tracked.frame_index;
        let _span = tracing::debug_span!("matte_frame", index).entered();

        let frame = self.frames.frame(index)?;
        let (frame_w, frame_h) = frame.dimensions();

        let segmentation = normalize_mask(tracked.mask)?;

        let (refine_w, refine_h) = self.options.refine_resolution.unwrap_or((frame_w, frame_h));
        let (refine_w, refine_h) = (aligned(refine_w), aligned(refine_h));
        let (rw, rh) = (refine_w as usize, refine_h as usize);

        let image = imaging::resize_rgb(&frame, refine_w, refine_h, FilterType::Triangle);
        let image = imaging::rgb_to_chw(&image, ChannelOrder::Bgr);
        let mask = imaging::resize_plane(segmentation.view(), rw, rh);
        let features = imaging::resize_channels(tracked.features.view(), rw, rh);

        let alpha = self.refiner.refine(image.view(), mask.view(), features.view())?;

        let (out_w, out_h) = self.options.output_resolution.unwrap_or((frame_w, frame_h));
        let (ow, oh) = (out_w as usize, out_h as usize);
        let mut alpha = imaging::resize_plane(alpha.view(), ow, oh);
        let segmentation = imaging::resize_plane(segmentation.view(), ow, oh);

        if self.options.zero_mask {
            apply_cutout(&mut alpha, &segmentation);
        }

        Ok(MatteResult {
            frame_index: index,
            alpha,
            segmentation,
        })
    }
}

impl<'a, T: ObjectTracker> Iterator for MatteStream<'a, T> {
    type Item = MattingResult<MatteResult>;

    fn next(&mut self) -> Option<Self::Item> {
        let track = self.track.as_mut()?;
        if track.next_index() >= self.finish {
            self.track = None;
            return None;
        }
        if self.cancel.is_cancelled() {
            tracing::warn!("Matting cancelled before frame {}", track.next_index());
            self.track = None;
            return Some(Err(MattingError::Cancelled));
        }

        let result = match track.next()? {
            Ok(tracked) => self.refine(tracked),
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.track = None;
        }
        Some(result)
    }
}
