mod preprocess;
mod sam2;
mod state;
#[cfg(test)]
pub(crate) mod testing;

pub use sam2::{Sam2Tracker, TrackerConfig};

use crate::error::{MattingError, MattingResult};
use crate::frames::FrameSource;
use image::RgbImage;
use ndarray::{Array2, Array3};

/// Foreground prompt in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromptPoint {
    pub x: f32,
    pub y: f32,
}

impl PromptPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// What the tracking model produces for one frame
#[derive(Debug, Clone)]
pub struct TrackOutput {
    /// Raw mask scores at frame resolution, shape (H, W)
    pub mask: Array2<f32>,
    /// First multi-scale feature map, shape (C, h, w) at the model's grid
    pub features: Array3<f32>,
}

#[derive(Debug, Clone)]
pub struct FrameResult {
    pub frame_index: usize,
    pub mask: Array2<f32>,
    pub features: Array3<f32>,
}

/// A promptable video segmentation model
///
/// Implementations hold only immutable model state; everything that changes
/// while a video is being tracked lives in `State`, which is created fresh by
/// [`ObjectTracker::seed`] for every request.
pub trait ObjectTracker: Send + Sync {
    type State: Send;

    /// Start a new track on `frame` with all-foreground prompts
    fn seed(
        &self,
        frame: &RgbImage,
        points: &[PromptPoint],
    ) -> MattingResult<(Self::State, TrackOutput)>;

    /// Extend the track by one frame
    fn propagate(&self, state: &mut Self::State, frame: &RgbImage) -> MattingResult<TrackOutput>;
}

/// Start tracking at `start` and return the forward-only result stream
///
/// The prompt frame is decoded and seeded eagerly, so a failure there is
/// reported before any result exists.
pub fn track<'a, T: ObjectTracker>(
    tracker: &'a T,
    frames: &'a dyn FrameSource,
    points: &[PromptPoint],
    start: usize,
) -> MattingResult<TrackStream<'a, T>> {
    let _span = tracing::debug_span!("track_seed", start).entered();

    if start >= frames.len() {
        return Err(MattingError::validation(format!(
            "start frame {} is outside the {} available frames",
            start,
            frames.len()
        )));
    }
    if points.is_empty() {
        return Err(MattingError::validation("at least one prompt point is required"));
    }

    let frame = frames.frame(start)?;
    let (state, output) = tracker.seed(&frame, points)?;

    tracing::debug!("Seeded track on frame {} with {} points", start, points.len());

    Ok(TrackStream {
        tracker,
        frames,
        state,
        seeded: Some(FrameResult {
            frame_index: start,
            mask: output.mask,
            features: output.features,
        }),
        next_index: start + 1,
        finished: false,
    })
}

/// Single forward pass over the frames following the prompt frame
///
/// Owns its propagation state and cannot be cloned or rewound; the consumer
/// may drop it at any point. After an error the stream yields nothing more.
pub struct TrackStream<'a, T: ObjectTracker> {
    tracker: &'a T,
    frames: &'a dyn FrameSource,
    state: T::State,
    seeded: Option<FrameResult>,
    next_index: usize,
    finished: bool,
}

impl<'a, T: ObjectTracker> TrackStream<'a, T> {
    /// Index of the frame the next call to `next` will produce
    pub fn next_index(&self) -> usize {
        if self.seeded.is_some() {
            self.next_index - 1
        } else {
            self.next_index
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &T::State {
        &self.state
    }

    fn step(&mut self) -> MattingResult<FrameResult> {
        let index = self.next_index;
        let _span = tracing::debug_span!("track_propagate", index).entered();

        let frame = self.frames.frame(index)?;
        let output = self.tracker.propagate(&mut self.state, &frame)?;

        Ok(FrameResult {
            frame_index: index,
            mask: output.mask,
            features: output.features,
        })
    }
}

impl<'a, T: ObjectTracker> Iterator for TrackStream<'a, T> {
    type Item = MattingResult<FrameResult>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(first) = self.seeded.take() {
            return Some(Ok(first));
        }
        if self.finished || self.next_index >= self.frames.len() {
            return None;
        }

        let result = self.step();
        match result {
            Ok(_) => self.next_index += 1,
            Err(ref e) => {
                tracing::warn!("Tracking aborted at frame {}: {}", self.next_index, e);
                self.finished = true;
            }
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeTracker, MemoryFrames};
    use super::*;

    #[test]
    fn yields_prompt_frame_then_strictly_increasing_indices() {
        let frames = MemoryFrames::new(6, 16, 8);
        let tracker = FakeTracker::default();

        let indices: Vec<usize> = track(&tracker, &frames, &[PromptPoint::new(8.0, 4.0)], 2)
            .unwrap()
            .map(|r| r.unwrap().frame_index)
            .collect();

        assert_eq!(indices, vec![2, 3, 4, 5]);
    }

    #[test]
    fn consumer_can_stop_early() {
        let frames = MemoryFrames::new(10, 16, 8);
        let tracker = FakeTracker::default();

        let mut stream = track(&tracker, &frames, &[PromptPoint::new(1.0, 1.0)], 0).unwrap();
        assert_eq!(stream.next_index(), 0);
        stream.next().unwrap().unwrap();
        stream.next().unwrap().unwrap();
        assert_eq!(stream.next_index(), 2);
        drop(stream);

        assert_eq!(tracker.propagations(), 1);
    }

    #[test]
    fn prompt_frame_decode_failure_aborts_before_any_result() {
        let frames = MemoryFrames::new(4, 16, 8).failing_at(1);
        let tracker = FakeTracker::default();

        let err = track(&tracker, &frames, &[PromptPoint::new(1.0, 1.0)], 1).err();
        assert!(matches!(err, Some(MattingError::Decode { index: 1, .. })));
        assert_eq!(tracker.seeds(), 0);
    }

    #[test]
    fn later_decode_failure_ends_the_stream() {
        let frames = MemoryFrames::new(6, 16, 8).failing_at(3);
        let tracker = FakeTracker::default();

        let results: Vec<_> = track(&tracker, &frames, &[PromptPoint::new(1.0, 1.0)], 1)
            .unwrap()
            .collect();

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(MattingError::Decode { index: 3, .. })));
    }

    #[test]
    fn rejects_out_of_range_start_and_empty_prompts() {
        let frames = MemoryFrames::new(3, 16, 8);
        let tracker = FakeTracker::default();

        assert!(matches!(
            track(&tracker, &frames, &[PromptPoint::new(1.0, 1.0)], 3).err(),
            Some(MattingError::Validation(_))
        ));
        assert!(matches!(
            track(&tracker, &frames, &[], 0).err(),
            Some(MattingError::Validation(_))
        ));
    }

    #[test]
    fn every_track_gets_a_fresh_state() {
        let frames = MemoryFrames::new(4, 16, 8);
        let tracker = FakeTracker::default();

        let first = track(&tracker, &frames, &[PromptPoint::new(1.0, 1.0)], 0).unwrap();
        let second = track(&tracker, &frames, &[PromptPoint::new(2.0, 2.0)], 0).unwrap();

        assert_ne!(first.state().id, second.state().id);
        assert_eq!(first.state().steps, 0);
    }
}
