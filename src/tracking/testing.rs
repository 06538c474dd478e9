//! Deterministic stand-ins for the tracking model and the frame store.

use super::{ObjectTracker, PromptPoint, TrackOutput};
use crate::error::{MattingError, MattingResult};
use crate::frames::FrameSource;
use image::RgbImage;
use ndarray::{Array2, Array3};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub const FAKE_FEATURE_CHANNELS: usize = 4;

/// In-memory frames with an optional undecodable index
pub struct MemoryFrames {
    count: usize,
    width: u32,
    height: u32,
    failing: Option<usize>,
}

impl MemoryFrames {
    pub fn new(count: usize, width: u32, height: u32) -> Self {
        Self {
            count,
            width,
            height,
            failing: None,
        }
    }

    pub fn failing_at(mut self, index: usize) -> Self {
        self.failing = Some(index);
        self
    }
}

impl FrameSource for MemoryFrames {
    fn len(&self) -> usize {
        self.count
    }

    fn frame(&self, index: usize) -> MattingResult<RgbImage> {
        if Some(index) == self.failing || index >= self.count {
            return Err(MattingError::decode(index, "corrupt frame"));
        }
        let shade = (index * 20 % 255) as u8;
        Ok(RgbImage::from_fn(self.width, self.height, |x, _| {
            image::Rgb([shade, (x % 255) as u8, 128])
        }))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Tracker that paints a disk of positive scores around the prompt centroid
/// and drifts it one pixel to the right per propagated frame
#[derive(Default)]
pub struct FakeTracker {
    seeds: AtomicUsize,
    propagations: AtomicUsize,
    next_id: AtomicU64,
}

pub struct FakeState {
    pub id: u64,
    pub steps: usize,
    center: (f32, f32),
}

impl FakeTracker {
    pub fn seeds(&self) -> usize {
        self.seeds.load(Ordering::SeqCst)
    }

    pub fn propagations(&self) -> usize {
        self.propagations.load(Ordering::SeqCst)
    }

    fn output(frame: &RgbImage, center: (f32, f32)) -> TrackOutput {
        let (width, height) = frame.dimensions();
        let radius = (width.min(height) as f32 / 3.0).max(1.0);

        let mask = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            let dx = x as f32 - center.0;
            let dy = y as f32 - center.1;
            let distance = (dx * dx + dy * dy).sqrt();
            if distance <= radius {
                6.0 - distance * 0.1
            } else {
                -4.0
            }
        });

        let grid = ((height / 2).max(1) as usize, (width / 2).max(1) as usize);
        let features = Array3::from_shape_fn(
            (FAKE_FEATURE_CHANNELS, grid.0, grid.1),
            |(c, y, x)| c as f32 * 0.25 + (y + x) as f32 * 0.01,
        );

        TrackOutput { mask, features }
    }
}

impl ObjectTracker for FakeTracker {
    type State = FakeState;

    fn seed(
        &self,
        frame: &RgbImage,
        points: &[PromptPoint],
    ) -> MattingResult<(FakeState, TrackOutput)> {
        self.seeds.fetch_add(1, Ordering::SeqCst);

        let n = points.len() as f32;
        let center = (
            points.iter().map(|p| p.x).sum::<f32>() / n,
            points.iter().map(|p| p.y).sum::<f32>() / n,
        );
        let state = FakeState {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            steps: 0,
            center,
        };

        Ok((state, Self::output(frame, center)))
    }

    fn propagate(&self, state: &mut FakeState, frame: &RgbImage) -> MattingResult<TrackOutput> {
        self.propagations.fetch_add(1, Ordering::SeqCst);
        state.steps += 1;
        state.center.0 += 1.0;
        Ok(Self::output(frame, state.center))
    }
}
