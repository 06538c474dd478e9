mod directory;

pub use directory::{frame_file_name, DirectoryFrames};

use crate::error::MattingResult;
use image::RgbImage;

/// Ordered, index-addressable sequence of decoded frames for one session
pub trait FrameSource: Send + Sync {
    /// Number of frames in the sequence
    fn len(&self) -> usize;

    /// Decode the frame at `index`
    fn frame(&self, index: usize) -> MattingResult<RgbImage>;

    /// Resolution of stored frames (width, height)
    fn resolution(&self) -> (u32, u32);
}
