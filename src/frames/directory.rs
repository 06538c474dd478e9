use super::FrameSource;
use crate::error::{MattingError, MattingResult};
use image::RgbImage;
use std::path::{Path, PathBuf};

/// Zero-padded file name used for every per-frame artifact
pub fn frame_file_name(index: usize, extension: &str) -> String {
    format!("{index:05}.{extension}")
}

/// Frames stored as `{index:05}.jpg` inside a session's `frames/` directory
pub struct DirectoryFrames {
    dir: PathBuf,
    count: usize,
    width: u32,
    height: u32,
}

impl DirectoryFrames {
    pub fn new<P: AsRef<Path>>(dir: P, count: usize, width: u32, height: u32) -> Self {
        let dir = dir.as_ref().to_path_buf();
        tracing::debug!(
            "Opening frame directory {} ({} frames, {}x{})",
            dir.display(),
            count,
            width,
            height
        );

        Self {
            dir,
            count,
            width,
            height,
        }
    }

    pub fn path_of(&self, index: usize) -> PathBuf {
        self.dir.join(frame_file_name(index, "jpg"))
    }
}

impl FrameSource for DirectoryFrames {
    fn len(&self) -> usize {
        self.count
    }

    fn frame(&self, index: usize) -> MattingResult<RgbImage> {
        let _span = tracing::debug_span!("decode_frame", index).entered();

        if index >= self.count {
            return Err(MattingError::decode(
                index,
                format!("index out of range (frame count {})", self.count),
            ));
        }

        let decoded = image::open(self.path_of(index))
            .map_err(|e| MattingError::decode(index, e))?
            .to_rgb8();
        if decoded.dimensions() != (self.width, self.height) {
            return Err(MattingError::decode(
                index,
                format!(
                    "frame is {}x{}, expected {}x{}",
                    decoded.width(),
                    decoded.height(),
                    self.width,
                    self.height
                ),
            ));
        }
        Ok(decoded)
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
