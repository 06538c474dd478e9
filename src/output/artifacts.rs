use super::MatteSink;
use crate::error::{MattingError, MattingResult};
use crate::frames::frame_file_name;
use crate::imaging::plane_to_gray;
use crate::matting::MatteResult;
use image::{GrayImage, ImageFormat};
use std::path::{Path, PathBuf};

const MATTE_DIR: &str = "matte";
const MASK_DIR: &str = "mask";

/// Request-scoped directory of 8-bit PNG mattes and, optionally, binary masks
pub struct ArtifactDir {
    root: PathBuf,
    write_masks: bool,
    written: usize,
}

impl ArtifactDir {
    /// Create `root/matte` (and `root/mask`); `root` must not exist yet
    pub fn create<P: AsRef<Path>>(root: P, write_masks: bool) -> MattingResult<Self> {
        let root = root.as_ref().to_path_buf();
        if root.exists() {
            return Err(MattingError::unexpected(format!(
                "artifact directory {} already exists",
                root.display()
            )));
        }

        let matte_dir = root.join(MATTE_DIR);
        std::fs::create_dir_all(&matte_dir).map_err(|e| MattingError::io(&matte_dir, e))?;
        if write_masks {
            let mask_dir = root.join(MASK_DIR);
            std::fs::create_dir_all(&mask_dir).map_err(|e| MattingError::io(&mask_dir, e))?;
        }

        tracing::debug!("Writing artifacts to {}", root.display());
        Ok(Self {
            root,
            write_masks,
            written: 0,
        })
    }

    pub fn matte_dir(&self) -> PathBuf {
        self.root.join(MATTE_DIR)
    }

    pub fn mask_dir(&self) -> PathBuf {
        self.root.join(MASK_DIR)
    }
}

fn save_png(image: &GrayImage, path: &Path) -> MattingResult<()> {
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|e| MattingError::unexpected(format!("failed to write {}: {e}", path.display())))
}

impl MatteSink for ArtifactDir {
    fn write(&mut self, result: &MatteResult) -> MattingResult<()> {
        let _span = tracing::debug_span!("write_artifacts", index = result.frame_index).entered();
        let name = frame_file_name(result.frame_index, "png");

        save_png(&plane_to_gray(result.alpha.view()), &self.matte_dir().join(&name))?;
        if self.write_masks {
            let mask = result.binary_mask();
            save_png(&plane_to_gray(mask.view()), &self.mask_dir().join(&name))?;
        }

        self.written += 1;
        Ok(())
    }

    fn written(&self) -> usize {
        self.written
    }
}
