//! Hash-keyed session directories.
//!
//! ```text
//! <root>/<hash>/params.json
//! <root>/<hash>/frames/00000.jpg ...
//! <root>/<hash>/<request_id>/matte/00000.png ...
//! <root>/<hash>/<request_id>.zip
//! ```
//!
//! A session directory only appears once fully written: frames and metadata
//! are staged next to it and renamed into place.

mod hashing;

pub use hashing::content_hash;

use crate::error::{MattingError, MattingResult};
use crate::frames::{frame_file_name, DirectoryFrames};
use crate::imaging;
use image::imageops::FilterType;
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const PARAMS_FILE: &str = "params.json";
const FRAMES_DIR: &str = "frames";
const MAX_HASH_LEN: usize = 128;

/// Stored description of an uploaded video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Bytes of the uploaded frames
    pub size: u64,
    pub frame_count: usize,
    /// `[width, height]` of the video as uploaded
    pub native_resolution: [u32; 2],
    /// `[width, height]` the frames were stored at
    pub working_resolution: [u32; 2],
    pub fps: f32,
    pub hash: String,
}

impl SessionMetadata {
    pub fn native(&self) -> (u32, u32) {
        (self.native_resolution[0], self.native_resolution[1])
    }

    pub fn working(&self) -> (u32, u32) {
        (self.working_resolution[0], self.working_resolution[1])
    }
}

#[derive(Debug, Clone)]
pub struct Ingested {
    pub metadata: SessionMetadata,
    /// False when the session already existed and nothing was decoded
    pub created: bool,
}

/// Output locations of one matting request
#[derive(Debug, Clone)]
pub struct RequestPaths {
    pub request_id: Uuid,
    pub dir: PathBuf,
    pub archive: PathBuf,
}

pub fn validate_hash(hash: &str) -> MattingResult<()> {
    if hash.is_empty() {
        return Err(MattingError::validation("session hash is required"));
    }
    if hash.len() > MAX_HASH_LEN {
        return Err(MattingError::validation(format!(
            "session hash is longer than {MAX_HASH_LEN} characters"
        )));
    }
    if !hash
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(MattingError::validation(format!(
            "session hash `{hash}` may only contain letters, digits, `-` and `_`"
        )));
    }
    Ok(())
}

pub struct SessionStore {
    root: PathBuf,
    working_resolution: (u32, u32),
}

impl SessionStore {
    pub fn new<P: AsRef<Path>>(root: P, working_resolution: (u32, u32)) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            working_resolution,
        }
    }

    pub fn session_dir(&self, hash: &str) -> MattingResult<PathBuf> {
        validate_hash(hash)?;
        Ok(self.root.join(hash))
    }

    pub fn metadata(&self, hash: &str) -> MattingResult<SessionMetadata> {
        let path = self.session_dir(hash)?.join(PARAMS_FILE);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MattingError::NotFound(hash.to_string()));
            }
            Err(e) => return Err(MattingError::io(&path, e)),
        };
        serde_json::from_slice(&raw)
            .map_err(|e| MattingError::unexpected(format!("invalid {}: {e}", path.display())))
    }

    /// Metadata plus a frame source over the stored working-resolution frames
    ///
    /// The frames keep the resolution they were ingested at, even when the
    /// store has since been configured with a different one.
    pub fn frames(&self, hash: &str) -> MattingResult<(SessionMetadata, DirectoryFrames)> {
        let metadata = self.metadata(hash)?;
        let (width, height) = metadata.working();
        if (width, height) != self.working_resolution {
            tracing::warn!(
                "Session {} was stored at {}x{}, not the configured {}x{}",
                hash,
                width,
                height,
                self.working_resolution.0,
                self.working_resolution.1
            );
        }
        let frames = DirectoryFrames::new(
            self.session_dir(hash)?.join(FRAMES_DIR),
            metadata.frame_count,
            width,
            height,
        );
        Ok((metadata, frames))
    }

    /// Fresh, unique output locations for a matting request
    pub fn new_request(&self, hash: &str) -> MattingResult<RequestPaths> {
        let session = self.session_dir(hash)?;
        let request_id = Uuid::new_v4();
        Ok(RequestPaths {
            request_id,
            dir: session.join(request_id.to_string()),
            archive: session.join(format!("{request_id}.zip")),
        })
    }

    /// Store already-decoded frames from `source_dir` as session `hash`
    ///
    /// An existing session is returned as-is without reading `source_dir`.
    pub fn ingest(&self, hash: &str, source_dir: &Path, fps: f32) -> MattingResult<Ingested> {
        let _span = tracing::debug_span!("ingest", hash).entered();

        let target = self.session_dir(hash)?;
        if target.join(PARAMS_FILE).is_file() {
            tracing::info!("Session {} already exists", hash);
            return Ok(Ingested {
                metadata: self.metadata(hash)?,
                created: false,
            });
        }
        if !fps.is_finite() || fps <= 0.0 {
            return Err(MattingError::validation(format!("invalid frame rate {fps}")));
        }

        let sources = frame_sources(source_dir)?;
        if sources.is_empty() {
            return Err(MattingError::validation(format!(
                "no frames found in {}",
                source_dir.display()
            )));
        }

        std::fs::create_dir_all(&self.root).map_err(|e| MattingError::io(&self.root, e))?;
        let staging = self.root.join(format!(".staging-{}", Uuid::new_v4()));

        let staged = self.stage(&staging, hash, &sources, fps);
        let metadata = match staged {
            Ok(metadata) => metadata,
            Err(e) => {
                remove_dir_quietly(&staging);
                return Err(e);
            }
        };

        match std::fs::rename(&staging, &target) {
            Ok(()) => {
                tracing::info!(
                    "Stored session {} ({} frames, native {}x{})",
                    hash,
                    metadata.frame_count,
                    metadata.native_resolution[0],
                    metadata.native_resolution[1]
                );
                Ok(Ingested {
                    metadata,
                    created: true,
                })
            }
            Err(e) => {
                remove_dir_quietly(&staging);
                if target.join(PARAMS_FILE).is_file() {
                    tracing::info!("Session {} was stored concurrently", hash);
                    return Ok(Ingested {
                        metadata: self.metadata(hash)?,
                        created: false,
                    });
                }
                Err(MattingError::io(&target, e))
            }
        }
    }

    fn stage(
        &self,
        staging: &Path,
        hash: &str,
        sources: &[PathBuf],
        fps: f32,
    ) -> MattingResult<SessionMetadata> {
        let frames_dir = staging.join(FRAMES_DIR);
        std::fs::create_dir_all(&frames_dir).map_err(|e| MattingError::io(&frames_dir, e))?;

        let (width, height) = self.working_resolution;
        let mut native = None;
        let mut size = 0u64;

        for (index, source) in sources.iter().enumerate() {
            let frame = image::open(source)
                .map_err(|e| MattingError::decode(index, e))?
                .to_rgb8();
            native.get_or_insert(frame.dimensions());
            size += std::fs::metadata(source)
                .map_err(|e| MattingError::io(source, e))?
                .len();

            let resized = imaging::resize_rgb(&frame, width, height, FilterType::Lanczos3);
            let path = frames_dir.join(frame_file_name(index, "jpg"));
            resized
                .save_with_format(&path, ImageFormat::Jpeg)
                .map_err(|e| MattingError::unexpected(format!("failed to write {}: {e}", path.display())))?;
        }

        let (native_w, native_h) = native.unwrap_or((width, height));
        let metadata = SessionMetadata {
            size,
            frame_count: sources.len(),
            native_resolution: [native_w, native_h],
            working_resolution: [width, height],
            fps,
            hash: hash.to_string(),
        };

        let params = staging.join(PARAMS_FILE);
        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| MattingError::unexpected(format!("failed to encode metadata: {e}")))?;
        std::fs::write(&params, json).map_err(|e| MattingError::io(&params, e))?;

        Ok(metadata)
    }
}

/// Image files of `dir` in file name order; files without a known image
/// extension are skipped
pub fn frame_sources(dir: &Path) -> MattingResult<Vec<PathBuf>> {
    let mut sources = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| MattingError::io(dir, e))? {
        let path = entry.map_err(|e| MattingError::io(dir, e))?.path();
        if path.is_file() && ImageFormat::from_path(&path).is_ok() {
            sources.push(path);
        }
    }
    sources.sort();
    Ok(sources)
}

fn remove_dir_quietly(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        tracing::warn!("Failed to remove {}: {}", dir.display(), e);
    }
}
