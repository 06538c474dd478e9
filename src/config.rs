use crate::matting::ProtocolVersion;
use crate::refiner::OutputMode;
use std::path::PathBuf;
use std::time::Duration;

/// Resolution frames are stored, tracked and refined at
pub const WORKING_RESOLUTION: (u32, u32) = (768, 432);

/// Everything the service needs at startup, resolved once
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root of all session directories
    pub data_root: PathBuf,
    pub working_resolution: (u32, u32),
    /// Directory holding the tracker's ONNX graphs
    pub tracker_dir: PathBuf,
    /// Refiner `.safetensors` file or checkpoint directory
    pub refiner_weights: PathBuf,
    /// Output head override; the artifact's own setting when unset
    pub refiner_mode: Option<OutputMode>,
    /// Coordinate convention for requests that do not name one
    pub protocol: ProtocolVersion,
    pub request_timeout: Duration,
    /// ONNX Runtime intra-op threads per graph
    pub intra_threads: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/tmp/matting"),
            working_resolution: WORKING_RESOLUTION,
            tracker_dir: PathBuf::from("models/sam2"),
            refiner_weights: PathBuf::from("models/refiner.safetensors"),
            refiner_mode: None,
            protocol: ProtocolVersion::default(),
            request_timeout: Duration::from_secs(600),
            intra_threads: 4,
        }
    }
}
