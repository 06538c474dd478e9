//! Refiner weight artifacts.
//!
//! A bare `.safetensors` file, or a training checkpoint directory described by
//! a versioned `manifest.json`. Everything is parsed into memory before a
//! refiner is built from it, so a half-read artifact never reaches serving.

use crate::error::{MattingError, MattingResult};
use ndarray::{Array, ArrayD, Dimension, IxDyn};
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "manifest.json";

const USE_SIGMOID_KEY: &str = "use_sigmoid";

/// Named parameter tensors
#[derive(Debug, Default, Clone)]
pub struct WeightMap {
    tensors: HashMap<String, ArrayD<f32>>,
}

impl WeightMap {
    #[cfg(test)]
    pub fn insert<D: Dimension>(&mut self, name: impl Into<String>, tensor: Array<f32, D>) {
        self.tensors.insert(name.into(), tensor.into_dyn());
    }

    pub fn get<D: Dimension>(&self, name: &str) -> MattingResult<Array<f32, D>> {
        let tensor = self
            .tensors
            .get(name)
            .ok_or_else(|| MattingError::model(format!("missing weight `{name}`")))?;
        tensor.clone().into_dimensionality::<D>().map_err(|_| {
            MattingError::model(format!(
                "weight `{}` has unexpected rank {}",
                name,
                tensor.ndim()
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArrayD<f32>)> {
        self.tensors.iter()
    }
}

/// Training checkpoint description
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointManifest {
    pub schema_version: u32,
    pub epoch: u32,
    pub learning_rate: f64,
    #[serde(default)]
    pub train_losses: Vec<f64>,
    #[serde(default)]
    pub test_losses: Vec<f64>,
    /// Weights file, relative to the checkpoint directory
    pub weights: String,
    /// Optimizer state file; recorded for resuming training, never loaded here
    #[serde(default)]
    pub optimizer_state: Option<String>,
    #[serde(default)]
    pub use_sigmoid: bool,
}

/// A fully loaded refiner artifact
#[derive(Debug)]
pub struct RefinerArtifact {
    pub weights: WeightMap,
    /// Output head mode recorded in the artifact, if any
    pub use_sigmoid: Option<bool>,
    pub manifest: Option<CheckpointManifest>,
    pub source: PathBuf,
}

/// Load weights from a `.safetensors` file, a checkpoint directory, or a
/// directory of checkpoints (the highest epoch wins)
pub fn load_artifact<P: AsRef<Path>>(path: P) -> MattingResult<RefinerArtifact> {
    let path = path.as_ref();

    if path.is_file() {
        let (weights, use_sigmoid) = read_safetensors(path)?;
        return Ok(RefinerArtifact {
            weights,
            use_sigmoid,
            manifest: None,
            source: path.to_path_buf(),
        });
    }

    if path.join(MANIFEST_FILE).is_file() {
        return load_checkpoint(path);
    }

    let latest = latest_checkpoint(path)?;
    tracing::info!("Using latest checkpoint {}", latest.display());
    load_checkpoint(&latest)
}

fn load_checkpoint(dir: &Path) -> MattingResult<RefinerArtifact> {
    let manifest = read_manifest(dir)?;
    if manifest.schema_version != CHECKPOINT_SCHEMA_VERSION {
        return Err(MattingError::model(format!(
            "unsupported checkpoint schema version {} in {}",
            manifest.schema_version,
            dir.display()
        )));
    }

    let weights_path = dir.join(&manifest.weights);
    let (weights, _) = read_safetensors(&weights_path)?;

    tracing::info!(
        "Loaded checkpoint epoch {} ({} tensors, last test loss {:?})",
        manifest.epoch,
        weights.len(),
        manifest.test_losses.last()
    );

    Ok(RefinerArtifact {
        weights,
        use_sigmoid: Some(manifest.use_sigmoid),
        manifest: Some(manifest),
        source: dir.to_path_buf(),
    })
}

fn read_manifest(dir: &Path) -> MattingResult<CheckpointManifest> {
    let path = dir.join(MANIFEST_FILE);
    let raw = std::fs::read(&path).map_err(|e| MattingError::io(&path, e))?;
    serde_json::from_slice(&raw)
        .map_err(|e| MattingError::model(format!("invalid manifest {}: {e}", path.display())))
}

fn latest_checkpoint(dir: &Path) -> MattingResult<PathBuf> {
    let entries = std::fs::read_dir(dir).map_err(|e| MattingError::io(dir, e))?;

    let mut best: Option<(u32, PathBuf)> = None;
    for entry in entries {
        let candidate = entry.map_err(|e| MattingError::io(dir, e))?.path();
        if !candidate.join(MANIFEST_FILE).is_file() {
            continue;
        }
        let Ok(manifest) = read_manifest(&candidate) else {
            tracing::warn!("Skipping unreadable checkpoint {}", candidate.display());
            continue;
        };
        if best.as_ref().map_or(true, |(epoch, _)| manifest.epoch > *epoch) {
            best = Some((manifest.epoch, candidate));
        }
    }

    best.map(|(_, path)| path).ok_or_else(|| {
        MattingError::model(format!("no refiner checkpoint found in {}", dir.display()))
    })
}

fn read_safetensors(path: &Path) -> MattingResult<(WeightMap, Option<bool>)> {
    let _span = tracing::debug_span!("read_weights").entered();

    let bytes = std::fs::read(path).map_err(|e| MattingError::io(path, e))?;
    let invalid = |e: safetensors::SafeTensorError| {
        MattingError::model(format!("invalid weights file {}: {e:?}", path.display()))
    };

    let (_, metadata) = SafeTensors::read_metadata(&bytes).map_err(invalid)?;
    let use_sigmoid = metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get(USE_SIGMOID_KEY))
        .map(|v| v.eq_ignore_ascii_case("true"));

    let tensors = SafeTensors::deserialize(&bytes).map_err(invalid)?;
    let mut weights = WeightMap::default();
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(MattingError::model(format!(
                "weight `{}` is {:?}, only F32 is supported",
                name,
                view.dtype()
            )));
        }
        let values: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let tensor = ArrayD::from_shape_vec(IxDyn(view.shape()), values)?;
        weights.tensors.insert(name, tensor);
    }

    tracing::debug!("Read {} tensors from {}", weights.len(), path.display());
    Ok((weights, use_sigmoid))
}

/// Serialize a weight map as `.safetensors`
#[cfg(test)]
pub fn write_safetensors<P: AsRef<Path>>(
    path: P,
    weights: &WeightMap,
    use_sigmoid: Option<bool>,
) -> MattingResult<()> {
    let path = path.as_ref();

    let raw: Vec<(String, Vec<usize>, Vec<u8>)> = weights
        .iter()
        .map(|(name, tensor)| {
            let bytes = tensor.iter().flat_map(|v| v.to_le_bytes()).collect();
            (name.clone(), tensor.shape().to_vec(), bytes)
        })
        .collect();

    let mut views = Vec::with_capacity(raw.len());
    for (name, shape, bytes) in &raw {
        let view = safetensors::tensor::TensorView::new(Dtype::F32, shape.clone(), bytes)
            .map_err(|e| MattingError::model(format!("cannot serialize `{name}`: {e:?}")))?;
        views.push((name.as_str(), view));
    }

    let metadata = use_sigmoid.map(|v| HashMap::from([(USE_SIGMOID_KEY.to_string(), v.to_string())]));
    let serialized = safetensors::serialize(views, &metadata)
        .map_err(|e| MattingError::model(format!("cannot serialize weights: {e:?}")))?;

    std::fs::write(path, serialized).map_err(|e| MattingError::io(path, e))
}
