use super::preprocess::Preprocessor;
use super::state::{MemoryEntry, TrackState};
use super::{ObjectTracker, PromptPoint, TrackOutput};
use crate::error::{MattingError, MattingResult};
use anyhow::Context;
use image::RgbImage;
use ndarray::{Array, Array1, Array2, Array3, Array4, ArrayD, Axis, Dimension, IxDyn};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionOutputs};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const IMAGE_ENCODER: &str = "image_encoder.onnx";
const MASK_DECODER: &str = "mask_decoder.onnx";
const MEMORY_ENCODER: &str = "memory_encoder.onnx";
const MEMORY_ATTENTION: &str = "memory_attention.onnx";

const FOREGROUND_LABEL: f32 = 1.0;
const PADDING_LABEL: f32 = -1.0;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Directory holding the four exported graphs
    pub model_dir: PathBuf,
    /// Square input size of the image encoder
    pub image_size: u32,
    /// Temporal memory slots, prompt frame included
    pub memory_slots: usize,
    /// Object pointers visible to memory attention, prompt frame included
    pub max_object_pointers: usize,
    pub intra_threads: usize,
}

impl TrackerConfig {
    pub fn new<P: AsRef<Path>>(model_dir: P) -> Self {
        Self {
            model_dir: model_dir.as_ref().to_path_buf(),
            image_size: 1024,
            memory_slots: 7,
            max_object_pointers: 16,
            intra_threads: 4,
        }
    }
}

/// SAM 2 video tracker running on four ONNX graphs
///
/// The graphs are immutable once loaded. ONNX Runtime needs exclusive access
/// to a session while it runs, so each graph has its own lock, held only for
/// one invocation. Per-track memory lives in [`TrackState`].
pub struct Sam2Tracker {
    image_encoder: Mutex<Session>,
    mask_decoder: Mutex<Session>,
    memory_encoder: Mutex<Session>,
    memory_attention: Mutex<Session>,
    preprocessor: Preprocessor,
    config: TrackerConfig,
}

/// Image encoder outputs for one frame
struct EncodedFrame {
    high_res_feat0: Array4<f32>,
    high_res_feat1: Array4<f32>,
    vision_feat: Array4<f32>,
    vision_pos_embed: Array3<f32>,
    no_mem_feat: Array4<f32>,
}

struct Decoded {
    /// Shape [h, w]
    low_res_mask: Array2<f32>,
    obj_ptr: Array1<f32>,
}

struct EncodedMemory {
    entry: MemoryEntry,
    temporal_code: Array4<f32>,
}

impl Sam2Tracker {
    /// Load the tracker graphs from `config.model_dir`
    ///
    /// # Default Configuration
    /// - Input size: 1024x1024
    /// - 7 memory slots, 16 object pointers
    pub fn new(config: TrackerConfig) -> anyhow::Result<Self> {
        tracing::info!("Loading SAM 2 tracker from {}", config.model_dir.display());

        let load = |name: &str| -> anyhow::Result<Mutex<Session>> {
            let path = config.model_dir.join(name);
            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(config.intra_threads)?
                .commit_from_file(&path)
                .with_context(|| format!("Failed to load model from {}", path.display()))?;
            tracing::debug!("Loaded {}", path.display());
            Ok(Mutex::new(session))
        };

        let tracker = Self {
            image_encoder: load(IMAGE_ENCODER)?,
            mask_decoder: load(MASK_DECODER)?,
            memory_encoder: load(MEMORY_ENCODER)?,
            memory_attention: load(MEMORY_ATTENTION)?,
            preprocessor: Preprocessor::new(config.image_size),
            config,
        };

        tracing::info!("SAM 2 tracker loaded successfully");
        Ok(tracker)
    }

    fn encode_image(&self, frame: &RgbImage) -> MattingResult<EncodedFrame> {
        let _span = tracing::debug_span!("image_encoder").entered();

        let image = to_tensor(&self.preprocessor.preprocess(frame))?;
        let mut session = lock(&self.image_encoder)?;
        let outputs = session.run(ort::inputs!["image" => image])?;

        Ok(EncodedFrame {
            high_res_feat0: extract(&outputs, "high_res_feat0")?,
            high_res_feat1: extract(&outputs, "high_res_feat1")?,
            vision_feat: extract(&outputs, "vision_feat")?,
            vision_pos_embed: extract(&outputs, "vision_pos_embed")?,
            no_mem_feat: extract(&outputs, "no_mem_feat")?,
        })
    }

    fn decode_mask(
        &self,
        coords: Vec<f32>,
        labels: Vec<f32>,
        image_embed: &Array4<f32>,
        frame: &EncodedFrame,
    ) -> MattingResult<Decoded> {
        let _span = tracing::debug_span!("mask_decoder").entered();

        let n = labels.len();
        let coords = Tensor::from_array((vec![1usize, n, 2], coords.into_boxed_slice()))?;
        let labels = Tensor::from_array((vec![1usize, n], labels.into_boxed_slice()))?;

        let mut session = lock(&self.mask_decoder)?;
        let outputs = session.run(ort::inputs![
            "point_coords" => coords,
            "point_labels" => labels,
            "image_embed" => to_tensor(image_embed)?,
            "high_res_feat0" => to_tensor(&frame.high_res_feat0)?,
            "high_res_feat1" => to_tensor(&frame.high_res_feat1)?
        ])?;

        let masks: Array4<f32> = extract(&outputs, "low_res_masks")?;
        let obj_ptr: Array2<f32> = extract(&outputs, "obj_ptr")?;

        Ok(Decoded {
            low_res_mask: masks.index_axis_move(Axis(0), 0).index_axis_move(Axis(0), 0),
            obj_ptr: obj_ptr.index_axis_move(Axis(0), 0),
        })
    }

    fn encode_memory(
        &self,
        frame: &EncodedFrame,
        low_res_mask: &Array2<f32>,
    ) -> MattingResult<EncodedMemory> {
        let _span = tracing::debug_span!("memory_encoder").entered();

        let mask_for_mem = self
            .preprocessor
            .mask_to_model(low_res_mask.view())
            .insert_axis(Axis(0))
            .insert_axis(Axis(0));

        let mut session = lock(&self.memory_encoder)?;
        let outputs = session.run(ort::inputs![
            "pix_feat" => to_tensor(&frame.vision_feat)?,
            "mask_for_mem" => to_tensor(&mask_for_mem)?
        ])?;

        Ok(EncodedMemory {
            entry: MemoryEntry {
                features: extract(&outputs, "maskmem_features")?,
                pos_enc: extract(&outputs, "maskmem_pos_enc")?,
            },
            temporal_code: extract(&outputs, "temporal_code")?,
        })
    }

    fn attend(&self, frame: &EncodedFrame, state: &TrackState) -> MattingResult<Array4<f32>> {
        let _span = tracing::debug_span!("memory_attention").entered();

        let memory = state.memory_inputs()?;
        tracing::debug!(
            "Attending over {} memories and {} object pointers",
            memory.memories.len_of(Axis(0)),
            memory.pointers.len_of(Axis(0))
        );

        let mut session = lock(&self.memory_attention)?;
        let outputs = session.run(ort::inputs![
            "current_vision_feat" => to_tensor(&frame.vision_feat)?,
            "current_vision_pos_embed" => to_tensor(&frame.vision_pos_embed)?,
            "memory_0" => to_tensor(&memory.pointers)?,
            "memory_0_tpos" => to_tensor(&memory.pointer_tpos)?,
            "memory_1" => to_tensor(&memory.memories)?,
            "memory_pos_embed" => to_tensor(&memory.memory_pos)?
        ])?;

        extract(&outputs, "image_embed")
    }

    fn output(&self, frame: &RgbImage, encoded: EncodedFrame, decoded: &Decoded) -> TrackOutput {
        let mask = self
            .preprocessor
            .mask_to_frame(decoded.low_res_mask.view(), frame.dimensions());
        let features = encoded.high_res_feat0.index_axis_move(Axis(0), 0);
        TrackOutput { mask, features }
    }
}

impl ObjectTracker for Sam2Tracker {
    type State = TrackState;

    fn seed(
        &self,
        frame: &RgbImage,
        points: &[PromptPoint],
    ) -> MattingResult<(TrackState, TrackOutput)> {
        let _span = tracing::debug_span!("sam2_seed").entered();

        let encoded = self.encode_image(frame)?;
        let coords = self.preprocessor.prompt_coords(points, frame.dimensions());
        let labels = vec![FOREGROUND_LABEL; points.len()];

        let decoded = self.decode_mask(coords, labels, &encoded.no_mem_feat, &encoded)?;
        let memory = self.encode_memory(&encoded, &decoded.low_res_mask)?;

        let state = TrackState::new(
            self.config.memory_slots,
            self.config.max_object_pointers,
            memory.temporal_code,
            memory.entry,
            decoded.obj_ptr.clone(),
        );

        Ok((state, self.output(frame, encoded, &decoded)))
    }

    fn propagate(&self, state: &mut TrackState, frame: &RgbImage) -> MattingResult<TrackOutput> {
        let _span = tracing::debug_span!("sam2_propagate", offset = state.offset() + 1).entered();

        let encoded = self.encode_image(frame)?;
        let image_embed = self.attend(&encoded, state)?;

        // No prompts on propagated frames: a single padding point
        let decoded = self.decode_mask(vec![0.0, 0.0], vec![PADDING_LABEL], &image_embed, &encoded)?;
        let memory = self.encode_memory(&encoded, &decoded.low_res_mask)?;
        state.push(memory.entry, decoded.obj_ptr.clone());

        Ok(self.output(frame, encoded, &decoded))
    }
}

fn lock(session: &Mutex<Session>) -> MattingResult<std::sync::MutexGuard<'_, Session>> {
    session
        .lock()
        .map_err(|_| MattingError::model("ORT session poisoned"))
}

fn to_tensor<D: Dimension>(array: &Array<f32, D>) -> MattingResult<Tensor<f32>> {
    let shape = array.shape().to_vec();
    let data: Vec<f32> = array.iter().copied().collect();
    Ok(Tensor::from_array((shape, data.into_boxed_slice()))?)
}

fn extract<D: Dimension>(outputs: &SessionOutputs, name: &str) -> MattingResult<Array<f32, D>> {
    let value = outputs
        .get(name)
        .ok_or_else(|| MattingError::model(format!("tracker graph returned no `{name}` output")))?;
    let (shape, data) = value.try_extract_tensor::<f32>()?;
    let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();

    let array: ArrayD<f32> = ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec())?;
    Ok(array.into_dimensionality::<D>()?)
}
