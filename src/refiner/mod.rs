mod layers;
mod loss;
#[cfg(test)]
pub(crate) mod testing;
mod weights;

pub use loss::{weighted_matte_loss, LossKind};
pub use weights::WeightMap;

use crate::error::{MattingError, MattingResult};
use layers::{leaky_relu, sigmoid, BatchNorm, Conv2d, ConvTranspose2d};
use weights::load_artifact;
use ndarray::{concatenate, Array2, Array3, ArrayView2, ArrayView3, Axis, Ix1, Ix4};
use std::path::Path;

/// Channels contributed by the image and the coarse mask
const IMAGE_CHANNELS: usize = 3;
const MASK_CHANNELS: usize = 1;

/// Spatial sizes must divide by this (three 2x reductions)
pub const SIZE_MULTIPLE: usize = 8;

/// Output head mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputMode {
    /// Raw head output
    Logits,
    /// Squashed into (0, 1) with a sigmoid
    Probability,
}

/// Convolution folded with its batch norm, followed by the leaky activation
struct ConvBlock {
    conv: Conv2d,
}

impl ConvBlock {
    fn load(weights: &WeightMap, conv: &str, norm: &str, stride: usize) -> MattingResult<Self> {
        let conv = Conv2d::new(
            weights.get::<Ix4>(&format!("{conv}.weight"))?,
            weights.get::<Ix1>(&format!("{conv}.bias"))?,
            stride,
            1,
        )?;
        let norm = BatchNorm {
            weight: weights.get(&format!("{norm}.weight"))?,
            bias: weights.get(&format!("{norm}.bias"))?,
            running_mean: weights.get(&format!("{norm}.running_mean"))?,
            running_var: weights.get(&format!("{norm}.running_var"))?,
        };
        Ok(Self {
            conv: conv.fold(&norm)?,
        })
    }

    fn forward(&self, x: ArrayView3<f32>) -> MattingResult<Array3<f32>> {
        Ok(leaky_relu(self.conv.forward(x)?))
    }
}

/// Two size-preserving blocks, optionally followed by a stride-2 block
///
/// Parameter paths follow the trained module layout: blocks at `.0/.1` and
/// `.3/.4`, the shrinking block at `.6.0/.6.1`.
struct Stage {
    blocks: Vec<ConvBlock>,
}

impl Stage {
    fn load(weights: &WeightMap, prefix: &str, shrink: bool) -> MattingResult<Self> {
        let mut blocks = vec![
            ConvBlock::load(weights, &format!("{prefix}.0"), &format!("{prefix}.1"), 1)?,
            ConvBlock::load(weights, &format!("{prefix}.3"), &format!("{prefix}.4"), 1)?,
        ];
        if shrink {
            blocks.push(ConvBlock::load(
                weights,
                &format!("{prefix}.6.0"),
                &format!("{prefix}.6.1"),
                2,
            )?);
        }
        Ok(Self { blocks })
    }

    fn forward(&self, x: ArrayView3<f32>) -> MattingResult<Array3<f32>> {
        let mut out = self.blocks[0].forward(x)?;
        for block in &self.blocks[1..] {
            out = block.forward(out.view())?;
        }
        Ok(out)
    }
}

/// Decoder step: learned 2x upsampling, skip concatenation, two blocks
struct UpStage {
    up: ConvTranspose2d,
    stage: Stage,
}

impl UpStage {
    fn load(weights: &WeightMap, up: &str, dec: &str) -> MattingResult<Self> {
        Ok(Self {
            up: ConvTranspose2d::new(
                weights.get(&format!("{up}.weight"))?,
                weights.get(&format!("{up}.bias"))?,
            )?,
            stage: Stage::load(weights, dec, false)?,
        })
    }

    fn forward(&self, x: ArrayView3<f32>, skip: ArrayView3<f32>) -> MattingResult<Array3<f32>> {
        let upsampled = self.up.forward(x)?;
        let joined = concatenate(Axis(0), &[upsampled.view(), skip.view()])?;
        self.stage.forward(joined.view())
    }
}

/// Alpha matte refinement network
///
/// Stateless and deterministic: the weights are read-only after loading, so
/// one instance can serve any number of concurrent requests.
pub struct MattingRefiner {
    enc1: Stage,
    enc2: Stage,
    enc3: Stage,
    bottleneck: Stage,
    dec3: UpStage,
    dec2: UpStage,
    dec1: UpStage,
    head: Conv2d,
    feature_channels: usize,
    mode: OutputMode,
}

impl MattingRefiner {
    /// Load the refiner from a weights file or checkpoint
    ///
    /// `mode` overrides the output head recorded in the artifact; without
    /// either, raw logits are produced.
    pub fn from_path<P: AsRef<Path>>(path: P, mode: Option<OutputMode>) -> MattingResult<Self> {
        let path = path.as_ref();
        tracing::info!("Loading matting refiner from {}", path.display());

        let artifact = load_artifact(path)?;
        let recorded = artifact.use_sigmoid.map(|s| {
            if s {
                OutputMode::Probability
            } else {
                OutputMode::Logits
            }
        });
        let mode = mode.or(recorded).unwrap_or(OutputMode::Logits);

        let refiner = Self::from_weights(&artifact.weights, mode)?;
        if let Some(manifest) = &artifact.manifest {
            tracing::info!(
                "Checkpoint epoch {} (learning rate {})",
                manifest.epoch,
                manifest.learning_rate
            );
        }
        tracing::info!(
            "Matting refiner loaded from {} ({} feature channels, {:?} output)",
            artifact.source.display(),
            refiner.feature_channels,
            refiner.mode
        );
        Ok(refiner)
    }

    pub fn from_weights(weights: &WeightMap, mode: OutputMode) -> MattingResult<Self> {
        let enc1 = Stage::load(weights, "enc1", false)?;
        let in_channels = enc1.blocks[0].conv.in_channels();
        let feature_channels = in_channels
            .checked_sub(IMAGE_CHANNELS + MASK_CHANNELS)
            .filter(|&c| c > 0)
            .ok_or_else(|| {
                MattingError::model(format!(
                    "first convolution takes {in_channels} channels, too few for image, mask and features"
                ))
            })?;

        let head = Conv2d::new(
            weights.get("final.weight")?,
            weights.get("final.bias")?,
            1,
            0,
        )?;
        if head.out_channels() != 1 {
            return Err(MattingError::model(format!(
                "output head produces {} channels, expected 1",
                head.out_channels()
            )));
        }

        Ok(Self {
            enc1,
            enc2: Stage::load(weights, "enc2", true)?,
            enc3: Stage::load(weights, "enc3", true)?,
            bottleneck: Stage::load(weights, "bottleneck", true)?,
            dec3: UpStage::load(weights, "up3", "dec3")?,
            dec2: UpStage::load(weights, "up2", "dec2")?,
            dec1: UpStage::load(weights, "up1", "dec1")?,
            head,
            feature_channels,
            mode,
        })
    }

    pub fn feature_channels(&self) -> usize {
        self.feature_channels
    }

    /// Produce an alpha matte for one frame
    ///
    /// # Arguments
    /// * `image` - Frame as CHW, 3 channels in `[0, 1]`
    /// * `mask` - Min-max normalized coarse mask, same H x W
    /// * `features` - Tracker features already resized to H x W
    ///
    /// H and W must be multiples of [`SIZE_MULTIPLE`].
    pub fn refine(
        &self,
        image: ArrayView3<f32>,
        mask: ArrayView2<f32>,
        features: ArrayView3<f32>,
    ) -> MattingResult<Array2<f32>> {
        let _span = tracing::debug_span!("refine").entered();

        let (image_channels, height, width) = image.dim();
        if image_channels != IMAGE_CHANNELS {
            return Err(MattingError::model(format!(
                "image has {image_channels} channels, expected {IMAGE_CHANNELS}"
            )));
        }
        if mask.dim() != (height, width) || (features.dim().1, features.dim().2) != (height, width) {
            return Err(MattingError::model(format!(
                "image {}x{}, mask {:?} and features {:?} must share a resolution",
                width,
                height,
                mask.dim(),
                features.dim()
            )));
        }
        if features.dim().0 != self.feature_channels {
            return Err(MattingError::model(format!(
                "features have {} channels, the refiner was trained on {}",
                features.dim().0,
                self.feature_channels
            )));
        }
        if height % SIZE_MULTIPLE != 0 || width % SIZE_MULTIPLE != 0 {
            return Err(MattingError::model(format!(
                "refine resolution {width}x{height} is not a multiple of {SIZE_MULTIPLE}"
            )));
        }

        let mask = mask.view().insert_axis(Axis(0));
        let x = concatenate(Axis(0), &[image.view(), mask.view(), features.view()])?;

        let e1 = self.enc1.forward(x.view())?;
        let e2 = self.enc2.forward(e1.view())?;
        let e3 = self.enc3.forward(e2.view())?;
        let b = self.bottleneck.forward(e3.view())?;

        let d3 = self.dec3.forward(b.view(), e3.view())?;
        let d2 = self.dec2.forward(d3.view(), e2.view())?;
        let d1 = self.dec1.forward(d2.view(), e1.view())?;

        let mut out = self.head.forward(d1.view())?.index_axis_move(Axis(0), 0);
        if self.mode == OutputMode::Probability {
            out.mapv_inplace(sigmoid);
        }
        Ok(out)
    }
}

/// Smallest size at or above `value` that the refiner accepts
pub fn aligned(value: u32) -> u32 {
    let m = SIZE_MULTIPLE as u32;
    value.div_ceil(m).max(1) * m
}
