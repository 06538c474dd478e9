use super::PromptPoint;
use crate::imaging::{self, ChannelOrder};
use image::{imageops, RgbImage};
use ndarray::{Array2, Array4, ArrayView2, Axis};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Preprocessor for converting frames and prompts into the tracker's square
/// model space
pub struct Preprocessor {
    target_size: u32,
}

impl Preprocessor {
    pub fn new(target_size: u32) -> Self {
        Self { target_size }
    }

    /// Preprocess an RGB frame into a normalized NCHW tensor
    ///
    /// Steps:
    /// 1. Resize (without preserving aspect) to the square model size
    /// 2. Scale to [0, 1]
    /// 3. Normalize with ImageNet mean/std
    ///
    /// Returns: Array4<f32> with shape [1, 3, size, size]
    pub fn preprocess(&self, image: &RgbImage) -> Array4<f32> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized = imaging::resize_rgb(
            image,
            self.target_size,
            self.target_size,
            imageops::FilterType::Triangle,
        );

        let mut chw = imaging::rgb_to_chw(&resized, ChannelOrder::Rgb);
        for (c, mut plane) in chw.axis_iter_mut(Axis(0)).enumerate() {
            plane.mapv_inplace(|v| (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c]);
        }

        chw.insert_axis(Axis(0))
    }

    /// Map frame-pixel prompts into model space, flattened as x0, y0, x1, y1, ...
    pub fn prompt_coords(&self, points: &[PromptPoint], frame_size: (u32, u32)) -> Vec<f32> {
        let sx = self.target_size as f32 / frame_size.0 as f32;
        let sy = self.target_size as f32 / frame_size.1 as f32;

        points.iter().flat_map(|p| [p.x * sx, p.y * sy]).collect()
    }

    /// Upsample low-resolution mask logits to frame resolution
    pub fn mask_to_frame(&self, low_res: ArrayView2<f32>, frame_size: (u32, u32)) -> Array2<f32> {
        let _span = tracing::debug_span!("postprocess").entered();
        imaging::resize_plane(low_res, frame_size.0 as usize, frame_size.1 as usize)
    }

    /// Upsample low-resolution mask logits to the square model size, as the
    /// memory encoder expects
    pub fn mask_to_model(&self, low_res: ArrayView2<f32>) -> Array2<f32> {
        let size = self.target_size as usize;
        imaging::resize_plane(low_res, size, size)
    }
}
