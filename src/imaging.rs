//! Plane and tensor helpers shared by the tracker, the refiner and the
//! orchestrator.
//!
//! Float planes are resized here rather than through `imageops`, which clamps
//! `f32` samples to `[0, 1]` and would destroy raw logits and feature values.

use image::{imageops, GrayImage, Luma, RgbImage};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};

/// Channel layout expected by a consumer of an RGB frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Bilinear resize of a single plane with half-pixel centers
///
/// Matches `align_corners = false` sampling, so a 2x upscale followed by a 2x
/// downscale of a constant plane is the identity.
pub fn resize_plane(plane: ArrayView2<f32>, width: usize, height: usize) -> Array2<f32> {
    let (src_h, src_w) = plane.dim();
    if src_h == height && src_w == width {
        return plane.to_owned();
    }
    if src_h == 0 || src_w == 0 {
        return Array2::zeros((height, width));
    }

    let scale_y = src_h as f32 / height as f32;
    let scale_x = src_w as f32 / width as f32;

    // Precompute horizontal taps once per column
    let x_taps: Vec<(usize, usize, f32)> = (0..width)
        .map(|x| sample_taps(x, scale_x, src_w))
        .collect();

    let mut out = Array2::<f32>::zeros((height, width));
    for y in 0..height {
        let (y0, y1, fy) = sample_taps(y, scale_y, src_h);
        for (x, &(x0, x1, fx)) in x_taps.iter().enumerate() {
            let top = plane[[y0, x0]] * (1.0 - fx) + plane[[y0, x1]] * fx;
            let bottom = plane[[y1, x0]] * (1.0 - fx) + plane[[y1, x1]] * fx;
            out[[y, x]] = top * (1.0 - fy) + bottom * fy;
        }
    }
    out
}

fn sample_taps(dst: usize, scale: f32, src_len: usize) -> (usize, usize, f32) {
    let src = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
    let i0 = (src.floor() as usize).min(src_len - 1);
    let i1 = (i0 + 1).min(src_len - 1);
    (i0, i1, src - i0 as f32)
}

/// Resize every channel of a CHW map to `width` x `height`
pub fn resize_channels(map: ArrayView3<f32>, width: usize, height: usize) -> Array3<f32> {
    let (channels, h, w) = map.dim();
    if h == height && w == width {
        return map.to_owned();
    }

    let mut out = Array3::<f32>::zeros((channels, height, width));
    for (src, mut dst) in map.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
        dst.assign(&resize_plane(src, width, height));
    }
    out
}

/// Convert an RGB frame into a CHW tensor scaled to `[0, 1]`
pub fn rgb_to_chw(image: &RgbImage, order: ChannelOrder) -> Array3<f32> {
    let (width, height) = image.dimensions();
    let mut tensor = Array3::<f32>::zeros((3, height as usize, width as usize));

    let channels = match order {
        ChannelOrder::Rgb => [0, 1, 2],
        ChannelOrder::Bgr => [2, 1, 0],
    };

    for (x, y, pixel) in image.enumerate_pixels() {
        for (dst, &src) in channels.iter().enumerate() {
            tensor[[dst, y as usize, x as usize]] = pixel[src] as f32 / 255.0;
        }
    }

    tensor
}

/// Resize an RGB frame with the given filter, skipping the copy when the
/// dimensions already match
pub fn resize_rgb(
    image: &RgbImage,
    width: u32,
    height: u32,
    filter: imageops::FilterType,
) -> RgbImage {
    if image.dimensions() == (width, height) {
        image.clone()
    } else {
        imageops::resize(image, width, height, filter)
    }
}

/// Scale a `[0, 1]` plane to an 8-bit grayscale image
pub fn plane_to_gray(plane: ArrayView2<f32>) -> GrayImage {
    let (height, width) = plane.dim();
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let value = (plane[[y as usize, x as usize]] * 255.0).round().clamp(0.0, 255.0) as u8;
        Luma([value])
    })
}

/// Read an 8-bit grayscale image back into a `[0, 1]` plane
pub fn gray_to_plane(image: &GrayImage) -> Array2<f32> {
    let (width, height) = image.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        image.get_pixel(x as u32, y as u32)[0] as f32 / 255.0
    })
}
