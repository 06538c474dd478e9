use crate::error::{MattingError, MattingResult};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};

/// Negative slope of every activation in the network
pub const LEAKY_SLOPE: f32 = 0.02;

const BATCH_NORM_EPS: f32 = 1e-5;

/// Upper bound on the im2col buffer, in elements
const COLUMN_TILE_ELEMS: usize = 1 << 22;

/// Inference-mode batch normalization parameters
pub struct BatchNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
}

/// 2D convolution over a CHW tensor
pub struct Conv2d {
    /// Flattened kernel, shape [out, in * k * k]
    weight: Array2<f32>,
    bias: Array1<f32>,
    in_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
}

impl Conv2d {
    /// `weight` has the usual [out, in, k, k] layout
    pub fn new(
        weight: Array4<f32>,
        bias: Array1<f32>,
        stride: usize,
        padding: usize,
    ) -> MattingResult<Self> {
        let (out_channels, in_channels, kh, kw) = weight.dim();
        if kh != kw {
            return Err(MattingError::model(format!("non-square kernel {kh}x{kw}")));
        }
        if bias.len() != out_channels {
            return Err(MattingError::model(format!(
                "bias has {} entries for {} output channels",
                bias.len(),
                out_channels
            )));
        }

        let weight = weight.into_shape((out_channels, in_channels * kh * kw))?;
        Ok(Self {
            weight,
            bias,
            in_channels,
            kernel: kh,
            stride,
            padding,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.weight.nrows()
    }

    /// Fold a following batch normalization into this convolution
    pub fn fold(mut self, bn: &BatchNorm) -> MattingResult<Self> {
        let channels = self.out_channels();
        let lengths = [
            ("weight", bn.weight.len()),
            ("bias", bn.bias.len()),
            ("running_mean", bn.running_mean.len()),
            ("running_var", bn.running_var.len()),
        ];
        if let Some((name, len)) = lengths.iter().find(|(_, len)| *len != channels) {
            return Err(MattingError::model(format!(
                "batch norm {name} over {len} channels follows a {channels}-channel convolution"
            )));
        }

        let scale = (&bn.running_var + BATCH_NORM_EPS).mapv(f32::sqrt);
        let scale = &bn.weight / &scale;

        for (mut row, &k) in self.weight.axis_iter_mut(Axis(0)).zip(scale.iter()) {
            row *= k;
        }
        self.bias = (&self.bias - &bn.running_mean) * &scale + &bn.bias;
        Ok(self)
    }

    pub fn forward(&self, input: ArrayView3<f32>) -> MattingResult<Array3<f32>> {
        let (channels, height, width) = input.dim();
        if channels != self.in_channels {
            return Err(MattingError::model(format!(
                "convolution expects {} input channels, got {}",
                self.in_channels, channels
            )));
        }

        let k = self.kernel;
        let (pad, stride) = (self.padding as isize, self.stride);
        let out_h = (height + 2 * self.padding - k) / stride + 1;
        let out_w = (width + 2 * self.padding - k) / stride + 1;
        let patch = channels * k * k;

        let mut out = Array3::<f32>::zeros((self.out_channels(), out_h, out_w));
        let rows_per_tile = (COLUMN_TILE_ELEMS / (patch * out_w).max(1)).max(1);

        for row0 in (0..out_h).step_by(rows_per_tile) {
            let rows = rows_per_tile.min(out_h - row0);
            let mut cols = Array2::<f32>::zeros((patch, rows * out_w));

            for c in 0..channels {
                let plane = input.index_axis(Axis(0), c);
                for ky in 0..k {
                    for kx in 0..k {
                        let mut dst = cols.row_mut((c * k + ky) * k + kx);
                        for oy in 0..rows {
                            let iy = ((row0 + oy) * stride) as isize + ky as isize - pad;
                            if iy < 0 || iy >= height as isize {
                                continue;
                            }
                            let src = plane.row(iy as usize);
                            for ox in 0..out_w {
                                let ix = (ox * stride) as isize + kx as isize - pad;
                                if ix >= 0 && ix < width as isize {
                                    dst[oy * out_w + ox] = src[ix as usize];
                                }
                            }
                        }
                    }
                }
            }

            let tile = self.weight.dot(&cols).into_shape((self.out_channels(), rows, out_w))?;
            out.slice_mut(s![.., row0..row0 + rows, ..]).assign(&tile);
        }

        let bias = self.bias.view().insert_axis(Axis(1)).insert_axis(Axis(2));
        out += &bias;
        Ok(out)
    }
}

/// Learned 2x upsampling (kernel 2, stride 2)
pub struct ConvTranspose2d {
    /// Shape [in, out, 2, 2]
    weight: Array4<f32>,
    bias: Array1<f32>,
}

impl ConvTranspose2d {
    pub fn new(weight: Array4<f32>, bias: Array1<f32>) -> MattingResult<Self> {
        let (_, out_channels, kh, kw) = weight.dim();
        if (kh, kw) != (2, 2) || bias.len() != out_channels {
            return Err(MattingError::model(format!(
                "upsampling expects a 2x2 kernel and {} biases, got {}x{} and {}",
                out_channels,
                kh,
                kw,
                bias.len()
            )));
        }
        Ok(Self { weight, bias })
    }

    pub fn forward(&self, input: ArrayView3<f32>) -> MattingResult<Array3<f32>> {
        let (channels, height, width) = input.dim();
        let (in_channels, out_channels, _, _) = self.weight.dim();
        if channels != in_channels {
            return Err(MattingError::model(format!(
                "upsampling expects {in_channels} input channels, got {channels}"
            )));
        }

        let flat = Array2::from_shape_vec((channels, height * width), input.iter().copied().collect())?;
        let mut out = Array3::<f32>::zeros((out_channels, height * 2, width * 2));

        for dy in 0..2 {
            for dx in 0..2 {
                let taps: ArrayView2<f32> = self.weight.slice(s![.., .., dy, dx]);
                let phase = taps
                    .t()
                    .dot(&flat)
                    .into_shape((out_channels, height, width))?;
                out.slice_mut(s![.., dy..;2, dx..;2]).assign(&phase);
            }
        }

        let bias = self.bias.view().insert_axis(Axis(1)).insert_axis(Axis(2));
        out += &bias;
        Ok(out)
    }
}

pub fn leaky_relu(mut x: Array3<f32>) -> Array3<f32> {
    x.mapv_inplace(|v| if v >= 0.0 { v } else { v * LEAKY_SLOPE });
    x
}

pub fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn same_padding_keeps_size_and_strided_conv_halves_it() {
        let input = Array3::from_elem((2, 6, 8), 1.0f32);
        let weight = Array4::from_elem((3, 2, 3, 3), 0.5f32);

        let same = Conv2d::new(weight.clone(), Array1::zeros(3), 1, 1).unwrap();
        let out = same.forward(input.view()).unwrap();
        assert_eq!(out.dim(), (3, 6, 8));
        // interior pixel sees the full 2x3x3 window
        assert_eq!(out[[0, 3, 4]], 9.0);
        // corner sees 2x2x2 inside the image
        assert_eq!(out[[0, 0, 0]], 4.0);

        let strided = Conv2d::new(weight, Array1::zeros(3), 2, 1).unwrap();
        assert_eq!(strided.forward(input.view()).unwrap().dim(), (3, 3, 4));
    }

    #[test]
    fn pointwise_conv_is_a_channel_mix() {
        let input = array![[[1.0f32, 2.0]], [[3.0, 4.0]]];
        let weight = Array4::from_shape_vec((1, 2, 1, 1), vec![10.0, 1.0]).unwrap();
        let conv = Conv2d::new(weight, array![0.5], 1, 0).unwrap();

        let out = conv.forward(input.view()).unwrap();
        assert_eq!(out, array![[[13.5f32, 24.5]]]);
    }

    #[test]
    fn folded_batch_norm_matches_separate_application() {
        let weight = Array4::from_shape_vec((1, 1, 1, 1), vec![2.0f32]).unwrap();
        let bn = BatchNorm {
            weight: array![3.0],
            bias: array![1.0],
            running_mean: array![4.0],
            running_var: array![1.0 - BATCH_NORM_EPS],
        };
        let conv = Conv2d::new(weight, array![0.0], 1, 0).unwrap().fold(&bn).unwrap();

        let out = conv.forward(array![[[5.0f32]]].view()).unwrap();
        // (2 * 5 - 4) / 1 * 3 + 1
        assert!((out[[0, 0, 0]] - 19.0).abs() < 1e-4);
    }

    #[test]
    fn batch_norm_with_short_statistics_is_rejected() {
        let weight = Array4::from_shape_vec((2, 1, 1, 1), vec![1.0f32, 1.0]).unwrap();
        let bn = BatchNorm {
            weight: array![1.0, 1.0],
            bias: array![0.0, 0.0],
            running_mean: array![0.0],
            running_var: array![1.0, 1.0],
        };
        let err = Conv2d::new(weight, array![0.0, 0.0], 1, 0)
            .unwrap()
            .fold(&bn)
            .err()
            .unwrap();
        assert!(matches!(err, MattingError::Model(_)));
        assert!(err.to_string().contains("running_mean"));
    }

    #[test]
    fn transposed_conv_doubles_and_interleaves() {
        let weight = Array4::from_shape_vec((1, 1, 2, 2), vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let up = ConvTranspose2d::new(weight, array![0.0]).unwrap();

        let out = up.forward(array![[[1.0f32, 10.0]]].view()).unwrap();
        assert_eq!(out, array![[[1.0f32, 2.0, 10.0, 20.0], [3.0, 4.0, 30.0, 40.0]]]);
    }

    #[test]
    fn leaky_relu_scales_negatives_only() {
        let out = leaky_relu(array![[[-1.0f32, 2.0]]]);
        assert_eq!(out, array![[[-0.02f32, 2.0]]]);
    }
}
