use super::WeightMap;
use ndarray::{Array1, Array4};

const WIDTH: usize = 4;

fn kernel(shape: (usize, usize, usize, usize), scale: f32, seed: usize) -> Array4<f32> {
    Array4::from_shape_fn(shape, |(o, i, y, x)| {
        let k = (o * 7 + i * 5 + y * 3 + x + seed) as f32;
        (k * 0.37).sin() * scale
    })
}

fn block(weights: &mut WeightMap, conv: &str, norm: &str, inputs: usize, outputs: usize, scale: f32) {
    let seed = weights.len();
    weights.insert(format!("{conv}.weight"), kernel((outputs, inputs, 3, 3), scale, seed));
    weights.insert(format!("{conv}.bias"), Array1::from_elem(outputs, 0.01f32));
    weights.insert(format!("{norm}.weight"), Array1::from_elem(outputs, 1.0f32));
    weights.insert(format!("{norm}.bias"), Array1::<f32>::zeros(outputs));
    weights.insert(format!("{norm}.running_mean"), Array1::<f32>::zeros(outputs));
    weights.insert(format!("{norm}.running_var"), Array1::from_elem(outputs, 1.0f32));
}

fn stage(weights: &mut WeightMap, prefix: &str, inputs: usize, outputs: usize, shrink: bool, scale: f32) {
    block(weights, &format!("{prefix}.0"), &format!("{prefix}.1"), inputs, outputs, scale);
    block(weights, &format!("{prefix}.3"), &format!("{prefix}.4"), outputs, outputs, scale);
    if shrink {
        block(weights, &format!("{prefix}.6.0"), &format!("{prefix}.6.1"), outputs, outputs, scale);
    }
}

fn up(weights: &mut WeightMap, name: &str, inputs: usize, outputs: usize, scale: f32) {
    let seed = weights.len();
    weights.insert(format!("{name}.weight"), kernel((inputs, outputs, 2, 2), scale, seed));
    weights.insert(format!("{name}.bias"), Array1::<f32>::zeros(outputs));
}

/// Complete refiner parameters with every stage `WIDTH` channels wide
pub fn tiny_weights(feature_channels: usize, scale: f32) -> WeightMap {
    let mut weights = WeightMap::default();
    let w = WIDTH;

    stage(&mut weights, "enc1", 4 + feature_channels, w, false, scale);
    stage(&mut weights, "enc2", w, w, true, scale);
    stage(&mut weights, "enc3", w, w, true, scale);
    stage(&mut weights, "bottleneck", w, w, true, scale);

    up(&mut weights, "up3", w, w, scale);
    stage(&mut weights, "dec3", 2 * w, w, false, scale);
    up(&mut weights, "up2", w, w, scale);
    stage(&mut weights, "dec2", 2 * w, w, false, scale);
    up(&mut weights, "up1", w, w, scale);
    stage(&mut weights, "dec1", 2 * w, w, false, scale);

    weights.insert("final.weight", kernel((1, w, 1, 1), scale, 0));
    weights.insert("final.bias", Array1::from_elem(1, 0.0f32));
    weights
}
