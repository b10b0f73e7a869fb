//! Element-wise and row-wise kernels on `f32` slices.
//!
//! All kernels operate on one token (one row of `num_emb` elements) unless noted.

#[inline]
pub fn dot(x: &[f32], y: &[f32]) -> f32 {
    debug_assert_eq!(x.len(), y.len());
    Iterator::zip(x.iter(), y.iter()).map(|(x, y)| x * y).sum()
}

/// Normalize `input` to zero mean and unit variance, then apply weight `w` and bias `b`.
pub fn layer_norm(input: &[f32], w: &[f32], b: &[f32], eps: f32, output: &mut [f32]) {
    let len = input.len() as f32;
    let mean = input.iter().sum::<f32>() / len;
    let var = input.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / len;
    let inv_std = (var + eps).sqrt().recip();
    for (((output, &x), &w), &b) in output.iter_mut().zip(input).zip(w).zip(b) {
        *output = (x - mean) * inv_std * w + b;
    }
}

pub fn layer_norm_in_place(x: &mut [f32], w: &[f32], b: &[f32], eps: f32) {
    let len = x.len() as f32;
    let mean = x.iter().sum::<f32>() / len;
    let var = x.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / len;
    let inv_std = (var + eps).sqrt().recip();
    for ((x, &w), &b) in x.iter_mut().zip(w).zip(b) {
        *x = (*x - mean) * inv_std * w + b;
    }
}

/// `output = x * mix + last * (1 - mix)`.
pub fn token_shift(mix: &[f32], x: &[f32], last: &[f32], output: &mut [f32]) {
    for (((output, &mix), &x), &last) in output.iter_mut().zip(mix).zip(x).zip(last) {
        *output = x * mix + last * (1.0 - mix);
    }
}

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn sigmoid_in_place(x: &mut [f32]) {
    x.iter_mut().for_each(|x| *x = sigmoid(*x));
}

/// `max(x, 0)^2`.
pub fn squared_relu_in_place(x: &mut [f32]) {
    x.iter_mut().for_each(|x| *x = x.max(0.0).powi(2));
}

pub fn add_in_place(x: &mut [f32], y: &[f32]) {
    x.iter_mut().zip(y).for_each(|(x, y)| *x += y);
}

pub fn mul_in_place(x: &mut [f32], y: &[f32]) {
    x.iter_mut().zip(y).for_each(|(x, y)| *x *= y);
}

pub fn scale_in_place(x: &mut [f32], factor: f32) {
    x.iter_mut().for_each(|x| *x *= factor);
}

/// Index of the first maximum.
pub fn argmax(x: &[f32]) -> Option<usize> {
    x.iter()
        .enumerate()
        .fold(None, |acc: Option<(usize, f32)>, (index, &value)| match acc {
            Some((_, max)) if max >= value => acc,
            _ if value.is_nan() => acc,
            _ => Some((index, value)),
        })
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(x: &[f32], y: &[f32]) -> bool {
        x.len() == y.len() && x.iter().zip(y).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn test_layer_norm() {
        let input = [1.0, 2.0, 3.0, 4.0];
        let w = [1.0; 4];
        let b = [0.5; 4];
        let mut output = [0.0; 4];
        layer_norm(&input, &w, &b, 0.0, &mut output);

        let std = 1.25f32.sqrt();
        let expected = input.map(|x| (x - 2.5) / std + 0.5);
        assert!(approx(&output, &expected), "{output:?}");

        let mut x = input;
        layer_norm_in_place(&mut x, &w, &b, 0.0);
        assert_eq!(x, output);
    }

    #[test]
    fn test_token_shift() {
        let mut output = [0.0; 3];
        token_shift(&[1.0, 0.0, 0.25], &[4.0, 4.0, 4.0], &[8.0, 8.0, 8.0], &mut output);
        assert_eq!(output, [4.0, 8.0, 7.0]);
    }

    #[test]
    fn test_activations() {
        let mut x = [-2.0, 0.0, 3.0];
        squared_relu_in_place(&mut x);
        assert_eq!(x, [0.0, 0.0, 9.0]);

        let mut x = [0.0, 40.0, -40.0];
        sigmoid_in_place(&mut x);
        assert!(approx(&x, &[0.5, 1.0, 0.0]));
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0, -1.0]), Some(1));
        assert_eq!(argmax(&[f32::NEG_INFINITY, -5.0]), Some(1));
        assert_eq!(argmax(&[]), None);
    }
}
