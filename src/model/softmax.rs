/// Numerically stable softmax. Entries of `-inf` get zero probability.
///
/// Returns all zeros if every entry is `-inf` (or `NaN`), leaving the caller to reject it.
pub fn softmax_in_place(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY || max.is_nan() {
        x.fill(0.0);
        return;
    }
    let mut sum = 0.0;
    for x in x.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    x.iter_mut().for_each(|x| *x /= sum);
}

pub fn softmax(x: &[f32]) -> Vec<f32> {
    let mut x = x.to_vec();
    softmax_in_place(&mut x);
    x
}
