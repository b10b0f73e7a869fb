use std::{cmp::Reverse, collections::BinaryHeap};

use itertools::Itertools;
use thiserror::Error;

use crate::model::softmax::softmax;

/// Replaces a temperature of zero.
pub const MIN_TEMPERATURE: f32 = 0.01;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error("temperature must be in [0, 1], got {0}")]
    Temperature(f32),
    #[error("top-p must be in [0, 1], got {0}")]
    TopP(f32),
}

/// Total order on `f32` for the top-k heap.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Logit(f32);

impl Eq for Logit {}

impl PartialOrd for Logit {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Logit {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Reshapes logits before selection: temperature, then top-k, then top-p.
///
/// Each stage is skipped at its neutral value (temperature 1, top-k 0, top-p 1).
#[derive(Debug, Clone, PartialEq)]
pub struct DiversityControl {
    temperature: Option<f32>,
    top_k: Option<usize>,
    top_p: Option<f32>,
}

impl DiversityControl {
    pub fn new(temperature: f32, top_k: usize, top_p: f32) -> Result<Self, ControlError> {
        if !(0.0..=1.0).contains(&temperature) {
            return Err(ControlError::Temperature(temperature));
        }
        if !(0.0..=1.0).contains(&top_p) {
            return Err(ControlError::TopP(top_p));
        }
        let temperature = if temperature == 1.0 {
            None
        } else if temperature == 0.0 {
            Some(MIN_TEMPERATURE)
        } else {
            Some(temperature)
        };
        let top_k = (top_k > 0).then_some(top_k);
        let top_p = (top_p < 1.0).then_some(top_p);
        Ok(Self {
            temperature,
            top_k,
            top_p,
        })
    }

    pub fn is_identity(&self) -> bool {
        self.temperature.is_none() && self.top_k.is_none() && self.top_p.is_none()
    }

    pub fn apply(&self, logits: &mut [f32]) {
        if self.is_identity() {
            return;
        }
        if let Some(temperature) = self.temperature {
            logits.iter_mut().for_each(|x| *x /= temperature);
        }
        if let Some(k) = self.top_k {
            top_k(logits, k);
        }
        if let Some(p) = self.top_p {
            top_p(logits, p);
        }
    }
}

/// Mask every logit below the `k`-th largest. Ties with the `k`-th largest survive.
pub fn top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut heap = BinaryHeap::with_capacity(k + 1);
    for &x in logits.iter() {
        heap.push(Reverse(Logit(x)));
        if heap.len() > k {
            heap.pop();
        }
    }
    let Some(&Reverse(Logit(threshold))) = heap.peek() else {
        return;
    };
    logits
        .iter_mut()
        .filter(|x| **x < threshold)
        .for_each(|x| *x = f32::NEG_INFINITY);
}

/// Nucleus filtering: keep the smallest most-likely prefix whose mass exceeds `p`,
/// including the token that crosses it.
pub fn top_p(logits: &mut [f32], p: f32) {
    let sorted = logits
        .iter()
        .copied()
        .enumerate()
        .sorted_by(|(_, x), (_, y)| x.total_cmp(y).reverse())
        .collect_vec();
    let probs = softmax(&sorted.iter().map(|&(_, x)| x).collect_vec());

    let remove = probs
        .iter()
        .scan(0.0, |cum, &x| {
            *cum += x;
            Some(*cum > p)
        })
        .collect_vec();
    // shift right so the token crossing `p` is kept, along with at least the top one
    for (index, &(id, _)) in sorted.iter().enumerate().skip(1) {
        if remove[index - 1] {
            logits[id] = f32::NEG_INFINITY;
        }
    }
}
