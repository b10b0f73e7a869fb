use itertools::Itertools;

use crate::{model::softmax::softmax_in_place, tensor::ops::argmax};

/// Picks the next token from a filtered distribution.
#[derive(Debug, Clone)]
pub enum Selector {
    Greedy,
    Sampling(fastrand::Rng),
}

impl Selector {
    pub fn new(use_sampling: bool, seed: Option<u64>) -> Self {
        match (use_sampling, seed) {
            (false, _) => Self::Greedy,
            (true, Some(seed)) => Self::Sampling(fastrand::Rng::with_seed(seed)),
            (true, None) => Self::Sampling(fastrand::Rng::new()),
        }
    }

    /// Turn `logits` into probabilities in place and choose a token.
    ///
    /// Returns the token and its probability, or `None` if every logit is masked.
    pub fn select(&mut self, logits: &mut [f32]) -> Option<(u32, f32)> {
        softmax_in_place(logits);
        let probs: &[f32] = logits;
        if probs.iter().all(|&x| x == 0.0) {
            return None;
        }
        let token = match self {
            Selector::Greedy => argmax(probs)?,
            Selector::Sampling(rng) => {
                let rand = rng.f32();
                probs
                    .iter()
                    .scan(0.0, |cum, &x| {
                        *cum += x;
                        Some(*cum)
                    })
                    .enumerate()
                    .filter(|&(id, _)| probs[id] > 0.0)
                    .find_or_last(|&(_, cum)| rand < cum)
                    .map(|(id, _)| id)?
            }
        };
        Some((token as u32, probs[token]))
    }
}
