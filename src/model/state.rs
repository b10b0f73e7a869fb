use serde::{Deserialize, Serialize};
use rwkv_flow_derive::{Deref, DerefMut};

use super::{ModelConfig, ModelError};

/// Initial value of the running maximum `att_p`; small enough that the first update discards it.
pub const ATT_P_INIT: f32 = -1.0e30;

/// Carried state of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerState {
    /// Previous channel-mix input.
    pub ffn_x: Vec<f32>,
    /// Previous time-mix input.
    pub att_x: Vec<f32>,
    /// WKV numerator.
    pub att_a: Vec<f32>,
    /// WKV denominator.
    pub att_b: Vec<f32>,
    /// WKV running maximum exponent.
    pub att_p: Vec<f32>,
}

impl LayerState {
    pub fn new(num_emb: usize) -> Self {
        Self {
            ffn_x: vec![0.0; num_emb],
            att_x: vec![0.0; num_emb],
            att_a: vec![0.0; num_emb],
            att_b: vec![0.0; num_emb],
            att_p: vec![ATT_P_INIT; num_emb],
        }
    }

    #[inline]
    pub fn num_emb(&self) -> usize {
        self.att_x.len()
    }

    fn is_consistent(&self, num_emb: usize) -> bool {
        [
            &self.ffn_x,
            &self.att_x,
            &self.att_a,
            &self.att_b,
            &self.att_p,
        ]
        .iter()
        .all(|x| x.len() == num_emb)
    }
}

/// The carried state of the whole stack, one [`LayerState`] per layer.
///
/// Its size depends only on the model config, never on how many tokens have been processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Deref, DerefMut)]
pub struct ModelState(pub Vec<LayerState>);

impl ModelState {
    pub fn new(config: &ModelConfig) -> Self {
        let layers = (0..config.num_hidden_layers)
            .map(|_| LayerState::new(config.d_model))
            .collect();
        Self(layers)
    }

    /// Check that the state fits a model of the given config.
    pub fn check(&self, config: &ModelConfig) -> Result<(), ModelError> {
        let fits = self.len() == config.num_hidden_layers
            && self.iter().all(|layer| layer.is_consistent(config.d_model));
        match fits {
            true => Ok(()),
            false => Err(ModelError::StateMismatch {
                num_layer: config.num_hidden_layers,
                num_emb: config.d_model,
            }),
        }
    }
}
