use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use self::{
    embed::{Embed, EmbedStore, Embeddings},
    runtime::{Arena, Runtime, RuntimeKey},
    v4::{Encoder, Layer, LayerNorm},
};
use crate::tensor::{cache::ResourcePool, matrix::Matrix, TensorError};

pub mod dump;
pub mod embed;
pub mod loader;
pub mod runtime;
pub mod softmax;
pub mod state;
pub mod v4;

pub use state::{LayerState, ModelState};

pub const RESCALE_LAYER: usize = 6;
pub const LN_EPS: f32 = 1.0e-5;
/// Prompts longer than this are fed to the stack in several sequence passes.
pub const TOKEN_CHUNK_SIZE: usize = 128;

/// Model config file name inside a model directory.
pub const CONFIG_FILE: &str = "config.json";
/// Default name of the converted parameter dump.
pub const MODEL_FILE: &str = "model.bin";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid model config: {0}")]
    InvalidConfig(String),
    #[error("malformed model config: {0}")]
    Config(#[from] serde_json::Error),
    #[error("model config {0:?} not found; download the model first")]
    NotDownloaded(PathBuf),
    #[error("{0:?} not found; convert the model first")]
    NotConverted(PathBuf),
    #[error("invalid model dump: {0}")]
    Dump(String),
    #[error("invalid embedding store {0:?}: {1}")]
    EmbedStore(PathBuf, String),
    #[error("empty input")]
    EmptyInput,
    #[error("token {token} out of vocabulary range {num_vocab}")]
    TokenOutOfRange { token: u32, num_vocab: usize },
    #[error("state doesn't fit the model of {num_layer} layers and embed size {num_emb}")]
    StateMismatch { num_layer: usize, num_emb: usize },
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn default_rescale_layer() -> usize {
    RESCALE_LAYER
}

fn default_layer_norm_eps() -> f32 {
    LN_EPS
}

/// Content of `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub d_model: usize,
    #[serde(default)]
    pub num_hidden_layers: usize,
    #[serde(default)]
    pub vocab_size: usize,
    /// Halve the hidden value after every this many layers; 0 disables it.
    #[serde(default = "default_rescale_layer")]
    pub rescale_layer: usize,
    /// Directory name of an on-disk embedding store; empty keeps embeddings in the dump.
    #[serde(default)]
    pub embeddings_store_name: String,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
}

impl ModelConfig {
    pub fn new(d_model: usize, num_hidden_layers: usize, vocab_size: usize) -> Self {
        Self {
            d_model,
            num_hidden_layers,
            vocab_size,
            rescale_layer: RESCALE_LAYER,
            embeddings_store_name: String::new(),
            layer_norm_eps: LN_EPS,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ModelError::NotDownloaded(path.to_path_buf()))
            }
            Err(err) => return Err(err.into()),
        };
        let config = serde_json::from_reader(BufReader::new(file))?;
        Ok(config)
    }

    /// Width of the channel-mix hidden layer.
    #[inline]
    pub fn num_hidden(&self) -> usize {
        self.d_model * 4
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let zero = [
            ("d_model", self.d_model),
            ("num_hidden_layers", self.num_hidden_layers),
            ("vocab_size", self.vocab_size),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);
        if let Some((name, _)) = zero {
            return Err(ModelError::InvalidConfig(format!("{name} must be positive")));
        }
        if self.layer_norm_eps.is_nan() || self.layer_norm_eps < 0.0 {
            return Err(ModelError::InvalidConfig(format!(
                "layer_norm_eps must be non-negative, got {}",
                self.layer_norm_eps
            )));
        }
        Ok(())
    }
}

/// Final normalization and projection to vocabulary logits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Head {
    pub layer_norm: LayerNorm,
    pub w: Matrix,
}

/// Every parameter of a model, as produced by the converter.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelTensor {
    /// Empty when the embeddings live in a separate store.
    pub embed: Embeddings,
    pub head: Head,
    pub layers: Vec<Layer>,
}

#[derive(Debug, Getters)]
pub struct Model {
    config: ModelConfig,
    embed: Embed,
    head: Head,
    encoder: Encoder,
    #[getter(skip)]
    pool: ResourcePool<RuntimeKey, Runtime>,
}

impl Model {
    pub fn new(
        config: ModelConfig,
        embed: Embed,
        head: Head,
        layers: Vec<Layer>,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        let (num_emb, num_hidden) = (config.d_model, config.num_hidden());

        if embed.num_emb() != num_emb || embed.len() != config.vocab_size {
            return Err(ModelError::InvalidConfig(format!(
                "embeddings are {} x {}, expected {} x {}",
                embed.len(),
                embed.num_emb(),
                config.vocab_size,
                num_emb
            )));
        }
        head.layer_norm.check(num_emb)?;
        head.w.check(num_emb, config.vocab_size)?;

        if layers.len() != config.num_hidden_layers {
            return Err(ModelError::InvalidConfig(format!(
                "{} layers found, expected {}",
                layers.len(),
                config.num_hidden_layers
            )));
        }
        for (index, layer) in layers.iter().enumerate() {
            if layer.ln0.is_some() != (index == 0) {
                return Err(ModelError::InvalidConfig(format!(
                    "layer {index}: only the first layer carries a pre-norm"
                )));
            }
            layer.check(num_emb, num_hidden)?;
        }

        let encoder = Encoder {
            layers,
            rescale_layer: config.rescale_layer,
            layer_norm_eps: config.layer_norm_eps,
        };
        Ok(Self {
            config,
            embed,
            head,
            encoder,
            pool: Default::default(),
        })
    }

    pub fn from_tensor(config: ModelConfig, tensor: ModelTensor) -> Result<Self, ModelError> {
        let ModelTensor { embed, head, layers } = tensor;
        Self::new(config, Embed::Memory(embed), head, layers)
    }

    /// A fresh carried state for one request.
    pub fn create_state(&self) -> ModelState {
        ModelState::new(&self.config)
    }

    /// A per-request arena drawing scratch buffers from this model's pool.
    pub fn arena(&self) -> Arena {
        Arena::new(
            self.pool.clone(),
            self.config.d_model,
            self.config.num_hidden(),
        )
    }

    /// Scratch buffers currently checked out by live arenas.
    pub fn outstanding_buffers(&self) -> usize {
        self.pool.outstanding()
    }

    /// Look up the embeddings of `tokens`, laid out consecutively.
    pub fn embed_tokens(&self, tokens: &[u32]) -> Result<Vec<f32>, ModelError> {
        let mut output = Vec::with_capacity(tokens.len() * self.config.d_model);
        for &token in tokens {
            let vector = self.embed.get(token).ok_or(ModelError::TokenOutOfRange {
                token,
                num_vocab: self.embed.len(),
            })?;
            output.extend_from_slice(vector);
        }
        Ok(output)
    }

    /// Run `tokens` through the stack, advancing `state`, and return the hidden value of the last token.
    ///
    /// A single token takes the single-step path; longer inputs run in sequence mode.
    pub fn encode(
        &self,
        tokens: &[u32],
        state: &mut ModelState,
        arena: &mut Arena,
    ) -> Result<Vec<f32>, ModelError> {
        if tokens.is_empty() {
            return Err(ModelError::EmptyInput);
        }
        state.check(&self.config)?;

        let num_emb = self.config.d_model;
        let mut hidden = vec![];
        for chunk in tokens.chunks(TOKEN_CHUNK_SIZE) {
            let mut x = self.embed_tokens(chunk)?;
            let runtime = arena.checkout(chunk.len());
            match chunk.len() {
                1 => self.encoder.forward_one(&mut x, state, runtime)?,
                num_token => self.encoder.forward_seq(&mut x, num_token, state, runtime)?,
            }
            hidden = x.split_off(x.len() - num_emb);
        }
        Ok(hidden)
    }

    /// Logits over the vocabulary for a hidden value.
    pub fn predict(&self, hidden: &[f32]) -> Result<Vec<f32>, ModelError> {
        let num_emb = self.config.d_model;
        if hidden.len() != num_emb {
            return Err(TensorError::Size(num_emb, hidden.len()).into());
        }
        let mut x = vec![0.0; num_emb];
        self.head
            .layer_norm
            .forward(hidden, &mut x, self.config.layer_norm_eps);
        let mut logits = vec![0.0; self.config.vocab_size];
        self.head.w.matmul(&x, &mut logits)?;
        Ok(logits)
    }
}
