use std::{path::Path, sync::Arc};

use anyhow::Result;
use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::{
    decoder::{
        cancel::Cancel, DecodeError, DecodeOutcome, Decoder, DecodingOptions, GeneratedToken,
        TokenResult,
    },
    model::{Model, ModelError},
};

/// Tokens buffered between a request task and its consumer.
pub const CHANNEL_CAPACITY: usize = 16;

/// Text to token id mapping.
pub trait Tokenize {
    type Error: std::error::Error + Send + Sync + 'static;

    fn tokenize(&self, text: &str) -> Result<Vec<u32>, Self::Error>;
    fn reconstruct_text(&self, tokens: &[u32]) -> Result<String, Self::Error>;
}

/// Serves generation requests from one loaded model.
#[derive(Debug, Clone)]
pub struct Pipeline {
    model: Arc<Model>,
    capacity: usize,
}

impl Pipeline {
    pub fn new(model: Arc<Model>) -> Self {
        Self {
            model,
            capacity: CHANNEL_CAPACITY,
        }
    }

    /// Load a converted model directory.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let model = Model::load(dir)?;
        Ok(Self::new(Arc::new(model)))
    }

    /// Number of tokens a request may run ahead of its consumer.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Start a request task. The prompt and options are checked before anything is spawned.
    ///
    /// Must be called within a `tokio` runtime.
    pub fn generate(&self, prompt: Vec<u32>, options: DecodingOptions) -> Result<Generation> {
        if prompt.is_empty() {
            return Err(ModelError::EmptyInput.into());
        }
        let decoder = Decoder::new(self.model.clone(), options)?;
        let (sender, receiver) = flume::bounded(self.capacity);
        let cancel = Cancel::new();

        log::debug!("request started with {} prompt tokens", prompt.len());
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { decoder.generate(&prompt, &sender, &cancel).await }
        });
        Ok(Generation {
            receiver,
            cancel,
            handle,
        })
    }

    /// Tokenize `prompt` and start a request task.
    pub fn generate_text<T: Tokenize>(
        &self,
        tokenizer: &T,
        prompt: &str,
        options: DecodingOptions,
    ) -> Result<Generation> {
        let tokens = tokenizer.tokenize(prompt)?;
        self.generate(tokens, options)
    }
}

/// Handle to a running request.
///
/// The stream closes once the request ends. A failed request sends its error as the last item.
#[derive(Debug)]
pub struct Generation {
    pub receiver: flume::Receiver<TokenResult>,
    pub cancel: Cancel,
    pub handle: JoinHandle<Result<DecodeOutcome, Arc<DecodeError>>>,
}

impl Generation {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn stream(&self) -> flume::r#async::RecvStream<'_, TokenResult> {
        self.receiver.stream()
    }

    /// Drain the stream, then wait for the request's outcome.
    pub async fn collect(self) -> Result<(Vec<GeneratedToken>, DecodeOutcome)> {
        let items: Vec<TokenResult> = self.receiver.stream().collect().await;
        let outcome = self.handle.await??;
        let tokens = items.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok((tokens, outcome))
    }
}
