use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use self::{
    cancel::Cancel,
    control::{ControlError, DiversityControl},
    selection::Selector,
};
use crate::model::{runtime::Arena, Model, ModelError, ModelState};

pub mod cancel;
pub mod control;
pub mod selection;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodingOptions {
    /// Generation stops once this many tokens are generated.
    pub max_len: usize,
    /// The end token can't be chosen before this many tokens are generated.
    pub min_len: usize,
    /// Generation stops right after any of these appears at the tail of the output.
    pub stop_sequences: Vec<Vec<u32>>,
    pub end_token: u32,
    /// Generate the end token but keep it off the output stream.
    pub skip_end_token: bool,
    /// In `[0, 1]`; 1 leaves logits unchanged.
    pub temperature: f32,
    /// Keep only the `top_k` most likely tokens; 0 disables it.
    pub top_k: usize,
    /// In `[0, 1]`; 1 disables nucleus filtering.
    pub top_p: f32,
    pub use_sampling: bool,
    /// Seed of the sampling generator, for reproducible output.
    pub seed: Option<u64>,
}

impl Default for DecodingOptions {
    fn default() -> Self {
        Self {
            max_len: 256,
            min_len: 0,
            stop_sequences: vec![],
            end_token: 0,
            skip_end_token: false,
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            use_sampling: false,
            seed: None,
        }
    }
}

/// One emitted token with the running sum of the surprisal of every token chosen so far.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeneratedToken {
    pub token: u32,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    MaxLength,
    EndToken,
    StopSequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodeStatus {
    Stopped(StopReason),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOutcome {
    pub status: DecodeStatus,
    /// Every token chosen, including an end token kept off the stream.
    pub tokens: Vec<u32>,
    pub score: f64,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("every token was masked out")]
    EmptyDistribution,
}

/// Item of a token stream. A failed request ends its stream with the error.
pub type TokenResult = Result<GeneratedToken, Arc<DecodeError>>;

/// The hidden value of the last prompt token and the state right after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    pub hidden: Vec<f32>,
    pub state: ModelState,
}

/// Drives a model token by token for one request.
#[derive(Debug, Clone)]
pub struct Decoder {
    model: Arc<Model>,
    options: DecodingOptions,
    control: DiversityControl,
}

impl Decoder {
    pub fn new(model: Arc<Model>, options: DecodingOptions) -> Result<Self, DecodeError> {
        let control = DiversityControl::new(options.temperature, options.top_k, options.top_p)?;
        Ok(Self {
            model,
            options,
            control,
        })
    }

    pub fn options(&self) -> &DecodingOptions {
        &self.options
    }

    /// Run the whole prompt through the model from a fresh state.
    pub fn prefill(&self, prompt: &[u32]) -> Result<Encoded, DecodeError> {
        self.prefill_with(prompt, self.model.create_state())
    }

    /// Continue from `state`, e.g. a snapshot taken after a shared prefix.
    pub fn prefill_with(&self, prompt: &[u32], mut state: ModelState) -> Result<Encoded, DecodeError> {
        let mut arena = self.model.arena();
        let hidden = self.model.encode(prompt, &mut state, &mut arena);
        arena.release_all();
        log::debug!("prefilled {} tokens", prompt.len());
        Ok(Encoded {
            hidden: hidden?,
            state,
        })
    }

    /// Prefill `prompt` then decode, sending tokens to `sink`.
    ///
    /// A failure is sent down `sink` as the last item before it is returned.
    pub async fn generate(
        &self,
        prompt: &[u32],
        sink: &flume::Sender<TokenResult>,
        cancel: &Cancel,
    ) -> Result<DecodeOutcome, Arc<DecodeError>> {
        match self.prefill(prompt) {
            Ok(encoded) => self.decode(encoded, sink, cancel).await,
            Err(err) => Err(Self::fail(err, sink, cancel).await),
        }
    }

    /// Generate from an encoded prompt until a stop condition fires or `cancel` is triggered.
    ///
    /// A dropped receiver counts as cancellation. Scratch buffers are returned on every exit.
    pub async fn decode(
        &self,
        encoded: Encoded,
        sink: &flume::Sender<TokenResult>,
        cancel: &Cancel,
    ) -> Result<DecodeOutcome, Arc<DecodeError>> {
        let mut arena = self.model.arena();
        let outcome = self.run(encoded, &mut arena, sink, cancel).await;
        arena.release_all();

        match outcome {
            Ok(outcome) => {
                log::debug!(
                    "decoding finished: {:?} after {} tokens, score {:.3}",
                    outcome.status,
                    outcome.tokens.len(),
                    outcome.score
                );
                Ok(outcome)
            }
            Err(err) => Err(Self::fail(err, sink, cancel).await),
        }
    }

    async fn fail(
        err: DecodeError,
        sink: &flume::Sender<TokenResult>,
        cancel: &Cancel,
    ) -> Arc<DecodeError> {
        log::debug!("decoding failed: {err}");
        let err = Arc::new(err);
        tokio::select! {
            _ = sink.send_async(Err(err.clone())) => {}
            _ = cancel.cancelled() => {}
        }
        err
    }

    async fn run(
        &self,
        encoded: Encoded,
        arena: &mut Arena,
        sink: &flume::Sender<TokenResult>,
        cancel: &Cancel,
    ) -> Result<DecodeOutcome, DecodeError> {
        let options = &self.options;
        let Encoded { mut hidden, mut state } = encoded;
        let mut selector = Selector::new(options.use_sampling, options.seed);
        let mut tokens = vec![];
        let mut score = 0.0;

        // nothing is generated at all, not even a first token
        if options.max_len == 0 {
            return Ok(DecodeOutcome {
                status: DecodeStatus::Stopped(StopReason::MaxLength),
                tokens,
                score,
            });
        }

        let status = loop {
            tokio::task::yield_now().await;
            if cancel.is_cancelled() {
                break DecodeStatus::Cancelled;
            }

            let mut logits = self.model.predict(&hidden)?;
            if tokens.len() < options.min_len {
                if let Some(x) = logits.get_mut(options.end_token as usize) {
                    *x = f32::NEG_INFINITY;
                }
            }
            self.control.apply(&mut logits);
            let (token, prob) = selector
                .select(&mut logits)
                .ok_or(DecodeError::EmptyDistribution)?;
            let next_score = score - (prob as f64).ln();
            log::trace!("token {token} with probability {prob:.4}");

            if !(token == options.end_token && options.skip_end_token) {
                let output = GeneratedToken {
                    token,
                    score: next_score,
                };
                // send first: a token the consumer already took must count
                let sent = tokio::select! {
                    biased;
                    sent = sink.send_async(Ok(output)) => sent.is_ok(),
                    _ = cancel.cancelled() => false,
                };
                if !sent {
                    break DecodeStatus::Cancelled;
                }
            }
            tokens.push(token);
            score = next_score;

            if let Some(reason) = self.stop_reason(&tokens) {
                log::trace!("stopped: {reason:?}");
                break DecodeStatus::Stopped(reason);
            }
            hidden = self.model.encode(&[token], &mut state, arena)?;
        };

        Ok(DecodeOutcome {
            status,
            tokens,
            score,
        })
    }

    fn stop_reason(&self, tokens: &[u32]) -> Option<StopReason> {
        let options = &self.options;
        let &last = tokens.last()?;
        if tokens.len() >= options.max_len {
            return Some(StopReason::MaxLength);
        }
        if last == options.end_token {
            return Some(StopReason::EndToken);
        }
        let matched = options
            .stop_sequences
            .iter()
            .any(|stop| !stop.is_empty() && tokens.ends_with(stop));
        if tokens.len() >= options.min_len && matched {
            return Some(StopReason::StopSequence);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;

    use super::{
        cancel::Cancel, DecodeError, DecodeOutcome, DecodeStatus, Decoder, DecodingOptions,
        StopReason,
    };
    use crate::{
        decoder::control::ControlError,
        model::{testing, Model, ModelConfig, ModelError},
        tensor::{shape::Shape, TensorCpu},
    };

    const NUM_VOCAB: usize = 8;

    fn cycle() -> Result<Arc<Model>> {
        let config = ModelConfig::new(NUM_VOCAB, 1, NUM_VOCAB);
        let tensor = testing::transition_tensor(NUM_VOCAB, |x| (x + 1) % NUM_VOCAB);
        Ok(Arc::new(Model::from_tensor(config, tensor)?))
    }

    async fn run(
        model: &Arc<Model>,
        prompt: &[u32],
        options: DecodingOptions,
    ) -> Result<(DecodeOutcome, Vec<u32>)> {
        let decoder = Decoder::new(model.clone(), options)?;
        let (sender, receiver) = flume::unbounded();
        let outcome = decoder.generate(prompt, &sender, &Cancel::new()).await?;
        drop(sender);
        let emitted = receiver
            .drain()
            .map(|x| x.map(|x| x.token))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((outcome, emitted))
    }

    #[tokio::test]
    async fn test_greedy_deterministic() -> Result<()> {
        let config = ModelConfig::new(8, 2, 16);
        let model = Arc::new(Model::from_tensor(
            config.clone(),
            testing::random_tensor(&config, 11),
        )?);
        let options = DecodingOptions {
            max_len: 12,
            end_token: 100,
            ..Default::default()
        };
        let (x, _) = run(&model, &[1, 2, 3], options.clone()).await?;
        let (y, _) = run(&model, &[1, 2, 3], options).await?;
        assert_eq!(x, y);
        assert_eq!(x.tokens.len(), 12);
        assert_eq!(x.status, DecodeStatus::Stopped(StopReason::MaxLength));
        assert_eq!(model.outstanding_buffers(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_end_to_end() -> Result<()> {
        let model = cycle()?;
        let options = DecodingOptions {
            max_len: 5,
            end_token: 0,
            ..Default::default()
        };
        let (outcome, emitted) = run(&model, &[1, 2, 3], options).await?;
        assert_eq!(outcome.tokens, vec![4, 5, 6, 7, 0]);
        assert_eq!(emitted, outcome.tokens);
        assert_eq!(outcome.status, DecodeStatus::Stopped(StopReason::MaxLength));
        assert!(outcome.score > 0.0);

        let options = DecodingOptions {
            max_len: 10,
            end_token: 0,
            skip_end_token: true,
            ..Default::default()
        };
        let (outcome, emitted) = run(&model, &[5], options).await?;
        assert_eq!(outcome.tokens, vec![6, 7, 0]);
        assert_eq!(emitted, vec![6, 7]);
        assert_eq!(outcome.status, DecodeStatus::Stopped(StopReason::EndToken));
        Ok(())
    }

    #[tokio::test]
    async fn test_scores_accumulate() -> Result<()> {
        let model = cycle()?;
        let decoder = Decoder::new(model, DecodingOptions::default())?;
        let (sender, receiver) = flume::unbounded();
        decoder.generate(&[4], &sender, &Cancel::new()).await?;
        drop(sender);
        let scores: Vec<f64> = receiver.drain().flatten().map(|x| x.score).collect();
        assert_eq!(scores.len(), 4);
        assert!(scores.windows(2).all(|x| x[1] > x[0]));
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_sequence() -> Result<()> {
        let model = cycle()?;
        let options = DecodingOptions {
            max_len: 20,
            stop_sequences: vec![vec![5, 6]],
            ..Default::default()
        };
        let (outcome, _) = run(&model, &[4], options.clone()).await?;
        assert_eq!(outcome.tokens, vec![5, 6]);
        assert_eq!(outcome.status, DecodeStatus::Stopped(StopReason::StopSequence));

        // not before the minimum length
        let options = DecodingOptions {
            min_len: 3,
            ..options
        };
        let (outcome, _) = run(&model, &[4], options).await?;
        assert_eq!(outcome.tokens, vec![5, 6, 7, 0]);
        assert_eq!(outcome.status, DecodeStatus::Stopped(StopReason::EndToken));
        Ok(())
    }

    #[tokio::test]
    async fn test_min_len() -> Result<()> {
        let mut tensor = testing::transition_tensor(NUM_VOCAB, |x| (x + 1) % NUM_VOCAB);
        // logits become the head row sums, with the end token on top
        tensor.head.layer_norm.w = TensorCpu::init(Shape::vector(NUM_VOCAB), 0.0);
        tensor.head.layer_norm.b = TensorCpu::init(Shape::vector(NUM_VOCAB), 1.0);
        let mut w = vec![0.5; NUM_VOCAB * NUM_VOCAB];
        w[..NUM_VOCAB].fill(1.0);
        tensor.head.w = crate::tensor::matrix::Matrix::new(
            TensorCpu::from_data(Shape::matrix(NUM_VOCAB, NUM_VOCAB), w)?,
            Default::default(),
        );
        let config = ModelConfig::new(NUM_VOCAB, 1, NUM_VOCAB);
        let model = Arc::new(Model::from_tensor(config, tensor)?);

        let (outcome, _) = run(&model, &[3], DecodingOptions::default()).await?;
        assert_eq!(outcome.tokens, vec![0]);

        let options = DecodingOptions {
            min_len: 3,
            ..Default::default()
        };
        let (outcome, _) = run(&model, &[3], options).await?;
        assert_eq!(outcome.tokens.len(), 4);
        assert!(!outcome.tokens[..3].contains(&0));
        assert_eq!(outcome.tokens[3], 0);
        assert_eq!(outcome.status, DecodeStatus::Stopped(StopReason::EndToken));
        Ok(())
    }

    #[tokio::test]
    async fn test_top_k_one_samples_argmax() -> Result<()> {
        let model = cycle()?;
        let options = DecodingOptions {
            max_len: 6,
            top_k: 1,
            use_sampling: true,
            seed: Some(5),
            end_token: 100,
            ..Default::default()
        };
        let (outcome, _) = run(&model, &[1], options).await?;
        assert_eq!(outcome.tokens, vec![2, 3, 4, 5, 6, 7]);
        assert_eq!(outcome.score, 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_options() -> Result<()> {
        let model = cycle()?;
        let options = DecodingOptions {
            top_p: 2.0,
            ..Default::default()
        };
        assert!(matches!(
            Decoder::new(model.clone(), options),
            Err(DecodeError::Control(ControlError::TopP(_)))
        ));

        let decoder = Decoder::new(model, DecodingOptions::default())?;
        let (sender, receiver) = flume::unbounded();
        assert!(decoder.generate(&[], &sender, &Cancel::new()).await.is_err());
        let items: Vec<_> = receiver.drain().collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0].as_ref().map_err(|err| err.as_ref()),
            Err(DecodeError::Model(ModelError::EmptyInput))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel() -> Result<()> {
        // never reaches token 0
        let config = ModelConfig::new(NUM_VOCAB, 1, NUM_VOCAB);
        let tensor = testing::transition_tensor(NUM_VOCAB, |x| x % (NUM_VOCAB - 1) + 1);
        let model = Arc::new(Model::from_tensor(config, tensor)?);
        let decoder = Decoder::new(
            model.clone(),
            DecodingOptions {
                max_len: 1000,
                ..Default::default()
            },
        )?;

        let (sender, receiver) = flume::bounded(0);
        let cancel = Cancel::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { decoder.generate(&[1], &sender, &cancel).await }
        });

        let mut received = vec![];
        while let Ok(token) = receiver.recv_async().await {
            received.push(token?.token);
            if received.len() == 3 {
                cancel.cancel();
            }
        }
        let outcome = handle.await??;
        assert_eq!(received, vec![2, 3, 4]);
        assert_eq!(outcome.status, DecodeStatus::Cancelled);
        assert_eq!(outcome.tokens, received);
        assert_eq!(model.outstanding_buffers(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_receiver_dropped() -> Result<()> {
        let model = cycle()?;
        let decoder = Decoder::new(model.clone(), DecodingOptions::default())?;
        let (sender, receiver) = flume::bounded(1);
        drop(receiver);
        let outcome = decoder.generate(&[1], &sender, &Cancel::new()).await?;
        assert_eq!(outcome.status, DecodeStatus::Cancelled);
        assert!(outcome.tokens.is_empty());
        assert_eq!(model.outstanding_buffers(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_max_len() -> Result<()> {
        let model = cycle()?;
        let options = DecodingOptions {
            max_len: 0,
            ..Default::default()
        };
        let (outcome, emitted) = run(&model, &[1], options).await?;
        assert!(outcome.tokens.is_empty());
        assert!(emitted.is_empty());
        assert_eq!(outcome.score, 0.0);
        assert_eq!(outcome.status, DecodeStatus::Stopped(StopReason::MaxLength));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_after_take() -> Result<()> {
        let model = cycle()?;
        let decoder = Decoder::new(model.clone(), DecodingOptions::default())?;
        let (sender, receiver) = flume::bounded(0);
        let cancel = Cancel::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { decoder.generate(&[1], &sender, &cancel).await }
        });

        // the task is parked on its first send when the token is taken
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let token = receiver.recv_async().await??;
        cancel.cancel();

        let outcome = handle.await??;
        assert_eq!(token.token, 2);
        assert_eq!(outcome.status, DecodeStatus::Cancelled);
        assert_eq!(outcome.tokens, vec![2]);
        assert_eq!(outcome.score, token.score);
        assert_eq!(model.outstanding_buffers(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_error_ends_stream() -> Result<()> {
        // a single token that is also the end token, masked by the minimum length
        let config = ModelConfig::new(4, 1, 1);
        let model = Arc::new(Model::from_tensor(
            config.clone(),
            testing::random_tensor(&config, 3),
        )?);
        let options = DecodingOptions {
            min_len: 1,
            ..Default::default()
        };
        let decoder = Decoder::new(model.clone(), options)?;
        let (sender, receiver) = flume::unbounded();
        let result = decoder.generate(&[0], &sender, &Cancel::new()).await;
        assert!(matches!(
            result.as_ref().map_err(|err| err.as_ref()),
            Err(DecodeError::EmptyDistribution)
        ));

        drop(sender);
        let items: Vec<_> = receiver.drain().collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0].as_ref().map_err(|err| err.as_ref()),
            Err(DecodeError::EmptyDistribution)
        ));
        assert_eq!(model.outstanding_buffers(), 0);
        Ok(())
    }
}
