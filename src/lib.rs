pub mod converter;
pub mod decoder;
pub mod model;
pub mod num;
pub mod pipeline;
pub mod tensor;

pub use converter::{convert, ConvertError, ConvertOptions, ConvertReport};
pub use decoder::{
    cancel::Cancel, DecodeError, DecodeOutcome, DecodeStatus, Decoder, DecodingOptions,
    GeneratedToken, StopReason, TokenResult,
};
pub use model::{Model, ModelConfig, ModelError, ModelState};
pub use pipeline::{Generation, Pipeline, Tokenize};
pub use tensor::{matrix::Precision, TensorError};
