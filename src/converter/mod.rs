use std::{
    fs::File,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Result;
use memmap2::Mmap;
use safetensors::{SafeTensorError, SafeTensors};
use thiserror::Error;

use self::{
    params::{Param, ParamMap},
    reader::{Reader, TorchReader},
};
use crate::{
    model::{
        dump::dump,
        embed::{DiskStoreWriter, Embeddings},
        v4::{Att, Ffn, Layer, LayerNorm},
        Head, ModelConfig, ModelError, ModelTensor, CONFIG_FILE, MODEL_FILE,
    },
    tensor::{
        matrix::{Matrix, Precision},
        shape::Shape,
        TensorCpu, TensorError,
    },
};

pub mod params;
pub mod reader;

/// Default name of the checkpoint inside a model directory.
pub const INPUT_FILE: &str = "pytorch_model.pt";

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("missing parameter `{0}`")]
    Missing(String),
    #[error("parameter `{0}` fetched twice")]
    Consumed(String),
    #[error("parameter `{name}` has shape {actual:?}, expected {expected:?}")]
    Shape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("parameter `{name}` has unsupported storage kind {kind}")]
    Storage { name: String, kind: String },
    #[error("tensor `{0}` reaches beyond its storage")]
    OutOfBounds(String),
    #[error("malformed checkpoint: {0}")]
    Pickle(String),
    #[error("no `blocks.N.` parameters found")]
    NoBlocks,
    #[error("invalid block index in `{0}`")]
    BlockIndex(String),
    #[error("{field} is {declared} in the config but {found} in the checkpoint")]
    Conflict {
        field: &'static str,
        declared: usize,
        found: usize,
    },
    #[error(transparent)]
    SafeTensors(#[from] SafeTensorError),
    #[error(transparent)]
    Regex(#[from] regex::Error),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub model_dir: PathBuf,
    pub input_name: String,
    pub output_name: String,
    pub overwrite: bool,
    pub precision: Precision,
}

impl ConvertOptions {
    pub fn new(model_dir: impl AsRef<Path>) -> Self {
        Self {
            model_dir: model_dir.as_ref().to_path_buf(),
            input_name: INPUT_FILE.into(),
            output_name: MODEL_FILE.into(),
            overwrite: false,
            precision: Precision::default(),
        }
    }

    pub fn with_overwrite(mut self, value: bool) -> Self {
        self.overwrite = value;
        self
    }

    pub fn with_precision(mut self, value: Precision) -> Self {
        self.precision = value;
        self
    }

    /// Name of the checkpoint. Files ending in `.st` or `.safetensors` are read as safetensors.
    pub fn with_input_name(mut self, value: impl Into<String>) -> Self {
        self.input_name = value.into();
        self
    }

    pub fn with_output_name(mut self, value: impl Into<String>) -> Self {
        self.output_name = value.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvertReport {
    /// The output already existed and was left alone.
    pub skipped: bool,
    pub output: PathBuf,
    /// The config stored in the dump, with deduced dimensions filled in.
    pub config: Option<ModelConfig>,
    /// Checkpoint entries no parameter was read from.
    pub unused: Vec<String>,
}

/// Maps checkpoint parameters onto the model layout.
#[derive(Debug, Clone)]
pub struct Converter {
    config: ModelConfig,
    precision: Precision,
}

fn resolve(field: &'static str, declared: &mut usize, found: usize) -> Result<(), ConvertError> {
    match *declared {
        0 => {
            *declared = found;
            Ok(())
        }
        x if x == found => Ok(()),
        _ => Err(ConvertError::Conflict {
            field,
            declared: *declared,
            found,
        }),
    }
}

impl Converter {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            precision: Precision::Fp32,
        }
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Convert every parameter `reader` holds.
    ///
    /// Zero dimensions in the config are deduced from the checkpoint; non-zero ones must agree with it.
    /// Returns the completed config, the parameters and the names left unused.
    pub fn convert<R: Reader + ?Sized>(
        &self,
        reader: &R,
    ) -> Result<(ModelConfig, ModelTensor, Vec<String>), ConvertError> {
        let mut params = ParamMap::new(reader);
        let mut config = self.config.clone();

        let emb = params.fetch("emb.weight")?;
        let [num_vocab, num_emb] = emb.shape[..] else {
            return Err(ConvertError::Shape {
                name: "emb.weight".into(),
                expected: vec![config.vocab_size, config.d_model],
                actual: emb.shape.clone(),
            });
        };
        resolve("vocab_size", &mut config.vocab_size, num_vocab)?;
        resolve("d_model", &mut config.d_model, num_emb)?;
        let num_layer = params.count_blocks()?;
        resolve("num_hidden_layers", &mut config.num_hidden_layers, num_layer)?;
        config.validate()?;

        let embed = emb
            .data
            .chunks_exact(num_emb)
            .map(|row| TensorCpu::from_data(Shape::vector(num_emb), row))
            .collect::<Result<Vec<_>, _>>()?;
        log::info!("embeddings: {num_vocab} x {num_emb}");

        let mut load = Load {
            params: &mut params,
            precision: self.precision,
        };
        let head = Head {
            layer_norm: load.layer_norm("ln_out", num_emb)?,
            w: load.matrix("head.weight", num_vocab, num_emb, 1.0)?,
        };
        let layers = (0..num_layer)
            .map(|index| {
                let layer = load.layer(&config, index);
                log::info!("converted layer {index}");
                layer
            })
            .collect::<Result<Vec<_>, _>>()?;

        let unused: Vec<String> = params.remaining().map(String::from).collect();
        for name in &unused {
            log::warn!("unused parameter `{name}`");
        }

        let tensor = ModelTensor {
            embed: Embeddings(embed),
            head,
            layers,
        };
        Ok((config, tensor, unused))
    }
}

struct Load<'a, 'b, R: ?Sized> {
    params: &'a mut ParamMap<'b, R>,
    precision: Precision,
}

impl<R: Reader + ?Sized> Load<'_, '_, R> {
    fn fetch(&mut self, name: &str, expected: &[usize]) -> Result<Param, ConvertError> {
        let param = self.params.fetch(name)?;
        if param.shape != expected {
            return Err(ConvertError::Shape {
                name: name.into(),
                expected: expected.to_vec(),
                actual: param.shape,
            });
        }
        Ok(param)
    }

    /// A vector of `len`; leading unit axes (as in `time_mix` of shape `[1, 1, C]`) are squeezed.
    fn vector(&mut self, name: &str, len: usize) -> Result<TensorCpu<f32>, ConvertError> {
        let param = self.params.fetch(name)?;
        let squeezed = match param.shape.split_last() {
            Some((&last, rest)) => last == len && rest.iter().all(|&x| x == 1),
            None => false,
        };
        if !squeezed {
            return Err(ConvertError::Shape {
                name: name.into(),
                expected: vec![len],
                actual: param.shape,
            });
        }
        Ok(TensorCpu::from_data(Shape::vector(len), param.data)?)
    }

    /// A `torch` linear weight of shape `[num_out, num_in]`, multiplied by `scale`.
    fn matrix(
        &mut self,
        name: &str,
        num_out: usize,
        num_in: usize,
        scale: f32,
    ) -> Result<Matrix, ConvertError> {
        let mut param = self.fetch(name, &[num_out, num_in])?;
        if scale != 1.0 {
            param.data.iter_mut().for_each(|x| *x *= scale);
        }
        let tensor = TensorCpu::from_data(Shape::matrix(num_in, num_out), param.data)?;
        Ok(Matrix::new(tensor, self.precision))
    }

    fn layer_norm(&mut self, prefix: &str, len: usize) -> Result<LayerNorm, ConvertError> {
        Ok(LayerNorm {
            w: self.vector(&format!("{prefix}.weight"), len)?,
            b: self.vector(&format!("{prefix}.bias"), len)?,
        })
    }

    fn layer(&mut self, config: &ModelConfig, index: usize) -> Result<Layer, ConvertError> {
        let c = config.d_model;
        let h = config.num_hidden();
        let scale = match config.rescale_layer {
            0 => 1.0,
            x => 0.5f32.powi((index / x) as i32),
        };

        let p = format!("blocks.{index}");
        let ln0 = match index {
            0 => Some(self.layer_norm(&format!("{p}.ln0"), c)?),
            _ => None,
        };
        let att_layer_norm = self.layer_norm(&format!("{p}.ln1"), c)?;
        let ffn_layer_norm = self.layer_norm(&format!("{p}.ln2"), c)?;

        let att = Att {
            time_decay: self
                .vector(&format!("{p}.att.time_decay"), c)?
                .map(|&x| -x.exp()),
            time_first: self.vector(&format!("{p}.att.time_first"), c)?,
            time_mix_k: self.vector(&format!("{p}.att.time_mix_k"), c)?,
            time_mix_v: self.vector(&format!("{p}.att.time_mix_v"), c)?,
            time_mix_r: self.vector(&format!("{p}.att.time_mix_r"), c)?,
            w_k: self.matrix(&format!("{p}.att.key.weight"), c, c, 1.0)?,
            w_v: self.matrix(&format!("{p}.att.value.weight"), c, c, 1.0)?,
            w_r: self.matrix(&format!("{p}.att.receptance.weight"), c, c, 1.0)?,
            w_o: self.matrix(&format!("{p}.att.output.weight"), c, c, scale)?,
        };
        let ffn = Ffn {
            time_mix_k: self.vector(&format!("{p}.ffn.time_mix_k"), c)?,
            time_mix_r: self.vector(&format!("{p}.ffn.time_mix_r"), c)?,
            w_k: self.matrix(&format!("{p}.ffn.key.weight"), h, c, 1.0)?,
            w_v: self.matrix(&format!("{p}.ffn.value.weight"), c, h, scale)?,
            w_r: self.matrix(&format!("{p}.ffn.receptance.weight"), c, c, 1.0)?,
        };

        Ok(Layer {
            ln0,
            att_layer_norm,
            ffn_layer_norm,
            att,
            ffn,
        })
    }
}

fn is_safetensors(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|x| x.to_str()),
        Some("st" | "safetensors")
    )
}

/// Convert the checkpoint in a model directory into a dump next to it.
///
/// Does nothing if the dump already exists, unless asked to overwrite.
pub fn convert(options: &ConvertOptions) -> Result<ConvertReport> {
    let dir = &options.model_dir;
    let output = dir.join(&options.output_name);
    if output.exists() && !options.overwrite {
        log::info!("{output:?} exists, skipping conversion");
        return Ok(ConvertReport {
            skipped: true,
            output,
            ..Default::default()
        });
    }

    let config = ModelConfig::load(dir.join(CONFIG_FILE))?;
    let input = dir.join(&options.input_name);
    let file = File::open(&input).map_err(|err| match err.kind() {
        ErrorKind::NotFound => ModelError::NotDownloaded(input.clone()),
        _ => err.into(),
    })?;
    let map = unsafe { Mmap::map(&file)? };
    log::info!("converting {input:?}");

    let converter = Converter::new(config).with_precision(options.precision);
    let (config, tensor, unused) = match is_safetensors(&input) {
        true => converter.convert(&SafeTensors::deserialize(&map)?)?,
        false => converter.convert(&TorchReader::new(&input, &map)?)?,
    };

    // the old store stays until the dump is in place
    let (tensor, staged) = match config.embeddings_store_name.as_str() {
        "" => (tensor, None),
        name => {
            let mut writer = DiskStoreWriter::create(dir.join(name), config.d_model)?;
            let count = match writer.replace_all(tensor.embed.iter().map(|x| x.data())) {
                Ok(count) => count,
                Err(err) => {
                    writer.discard();
                    return Err(err.into());
                }
            };
            log::info!("staged {count} embeddings for store `{name}`");
            let tensor = ModelTensor {
                embed: Embeddings::default(),
                ..tensor
            };
            (tensor, Some(writer.close()?))
        }
    };

    if let Err(err) = dump(&output, &config, &tensor) {
        if let Some(staged) = staged {
            staged.discard();
        }
        return Err(err);
    }
    if let Some(staged) = staged {
        staged.commit()?;
    }
    Ok(ConvertReport {
        skipped: false,
        output,
        config: Some(config),
        unused,
    })
}
