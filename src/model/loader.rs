use std::{
    fs::File,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use cbor4ii::core::utils::SliceReader;
use memmap2::Mmap;
use serde::Deserialize;

use super::{
    dump::{DumpHeader, DUMP_VERSION},
    embed::{DiskStore, Embed, Embeddings},
    v4::{Layer, LayerNorm},
    Head, Model, ModelConfig, ModelError, ModelTensor, CONFIG_FILE, MODEL_FILE,
};
use crate::tensor::matrix::Matrix;

/// Reads the chunks of a parameter dump back in the order they were written.
pub struct Loader<'a> {
    deserializer: cbor4ii::serde::Deserializer<SliceReader<'a>>,
}

impl<'a> Loader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let reader = SliceReader::new(data);
        Self {
            deserializer: cbor4ii::serde::Deserializer::new(reader),
        }
    }

    fn chunk<T: Deserialize<'a>>(&mut self, name: &str) -> Result<T> {
        T::deserialize(&mut self.deserializer)
            .with_context(|| format!("failed to read chunk `{name}`"))
    }

    pub fn header(&mut self) -> Result<DumpHeader> {
        let header: DumpHeader = self.chunk("header")?;
        if header.version != DUMP_VERSION {
            return Err(ModelError::Dump(format!(
                "unsupported dump version {}, expected {DUMP_VERSION}",
                header.version
            ))
            .into());
        }
        Ok(header)
    }

    /// Read every chunk after the header.
    pub fn tensor(&mut self, config: &ModelConfig) -> Result<ModelTensor> {
        let embed: Embeddings = self.chunk("embed")?;
        let layer_norm: LayerNorm = self.chunk("head.layer_norm")?;
        let w: Matrix = self.chunk("head.w")?;
        let layers = (0..config.num_hidden_layers)
            .map(|index| self.chunk::<Layer>(&format!("layer {index}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(ModelTensor {
            embed,
            head: Head { layer_norm, w },
            layers,
        })
    }
}

/// Read a dump file into its config and parameters.
pub fn read_dump(path: impl AsRef<Path>) -> Result<(ModelConfig, ModelTensor)> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => ModelError::NotConverted(path.to_path_buf()),
        _ => err.into(),
    })?;
    let map = unsafe { Mmap::map(&file)? };

    let mut loader = Loader::new(&map);
    let DumpHeader { config, .. } = loader.header()?;
    let tensor = loader.tensor(&config)?;
    Ok((config, tensor))
}

/// Dimensions left at zero in the side-car were deduced at conversion and match anything.
fn same_shape(declared: &ModelConfig, dumped: &ModelConfig) -> bool {
    let fits = |x: usize, y: usize| x == 0 || x == y;
    fits(declared.d_model, dumped.d_model)
        && fits(declared.num_hidden_layers, dumped.num_hidden_layers)
        && fits(declared.vocab_size, dumped.vocab_size)
        && declared.rescale_layer == dumped.rescale_layer
}

impl Model {
    /// Load a converted model from its directory.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        Self::load_with(dir, MODEL_FILE)
    }

    /// Load a converted model whose dump is named `model_name` inside `dir`.
    pub fn load_with(dir: impl AsRef<Path>, model_name: &str) -> Result<Self> {
        let dir = dir.as_ref();
        let config = ModelConfig::load(dir.join(CONFIG_FILE))?;
        let path: PathBuf = dir.join(model_name);
        let (dumped, tensor) = read_dump(&path)?;
        if !same_shape(&config, &dumped) {
            return Err(ModelError::Dump(format!(
                "{path:?} was converted with a different config; convert again with overwrite"
            ))
            .into());
        }
        // eps follows the side-car config
        let config = ModelConfig {
            layer_norm_eps: config.layer_norm_eps,
            ..dumped
        };

        let embed = match config.embeddings_store_name.as_str() {
            "" => Embed::Memory(tensor.embed),
            name => Embed::Disk(DiskStore::open(dir.join(name))?),
        };
        let model = Model::new(config, embed, tensor.head, tensor.layers)?;
        log::info!(
            "loaded model from {dir:?}: {} layers, embed {}, vocab {}",
            model.config().num_hidden_layers,
            model.config().d_model,
            model.config().vocab_size
        );
        Ok(model)
    }
}
