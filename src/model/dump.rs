use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::{ModelConfig, ModelTensor};

/// Bumped whenever the chunk layout changes.
pub const DUMP_VERSION: u32 = 1;

/// First chunk of a dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpHeader {
    pub version: u32,
    pub config: ModelConfig,
}

struct ChunkWriter<'a, W>(&'a mut W);

impl<W: Write> cbor4ii::core::enc::Write for ChunkWriter<'_, W> {
    type Error = std::io::Error;

    fn push(&mut self, input: &[u8]) -> Result<(), Self::Error> {
        self.0.write_all(input)
    }
}

/// Encode one self-contained CBOR value and flush it out.
fn write_chunk<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    {
        let mut serializer = cbor4ii::serde::Serializer::new(ChunkWriter(writer));
        value.serialize(&mut serializer)?;
    }
    writer.flush()?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write the model as an ordered sequence of chunks:
/// header (with config), embeddings, head layer norm, head matrix, then one chunk per layer.
///
/// The dump goes to `<path>.tmp` first and is renamed into place once complete.
pub fn dump(path: impl AsRef<Path>, config: &ModelConfig, tensor: &ModelTensor) -> Result<()> {
    let path = path.as_ref();
    let temp = temp_path(path);

    let write = || -> Result<()> {
        let mut writer = BufWriter::new(File::create(&temp)?);
        let header = DumpHeader {
            version: DUMP_VERSION,
            config: config.clone(),
        };
        write_chunk(&mut writer, &header)?;
        write_chunk(&mut writer, &tensor.embed)?;
        write_chunk(&mut writer, &tensor.head.layer_norm)?;
        write_chunk(&mut writer, &tensor.head.w)?;
        for (index, layer) in tensor.layers.iter().enumerate() {
            write_chunk(&mut writer, layer)?;
            log::debug!("dumped layer {index}");
        }
        writer.into_inner()?.sync_all()?;
        Ok(())
    };

    if let Err(err) = write() {
        let _ = std::fs::remove_file(&temp);
        return Err(err);
    }
    std::fs::rename(&temp, path)?;
    log::info!("model dumped to {path:?}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::temp_path;

    #[test]
    fn test_temp_path() {
        let path = temp_path(Path::new("/models/tiny/model.bin"));
        assert_eq!(path, Path::new("/models/tiny/model.bin.tmp"));
    }
}
