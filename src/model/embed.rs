use std::{
    fs::File,
    io::{BufWriter, ErrorKind, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use rwkv_flow_derive::{Deref, DerefMut};

use super::ModelError;
use crate::tensor::TensorCpu;

/// Name of the row file inside an embedding store directory.
pub const EMBED_FILE: &str = "embeddings.bin";

const MAGIC: [u8; 8] = *b"RWKVEMB1";
const HEADER_SIZE: usize = 24;

/// Lookup from token id to its embedding vector.
pub trait EmbedStore {
    /// Length of each vector.
    fn num_emb(&self) -> usize;
    /// Number of tokens stored.
    fn len(&self) -> usize;
    fn get(&self, token: u32) -> Option<&[f32]>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory embedding table, one vector per token.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, Deref, DerefMut)]
pub struct Embeddings(pub Vec<TensorCpu<f32>>);

impl EmbedStore for Embeddings {
    fn num_emb(&self) -> usize {
        self.first().map(|x| x.len()).unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn get(&self, token: u32) -> Option<&[f32]> {
        self.0.get(token as usize).map(|x| x.data())
    }
}

/// Read-only embedding store backed by a memory-mapped file.
#[derive(Debug)]
pub struct DiskStore {
    map: Mmap,
    num_vocab: usize,
    num_emb: usize,
}

impl DiskStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = dir.as_ref().join(EMBED_FILE);
        let file = File::open(&path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => ModelError::NotConverted(path.clone()),
            _ => err.into(),
        })?;
        let map = unsafe { Mmap::map(&file)? };

        let invalid = |reason: &str| ModelError::EmbedStore(path.clone(), reason.into());
        if map.len() < HEADER_SIZE || map[..8] != MAGIC {
            return Err(invalid("bad header"));
        }
        let read_u64 = |offset: usize| {
            let mut bytes = [0; 8];
            bytes.copy_from_slice(&map[offset..offset + 8]);
            u64::from_le_bytes(bytes) as usize
        };
        let num_vocab = read_u64(8);
        let num_emb = read_u64(16);
        let size = num_vocab
            .checked_mul(num_emb)
            .and_then(|x| x.checked_mul(std::mem::size_of::<f32>()))
            .ok_or_else(|| invalid("dimensions overflow"))?;
        if map.len() - HEADER_SIZE != size {
            return Err(invalid("truncated rows"));
        }
        if bytemuck::try_cast_slice::<u8, f32>(&map[HEADER_SIZE..]).is_err() {
            return Err(invalid("misaligned rows"));
        }

        log::info!("opened embedding store {path:?}: {num_vocab} x {num_emb}");
        Ok(Self {
            map,
            num_vocab,
            num_emb,
        })
    }
}

impl EmbedStore for DiskStore {
    fn num_emb(&self) -> usize {
        self.num_emb
    }

    fn len(&self) -> usize {
        self.num_vocab
    }

    fn get(&self, token: u32) -> Option<&[f32]> {
        let token = token as usize;
        if token >= self.num_vocab {
            return None;
        }
        let size = self.num_emb * std::mem::size_of::<f32>();
        let start = HEADER_SIZE + token * size;
        bytemuck::try_cast_slice(&self.map[start..start + size]).ok()
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writable side of a [`DiskStore`], used while converting a model.
///
/// Rows go to a temporary file; the store only changes once the staged file is committed.
#[derive(Debug)]
pub struct DiskStoreWriter {
    path: PathBuf,
    temp: PathBuf,
    writer: BufWriter<File>,
    num_emb: usize,
}

impl DiskStoreWriter {
    pub fn create(dir: impl AsRef<Path>, num_emb: usize) -> Result<Self, ModelError> {
        std::fs::create_dir_all(&dir)?;
        let path = dir.as_ref().join(EMBED_FILE);
        let temp = temp_path(&path);
        let writer = BufWriter::new(File::create(&temp)?);
        Ok(Self {
            path,
            temp,
            writer,
            num_emb,
        })
    }

    /// Replace every stored vector with `rows`, in token order.
    pub fn replace_all<'a>(
        &mut self,
        rows: impl IntoIterator<Item = &'a [f32]>,
    ) -> Result<usize, ModelError> {
        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.get_ref().set_len(0)?;
        self.writer.write_all(&[0; HEADER_SIZE])?;

        let mut count = 0;
        for row in rows {
            if row.len() != self.num_emb {
                return Err(ModelError::EmbedStore(
                    self.path.clone(),
                    format!("row {count} has {} elements, expected {}", row.len(), self.num_emb),
                ));
            }
            for x in row {
                self.writer.write_all(&x.to_le_bytes())?;
            }
            count += 1;
        }

        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.write_all(&MAGIC)?;
        self.writer.write_all(&(count as u64).to_le_bytes())?;
        self.writer.write_all(&(self.num_emb as u64).to_le_bytes())?;
        self.writer.seek(SeekFrom::End(0))?;
        Ok(count)
    }

    /// Flush everything to disk and hand back the staged file, not yet in place.
    pub fn close(mut self) -> Result<StagedStore, ModelError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(StagedStore {
            path: self.path,
            temp: self.temp,
        })
    }

    /// Drop whatever was written.
    pub fn discard(self) {
        let Self { temp, writer, .. } = self;
        drop(writer);
        let _ = std::fs::remove_file(temp);
    }
}

/// A fully written store waiting to replace the current one.
#[derive(Debug)]
pub struct StagedStore {
    path: PathBuf,
    temp: PathBuf,
}

impl StagedStore {
    pub fn commit(self) -> Result<(), ModelError> {
        std::fs::rename(&self.temp, &self.path)?;
        Ok(())
    }

    pub fn discard(self) {
        let _ = std::fs::remove_file(&self.temp);
    }
}

/// The embedding source a loaded model reads from.
#[derive(Debug)]
pub enum Embed {
    Memory(Embeddings),
    Disk(DiskStore),
}

impl EmbedStore for Embed {
    fn num_emb(&self) -> usize {
        match self {
            Embed::Memory(store) => store.num_emb(),
            Embed::Disk(store) => store.num_emb(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Embed::Memory(store) => store.len(),
            Embed::Disk(store) => store.len(),
        }
    }

    fn get(&self, token: u32) -> Option<&[f32]> {
        match self {
            Embed::Memory(store) => store.get(token),
            Embed::Disk(store) => store.get(token),
        }
    }
}
