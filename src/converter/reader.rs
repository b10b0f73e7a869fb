use std::{borrow::Cow, path::Path};

use ahash::AHashMap;
use repugnant_pickle::{RepugnantTorchTensors as TorchTensors, TensorType};
use safetensors::{Dtype, SafeTensors};

use super::ConvertError;

pub type ReaderTensor<'a> = (Dtype, Vec<usize>, Cow<'a, [u8]>);

/// Interface accessing a named tensor blob, with shapes in `torch` order.
pub trait Reader {
    fn names(&self) -> Vec<&str>;
    fn contains(&self, name: &str) -> bool;
    fn shape(&self, name: &str) -> Result<Vec<usize>, ConvertError>;
    fn tensor(&self, name: &str) -> Result<ReaderTensor<'_>, ConvertError>;
}

impl Reader for SafeTensors<'_> {
    #[inline]
    fn names(&self) -> Vec<&str> {
        SafeTensors::names(self).into_iter().map(String::as_str).collect()
    }

    #[inline]
    fn contains(&self, name: &str) -> bool {
        SafeTensors::tensor(self, name).is_ok()
    }

    #[inline]
    fn shape(&self, name: &str) -> Result<Vec<usize>, ConvertError> {
        Ok(SafeTensors::tensor(self, name)?.shape().to_vec())
    }

    #[inline]
    fn tensor(&self, name: &str) -> Result<ReaderTensor<'_>, ConvertError> {
        let tensor = SafeTensors::tensor(self, name)?;
        let shape = tensor.shape().to_vec();
        let data = tensor.data().into();
        Ok((tensor.dtype(), shape, data))
    }
}

#[derive(Debug, Clone)]
struct TorchEntry {
    dtype: Dtype,
    shape: Vec<usize>,
    stride: Vec<usize>,
    offset: usize,
}

/// Tensors of a PyTorch checkpoint, read straight out of the memory-mapped zip container.
#[derive(Debug)]
pub struct TorchReader<'a> {
    data: &'a [u8],
    names: Vec<String>,
    entries: AHashMap<String, TorchEntry>,
}

impl<'a> TorchReader<'a> {
    /// `data` must be the content of the file at `path`.
    pub fn new(path: impl AsRef<Path>, data: &'a [u8]) -> Result<Self, ConvertError> {
        let tensors = TorchTensors::new_from_file(path.as_ref())
            .map_err(|err| ConvertError::Pickle(err.to_string()))?;

        let mut names = vec![];
        let mut entries = AHashMap::new();
        for tensor in tensors.into_iter() {
            let dtype = match tensor.tensor_type {
                TensorType::Float32 => Dtype::F32,
                TensorType::Float16 => Dtype::F16,
                TensorType::BFloat16 => Dtype::BF16,
                other => {
                    return Err(ConvertError::Storage {
                        name: tensor.name,
                        kind: format!("{other:?}"),
                    })
                }
            };
            let entry = TorchEntry {
                dtype,
                shape: tensor.shape,
                stride: tensor.stride,
                offset: tensor.absolute_offset as usize,
            };
            names.push(tensor.name.clone());
            entries.insert(tensor.name, entry);
        }
        Ok(Self {
            data,
            names,
            entries,
        })
    }
}

impl Reader for TorchReader<'_> {
    fn names(&self) -> Vec<&str> {
        self.names.iter().map(String::as_str).collect()
    }

    fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn shape(&self, name: &str) -> Result<Vec<usize>, ConvertError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ConvertError::Missing(name.into()))?;
        Ok(entry.shape.clone())
    }

    fn tensor(&self, name: &str) -> Result<ReaderTensor<'_>, ConvertError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ConvertError::Missing(name.into()))?;
        let data = self
            .data
            .get(entry.offset..)
            .ok_or_else(|| ConvertError::OutOfBounds(name.into()))?;
        let size = dtype_size(entry.dtype);
        let data = gather_strided(data, &entry.shape, &entry.stride, size)
            .ok_or_else(|| ConvertError::OutOfBounds(name.into()))?;
        Ok((entry.dtype, entry.shape.clone(), data))
    }
}

fn dtype_size(dtype: Dtype) -> usize {
    match dtype {
        Dtype::F32 => 4,
        Dtype::F16 | Dtype::BF16 => 2,
        _ => 1,
    }
}

/// Copy the elements of a strided view into row-major order.
///
/// `shape` and `stride` are in elements, slowest axis first. A view that is already row-major
/// is borrowed as is. Returns `None` if the view reaches beyond `data`.
pub fn gather_strided<'a>(
    data: &'a [u8],
    shape: &[usize],
    stride: &[usize],
    size: usize,
) -> Option<Cow<'a, [u8]>> {
    let len: usize = shape.iter().product();
    if len == 0 {
        return Some(Cow::Borrowed(&[]));
    }

    let mut contiguous = true;
    let mut expected = 1;
    for (&dim, &stride) in shape.iter().zip(stride).rev() {
        if dim != 1 && stride != expected {
            contiguous = false;
        }
        expected *= dim;
    }
    if contiguous || stride.len() != shape.len() {
        return data.get(..len * size).map(Cow::Borrowed);
    }

    let extent = 1 + Iterator::zip(shape.iter(), stride)
        .map(|(dim, stride)| (dim - 1) * stride)
        .sum::<usize>();
    if data.len() < extent * size {
        return None;
    }

    let mut output = Vec::with_capacity(len * size);
    let mut index = vec![0; shape.len()];
    for _ in 0..len {
        let offset: usize = Iterator::zip(index.iter(), stride)
            .map(|(index, stride)| index * stride)
            .sum();
        output.extend_from_slice(&data[offset * size..(offset + 1) * size]);

        for axis in (0..shape.len()).rev() {
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    Some(Cow::Owned(output))
}
