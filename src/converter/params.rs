use std::collections::BTreeSet;

use regex::Regex;

use super::{reader::Reader, ConvertError};
use crate::num::decode_f32;

/// A raw parameter widened to `f32`, with its shape in `torch` order.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Hands out each named parameter at most once and remembers which were never asked for.
pub struct ParamMap<'a, R: ?Sized> {
    reader: &'a R,
    remaining: BTreeSet<String>,
}

impl<'a, R: Reader + ?Sized> ParamMap<'a, R> {
    pub fn new(reader: &'a R) -> Self {
        let remaining = reader.names().into_iter().map(String::from).collect();
        Self { reader, remaining }
    }

    /// Take the parameter out of the map.
    pub fn fetch(&mut self, name: &str) -> Result<Param, ConvertError> {
        if !self.remaining.remove(name) {
            return match self.reader.contains(name) {
                true => Err(ConvertError::Consumed(name.into())),
                false => Err(ConvertError::Missing(name.into())),
            };
        }
        let (dtype, shape, data) = self.reader.tensor(name)?;
        let data = decode_f32(dtype, &data).ok_or_else(|| ConvertError::Storage {
            name: name.into(),
            kind: format!("{dtype:?}"),
        })?;
        if data.len() != shape.iter().product::<usize>() {
            return Err(ConvertError::OutOfBounds(name.into()));
        }
        Ok(Param { shape, data })
    }

    /// Names never fetched, in sorted order.
    pub fn remaining(&self) -> impl Iterator<Item = &str> {
        self.remaining.iter().map(String::as_str)
    }

    /// Number of layers, one past the highest `blocks.N.` index.
    pub fn count_blocks(&self) -> Result<usize, ConvertError> {
        let re = Regex::new(r"^blocks\.([^.]+)\.")?;
        let mut count = None;
        for name in self.reader.names() {
            let Some(captures) = re.captures(name) else {
                continue;
            };
            let index: usize = captures[1]
                .parse()
                .map_err(|_| ConvertError::BlockIndex(name.into()))?;
            count = count.max(Some(index + 1));
        }
        count.ok_or(ConvertError::NoBlocks)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::Result;
    use safetensors::{tensor::TensorView, Dtype, SafeTensors};

    use super::ParamMap;
    use crate::converter::ConvertError;

    fn serialize(names: &[&str]) -> Result<Vec<u8>> {
        let data = [half::f16::from_f32(1.5); 2];
        let bytes: &[u8] = bytemuck::cast_slice(&data);
        let tensors = names
            .iter()
            .map(|&name| Ok((name.to_string(), TensorView::new(Dtype::F16, vec![2], bytes)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(safetensors::serialize(&tensors, &None)?)
    }

    #[test]
    fn test_fetch_once() -> Result<()> {
        let bytes = serialize(&["emb.weight", "blocks.0.ln1.weight", "extra"])?;
        let reader = SafeTensors::deserialize(&bytes)?;
        let mut params = ParamMap::new(&reader);

        let param = params.fetch("emb.weight")?;
        assert_eq!(param.shape, vec![2]);
        assert_eq!(param.data, vec![1.5, 1.5]);

        assert!(matches!(
            params.fetch("emb.weight"),
            Err(ConvertError::Consumed(_))
        ));
        assert!(matches!(
            params.fetch("head.weight"),
            Err(ConvertError::Missing(name)) if name == "head.weight"
        ));

        params.fetch("blocks.0.ln1.weight")?;
        assert_eq!(params.remaining().collect::<Vec<_>>(), vec!["extra"]);
        Ok(())
    }

    #[test]
    fn test_count_blocks() -> Result<()> {
        let bytes = serialize(&["blocks.0.ln0.weight", "blocks.11.att.key.weight", "emb.weight"])?;
        let reader = SafeTensors::deserialize(&bytes)?;
        assert_eq!(ParamMap::new(&reader).count_blocks()?, 12);

        let bytes = serialize(&["emb.weight"])?;
        let reader = SafeTensors::deserialize(&bytes)?;
        assert!(matches!(
            ParamMap::new(&reader).count_blocks(),
            Err(ConvertError::NoBlocks)
        ));

        let bytes = serialize(&["blocks.x.ln1.weight"])?;
        let reader = SafeTensors::deserialize(&bytes)?;
        assert!(matches!(
            ParamMap::new(&reader).count_blocks(),
            Err(ConvertError::BlockIndex(_))
        ));
        Ok(())
    }
}
