use std::borrow::Cow;

use safetensors::Dtype;
use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};

use super::{shape::Shape, TensorCpu};
use crate::num::Scalar;

/// On-disk form of a tensor: its element type, shape and raw little-endian bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TensorBlob<'a> {
    dtype: Dtype,
    shape: Shape,
    #[serde(with = "serde_bytes")]
    #[serde(borrow)]
    data: Cow<'a, [u8]>,
}

impl<T: Scalar> Serialize for TensorCpu<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let blob = TensorBlob {
            dtype: T::DATA_TYPE,
            shape: self.shape(),
            data: Cow::Borrowed(bytemuck::cast_slice(self.data())),
        };
        blob.serialize(serializer)
    }
}

impl<'de, T: Scalar> Deserialize<'de> for TensorCpu<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let TensorBlob { dtype, shape, data } = TensorBlob::deserialize(deserializer)?;
        if dtype != T::DATA_TYPE {
            return Err(D::Error::custom(format!(
                "tensor data type not match: {:?} vs. {:?}",
                T::DATA_TYPE,
                dtype
            )));
        }
        if data.len() != shape.len() * T::size() {
            return Err(D::Error::invalid_length(
                data.len(),
                &format!("{} bytes", shape.len() * T::size()).as_str(),
            ));
        }
        let data: Vec<T> = bytemuck::pod_collect_to_vec(&data);
        TensorCpu::from_data(shape, data).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use half::f16;

    use crate::tensor::{shape::Shape, TensorCpu};

    #[test]
    fn test_serialize_cbor() -> Result<()> {
        let data = (0..12).map(|x| f16::from_f32(x as f32 * 0.5)).collect::<Vec<_>>();
        let tensor = TensorCpu::from_data(Shape::matrix(4, 3), data)?;

        let buf = cbor4ii::serde::to_vec(vec![], &tensor)?;
        let reader = cbor4ii::core::utils::SliceReader::new(&buf);
        let mut deserializer = cbor4ii::serde::Deserializer::new(reader);
        let back: TensorCpu<f16> = serde::Deserialize::deserialize(&mut deserializer)?;
        assert_eq!(back, tensor);

        let reader = cbor4ii::core::utils::SliceReader::new(&buf);
        let mut deserializer = cbor4ii::serde::Deserializer::new(reader);
        let wrong: Result<TensorCpu<f32>, _> = serde::Deserialize::deserialize(&mut deserializer);
        assert!(wrong.is_err());
        Ok(())
    }
}
