use thiserror::Error;

use self::shape::Shape;
use crate::num::{Float, Scalar};

pub mod cache;
pub mod matrix;
pub mod ops;
pub mod serialization;
pub mod shape;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    #[error("data size not match: {0} vs. {1}")]
    Size(usize, usize),
    #[error("tensor shape not match: {0} vs. {1}")]
    Shape(Shape, Shape),
}

/// A dense tensor living in host memory.
///
/// Data is laid out with the fastest-moving axis first (see [`Shape`]),
/// so a 2-dimensional tensor of shape `(c, r)` is `r` rows of `c` elements.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorCpu<T: Scalar> {
    shape: Shape,
    data: Vec<T>,
}

impl<T: Scalar> TensorCpu<T> {
    pub fn from_data(shape: Shape, data: impl Into<Vec<T>>) -> Result<Self, TensorError> {
        let data = data.into();
        if shape.len() != data.len() {
            return Err(TensorError::Size(shape.len(), data.len()));
        }
        Ok(Self { shape, data })
    }

    pub fn init(shape: Shape, value: T) -> Self {
        let data = vec![value; shape.len()];
        Self { shape, data }
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_inner(self) -> Vec<T> {
        self.data
    }

    pub fn check_shape(&self, shape: Shape) -> Result<(), TensorError> {
        match self.shape == shape {
            true => Ok(()),
            false => Err(TensorError::Shape(shape, self.shape)),
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &[T]> {
        self.data.chunks_exact(self.shape[0].max(1))
    }

    pub fn map<U: Scalar>(&self, f: impl FnMut(&T) -> U) -> TensorCpu<U> {
        let data = self.data.iter().map(f).collect();
        TensorCpu {
            shape: self.shape,
            data,
        }
    }
}

impl<T: Float> TensorCpu<T> {
    pub fn zeros(shape: Shape) -> Self {
        Self::init(shape, T::co_hom(0.0))
    }

    pub fn to_f32(&self) -> TensorCpu<f32> {
        self.map(|&x| x.hom())
    }
}

impl TensorCpu<f32> {
    pub fn to_precision<T: Float>(&self) -> TensorCpu<T> {
        self.map(|&x| T::co_hom(x))
    }
}

impl<T: Scalar> std::ops::Deref for TensorCpu<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
