use half::f16;
use serde::{Deserialize, Serialize};

use super::{ops::dot, shape::Shape, TensorCpu, TensorError};
use crate::num::Hom;

/// Precision a [`Matrix`] is stored in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
}

/// A weight matrix of shape `(num_in, num_out)`: `num_out` rows of `num_in` elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Matrix {
    Fp32(TensorCpu<f32>),
    Fp16(TensorCpu<f16>),
}

impl Matrix {
    pub fn new(tensor: TensorCpu<f32>, precision: Precision) -> Self {
        match precision {
            Precision::Fp32 => Self::Fp32(tensor),
            Precision::Fp16 => Self::Fp16(tensor.to_precision()),
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Matrix::Fp32(w) => w.shape(),
            Matrix::Fp16(w) => w.shape(),
        }
    }

    pub fn precision(&self) -> Precision {
        match self {
            Matrix::Fp32(_) => Precision::Fp32,
            Matrix::Fp16(_) => Precision::Fp16,
        }
    }

    #[inline]
    pub fn num_in(&self) -> usize {
        self.shape()[0]
    }

    #[inline]
    pub fn num_out(&self) -> usize {
        self.shape()[1]
    }

    pub fn to_f32(&self) -> TensorCpu<f32> {
        match self {
            Matrix::Fp32(w) => w.clone(),
            Matrix::Fp16(w) => w.to_f32(),
        }
    }

    /// Check that the matrix maps `num_in` inputs to `num_out` outputs.
    pub fn check(&self, num_in: usize, num_out: usize) -> Result<(), TensorError> {
        let shape = Shape::matrix(num_in, num_out);
        match self.shape() == shape {
            true => Ok(()),
            false => Err(TensorError::Shape(shape, self.shape())),
        }
    }

    /// `output = W · input` for a single token.
    pub fn matmul(&self, input: &[f32], output: &mut [f32]) -> Result<(), TensorError> {
        if input.len() != self.num_in() {
            return Err(TensorError::Size(self.num_in(), input.len()));
        }
        if output.len() != self.num_out() {
            return Err(TensorError::Size(self.num_out(), output.len()));
        }
        match self {
            Matrix::Fp32(w) => {
                for (output, row) in output.iter_mut().zip(w.rows()) {
                    *output = dot(row, input);
                }
            }
            Matrix::Fp16(w) => {
                for (output, row) in output.iter_mut().zip(w.rows()) {
                    *output = Iterator::zip(row.iter(), input.iter())
                        .map(|(&w, x)| Hom::<f32>::hom(w) * x)
                        .sum();
                }
            }
        }
        Ok(())
    }

    /// Apply [`Matrix::matmul`] to `num_token` consecutive tokens.
    pub fn matmul_seq(
        &self,
        input: &[f32],
        output: &mut [f32],
        num_token: usize,
    ) -> Result<(), TensorError> {
        let (num_in, num_out) = (self.num_in(), self.num_out());
        if input.len() < num_in * num_token {
            return Err(TensorError::Size(num_in * num_token, input.len()));
        }
        if output.len() < num_out * num_token {
            return Err(TensorError::Size(num_out * num_token, output.len()));
        }
        for (input, output) in input
            .chunks_exact(num_in)
            .zip(output.chunks_exact_mut(num_out))
            .take(num_token)
        {
            self.matmul(input, output)?;
        }
        Ok(())
    }
}
