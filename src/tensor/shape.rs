use serde::{Deserialize, Serialize};
use rwkv_flow_derive::{Deref, DerefMut};

/// The shape of a [`TensorCpu`](super::TensorCpu).
/// Note that the fastest-moving axis occupies the lowest shape index, which is opposite to that in `torch`.
#[derive(
    Debug, Default, Clone, Copy, Deref, DerefMut, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct Shape([usize; 4]);

impl Shape {
    pub const fn new(x: usize, y: usize, z: usize, w: usize) -> Self {
        Self([x, y, z, w])
    }

    pub fn len(&self) -> usize {
        self.0.into_iter().product()
    }

    /// A 1-dimensional shape of `len` elements.
    pub const fn vector(len: usize) -> Self {
        Self::new(len, 1, 1, 1)
    }

    /// A matrix of `num_row` rows, each `num_col` elements long.
    pub const fn matrix(num_col: usize, num_row: usize) -> Self {
        Self::new(num_col, num_row, 1, 1)
    }
}

impl From<[usize; 4]> for Shape {
    fn from(value: [usize; 4]) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {}, {})", self[0], self[1], self[2], self[3])
    }
}

impl std::ops::Index<usize> for Shape {
    type Output = usize;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl std::ops::IndexMut<usize> for Shape {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.0[index]
    }
}
