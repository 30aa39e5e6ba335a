//! Tensor sizes.

use smallvec::SmallVec;
use std::fmt;

/// Tensor size as reported by the native runtime.
///
/// Stack storage for up to 4 dimensions; recurrent states and sequences are 3D.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: SmallVec<[i64; 4]>,
}

impl Shape {
    pub fn new(dims: &[i64]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements.
    pub fn numel(&self) -> i64 {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    /// Size of one dimension. Negative axes count from the end.
    pub fn dim(&self, axis: i64) -> Option<i64> {
        let axis = if axis < 0 { axis + self.dims.len() as i64 } else { axis };
        usize::try_from(axis).ok().and_then(|a| self.dims.get(a).copied())
    }

    pub fn to_vec(&self) -> Vec<i64> {
        self.dims.to_vec()
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<&[i64]> for Shape {
    fn from(dims: &[i64]) -> Self {
        Shape::new(dims)
    }
}

impl PartialEq<[i64]> for Shape {
    fn eq(&self, other: &[i64]) -> bool {
        self.dims() == other
    }
}
