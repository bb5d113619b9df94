//! Shape, stride, and offset computations.
//!
//! Uses row-major (C) order: the last dimension is contiguous. Strides are
//! counted in elements; multiply by the dtype size for byte strides.

use crate::error::TensorError;

/// Shape, element strides, and storage offset of a tensor view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Layout {
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Contiguous row-major layout for `shape` at offset 0.
    pub fn contiguous(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            strides: compute_strides(shape),
            offset: 0,
        }
    }

    /// Arbitrary strided layout.
    ///
    /// # Errors
    /// `RankMismatch` if `shape` and `strides` differ in length.
    pub fn new(shape: &[usize], strides: &[usize], offset: usize) -> Result<Self, TensorError> {
        if shape.len() != strides.len() {
            return Err(TensorError::RankMismatch {
                expected: shape.len(),
                actual: strides.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            strides: strides.to_vec(),
            offset,
        })
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of logical elements (1 for a 0-dimensional layout).
    #[inline]
    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    /// Check if elements are laid out densely in row-major order.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1;
        for (&dim, &stride) in self.shape.iter().zip(self.strides.iter()).rev() {
            if dim != 1 && stride != expected {
                return false;
            }
            expected = expected.saturating_mul(dim);
        }
        true
    }

    /// Minimum storage length this layout needs.
    ///
    /// `None` if the element count or the furthest position does not fit in
    /// `usize`.
    pub fn required_len(&self) -> Option<usize> {
        checked_numel(&self.shape)?;
        if self.shape.contains(&0) {
            return Some(self.offset);
        }
        let mut last = self.offset;
        for (&dim, &stride) in self.shape.iter().zip(self.strides.iter()) {
            last = last.checked_add((dim - 1).checked_mul(stride)?)?;
        }
        last.checked_add(1)
    }

    /// Storage position of the element at `indices`.
    #[inline]
    pub fn position(&self, indices: &[usize]) -> usize {
        self.offset + cartesian_to_linear(indices, &self.strides)
    }

    /// Storage positions of all elements in logical row-major order.
    pub fn positions(&self) -> Vec<usize> {
        let total = self.numel();
        let mut out = Vec::with_capacity(total);
        if self.shape.contains(&0) {
            return out;
        }
        let mut index = vec![0usize; self.ndim()];
        for _ in 0..total {
            out.push(self.position(&index));
            for d in (0..index.len()).rev() {
                index[d] += 1;
                if index[d] < self.shape[d] {
                    break;
                }
                index[d] = 0;
            }
        }
        out
    }

    /// Layout with dimensions reordered by `perm`.
    ///
    /// # Errors
    /// `InvalidPermutation` if `perm` is not a permutation of `0..ndim`.
    pub fn permute(&self, perm: &[usize]) -> Result<Self, TensorError> {
        let ndim = self.ndim();
        let mut seen = vec![false; ndim];
        if perm.len() != ndim {
            return Err(TensorError::InvalidPermutation {
                perm: perm.to_vec(),
                ndim,
            });
        }
        for &p in perm {
            if p >= ndim || seen[p] {
                return Err(TensorError::InvalidPermutation {
                    perm: perm.to_vec(),
                    ndim,
                });
            }
            seen[p] = true;
        }
        Ok(Self {
            shape: perm.iter().map(|&p| self.shape[p]).collect(),
            strides: perm.iter().map(|&p| self.strides[p]).collect(),
            offset: self.offset,
        })
    }
}

/// Number of elements for a shape (1 for the empty shape).
///
/// Saturates at `usize::MAX`, which no buffer can hold, so an overflowing
/// shape never matches a real length.
#[inline]
pub fn numel(shape: &[usize]) -> usize {
    checked_numel(shape).unwrap_or(usize::MAX)
}

/// Number of elements for a shape, `None` on overflow.
pub fn checked_numel(shape: &[usize]) -> Option<usize> {
    if shape.contains(&0) {
        return Some(0);
    }
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

/// Compute row-major strides from shape.
///
/// For shape [d0, d1, d2], returns strides [d1*d2, d2, 1].
///
/// # Examples
///
/// ```
/// use ndgrad::layout::compute_strides;
///
/// assert_eq!(compute_strides(&[3, 4, 5]), vec![20, 5, 1]);
/// assert_eq!(compute_strides(&[2, 3]), vec![3, 1]);
/// assert_eq!(compute_strides(&[5]), vec![1]);
/// assert_eq!(compute_strides(&[]), Vec::<usize>::new());
/// ```
pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut stride: usize = 1;

    for (i, &dim) in shape.iter().enumerate().rev() {
        strides[i] = stride;
        stride = stride.saturating_mul(dim.max(1));
    }

    strides
}

/// Convert cartesian indices to a linear index.
#[inline]
pub fn cartesian_to_linear(indices: &[usize], strides: &[usize]) -> usize {
    indices
        .iter()
        .zip(strides.iter())
        .map(|(&idx, &stride)| idx * stride)
        .sum()
}

/// Convert a linear index to cartesian indices using row-major order.
pub fn linear_to_cartesian(mut linear: usize, shape: &[usize]) -> Vec<usize> {
    let mut indices = vec![0; shape.len()];

    for (i, &dim) in shape.iter().enumerate().rev() {
        indices[i] = linear % dim;
        linear /= dim;
    }

    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_strides_3d() {
        assert_eq!(compute_strides(&[3, 4, 5]), vec![20, 5, 1]);
    }

    #[test]
    fn test_compute_strides_empty() {
        assert_eq!(compute_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn test_cartesian_to_linear() {
        let strides = compute_strides(&[3, 4, 5]);
        assert_eq!(cartesian_to_linear(&[0, 0, 0], &strides), 0);
        assert_eq!(cartesian_to_linear(&[0, 0, 1], &strides), 1);
        assert_eq!(cartesian_to_linear(&[0, 1, 0], &strides), 5);
        assert_eq!(cartesian_to_linear(&[1, 0, 0], &strides), 20);
        assert_eq!(cartesian_to_linear(&[2, 3, 4], &strides), 2 * 20 + 3 * 5 + 4);
    }

    #[test]
    fn test_roundtrip() {
        let shape = [3, 4, 5];
        let strides = compute_strides(&shape);

        for linear in 0..numel(&shape) {
            let cartesian = linear_to_cartesian(linear, &shape);
            assert_eq!(linear, cartesian_to_linear(&cartesian, &strides));
        }
    }

    #[test]
    fn test_contiguity() {
        assert!(Layout::contiguous(&[2, 3]).is_contiguous());
        let transposed = Layout::contiguous(&[2, 3]).permute(&[1, 0]).unwrap();
        assert!(!transposed.is_contiguous());
        // Size-1 dimensions never break contiguity.
        assert!(Layout::new(&[1, 3], &[99, 1], 0).unwrap().is_contiguous());
    }

    #[test]
    fn test_required_len() {
        assert_eq!(Layout::contiguous(&[2, 3]).required_len(), Some(6));
        assert_eq!(Layout::contiguous(&[]).required_len(), Some(1));
        assert_eq!(Layout::new(&[2, 2], &[1, 2], 3).unwrap().required_len(), Some(7));
        assert_eq!(Layout::new(&[0, 4], &[4, 1], 2).unwrap().required_len(), Some(2));
    }

    #[test]
    fn test_required_len_overflow() {
        assert_eq!(Layout::new(&[2], &[usize::MAX], 0).unwrap().required_len(), None);
        assert_eq!(Layout::new(&[1], &[1], usize::MAX).unwrap().required_len(), None);
        // Zero strides address one element, but the count itself overflows.
        let broadcast = Layout::new(&[usize::MAX, 2], &[0, 0], 0).unwrap();
        assert_eq!(broadcast.required_len(), None);
        assert_eq!(numel(&[usize::MAX, 2]), usize::MAX);
        assert_eq!(checked_numel(&[usize::MAX, 2, 0]), Some(0));
    }

    #[test]
    fn test_positions_of_transpose() {
        let t = Layout::contiguous(&[2, 3]).permute(&[1, 0]).unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.positions(), vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_invalid_permutation() {
        let l = Layout::contiguous(&[2, 3]);
        assert!(l.permute(&[0, 0]).is_err());
        assert!(l.permute(&[0]).is_err());
        assert!(l.permute(&[0, 2]).is_err());
    }
}
