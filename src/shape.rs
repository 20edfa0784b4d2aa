use crate::common::{DimSize, Dims};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("Shape read before its dims were set")]
    Uninitialized,
    #[error("index {index} out of bounds for length {len} dims")]
    IndexOutOfRange { index: usize, len: usize },
}

/// The per-axis extents of one index group.
///
/// A `Shape` starts out uninitialized; every read fails until [Shape::set] is called.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shape {
    dims: Option<Dims>,
}

impl Shape {
    pub fn new() -> Self {
        Shape::default()
    }

    pub fn set(&mut self, dims: impl IntoIterator<Item = DimSize>) {
        self.dims = Some(dims.into_iter().collect());
    }

    pub fn set_elem(&mut self, index: usize, dim: DimSize) -> Result<(), ShapeError> {
        let dims = self.dims.as_mut().ok_or(ShapeError::Uninitialized)?;
        let len = dims.len();
        let slot = dims
            .get_mut(index)
            .ok_or(ShapeError::IndexOutOfRange { index, len })?;
        *slot = dim;
        Ok(())
    }

    pub fn get(&self) -> Result<&[DimSize], ShapeError> {
        self.dims.as_deref().ok_or(ShapeError::Uninitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.dims.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_get_fails_before_set() {
        let shape = Shape::new();
        assert_eq!(shape.get(), Err(ShapeError::Uninitialized));
        assert!(!shape.is_initialized());
    }

    #[test]
    fn test_set_elem_fails_before_set() {
        let mut shape = Shape::new();
        assert_eq!(shape.set_elem(0, 3), Err(ShapeError::Uninitialized));
    }

    #[test]
    fn test_set_elem_out_of_range() {
        let mut shape = Shape::new();
        shape.set([4, 5]);
        assert_eq!(
            shape.set_elem(2, 1),
            Err(ShapeError::IndexOutOfRange { index: 2, len: 2 })
        );
        shape.set_elem(1, 9).unwrap();
        assert_eq!(shape.get().unwrap(), &[4, 9]);
    }

    #[test]
    fn test_set_to_empty_is_initialized() {
        let mut shape = Shape::new();
        shape.set([]);
        assert_eq!(shape.get().unwrap(), &[] as &[DimSize]);
    }

    proptest! {
        #[test]
        fn test_set_replaces_dims_wholesale(
            first in proptest::collection::vec(0..100u32, 0..6),
            second in proptest::collection::vec(0..100u32, 0..6),
        ) {
            let mut shape = Shape::new();
            shape.set(first.iter().copied());
            prop_assert_eq!(shape.get().unwrap(), first.as_slice());
            shape.set(second.iter().copied());
            prop_assert_eq!(shape.get().unwrap(), second.as_slice());
        }
    }
}
