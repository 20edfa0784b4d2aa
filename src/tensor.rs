//! Dtype-tagged, dynamic-rank arrays and the tolerance-aware comparison used by validation.

use half::bf16;
use ndarray::{ArrayD, Ix2, IxDyn, Zip};
use num_traits::AsPrimitive;
use rand::Rng;
use std::fmt::{self, Debug, Formatter};

use crate::common::Dtype;

/// The default elementwise tolerance for floating-point comparisons.
pub const DEFAULT_EPS: f64 = 1e-6;

#[derive(Clone)]
pub enum DynArray {
    Bool(ArrayD<bool>),
    Uint8(ArrayD<u8>),
    Sint8(ArrayD<i8>),
    Uint32(ArrayD<u32>),
    Sint32(ArrayD<i32>),
    Sint64(ArrayD<i64>),
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
    Bfloat16(ArrayD<bf16>),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    #[error("empty sampling range [{lo}, {hi}) for {dtype}")]
    EmptyRange { lo: f64, hi: f64, dtype: Dtype },
    #[error("shape mismatch: {lhs:?} vs. {rhs:?}")]
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    #[error("dtype mismatch: {lhs} vs. {rhs}")]
    DtypeMismatch { lhs: Dtype, rhs: Dtype },
    #[error("expected rank {expected}, got shape {shape:?}")]
    Rank { expected: usize, shape: Vec<usize> },
    #[error("invalid axis {axis} for rank {rank}")]
    Axis { axis: usize, rank: usize },
    #[error("invalid permutation {perm:?} for rank {rank}")]
    Permutation { perm: Vec<usize>, rank: usize },
}

/// Conversion of element types through `f64`, the type in which statements compute.
pub trait Scalar: Copy + 'static {
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
}

macro_rules! impl_scalar_via_as {
    ($($t:ty),*) => {
        $(
            impl Scalar for $t {
                fn to_f64(self) -> f64 {
                    self.as_()
                }

                fn from_f64(v: f64) -> Self {
                    v.as_()
                }
            }
        )*
    };
}

impl_scalar_via_as!(u8, i8, u32, i32, i64, f32, f64);

impl Scalar for bool {
    fn to_f64(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }

    fn from_f64(v: f64) -> Self {
        v != 0.0
    }
}

impl Scalar for bf16 {
    fn to_f64(self) -> f64 {
        bf16::to_f64(self)
    }

    fn from_f64(v: f64) -> Self {
        bf16::from_f64(v)
    }
}

/// Apply `$body` to whichever array `$value` holds.
macro_rules! dyn_map {
    ($value:expr, $a:ident => $body:expr) => {
        match $value {
            DynArray::Bool($a) => $body,
            DynArray::Uint8($a) => $body,
            DynArray::Sint8($a) => $body,
            DynArray::Uint32($a) => $body,
            DynArray::Sint32($a) => $body,
            DynArray::Sint64($a) => $body,
            DynArray::Float32($a) => $body,
            DynArray::Float64($a) => $body,
            DynArray::Bfloat16($a) => $body,
        }
    };
}

/// Like [dyn_map], but re-wraps the resulting array in the same variant.
macro_rules! dyn_rewrap {
    ($value:expr, $a:ident => $body:expr) => {
        match $value {
            DynArray::Bool($a) => DynArray::Bool($body),
            DynArray::Uint8($a) => DynArray::Uint8($body),
            DynArray::Sint8($a) => DynArray::Sint8($body),
            DynArray::Uint32($a) => DynArray::Uint32($body),
            DynArray::Sint32($a) => DynArray::Sint32($body),
            DynArray::Sint64($a) => DynArray::Sint64($body),
            DynArray::Float32($a) => DynArray::Float32($body),
            DynArray::Float64($a) => DynArray::Float64($body),
            DynArray::Bfloat16($a) => DynArray::Bfloat16($body),
        }
    };
}

impl DynArray {
    pub fn zeros(shape: &[usize], dtype: Dtype) -> Self {
        let shape = IxDyn(shape);
        match dtype {
            Dtype::Bool => DynArray::Bool(ArrayD::from_elem(shape, false)),
            Dtype::Uint8 => DynArray::Uint8(ArrayD::zeros(shape)),
            Dtype::Sint8 => DynArray::Sint8(ArrayD::zeros(shape)),
            Dtype::Uint32 => DynArray::Uint32(ArrayD::zeros(shape)),
            Dtype::Sint32 => DynArray::Sint32(ArrayD::zeros(shape)),
            Dtype::Sint64 => DynArray::Sint64(ArrayD::zeros(shape)),
            Dtype::Float32 => DynArray::Float32(ArrayD::zeros(shape)),
            Dtype::Float64 => DynArray::Float64(ArrayD::zeros(shape)),
            Dtype::Bfloat16 => DynArray::Bfloat16(ArrayD::from_elem(shape, bf16::ZERO)),
        }
    }

    /// Sample an array with elements drawn uniformly from `[lo, hi)`.
    ///
    /// Integer dtypes sample from `[floor(lo), floor(hi))`. Booleans ignore the range and are
    /// fair coin flips.
    pub fn random<R: Rng + ?Sized>(
        shape: &[usize],
        dtype: Dtype,
        lo: f64,
        hi: f64,
        rng: &mut R,
    ) -> Result<Self, TensorError> {
        let shape = IxDyn(shape);
        let empty = || TensorError::EmptyRange { lo, hi, dtype };
        if dtype == Dtype::Bool {
            return Ok(DynArray::Bool(ArrayD::from_shape_simple_fn(shape, || {
                rng.gen_bool(0.5)
            })));
        }
        if dtype.is_floating() {
            if !(lo < hi) {
                return Err(empty());
            }
            let samples = ArrayD::from_shape_simple_fn(shape, || rng.gen_range(lo..hi));
            return Ok(DynArray::from_f64(dtype, &samples));
        }
        let (lo_i, hi_i) = (lo.floor() as i64, hi.floor() as i64);
        if lo_i >= hi_i {
            return Err(empty());
        }
        let samples = ArrayD::from_shape_simple_fn(shape, || rng.gen_range(lo_i..hi_i) as f64);
        Ok(DynArray::from_f64(dtype, &samples))
    }

    /// Build an array of `dtype` from `f64` values, saturating where the dtype requires.
    pub fn from_f64(dtype: Dtype, values: &ArrayD<f64>) -> Self {
        match dtype {
            Dtype::Bool => DynArray::Bool(values.mapv(Scalar::from_f64)),
            Dtype::Uint8 => DynArray::Uint8(values.mapv(Scalar::from_f64)),
            Dtype::Sint8 => DynArray::Sint8(values.mapv(Scalar::from_f64)),
            Dtype::Uint32 => DynArray::Uint32(values.mapv(Scalar::from_f64)),
            Dtype::Sint32 => DynArray::Sint32(values.mapv(Scalar::from_f64)),
            Dtype::Sint64 => DynArray::Sint64(values.mapv(Scalar::from_f64)),
            Dtype::Float32 => DynArray::Float32(values.mapv(Scalar::from_f64)),
            Dtype::Float64 => DynArray::Float64(values.clone()),
            Dtype::Bfloat16 => DynArray::Bfloat16(values.mapv(Scalar::from_f64)),
        }
    }

    pub fn to_f64(&self) -> ArrayD<f64> {
        dyn_map!(self, a => a.mapv(Scalar::to_f64))
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            DynArray::Bool(_) => Dtype::Bool,
            DynArray::Uint8(_) => Dtype::Uint8,
            DynArray::Sint8(_) => Dtype::Sint8,
            DynArray::Uint32(_) => Dtype::Uint32,
            DynArray::Sint32(_) => Dtype::Sint32,
            DynArray::Sint64(_) => Dtype::Sint64,
            DynArray::Float32(_) => Dtype::Float32,
            DynArray::Float64(_) => Dtype::Float64,
            DynArray::Bfloat16(_) => Dtype::Bfloat16,
        }
    }

    pub fn shape(&self) -> &[usize] {
        dyn_map!(self, a => a.shape())
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn len(&self) -> usize {
        dyn_map!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read one element as `f64`. Panics if `index` is out of bounds.
    pub fn get_f64(&self, index: &[usize]) -> f64 {
        dyn_map!(self, a => a[IxDyn(index)].to_f64())
    }

    /// Write one element, converting from `f64`. Panics if `index` is out of bounds.
    pub fn set_f64(&mut self, index: &[usize], value: f64) {
        dyn_map!(self, a => a[IxDyn(index)] = Scalar::from_f64(value))
    }

    pub fn cast(&self, dtype: Dtype) -> Self {
        if dtype == self.dtype() {
            return self.clone();
        }
        DynArray::from_f64(dtype, &self.to_f64())
    }

    pub fn permuted_axes(&self, perm: &[usize]) -> Result<Self, TensorError> {
        let rank = self.ndim();
        let mut seen = vec![false; rank];
        let valid = perm.len() == rank
            && perm
                .iter()
                .all(|&p| p < rank && !std::mem::replace(&mut seen[p], true));
        if !valid {
            return Err(TensorError::Permutation {
                perm: perm.to_vec(),
                rank,
            });
        }
        Ok(dyn_rewrap!(self, a => a
            .clone()
            .permuted_axes(IxDyn(perm))
            .as_standard_layout()
            .into_owned()))
    }

    /// Sum over `axis`, or over all axes (yielding a 0-d array) if `axis` is `None`.
    ///
    /// Sums are accumulated in `f64` and converted back to this array's dtype.
    pub fn sum(&self, axis: Option<usize>) -> Result<Self, TensorError> {
        let values = self.to_f64();
        let summed = match axis {
            None => ArrayD::from_elem(IxDyn(&[]), values.sum()),
            Some(axis) if axis < self.ndim() => values.sum_axis(ndarray::Axis(axis)),
            Some(axis) => {
                return Err(TensorError::Axis {
                    axis,
                    rank: self.ndim(),
                })
            }
        };
        Ok(DynArray::from_f64(self.dtype(), &summed))
    }

    /// Elementwise combination of two same-shaped, same-dtype arrays, computed in `f64`.
    pub fn zip_with(
        &self,
        rhs: &DynArray,
        op: impl Fn(f64, f64) -> f64,
    ) -> Result<Self, TensorError> {
        self.check_compatible(rhs)?;
        let mut out = self.to_f64();
        out.zip_mut_with(&rhs.to_f64(), |l, &r| *l = op(*l, r));
        Ok(DynArray::from_f64(self.dtype(), &out))
    }

    pub fn matmul(&self, rhs: &DynArray) -> Result<Self, TensorError> {
        if self.dtype() != rhs.dtype() {
            return Err(TensorError::DtypeMismatch {
                lhs: self.dtype(),
                rhs: rhs.dtype(),
            });
        }
        let as_matrix = |a: &DynArray| {
            a.to_f64()
                .into_dimensionality::<Ix2>()
                .map_err(|_| TensorError::Rank {
                    expected: 2,
                    shape: a.shape().to_vec(),
                })
        };
        let (lhs_m, rhs_m) = (as_matrix(self)?, as_matrix(rhs)?);
        if lhs_m.ncols() != rhs_m.nrows() {
            return Err(TensorError::ShapeMismatch {
                lhs: self.shape().to_vec(),
                rhs: rhs.shape().to_vec(),
            });
        }
        Ok(DynArray::from_f64(
            self.dtype(),
            &lhs_m.dot(&rhs_m).into_dyn(),
        ))
    }

    fn check_compatible(&self, rhs: &DynArray) -> Result<(), TensorError> {
        if self.dtype() != rhs.dtype() {
            return Err(TensorError::DtypeMismatch {
                lhs: self.dtype(),
                rhs: rhs.dtype(),
            });
        }
        if self.shape() != rhs.shape() {
            return Err(TensorError::ShapeMismatch {
                lhs: self.shape().to_vec(),
                rhs: rhs.shape().to_vec(),
            });
        }
        Ok(())
    }

    fn exact_eq(&self, other: &Self) -> Option<bool> {
        match (self, other) {
            (DynArray::Bool(a), DynArray::Bool(b)) => Some(a == b),
            (DynArray::Uint8(a), DynArray::Uint8(b)) => Some(a == b),
            (DynArray::Sint8(a), DynArray::Sint8(b)) => Some(a == b),
            (DynArray::Uint32(a), DynArray::Uint32(b)) => Some(a == b),
            (DynArray::Sint32(a), DynArray::Sint32(b)) => Some(a == b),
            (DynArray::Sint64(a), DynArray::Sint64(b)) => Some(a == b),
            _ => None,
        }
    }
}

/// Whether two arrays hold the same values.
///
/// Shapes must match exactly. If either operand is not floating-point, `eps` is forced to zero;
/// otherwise every pair of elements must differ by no more than `eps`. NaNs never compare equal.
pub fn equal_tens(a: &DynArray, b: &DynArray, eps: f64) -> bool {
    if a.shape() != b.shape() {
        return false;
    }
    if let Some(result) = a.exact_eq(b) {
        return result;
    }
    let eps = if a.dtype().is_floating() && b.dtype().is_floating() {
        eps
    } else {
        0.0
    };
    Zip::from(&a.to_f64())
        .and(&b.to_f64())
        .all(|&x, &y| (x - y).abs() <= eps)
}

impl PartialEq for DynArray {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float32(l0), Self::Float32(r0)) => l0 == r0,
            (Self::Float64(l0), Self::Float64(r0)) => l0 == r0,
            (Self::Bfloat16(l0), Self::Bfloat16(r0)) => l0 == r0,
            _ => self.exact_eq(other).unwrap_or(false),
        }
    }
}

impl From<ArrayD<bool>> for DynArray {
    fn from(value: ArrayD<bool>) -> Self {
        DynArray::Bool(value)
    }
}

impl From<ArrayD<u8>> for DynArray {
    fn from(value: ArrayD<u8>) -> Self {
        DynArray::Uint8(value)
    }
}

impl From<ArrayD<i8>> for DynArray {
    fn from(value: ArrayD<i8>) -> Self {
        DynArray::Sint8(value)
    }
}

impl From<ArrayD<u32>> for DynArray {
    fn from(value: ArrayD<u32>) -> Self {
        DynArray::Uint32(value)
    }
}

impl From<ArrayD<i32>> for DynArray {
    fn from(value: ArrayD<i32>) -> Self {
        DynArray::Sint32(value)
    }
}

impl From<ArrayD<i64>> for DynArray {
    fn from(value: ArrayD<i64>) -> Self {
        DynArray::Sint64(value)
    }
}

impl From<ArrayD<f32>> for DynArray {
    fn from(value: ArrayD<f32>) -> Self {
        DynArray::Float32(value)
    }
}

impl From<ArrayD<f64>> for DynArray {
    fn from(value: ArrayD<f64>) -> Self {
        DynArray::Float64(value)
    }
}

impl From<ArrayD<bf16>> for DynArray {
    fn from(value: ArrayD<bf16>) -> Self {
        DynArray::Bfloat16(value)
    }
}

impl Debug for DynArray {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DynArray::Bool(a) => write!(f, "DynArray::Bool({:?})", a),
            DynArray::Uint8(a) => write!(f, "DynArray::Uint8({:?})", a),
            DynArray::Sint8(a) => write!(f, "DynArray::Sint8({:?})", a),
            DynArray::Uint32(a) => write!(f, "DynArray::Uint32({:?})", a),
            DynArray::Sint32(a) => write!(f, "DynArray::Sint32({:?})", a),
            DynArray::Sint64(a) => write!(f, "DynArray::Sint64({:?})", a),
            DynArray::Float32(a) => write!(f, "DynArray::Float32({:?})", a),
            DynArray::Float64(a) => write!(f, "DynArray::Float64({:?})", a),
            DynArray::Bfloat16(a) => write!(f, "DynArray::Bfloat16({:?})", a),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, ArrayD};
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn f32s(shape: &[usize], values: Vec<f32>) -> DynArray {
        ArrayD::from_shape_vec(IxDyn(shape), values).unwrap().into()
    }

    fn i32s(shape: &[usize], values: Vec<i32>) -> DynArray {
        ArrayD::from_shape_vec(IxDyn(shape), values).unwrap().into()
    }

    #[test]
    fn test_float_within_eps_is_equal() {
        let a = f32s(&[2], vec![1.0, 2.0]);
        let b = f32s(&[2], vec![1.0 + 5e-7, 2.0]);
        assert!(equal_tens(&a, &b, DEFAULT_EPS));
        let c = f32s(&[2], vec![1.0 + 1e-4, 2.0]);
        assert!(!equal_tens(&a, &c, DEFAULT_EPS));
    }

    #[test]
    fn test_integer_comparison_ignores_eps() {
        let a = i32s(&[3], vec![1, 2, 3]);
        let b = i32s(&[3], vec![1, 2, 4]);
        assert!(!equal_tens(&a, &b, 10.0));
        assert!(equal_tens(&a, &a.clone(), 0.0));
    }

    #[test]
    fn test_mixed_int_and_float_compare_exactly() {
        let a = i32s(&[2], vec![1, 2]);
        let b = f32s(&[2], vec![1.0, 2.5]);
        assert!(!equal_tens(&a, &b, 1.0));
        let c = f32s(&[2], vec![1.0, 2.0]);
        assert!(equal_tens(&a, &c, 1.0));
    }

    #[test]
    fn test_shape_mismatch_is_never_equal() {
        let a = f32s(&[2, 1], vec![0.0, 0.0]);
        let b = f32s(&[1, 2], vec![0.0, 0.0]);
        assert!(!equal_tens(&a, &b, f64::INFINITY));
    }

    #[test]
    fn test_nan_is_never_equal() {
        let a = f32s(&[1], vec![f32::NAN]);
        assert!(!equal_tens(&a, &a.clone(), DEFAULT_EPS));
    }

    #[test]
    fn test_bool_equality() {
        let a: DynArray = arr1(&[true, false]).into_dyn().into();
        let b: DynArray = arr1(&[true, true]).into_dyn().into();
        assert!(equal_tens(&a, &a.clone(), DEFAULT_EPS));
        assert!(!equal_tens(&a, &b, DEFAULT_EPS));
    }

    #[test]
    fn test_random_respects_range_and_dtype() {
        let mut rng = StdRng::seed_from_u64(0);
        let a = DynArray::random(&[4, 5], Dtype::Sint32, -2.0, 3.0, &mut rng).unwrap();
        assert_eq!(a.dtype(), Dtype::Sint32);
        assert_eq!(a.shape(), &[4, 5]);
        assert!(a.to_f64().iter().all(|&v| (-2.0..3.0).contains(&v)));

        let f = DynArray::random(&[10], Dtype::Float64, 0.5, 0.75, &mut rng).unwrap();
        assert!(f.to_f64().iter().all(|&v| (0.5..0.75).contains(&v)));
    }

    #[test]
    fn test_random_rejects_empty_range() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(DynArray::random(&[2], Dtype::Float32, 1.0, 1.0, &mut rng).is_err());
        assert!(DynArray::random(&[2], Dtype::Sint32, 0.2, 0.7, &mut rng).is_err());
    }

    #[test]
    fn test_set_and_get_elements() {
        let mut a = DynArray::zeros(&[2, 2], Dtype::Sint64);
        a.set_f64(&[1, 0], 7.0);
        assert_eq!(a.get_f64(&[1, 0]), 7.0);
        assert_eq!(a.get_f64(&[0, 1]), 0.0);
    }

    #[test]
    fn test_zero_dim_array_holds_one_element() {
        let a = DynArray::zeros(&[], Dtype::Float32);
        assert_eq!(a.len(), 1);
        assert_eq!(a.get_f64(&[]), 0.0);
    }

    #[test]
    fn test_matmul_matches_ndarray_dot() {
        let a: DynArray = arr2(&[[1i32, 2], [3, 4]]).into_dyn().into();
        let b: DynArray = arr2(&[[5i32, 6], [7, 8]]).into_dyn().into();
        let expected: DynArray = arr2(&[[19i32, 22], [43, 50]]).into_dyn().into();
        assert_eq!(a.matmul(&b).unwrap(), expected);
    }

    #[test]
    fn test_matmul_rejects_non_matrices() {
        let a = DynArray::zeros(&[2, 2, 2], Dtype::Float32);
        assert!(matches!(
            a.matmul(&a),
            Err(TensorError::Rank { expected: 2, .. })
        ));
    }

    #[test]
    fn test_sum_all_and_axis() {
        let a: DynArray = arr2(&[[1i32, 2, 3], [4, 5, 6]]).into_dyn().into();
        assert_eq!(a.sum(None).unwrap().get_f64(&[]), 21.0);
        let cols = a.sum(Some(0)).unwrap();
        assert_eq!(cols.shape(), &[3]);
        assert_eq!(cols.get_f64(&[2]), 9.0);
        assert!(a.sum(Some(2)).is_err());
    }

    #[test]
    fn test_permuted_axes_validates_permutation() {
        let a = DynArray::zeros(&[2, 3, 4], Dtype::Uint8);
        assert_eq!(a.permuted_axes(&[2, 0, 1]).unwrap().shape(), &[4, 2, 3]);
        assert!(a.permuted_axes(&[0, 0, 1]).is_err());
        assert!(a.permuted_axes(&[0, 1]).is_err());
    }

    proptest! {
        #[test]
        fn test_equal_tens_is_reflexive_for_finite_floats(
            values in proptest::collection::vec(-1e6f32..1e6, 1..20)
        ) {
            let a = f32s(&[values.len()], values);
            prop_assert!(equal_tens(&a, &a.clone(), 0.0));
        }

        #[test]
        fn test_integer_equal_tens_iff_identical(
            lhs in proptest::collection::vec(-3i32..3, 6),
            rhs in proptest::collection::vec(-3i32..3, 6),
        ) {
            let a = i32s(&[2, 3], lhs.clone());
            let b = i32s(&[2, 3], rhs.clone());
            prop_assert_eq!(equal_tens(&a, &b, DEFAULT_EPS), lhs == rhs);
        }

        #[test]
        fn test_float_equal_tens_iff_within_eps(
            base in proptest::collection::vec(-10f64..10.0, 4),
            deltas in proptest::collection::vec(-2e-6f64..2e-6, 4),
        ) {
            let a: DynArray = ArrayD::from_shape_vec(IxDyn(&[4]), base.clone()).unwrap().into();
            let shifted = base.iter().zip(&deltas).map(|(b, d)| b + d).collect::<Vec<_>>();
            let b: DynArray = ArrayD::from_shape_vec(IxDyn(&[4]), shifted.clone()).unwrap().into();
            let expected = base
                .iter()
                .zip(&shifted)
                .all(|(x, y)| (x - y).abs() <= DEFAULT_EPS);
            prop_assert_eq!(equal_tens(&a, &b, DEFAULT_EPS), expected);
        }

        #[test]
        fn test_cast_roundtrip_preserves_small_ints(dtype in any::<Dtype>()) {
            let a = i32s(&[3], vec![0, 1, 1]);
            let back = a.cast(dtype).cast(Dtype::Sint32);
            prop_assert_eq!(back, a);
        }
    }
}
