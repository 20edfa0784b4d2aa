use smallvec::SmallVec;
use std::fmt::Display;

pub type DimSize = u32;
pub type Dims = SmallVec<[DimSize; 6]>;

/// Element types of the arrays flowing through the harness.
///
/// The [strum::EnumString] spellings are the dtype keywords accepted by `RANDOM(..)`; the
/// [Display] form is the Rust element type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumString, strum::EnumIter, strum::IntoStaticStr,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    #[strum(serialize = "BOOL")]
    Bool,
    #[strum(serialize = "UINT8")]
    Uint8,
    #[strum(serialize = "INT8")]
    Sint8,
    #[strum(serialize = "UINT")]
    Uint32,
    #[strum(serialize = "INT")]
    Sint32,
    #[strum(serialize = "LONG")]
    Sint64,
    #[strum(serialize = "FLOAT")]
    Float32,
    #[strum(serialize = "DOUBLE")]
    Float64,
    #[strum(serialize = "BFLOAT16")]
    Bfloat16,
}

impl Dtype {
    pub fn is_floating(&self) -> bool {
        matches!(self, Dtype::Float32 | Dtype::Float64 | Dtype::Bfloat16)
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Bool => write!(f, "bool"),
            Dtype::Uint8 => write!(f, "u8"),
            Dtype::Sint8 => write!(f, "i8"),
            Dtype::Uint32 => write!(f, "u32"),
            Dtype::Sint32 => write!(f, "i32"),
            Dtype::Sint64 => write!(f, "i64"),
            Dtype::Float32 => write!(f, "f32"),
            Dtype::Float64 => write!(f, "f64"),
            Dtype::Bfloat16 => write!(f, "bf16"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_dtype_keywords_parse() {
        assert_eq!(Dtype::from_str("FLOAT").unwrap(), Dtype::Float32);
        assert_eq!(Dtype::from_str("INT").unwrap(), Dtype::Sint32);
        assert_eq!(Dtype::from_str("BOOL").unwrap(), Dtype::Bool);
        assert!(Dtype::from_str("float").is_err());
    }

    #[test]
    fn test_only_three_dtypes_are_floating() {
        assert_eq!(Dtype::iter().filter(|d| d.is_floating()).count(), 3);
    }

    proptest! {
        #[test]
        fn test_dtype_keyword_parses_back(dtype in any::<Dtype>()) {
            let keyword: &'static str = dtype.into();
            prop_assert_eq!(Dtype::from_str(keyword).unwrap(), dtype);
        }
    }
}
