//! Reference operations backed by `ndarray`, and schemas describing them.

use crate::common::Dtype;
use crate::opcheck::{BoundArgs, OpError, OpRegistry, Param, SchemaHandle, Value};
use crate::schema::TensorSchema;
use crate::tensor::DynArray;

const NUMERIC: [Dtype; 8] = [
    Dtype::Uint8,
    Dtype::Sint8,
    Dtype::Uint32,
    Dtype::Sint32,
    Dtype::Sint64,
    Dtype::Float32,
    Dtype::Float64,
    Dtype::Bfloat16,
];

/// An [OpRegistry] holding every reference operation, with no schemas attached.
pub fn standard_registry() -> OpRegistry {
    let mut reg = OpRegistry::new();
    reg.define("array.identity", [Param::required("input")], |args| {
        Ok(vec![args.tensor("input")?.clone()])
    })
    .define(
        "array.transpose",
        [Param::required("input"), Param::optional("perm", Value::None)],
        transpose,
    )
    .define("math.add", binary_params(), |args| {
        binary(args, |a, b| a + b)
    })
    .define("math.subtract", binary_params(), |args| {
        binary(args, |a, b| a - b)
    })
    .define("math.multiply", binary_params(), |args| {
        binary(args, |a, b| a * b)
    })
    .define(
        "math.reduce_sum",
        [Param::required("input"), Param::optional("axis", Value::None)],
        reduce_sum,
    )
    .define(
        "linalg.matmul",
        [Param::required("a"), Param::required("b")],
        |args| Ok(vec![args.tensor("a")?.matmul(args.tensor("b")?)?]),
    );
    reg
}

/// Attach a [TensorSchema] to each reference operation in `reg`.
pub fn register_standard_schemas(reg: &mut OpRegistry) -> Result<Vec<SchemaHandle>, OpError> {
    let single = |arg: &str| {
        TensorSchema::new()
            .tensor(arg)
            .num_outputs(1)
            .output_shape_of(0, arg)
    };
    let binary = || {
        TensorSchema::new()
            .tensor("x")
            .tensor("y")
            .dtypes("x", &NUMERIC)
            .same_shape("x", "y")
            .num_outputs(1)
            .output_shape_of(0, "x")
    };
    Ok(vec![
        reg.register("array.identity", single("input"))?,
        reg.register(
            "array.transpose",
            TensorSchema::new().tensor("input").num_outputs(1),
        )?,
        reg.register("math.add", binary())?,
        reg.register("math.subtract", binary())?,
        reg.register("math.multiply", binary())?,
        reg.register(
            "math.reduce_sum",
            TensorSchema::new()
                .tensor("input")
                .dtypes("input", &NUMERIC)
                .num_outputs(1),
        )?,
        reg.register(
            "linalg.matmul",
            TensorSchema::new()
                .tensor("a")
                .tensor("b")
                .rank("a", 2..=2)
                .rank("b", 2..=2)
                .num_outputs(1),
        )?,
    ])
}

fn binary_params() -> [Param; 2] {
    [Param::required("x"), Param::required("y")]
}

fn binary(args: &BoundArgs, op: impl Fn(f64, f64) -> f64) -> Result<Vec<DynArray>, OpError> {
    Ok(vec![args.tensor("x")?.zip_with(args.tensor("y")?, op)?])
}

/// Resolve a possibly-negative axis against `rank`.
fn normalize_axis(axis: i64, rank: usize) -> Result<usize, OpError> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    usize::try_from(resolved)
        .ok()
        .filter(|&a| a < rank)
        .ok_or_else(|| OpError::InvalidArgument(format!("axis {axis} out of range for rank {rank}")))
}

fn transpose(args: &BoundArgs) -> Result<Vec<DynArray>, OpError> {
    let input = args.tensor("input")?;
    let rank = input.ndim();
    let perm = match args.get("perm") {
        None | Some(Value::None) => (0..rank).rev().collect::<Vec<_>>(),
        Some(Value::Ints(perm)) => perm
            .iter()
            .map(|&p| normalize_axis(p, rank))
            .collect::<Result<_, _>>()?,
        Some(other) => {
            return Err(OpError::InvalidArgument(format!(
                "perm must be a list of ints, got {}",
                other.type_name()
            )))
        }
    };
    Ok(vec![input.permuted_axes(&perm)?])
}

fn reduce_sum(args: &BoundArgs) -> Result<Vec<DynArray>, OpError> {
    let input = args.tensor("input")?;
    let axis = match args.get("axis") {
        None | Some(Value::None) => None,
        Some(Value::Int(axis)) => Some(normalize_axis(*axis, input.ndim())?),
        Some(other) => {
            return Err(OpError::Unsupported(format!(
                "reduce_sum over axis of type {}",
                other.type_name()
            )))
        }
    };
    if input.dtype() == Dtype::Bool {
        return Err(OpError::Unsupported("reduce_sum of bool tensors".to_owned()));
    }
    Ok(vec![input.sum(axis)?])
}
