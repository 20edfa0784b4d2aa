use std::ops::RangeInclusive;

use crate::common::Dtype;
use crate::opcheck::{BoundArgs, Schema, Value};
use crate::tensor::DynArray;
use crate::utils::join_into_string;

/// A [Schema] assembled from declarative rules over named arguments and positional outputs.
///
/// ```
/// # use opcheck::schema::TensorSchema;
/// # use opcheck::common::Dtype;
/// let schema = TensorSchema::new()
///     .tensor("a")
///     .rank("a", 2..=2)
///     .dtypes("a", &[Dtype::Float32, Dtype::Sint32])
///     .num_outputs(1)
///     .output_dtype(0, &[Dtype::Float32, Dtype::Sint32]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TensorSchema {
    input_rules: Vec<InputRule>,
    output_rules: Vec<OutputRule>,
    op_path: String,
    args: BoundArgs,
    outputs: Vec<DynArray>,
    input_failures: Vec<String>,
    output_failures: Vec<String>,
}

#[derive(Debug, Clone)]
enum InputRule {
    Tensor(String),
    Dtypes(String, Vec<Dtype>),
    Rank(String, RangeInclusive<usize>),
    SameShape(String, String),
}

#[derive(Debug, Clone)]
enum OutputRule {
    Count(usize),
    Dtype(usize, Vec<Dtype>),
    ShapeOf(usize, String),
}

impl TensorSchema {
    pub fn new() -> Self {
        TensorSchema::default()
    }

    pub fn tensor(mut self, arg: &str) -> Self {
        self.input_rules.push(InputRule::Tensor(arg.to_owned()));
        self
    }

    pub fn dtypes(mut self, arg: &str, dtypes: &[Dtype]) -> Self {
        self.input_rules
            .push(InputRule::Dtypes(arg.to_owned(), dtypes.to_vec()));
        self
    }

    pub fn rank(mut self, arg: &str, ranks: RangeInclusive<usize>) -> Self {
        self.input_rules.push(InputRule::Rank(arg.to_owned(), ranks));
        self
    }

    pub fn same_shape(mut self, a: &str, b: &str) -> Self {
        self.input_rules
            .push(InputRule::SameShape(a.to_owned(), b.to_owned()));
        self
    }

    pub fn num_outputs(mut self, n: usize) -> Self {
        self.output_rules.push(OutputRule::Count(n));
        self
    }

    pub fn output_dtype(mut self, index: usize, dtypes: &[Dtype]) -> Self {
        self.output_rules
            .push(OutputRule::Dtype(index, dtypes.to_vec()));
        self
    }

    /// Require output `index` to have the same shape as tensor argument `arg`.
    pub fn output_shape_of(mut self, index: usize, arg: &str) -> Self {
        self.output_rules
            .push(OutputRule::ShapeOf(index, arg.to_owned()));
        self
    }

    fn arg_tensor(&self, arg: &str) -> Result<&DynArray, String> {
        match self.args.get(arg) {
            Some(Value::Tensor(t)) => Ok(t),
            Some(other) => Err(format!(
                "argument '{arg}' must be a tensor, got {}",
                other.type_name()
            )),
            None => Err(format!("argument '{arg}' is missing")),
        }
    }

    fn check_input(&self, rule: &InputRule) -> Result<(), String> {
        match rule {
            InputRule::Tensor(arg) => self.arg_tensor(arg).map(|_| ()),
            InputRule::Dtypes(arg, dtypes) => {
                let dtype = self.arg_tensor(arg)?.dtype();
                if dtypes.contains(&dtype) {
                    Ok(())
                } else {
                    Err(format!(
                        "argument '{arg}' has dtype {dtype}; expected one of {}",
                        join_into_string(dtypes, ", ")
                    ))
                }
            }
            InputRule::Rank(arg, ranks) => {
                let rank = self.arg_tensor(arg)?.ndim();
                if ranks.contains(&rank) {
                    Ok(())
                } else {
                    Err(format!(
                        "argument '{arg}' has rank {rank}; expected {}..={}",
                        ranks.start(),
                        ranks.end()
                    ))
                }
            }
            InputRule::SameShape(a, b) => {
                let (sa, sb) = (self.arg_tensor(a)?.shape(), self.arg_tensor(b)?.shape());
                if sa == sb {
                    Ok(())
                } else {
                    Err(format!("arguments '{a}' {sa:?} and '{b}' {sb:?} differ in shape"))
                }
            }
        }
    }

    fn output(&self, index: usize) -> Result<&DynArray, String> {
        self.outputs
            .get(index)
            .ok_or_else(|| format!("output {index} is missing"))
    }

    fn check_output(&self, rule: &OutputRule) -> Result<(), String> {
        match rule {
            OutputRule::Count(n) if self.outputs.len() == *n => Ok(()),
            OutputRule::Count(n) => Err(format!(
                "expected {n} outputs, got {}",
                self.outputs.len()
            )),
            OutputRule::Dtype(index, dtypes) => {
                let dtype = self.output(*index)?.dtype();
                if dtypes.contains(&dtype) {
                    Ok(())
                } else {
                    Err(format!("output {index} has unexpected dtype {dtype}"))
                }
            }
            OutputRule::ShapeOf(index, arg) => {
                let actual = self.output(*index)?.shape();
                let expected = self.arg_tensor(arg)?.shape();
                if actual == expected {
                    Ok(())
                } else {
                    Err(format!(
                        "output {index} has shape {actual:?}; expected {expected:?} (from '{arg}')"
                    ))
                }
            }
        }
    }
}

impl Schema for TensorSchema {
    fn init(&mut self, op_path: &str, args: &BoundArgs) {
        self.op_path = op_path.to_owned();
        self.args = args.clone();
        self.outputs.clear();
        self.input_failures.clear();
        self.output_failures.clear();
    }

    fn evaluate(&mut self) -> bool {
        self.input_failures = self
            .input_rules
            .iter()
            .filter_map(|rule| self.check_input(rule).err())
            .collect();
        self.input_failures.is_empty()
    }

    fn set_outputs(&mut self, outputs: &[DynArray]) {
        self.outputs = outputs.to_vec();
    }

    fn validate(&mut self) -> bool {
        self.output_failures = self
            .output_rules
            .iter()
            .filter_map(|rule| self.check_output(rule).err())
            .collect();
        self.output_failures.is_empty()
    }

    fn report(&self) -> String {
        let failures = self
            .input_failures
            .iter()
            .chain(&self.output_failures)
            .map(|f| format!("  {f}"))
            .collect::<Vec<_>>();
        if failures.is_empty() {
            format!("{}: all checks passed", self.op_path)
        } else {
            format!("{}:\n{}", self.op_path, failures.join("\n"))
        }
    }
}
