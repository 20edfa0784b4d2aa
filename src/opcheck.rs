//! The instrumented operation registry.
//!
//! Operations are closures registered under stable dotted paths with [OpRegistry::define]. Attaching
//! a [Schema] with [OpRegistry::register] makes later calls through that path instrumented: the
//! schema sees the bound arguments before the call and the outputs after it, and its findings are
//! collected as diagnostics. An error returned by the operation itself always reaches the caller
//! unchanged.

use auto_impl::auto_impl;
use indexmap::IndexMap;
use log::{debug, log, warn, Level};
use std::fmt;

use crate::tensor::{DynArray, TensorError};
use crate::utils::join_into_string;

/// An argument passed to, or bound for, an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Ints(Vec<i64>),
    Tensor(DynArray),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Value>,
}

/// Arguments bound to an operation's parameters, in parameter order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArgs(IndexMap<String, Value>);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("{op_path} takes {expected} positional arguments but {given} were given")]
    TooManyPositional {
        op_path: String,
        expected: usize,
        given: usize,
    },
    #[error("{op_path} got an unexpected keyword argument '{keyword}'")]
    UnexpectedKeyword { op_path: String, keyword: String },
    #[error("{op_path} got multiple values for argument '{param}'")]
    Duplicate { op_path: String, param: String },
    #[error("{op_path} missing required argument '{param}'")]
    Missing { op_path: String, param: String },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("no operation registered at '{0}'")]
    UnknownOp(String),
    #[error(transparent)]
    Bind(#[from] BindError),
}

/// Checks an operation's inputs and outputs.
///
/// A schema never blocks a call. Failures are reported through the `bool` results and
/// [Schema::report].
#[auto_impl(&mut, Box)]
pub trait Schema {
    fn init(&mut self, op_path: &str, args: &BoundArgs);
    /// Validate the inputs given to [Schema::init].
    fn evaluate(&mut self) -> bool;
    fn set_outputs(&mut self, outputs: &[DynArray]);
    /// Validate the outputs given to [Schema::set_outputs].
    fn validate(&mut self) -> bool;
    fn report(&self) -> String;
}

/// Executes named operations on behalf of a [crate::runtime::Runtime].
#[auto_impl(&mut, Box)]
pub trait TensorEngine {
    fn execute(
        &mut self,
        op_path: &str,
        positional: Vec<Value>,
        keyword: Vec<(String, Value)>,
    ) -> Result<Vec<DynArray>, OpError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpcheckConfig {
    pub validate: bool,
}

/// Identifies a schema attached with [OpRegistry::register].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaHandle {
    op_path: String,
}

pub type OpFn = dyn Fn(&BoundArgs) -> Result<Vec<DynArray>, OpError>;

struct OpDef {
    params: Vec<Param>,
    func: Box<OpFn>,
    schema: Option<Box<dyn Schema>>,
}

#[derive(Default)]
pub struct OpRegistry {
    ops: IndexMap<String, OpDef>,
    config: OpcheckConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// No schema was consulted.
    Unchecked(Vec<DynArray>),
    ValidatedSuccess(Vec<DynArray>),
    /// The call completed but input or output validation failed.
    ValidatedFailure(Vec<DynArray>),
    OperationError(OpError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub outcome: CallOutcome,
    pub diagnostics: Vec<Diagnostic>,
    pub report: Option<String>,
}

/// A message produced while checking a call, with the level it is logged at.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub level: Level,
    pub message: String,
}

impl Diagnostic {
    fn new(level: Level, message: String) -> Self {
        Diagnostic { level, message }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Ints(_) => "list",
            Value::Tensor(_) => "tensor",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_tensor(&self) -> Option<&DynArray> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Value::Ints(v) => Some(v),
            _ => None,
        }
    }
}

impl From<DynArray> for Value {
    fn from(value: DynArray) -> Self {
        Value::Tensor(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Ints(v) => write!(f, "[{}]", join_into_string(v, ", ")),
            Value::Tensor(t) => write!(f, "tensor<{}>{:?}", t.dtype(), t.shape()),
        }
    }
}

impl Param {
    pub fn required(name: &str) -> Self {
        Param {
            name: name.to_owned(),
            default: None,
        }
    }

    pub fn optional(name: &str, default: Value) -> Self {
        Param {
            name: name.to_owned(),
            default: Some(default),
        }
    }
}

impl BoundArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// The tensor bound to `name`, or [OpError::InvalidArgument] if it is missing or not a tensor.
    pub fn tensor(&self, name: &str) -> Result<&DynArray, OpError> {
        match self.0.get(name) {
            Some(Value::Tensor(t)) => Ok(t),
            Some(other) => Err(OpError::InvalidArgument(format!(
                "'{name}' must be a tensor, got {}",
                other.type_name()
            ))),
            None => Err(OpError::InvalidArgument(format!("no argument '{name}'"))),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl SchemaHandle {
    pub fn op_path(&self) -> &str {
        &self.op_path
    }
}

impl From<TensorError> for OpError {
    fn from(value: TensorError) -> Self {
        OpError::InvalidArgument(value.to_string())
    }
}

impl OpRegistry {
    pub fn new() -> Self {
        OpRegistry::default()
    }

    pub fn with_config(config: OpcheckConfig) -> Self {
        OpRegistry {
            ops: IndexMap::new(),
            config,
        }
    }

    /// Define (or redefine) the operation at `op_path`. Redefining drops any attached schema.
    pub fn define<F>(
        &mut self,
        op_path: &str,
        params: impl IntoIterator<Item = Param>,
        func: F,
    ) -> &mut Self
    where
        F: Fn(&BoundArgs) -> Result<Vec<DynArray>, OpError> + 'static,
    {
        let def = OpDef {
            params: params.into_iter().collect(),
            func: Box::new(func),
            schema: None,
        };
        if self.ops.insert(op_path.to_owned(), def).is_some() {
            warn!("Redefined operation {op_path}");
        }
        self
    }

    /// Attach `schema` to the operation at `op_path`, replacing any previous schema.
    pub fn register(
        &mut self,
        op_path: &str,
        schema: impl Schema + 'static,
    ) -> Result<SchemaHandle, OpError> {
        let def = self
            .ops
            .get_mut(op_path)
            .ok_or_else(|| OpError::UnknownOp(op_path.to_owned()))?;
        if def.schema.replace(Box::new(schema)).is_some() {
            debug!("Replaced schema for {op_path}");
        }
        Ok(SchemaHandle {
            op_path: op_path.to_owned(),
        })
    }

    /// Enable or disable instrumentation for every registered schema.
    pub fn validate_schema(&mut self, enabled: bool) {
        self.config.validate = enabled;
    }

    pub fn config(&self) -> OpcheckConfig {
        self.config
    }

    pub fn contains(&self, op_path: &str) -> bool {
        self.ops.contains_key(op_path)
    }

    pub fn op_paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.ops.keys().map(String::as_str)
    }

    pub fn params(&self, op_path: &str) -> Option<&[Param]> {
        self.ops.get(op_path).map(|d| d.params.as_slice())
    }

    pub fn schema(&self, handle: &SchemaHandle) -> Option<&dyn Schema> {
        self.ops.get(&handle.op_path)?.schema.as_deref()
    }

    /// Bind arguments to the parameters of `op_path`, filling in defaults.
    pub fn bind(
        &self,
        op_path: &str,
        positional: Vec<Value>,
        keyword: Vec<(String, Value)>,
    ) -> Result<BoundArgs, OpError> {
        let def = self
            .ops
            .get(op_path)
            .ok_or_else(|| OpError::UnknownOp(op_path.to_owned()))?;
        Ok(bind_params(op_path, &def.params, positional, keyword)?)
    }

    /// Run the operation at `op_path`, consulting its schema if validation is enabled.
    ///
    /// Only failures to resolve the operation or bind its arguments are returned as `Err`. A
    /// failure of the operation itself is reported as [CallOutcome::OperationError].
    pub fn call_instrumented(
        &mut self,
        op_path: &str,
        positional: Vec<Value>,
        keyword: Vec<(String, Value)>,
    ) -> Result<Invocation, OpError> {
        let validate = self.config.validate;
        let def = self
            .ops
            .get_mut(op_path)
            .ok_or_else(|| OpError::UnknownOp(op_path.to_owned()))?;
        let bound = bind_params(op_path, &def.params, positional, keyword)?;

        let mut diagnostics = Vec::new();
        let schema = match def.schema.as_mut() {
            Some(schema) if validate => schema,
            _ => {
                let outcome = match (def.func)(&bound) {
                    Ok(outputs) => CallOutcome::Unchecked(outputs),
                    Err(err) => CallOutcome::OperationError(err),
                };
                return Ok(Invocation {
                    outcome,
                    diagnostics,
                    report: None,
                });
            }
        };

        schema.init(op_path, &bound);
        let inputs_valid = schema.evaluate();
        if inputs_valid {
            diagnostics.push(Diagnostic::new(
                Level::Info,
                format!("Opcheck {op_path} input validation passed."),
            ));
        } else {
            diagnostics.push(Diagnostic::new(
                Level::Warn,
                format!(
                    "Opcheck {op_path} input validation failed.\n\n{}",
                    schema.report()
                ),
            ));
        }

        let outcome = match (def.func)(&bound) {
            Err(err) => {
                diagnostics.push(Diagnostic::new(
                    Level::Warn,
                    format!("Framework op raised exception.\n\n{err}"),
                ));
                CallOutcome::OperationError(err)
            }
            Ok(outputs) => {
                schema.set_outputs(&outputs);
                let outputs_valid = schema.validate();
                diagnostics.push(if outputs_valid {
                    Diagnostic::new(
                        Level::Info,
                        format!("Opcheck {op_path} output validation passed."),
                    )
                } else {
                    Diagnostic::new(
                        Level::Warn,
                        format!("Opcheck {op_path} output validation failed."),
                    )
                });
                if inputs_valid && outputs_valid {
                    CallOutcome::ValidatedSuccess(outputs)
                } else {
                    CallOutcome::ValidatedFailure(outputs)
                }
            }
        };
        Ok(Invocation {
            outcome,
            diagnostics,
            report: Some(schema.report()),
        })
    }

    /// Like [OpRegistry::call_instrumented], but logs diagnostics and returns the operation's
    /// own result.
    pub fn invoke(
        &mut self,
        op_path: &str,
        positional: Vec<Value>,
        keyword: Vec<(String, Value)>,
    ) -> Result<Vec<DynArray>, OpError> {
        let invocation = self.call_instrumented(op_path, positional, keyword)?;
        for diagnostic in &invocation.diagnostics {
            log!(diagnostic.level, "{diagnostic}");
        }
        if let Some(report) = &invocation.report {
            debug!("Opcheck {op_path} report:\n{report}");
        }
        match invocation.outcome {
            CallOutcome::Unchecked(outputs)
            | CallOutcome::ValidatedSuccess(outputs)
            | CallOutcome::ValidatedFailure(outputs) => Ok(outputs),
            CallOutcome::OperationError(err) => Err(err),
        }
    }
}

impl TensorEngine for OpRegistry {
    fn execute(
        &mut self,
        op_path: &str,
        positional: Vec<Value>,
        keyword: Vec<(String, Value)>,
    ) -> Result<Vec<DynArray>, OpError> {
        self.invoke(op_path, positional, keyword)
    }
}

impl fmt::Debug for OpRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRegistry")
            .field("ops", &self.ops.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}

fn bind_params(
    op_path: &str,
    params: &[Param],
    positional: Vec<Value>,
    keyword: Vec<(String, Value)>,
) -> Result<BoundArgs, BindError> {
    if positional.len() > params.len() {
        return Err(BindError::TooManyPositional {
            op_path: op_path.to_owned(),
            expected: params.len(),
            given: positional.len(),
        });
    }
    let mut slots: Vec<Option<Value>> = positional.into_iter().map(Some).collect();
    slots.resize(params.len(), None);
    for (keyword, value) in keyword {
        let Some(idx) = params.iter().position(|p| p.name == keyword) else {
            return Err(BindError::UnexpectedKeyword {
                op_path: op_path.to_owned(),
                keyword,
            });
        };
        if slots[idx].is_some() {
            return Err(BindError::Duplicate {
                op_path: op_path.to_owned(),
                param: keyword,
            });
        }
        slots[idx] = Some(value);
    }
    let mut bound = IndexMap::with_capacity(params.len());
    for (param, slot) in params.iter().zip(slots) {
        let value = slot
            .or_else(|| param.default.clone())
            .ok_or_else(|| BindError::Missing {
                op_path: op_path.to_owned(),
                param: param.name.clone(),
            })?;
        bound.insert(param.name.clone(), value);
    }
    Ok(BoundArgs(bound))
}
