//! The parsed form of a test specification.
//!
//! Nodes come in four closed roles: [Statement]s that materialize arrays, [Constraint]s over group
//! ranks and dims, a single [CallExpr] invoking the operation under test, and the [OutputRef]s
//! naming the expected outputs. Each role has its own `post_parse_init` (registering the groups and
//! array signatures it mentions) and its own evaluation entry point.

use indexmap::IndexMap;
use rand::rngs::StdRng;
use std::fmt;

use crate::common::Dtype;
use crate::eintup::{GroupId, GroupRegistry, MultiIndexIter};
use crate::opcheck::Value;
use crate::runtime::RuntimeError;
use crate::shape::ShapeError;
use crate::tensor::DynArray;
use crate::utils::join_into_string;

pub type ArraySignatures = IndexMap<String, Vec<GroupId>>;
pub type Arrays = IndexMap<String, DynArray>;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Statement(Statement),
    Constraint(Constraint),
    Call(CallExpr),
    Outputs(Vec<OutputRef>),
}

/// One group position in an index list: `name`, or `name:owner` to declare a shadow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub shadow_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayRef {
    pub name: String,
    pub groups: Vec<IndexSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// `=`: every RHS group must also appear on the LHS.
    Assign,
    /// `+=`: RHS-only groups are summed over.
    Accumulate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Array(ArrayRef),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rhs {
    Random { lo: f64, hi: f64, dtype: Dtype },
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub lhs: ArrayRef,
    pub op: AssignOp,
    pub rhs: Rhs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Add,
    Sub,
    Mul,
    FloorDiv,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntExpr {
    Lit(i64),
    Rank(String),
    Nelem(String),
    Dim(String, usize),
    Binary(IntOp, Box<IntExpr>, Box<IntExpr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub lhs: IntExpr,
    pub cmp: CmpOp,
    pub rhs: IntExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallValue {
    Array(String),
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Ints(Vec<i64>),
    Rank(String),
    Dims(String),
    Nelem(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallArg {
    pub keyword: Option<String>,
    pub value: CallValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub op_path: String,
    pub args: Vec<CallArg>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRef {
    pub name: String,
}

/// The mutable state statements evaluate against.
pub struct EvalContext<'a> {
    pub groups: &'a GroupRegistry,
    pub arrays: &'a mut Arrays,
    pub rng: &'a mut StdRng,
}

/// An [Expr] whose array references have been replaced by operand indices.
enum Compiled {
    Num(f64),
    Operand(usize),
    Neg(Box<Compiled>),
    Binary(BinOp, Box<Compiled>, Box<Compiled>),
}

struct Operand {
    values: ndarray::ArrayD<f64>,
    // Positions, within the combined iteration index, of each of this operand's axes.
    axes: Vec<usize>,
}

impl Node {
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Statement(_) => "statement",
            Node::Constraint(_) => "constraint",
            Node::Call(_) => "call",
            Node::Outputs(_) => "output",
        }
    }

    pub fn post_parse_init(
        &self,
        groups: &mut GroupRegistry,
        array_sig: &mut ArraySignatures,
    ) -> Result<(), RuntimeError> {
        match self {
            Node::Statement(st) => st.post_parse_init(groups, array_sig),
            Node::Constraint(con) => con.post_parse_init(groups),
            Node::Call(call) => call.post_parse_init(groups, array_sig),
            Node::Outputs(outs) => outs
                .iter()
                .try_for_each(|out| out.post_parse_init(array_sig)),
        }
    }
}

impl ArrayRef {
    fn group_ids(&self, groups: &GroupRegistry) -> Result<Vec<GroupId>, RuntimeError> {
        self.groups
            .iter()
            .map(|g| groups.id(&g.name).map_err(RuntimeError::from))
            .collect()
    }

    fn check_signature(&self, array_sig: &ArraySignatures) -> Result<(), RuntimeError> {
        let sig = array_sig
            .get(&self.name)
            .ok_or_else(|| RuntimeError::UndefinedArray(self.name.clone()))?;
        if sig.len() != self.groups.len() {
            return Err(RuntimeError::SignatureMismatch {
                name: self.name.clone(),
                expected: sig.len(),
                found: self.groups.len(),
            });
        }
        Ok(())
    }
}

impl Expr {
    fn array_refs<'a>(&'a self, out: &mut Vec<&'a ArrayRef>) {
        match self {
            Expr::Num(_) => {}
            Expr::Array(r) => out.push(r),
            Expr::Neg(e) => e.array_refs(out),
            Expr::Binary(_, l, r) => {
                l.array_refs(out);
                r.array_refs(out);
            }
        }
    }

    fn compile(&self, next_operand: &mut usize) -> Compiled {
        match self {
            Expr::Num(v) => Compiled::Num(*v),
            Expr::Array(_) => {
                *next_operand += 1;
                Compiled::Operand(*next_operand - 1)
            }
            Expr::Neg(e) => Compiled::Neg(Box::new(e.compile(next_operand))),
            Expr::Binary(op, l, r) => {
                let l = l.compile(next_operand);
                let r = r.compile(next_operand);
                Compiled::Binary(*op, Box::new(l), Box::new(r))
            }
        }
    }
}

impl Compiled {
    fn eval(&self, operands: &[Operand], index: &[usize], scratch: &mut Vec<usize>) -> f64 {
        match self {
            Compiled::Num(v) => *v,
            Compiled::Operand(i) => {
                let operand = &operands[*i];
                scratch.clear();
                scratch.extend(operand.axes.iter().map(|&a| index[a]));
                operand.values[ndarray::IxDyn(scratch)]
            }
            Compiled::Neg(e) => -e.eval(operands, index, scratch),
            Compiled::Binary(op, l, r) => {
                let l = l.eval(operands, index, scratch);
                let r = r.eval(operands, index, scratch);
                match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l / r,
                }
            }
        }
    }
}

impl Statement {
    pub fn post_parse_init(
        &self,
        groups: &mut GroupRegistry,
        array_sig: &mut ArraySignatures,
    ) -> Result<(), RuntimeError> {
        let mut refs = Vec::new();
        if let Rhs::Expr(expr) = &self.rhs {
            expr.array_refs(&mut refs);
        }
        for r in &refs {
            r.check_signature(array_sig)?;
        }

        // Owners may be introduced by the same statement, so shadows go second.
        let all_specs = refs
            .iter()
            .flat_map(|r| &r.groups)
            .chain(&self.lhs.groups)
            .collect::<Vec<_>>();
        for spec in all_specs.iter().filter(|s| s.shadow_of.is_none()) {
            groups.maybe_add(&spec.name, None)?;
        }
        for spec in all_specs.iter().filter(|s| s.shadow_of.is_some()) {
            groups.maybe_add(&spec.name, spec.shadow_of.as_deref())?;
        }

        if self.op == AssignOp::Assign {
            let unbound = refs
                .iter()
                .flat_map(|r| &r.groups)
                .filter(|g| !self.lhs.groups.iter().any(|l| l.name == g.name))
                .map(|g| g.name.as_str())
                .collect::<Vec<_>>();
            if !unbound.is_empty() {
                return Err(RuntimeError::UnboundGroups {
                    statement: self.to_string(),
                    groups: join_into_string(unbound, ", "),
                });
            }
        }

        let lhs_ids = self.lhs.group_ids(groups)?;
        match array_sig.get(&self.lhs.name) {
            Some(sig) if sig.len() != lhs_ids.len() => Err(RuntimeError::SignatureMismatch {
                name: self.lhs.name.clone(),
                expected: sig.len(),
                found: lhs_ids.len(),
            }),
            Some(_) => Ok(()),
            None => {
                array_sig.insert(self.lhs.name.clone(), lhs_ids);
                Ok(())
            }
        }
    }

    /// Materialize (or accumulate into) this statement's LHS array under the current dims.
    pub fn evaluate(&self, ctx: &mut EvalContext<'_>) -> Result<(), RuntimeError> {
        let lhs_ids = self.lhs.group_ids(ctx.groups)?;
        let lhs_shape = concat_dims(ctx.groups, &lhs_ids)?;
        let expr = match &self.rhs {
            Rhs::Random { lo, hi, dtype } => {
                let array = DynArray::random(&lhs_shape, *dtype, *lo, *hi, ctx.rng)?;
                ctx.arrays.insert(self.lhs.name.clone(), array);
                return Ok(());
            }
            Rhs::Expr(expr) => expr,
        };

        let mut refs = Vec::new();
        expr.array_refs(&mut refs);

        // The combined iteration space: LHS groups, then groups appearing only on the RHS.
        let mut iter_ids = lhs_ids.clone();
        for r in &refs {
            for id in r.group_ids(ctx.groups)? {
                if !iter_ids.contains(&id) {
                    iter_ids.push(id);
                }
            }
        }
        if self.op == AssignOp::Assign && iter_ids.len() > lhs_ids.len() {
            let extra = iter_ids[lhs_ids.len()..]
                .iter()
                .map(|&id| ctx.groups.group(id).name());
            return Err(RuntimeError::UnboundGroups {
                statement: self.to_string(),
                groups: join_into_string(extra, ", "),
            });
        }
        let mut group_axes = Vec::with_capacity(iter_ids.len());
        let mut all_dims = Vec::new();
        for &id in &iter_ids {
            let dims = ctx.groups.group(id).dims()?;
            group_axes.push(all_dims.len()..all_dims.len() + dims.len());
            all_dims.extend_from_slice(dims);
        }

        let mut operands = Vec::with_capacity(refs.len());
        for r in &refs {
            let array = ctx
                .arrays
                .get(&r.name)
                .ok_or_else(|| RuntimeError::UndefinedArray(r.name.clone()))?;
            let ids = r.group_ids(ctx.groups)?;
            let expected = concat_dims(ctx.groups, &ids)?;
            if array.shape() != expected.as_slice() {
                return Err(RuntimeError::ArrayShape {
                    name: r.name.clone(),
                    expected,
                    actual: array.shape().to_vec(),
                });
            }
            let axes = ids
                .iter()
                .filter_map(|id| iter_ids.iter().position(|i| i == id))
                .flat_map(|pos| group_axes[pos].clone())
                .collect();
            operands.push(Operand {
                values: array.to_f64(),
                axes,
            });
        }

        let existing = ctx.arrays.get(&self.lhs.name);
        let dtype = existing
            .map(|a| a.dtype())
            .or_else(|| {
                refs.first()
                    .and_then(|r| ctx.arrays.get(&r.name))
                    .map(|a| a.dtype())
            })
            .unwrap_or(Dtype::Float32);
        let mut target = match (self.op, existing) {
            (AssignOp::Accumulate, Some(prev)) => {
                if prev.shape() != lhs_shape.as_slice() {
                    return Err(RuntimeError::ArrayShape {
                        name: self.lhs.name.clone(),
                        expected: lhs_shape,
                        actual: prev.shape().to_vec(),
                    });
                }
                prev.to_f64()
            }
            _ => ndarray::ArrayD::zeros(ndarray::IxDyn(&lhs_shape)),
        };

        let compiled = expr.compile(&mut 0);
        let lhs_rank = lhs_shape.len();
        let mut index = Vec::with_capacity(all_dims.len());
        let mut scratch = Vec::new();
        for combined in MultiIndexIter::new(&all_dims) {
            index.clear();
            index.extend(combined.iter().map(|&i| i as usize));
            let value = compiled.eval(&operands, &index, &mut scratch);
            let slot = &mut target[ndarray::IxDyn(&index[..lhs_rank])];
            match self.op {
                AssignOp::Assign => *slot = value,
                AssignOp::Accumulate => *slot += value,
            }
        }
        ctx.arrays
            .insert(self.lhs.name.clone(), DynArray::from_f64(dtype, &target));
        Ok(())
    }
}

fn concat_dims(groups: &GroupRegistry, ids: &[GroupId]) -> Result<Vec<usize>, RuntimeError> {
    let mut shape = Vec::new();
    for &id in ids {
        shape.extend(groups.group(id).dims()?.iter().map(|&d| d as usize));
    }
    Ok(shape)
}

impl IntExpr {
    fn group_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            IntExpr::Lit(_) => {}
            IntExpr::Rank(g) | IntExpr::Nelem(g) | IntExpr::Dim(g, _) => out.push(g),
            IntExpr::Binary(_, l, r) => {
                l.group_names(out);
                r.group_names(out);
            }
        }
    }

    pub fn value(&self, groups: &GroupRegistry) -> Result<Option<i64>, RuntimeError> {
        Ok(match self {
            IntExpr::Lit(v) => Some(*v),
            IntExpr::Rank(g) => Some(groups.get(g)?.rank()? as i64),
            IntExpr::Nelem(g) => Some(
                i64::try_from(groups.get(g)?.element_count()?)
                    .map_err(|_| RuntimeError::IntegerOverflow(self.to_string()))?,
            ),
            IntExpr::Dim(g, ind) => {
                let dims = groups.get(g)?.dims()?;
                let dim = dims.get(*ind).ok_or_else(|| {
                    crate::eintup::GroupError::Shape {
                        name: g.clone(),
                        source: ShapeError::IndexOutOfRange {
                            index: *ind,
                            len: dims.len(),
                        },
                    }
                })?;
                Some(i64::from(*dim))
            }
            IntExpr::Binary(op, l, r) => {
                let (Some(l), Some(r)) = (l.value(groups)?, r.value(groups)?) else {
                    return Ok(None);
                };
                let checked = match op {
                    IntOp::Add => l.checked_add(r),
                    IntOp::Sub => l.checked_sub(r),
                    IntOp::Mul => l.checked_mul(r),
                    IntOp::FloorDiv if r == 0 => return Ok(None),
                    IntOp::FloorDiv => floor_div(l, r),
                };
                Some(checked.ok_or_else(|| RuntimeError::IntegerOverflow(self.to_string()))?)
            }
        })
    }
}

/// Floor division; `None` only when the quotient overflows (`i64::MIN // -1`).
fn floor_div(l: i64, r: i64) -> Option<i64> {
    let q = l.checked_div(r)?;
    if l % r != 0 && ((l < 0) != (r < 0)) {
        q.checked_sub(1)
    } else {
        Some(q)
    }
}

impl Constraint {
    pub fn post_parse_init(&self, groups: &GroupRegistry) -> Result<(), RuntimeError> {
        let mut names = Vec::new();
        self.lhs.group_names(&mut names);
        self.rhs.group_names(&mut names);
        for name in names {
            groups.id(name)?;
        }
        Ok(())
    }

    /// Whether the constraint holds for the groups' current dims.
    pub fn value(&self, groups: &GroupRegistry) -> Result<bool, RuntimeError> {
        let (Some(l), Some(r)) = (self.lhs.value(groups)?, self.rhs.value(groups)?) else {
            return Err(RuntimeError::DivisionByZero(self.to_string()));
        };
        Ok(match self.cmp {
            CmpOp::Eq => l == r,
            CmpOp::Ne => l != r,
            CmpOp::Lt => l < r,
            CmpOp::Le => l <= r,
            CmpOp::Gt => l > r,
            CmpOp::Ge => l >= r,
        })
    }
}

impl CallExpr {
    pub fn post_parse_init(
        &self,
        groups: &GroupRegistry,
        array_sig: &ArraySignatures,
    ) -> Result<(), RuntimeError> {
        for arg in &self.args {
            match &arg.value {
                CallValue::Array(name) => {
                    if !array_sig.contains_key(name) {
                        return Err(RuntimeError::UndefinedArray(name.clone()));
                    }
                }
                CallValue::Rank(g) | CallValue::Dims(g) | CallValue::Nelem(g) => {
                    groups.id(g)?;
                }
                CallValue::None
                | CallValue::Bool(_)
                | CallValue::Int(_)
                | CallValue::Float(_)
                | CallValue::Ints(_) => {}
            }
        }
        Ok(())
    }

    /// Resolve arguments into positional and keyword [Value]s for the tensor engine.
    pub fn arguments(
        &self,
        groups: &GroupRegistry,
        arrays: &Arrays,
    ) -> Result<(Vec<Value>, Vec<(String, Value)>), RuntimeError> {
        let mut positional = Vec::new();
        let mut keyword = Vec::new();
        for arg in &self.args {
            let value = match &arg.value {
                CallValue::Array(name) => Value::Tensor(
                    arrays
                        .get(name)
                        .cloned()
                        .ok_or_else(|| RuntimeError::UndefinedArray(name.clone()))?,
                ),
                CallValue::None => Value::None,
                CallValue::Bool(b) => Value::Bool(*b),
                CallValue::Int(i) => Value::Int(*i),
                CallValue::Float(f) => Value::Float(*f),
                CallValue::Ints(v) => Value::Ints(v.clone()),
                CallValue::Rank(g) => Value::Int(groups.get(g)?.rank()? as i64),
                CallValue::Dims(g) => {
                    Value::Ints(groups.get(g)?.dims()?.iter().map(|&d| i64::from(d)).collect())
                }
                CallValue::Nelem(g) => Value::Int(
                    i64::try_from(groups.get(g)?.element_count()?)
                        .map_err(|_| RuntimeError::IntegerOverflow(format!("NELEM({g})")))?,
                ),
            };
            match &arg.keyword {
                Some(k) => keyword.push((k.clone(), value)),
                None => positional.push(value),
            }
        }
        Ok((positional, keyword))
    }
}

impl OutputRef {
    pub fn post_parse_init(&self, array_sig: &ArraySignatures) -> Result<(), RuntimeError> {
        if array_sig.contains_key(&self.name) {
            Ok(())
        } else {
            Err(RuntimeError::UndefinedArray(self.name.clone()))
        }
    }

    pub fn value(&self, arrays: &Arrays) -> Result<DynArray, RuntimeError> {
        arrays
            .get(&self.name)
            .cloned()
            .ok_or_else(|| RuntimeError::UndefinedArray(self.name.clone()))
    }
}

impl fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.shadow_of {
            Some(owner) => write!(f, "{}:{}", self.name, owner),
            None => write!(f, "{}", self.name),
        }
    }
}

impl fmt::Display for ArrayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, join_into_string(&self.groups, ","))
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
        })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Num(v) => write!(f, "{v}"),
            Expr::Array(r) => write!(f, "{r}"),
            Expr::Neg(e) => write!(f, "-{e}"),
            Expr::Binary(op, l, r) => write!(f, "({l} {op} {r})"),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            AssignOp::Assign => "=",
            AssignOp::Accumulate => "+=",
        };
        match &self.rhs {
            Rhs::Random { lo, hi, dtype } => {
                let keyword: &'static str = (*dtype).into();
                write!(f, "{} {op} RANDOM({lo}, {hi}, {keyword})", self.lhs)
            }
            Rhs::Expr(e) => write!(f, "{} {op} {e}", self.lhs),
        }
    }
}

impl fmt::Display for IntExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntExpr::Lit(v) => write!(f, "{v}"),
            IntExpr::Rank(g) => write!(f, "RANK({g})"),
            IntExpr::Nelem(g) => write!(f, "NELEM({g})"),
            IntExpr::Dim(g, i) => write!(f, "DIMS({g})[{i}]"),
            IntExpr::Binary(op, l, r) => {
                let op = match op {
                    IntOp::Add => "+",
                    IntOp::Sub => "-",
                    IntOp::Mul => "*",
                    IntOp::FloorDiv => "//",
                };
                write!(f, "({l} {op} {r})")
            }
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cmp = match self.cmp {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        write!(f, "{} {cmp} {}", self.lhs, self.rhs)
    }
}

impl fmt::Display for CallValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallValue::Array(name) => write!(f, "{name}"),
            CallValue::None => write!(f, "None"),
            CallValue::Bool(true) => write!(f, "True"),
            CallValue::Bool(false) => write!(f, "False"),
            CallValue::Int(i) => write!(f, "{i}"),
            CallValue::Float(v) => write!(f, "{v:?}"),
            CallValue::Ints(v) => write!(f, "[{}]", join_into_string(v, ", ")),
            CallValue::Rank(g) => write!(f, "RANK({g})"),
            CallValue::Dims(g) => write!(f, "DIMS({g})"),
            CallValue::Nelem(g) => write!(f, "NELEM({g})"),
        }
    }
}

impl fmt::Display for CallExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self.args.iter().map(|a| match &a.keyword {
            Some(k) => format!("{k}={}", a.value),
            None => a.value.to_string(),
        });
        write!(f, "{}({})", self.op_path, join_into_string(args, ", "))
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn spec(name: &str) -> IndexSpec {
        IndexSpec {
            name: name.to_owned(),
            shadow_of: None,
        }
    }

    fn aref(name: &str, groups: &[&str]) -> ArrayRef {
        ArrayRef {
            name: name.to_owned(),
            groups: groups.iter().map(|g| spec(g)).collect(),
        }
    }

    fn random_stmt(name: &str, groups: &[&str], dtype: Dtype) -> Statement {
        Statement {
            lhs: aref(name, groups),
            op: AssignOp::Assign,
            rhs: Rhs::Random {
                lo: 0.0,
                hi: 10.0,
                dtype,
            },
        }
    }

    struct Fixture {
        groups: GroupRegistry,
        array_sig: ArraySignatures,
        arrays: Arrays,
        rng: StdRng,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                groups: GroupRegistry::new(),
                array_sig: ArraySignatures::new(),
                arrays: Arrays::new(),
                rng: StdRng::seed_from_u64(7),
            }
        }

        fn init(&mut self, st: &Statement) -> Result<(), RuntimeError> {
            st.post_parse_init(&mut self.groups, &mut self.array_sig)
        }

        fn eval(&mut self, st: &Statement) -> Result<(), RuntimeError> {
            st.evaluate(&mut EvalContext {
                groups: &self.groups,
                arrays: &mut self.arrays,
                rng: &mut self.rng,
            })
        }

        fn set(&mut self, name: &str, dims: &[u32]) {
            let id = self.groups.id(name).unwrap();
            self.groups.set_dims(id, dims.iter().copied()).unwrap();
        }
    }

    #[test]
    fn test_random_statement_uses_group_dims() {
        let mut fx = Fixture::new();
        let st = random_stmt("x", &["a", "b"], Dtype::Sint32);
        fx.init(&st).unwrap();
        fx.set("a", &[2, 3]);
        fx.set("b", &[4]);
        fx.eval(&st).unwrap();
        assert_eq!(fx.arrays["x"].shape(), &[2, 3, 4]);
        assert_eq!(fx.arrays["x"].dtype(), Dtype::Sint32);
        assert_eq!(fx.array_sig["x"].len(), 2);
    }

    #[test]
    fn test_copy_statement_preserves_values_and_dtype() {
        let mut fx = Fixture::new();
        let init = random_stmt("x", &["a"], Dtype::Sint32);
        let copy = Statement {
            lhs: aref("y", &["a"]),
            op: AssignOp::Assign,
            rhs: Rhs::Expr(Expr::Array(aref("x", &["a"]))),
        };
        fx.init(&init).unwrap();
        fx.init(&copy).unwrap();
        fx.set("a", &[3, 2]);
        fx.eval(&init).unwrap();
        fx.eval(&copy).unwrap();
        assert_eq!(fx.arrays["y"], fx.arrays["x"]);
    }

    #[test]
    fn test_accumulate_sums_over_rhs_only_groups() {
        let mut fx = Fixture::new();
        let a = random_stmt("a", &["i", "k"], Dtype::Sint32);
        let b = random_stmt("b", &["k", "j"], Dtype::Sint32);
        let c = Statement {
            lhs: aref("c", &["i", "j"]),
            op: AssignOp::Accumulate,
            rhs: Rhs::Expr(Expr::Binary(
                BinOp::Mul,
                Box::new(Expr::Array(aref("a", &["i", "k"]))),
                Box::new(Expr::Array(aref("b", &["k", "j"]))),
            )),
        };
        for st in [&a, &b, &c] {
            fx.init(st).unwrap();
        }
        fx.set("i", &[3]);
        fx.set("k", &[4]);
        fx.set("j", &[2]);
        for st in [&a, &b, &c] {
            fx.eval(st).unwrap();
        }
        let expected = fx.arrays["a"].matmul(&fx.arrays["b"]).unwrap();
        assert_eq!(fx.arrays["c"], expected);
    }

    #[test]
    fn test_assign_with_unbound_groups_is_rejected() {
        let mut fx = Fixture::new();
        fx.init(&random_stmt("x", &["a", "b"], Dtype::Float32))
            .unwrap();
        let st = Statement {
            lhs: aref("y", &["a"]),
            op: AssignOp::Assign,
            rhs: Rhs::Expr(Expr::Array(aref("x", &["a", "b"]))),
        };
        assert!(matches!(
            fx.init(&st),
            Err(RuntimeError::UnboundGroups { .. })
        ));
    }

    #[test]
    fn test_reference_to_undeclared_array_is_rejected() {
        let mut fx = Fixture::new();
        let st = Statement {
            lhs: aref("y", &["a"]),
            op: AssignOp::Assign,
            rhs: Rhs::Expr(Expr::Array(aref("ghost", &["a"]))),
        };
        assert!(matches!(fx.init(&st), Err(RuntimeError::UndefinedArray(n)) if n == "ghost"));
    }

    #[test]
    fn test_signature_arity_mismatch_is_rejected() {
        let mut fx = Fixture::new();
        fx.init(&random_stmt("x", &["a", "b"], Dtype::Float32))
            .unwrap();
        let st = Statement {
            lhs: aref("y", &["a"]),
            op: AssignOp::Assign,
            rhs: Rhs::Expr(Expr::Array(aref("x", &["a"]))),
        };
        assert!(matches!(
            fx.init(&st),
            Err(RuntimeError::SignatureMismatch {
                expected: 2,
                found: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_shadow_declared_alongside_owner() {
        let mut fx = Fixture::new();
        let st = Statement {
            lhs: ArrayRef {
                name: "x".to_owned(),
                groups: vec![
                    IndexSpec {
                        name: "b2".to_owned(),
                        shadow_of: Some("b".to_owned()),
                    },
                    spec("b"),
                ],
            },
            op: AssignOp::Assign,
            rhs: Rhs::Random {
                lo: 0.0,
                hi: 1.0,
                dtype: Dtype::Float32,
            },
        };
        fx.init(&st).unwrap();
        let b2 = fx.groups.get("b2").unwrap();
        assert!(!b2.is_primary());
        assert!(b2.same_shape_as(&fx.groups.get("b").unwrap()));
    }

    #[test]
    fn test_transpose_through_shadow_group() {
        let mut fx = Fixture::new();
        let x = random_stmt("x", &["i", "j"], Dtype::Sint32);
        let t = Statement {
            lhs: aref("t", &["j", "i"]),
            op: AssignOp::Assign,
            rhs: Rhs::Expr(Expr::Array(aref("x", &["i", "j"]))),
        };
        fx.init(&x).unwrap();
        fx.init(&t).unwrap();
        fx.set("i", &[2]);
        fx.set("j", &[3]);
        fx.eval(&x).unwrap();
        fx.eval(&t).unwrap();
        let expected = fx.arrays["x"].permuted_axes(&[1, 0]).unwrap();
        assert_eq!(fx.arrays["t"], expected);
    }

    #[test]
    fn test_constraint_values() {
        let mut groups = GroupRegistry::new();
        let a = groups.maybe_add("a", None).unwrap();
        groups.set_dims(a, [3, 5]).unwrap();
        let con = Constraint {
            lhs: IntExpr::Binary(
                IntOp::Add,
                Box::new(IntExpr::Rank("a".to_owned())),
                Box::new(IntExpr::Dim("a".to_owned(), 1)),
            ),
            cmp: CmpOp::Eq,
            rhs: IntExpr::Lit(7),
        };
        assert!(con.value(&groups).unwrap());
        let out_of_range = Constraint {
            lhs: IntExpr::Dim("a".to_owned(), 2),
            cmp: CmpOp::Ge,
            rhs: IntExpr::Lit(0),
        };
        assert!(out_of_range.value(&groups).is_err());
    }

    #[test]
    fn test_nelem_constraint_overflow_is_an_error() {
        let mut groups = GroupRegistry::new();
        let a = groups.maybe_add("a", None).unwrap();
        groups.set_dims(a, [99; 9]).unwrap();
        let nelem = || Box::new(IntExpr::Nelem("a".to_owned()));
        let fits = Constraint {
            lhs: IntExpr::Nelem("a".to_owned()),
            cmp: CmpOp::Gt,
            rhs: IntExpr::Lit(4096),
        };
        assert!(fits.value(&groups).unwrap());
        let squared = Constraint {
            lhs: IntExpr::Binary(IntOp::Mul, nelem(), nelem()),
            cmp: CmpOp::Le,
            rhs: IntExpr::Lit(4096),
        };
        assert!(matches!(
            squared.value(&groups),
            Err(RuntimeError::IntegerOverflow(expr)) if expr == "(NELEM(a) * NELEM(a))"
        ));

        groups.set_dims(a, [99; 10]).unwrap();
        assert!(matches!(
            fits.value(&groups),
            Err(RuntimeError::Group(crate::eintup::GroupError::ElementCountOverflow(name)))
                if name == "a"
        ));
    }

    #[test]
    fn test_constraint_referencing_unknown_group_fails_init() {
        let groups = GroupRegistry::new();
        let con = Constraint {
            lhs: IntExpr::Rank("nope".to_owned()),
            cmp: CmpOp::Eq,
            rhs: IntExpr::Lit(0),
        };
        assert!(con.post_parse_init(&groups).is_err());
    }

    #[test]
    fn test_floor_div_rounds_toward_negative_infinity() {
        assert_eq!(floor_div(7, 2), Some(3));
        assert_eq!(floor_div(-7, 2), Some(-4));
        assert_eq!(floor_div(7, -2), Some(-4));
        assert_eq!(floor_div(-8, 2), Some(-4));
        assert_eq!(floor_div(i64::MIN, -1), None);
    }

    #[test]
    fn test_statement_display() {
        let st = Statement {
            lhs: aref("c", &["i", "j"]),
            op: AssignOp::Accumulate,
            rhs: Rhs::Expr(Expr::Binary(
                BinOp::Mul,
                Box::new(Expr::Array(aref("a", &["i", "k"]))),
                Box::new(Expr::Num(2.0)),
            )),
        };
        assert_eq!(st.to_string(), "c[i,j] += (a[i,k] * 2)");
    }
}
