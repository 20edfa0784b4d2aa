//! Loading, searching, and cross-validating test specifications.
//!
//! A [Runtime] owns the parsed program and its [GroupRegistry]. [Runtime::gen_shapes] enumerates
//! every rank assignment of the primary index groups, samples dims for each, and filters by the
//! program's constraints. [Runtime::validate] evaluates the statements under the current dims and
//! compares the declared outputs against what the [TensorEngine] returns for the call.

use indexmap::IndexMap;
use itertools::{Either, Itertools};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::{self, Write as _};
use std::io::{self, Write as _};
use std::path::Path;

use crate::ast::{
    ArraySignatures, Arrays, CallExpr, Constraint, EvalContext, Node, OutputRef, Statement,
};
use crate::common::{DimSize, Dims};
use crate::eintup::{Group, GroupError, GroupRegistry, MultiIndexIter};
use crate::grammar::{EtGrammar, Grammar, ParseError, ParseMode};
use crate::opcheck::{OpError, OpRegistry, TensorEngine};
use crate::tensor::{equal_tens, DynArray, TensorError, DEFAULT_EPS};
use crate::utils::{join_into_string, split_sections, LinePrefixWrite};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct RuntimeConfig {
    /// Smallest sampled dimension (inclusive)
    #[cfg_attr(feature = "clap", arg(long, default_value_t = 5))]
    pub min_dim: DimSize,
    /// Largest sampled dimension (exclusive)
    #[cfg_attr(feature = "clap", arg(long, default_value_t = 100))]
    pub max_dim: DimSize,
    /// Ranks 0 up to (but excluding) this are tried for each primary index group
    #[cfg_attr(feature = "clap", arg(long, default_value_t = 10))]
    pub max_rank: u32,
    /// Tolerance when comparing floating-point outputs
    #[cfg_attr(feature = "clap", arg(long, default_value_t = DEFAULT_EPS))]
    pub eps: f64,
    /// Seed for dimension and data sampling
    #[cfg_attr(feature = "clap", arg(long))]
    pub seed: Option<u64>,
}

#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("specification has no {0} section")]
    MissingSection(&'static str),
    #[error("could not parse {mode} {text:?}: {source}")]
    Parse {
        mode: ParseMode,
        text: String,
        #[source]
        source: ParseError,
    },
    #[error("expected a {expected} but parsed a {found}")]
    UnexpectedNode {
        expected: ParseMode,
        found: &'static str,
    },
    #[error(transparent)]
    Group(#[from] GroupError),
    #[error("array '{0}' is used before it is defined")]
    UndefinedArray(String),
    #[error("array '{name}' has {expected} index groups but was used with {found}")]
    SignatureMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("statement '{statement}' does not bind {groups} on its left-hand side")]
    UnboundGroups { statement: String, groups: String },
    #[error("array '{name}' has shape {actual:?}; expected {expected:?}")]
    ArrayShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("empty dimension range [{min}, {max})")]
    InvalidDimRange { min: DimSize, max: DimSize },
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("division by zero in '{0}'")]
    DivisionByZero(String),
    #[error("integer overflow in '{0}'")]
    IntegerOverflow(String),
    #[error("no specification loaded")]
    NotLoaded,
    #[error("operation failed: {0}")]
    Operation(#[source] OpError),
}

/// Ranks assigned to each primary group, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankMap(pub IndexMap<String, usize>);

pub type DimsMap = IndexMap<String, Vec<DimSize>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub candidates: usize,
    pub accepted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputVerdict {
    pub name: String,
    pub equal: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRecord {
    pub ranks: RankMap,
    pub dims: DimsMap,
    pub verdicts: Vec<OutputVerdict>,
}

pub struct Runtime<E: TensorEngine = OpRegistry> {
    groups: GroupRegistry,
    array_sig: ArraySignatures,
    arrays: Arrays,
    statements: Vec<Statement>,
    constraints: Vec<Constraint>,
    call: Option<CallExpr>,
    outputs: Vec<OutputRef>,
    rng: StdRng,
    config: RuntimeConfig,
    engine: E,
    grammar: Box<dyn Grammar>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            min_dim: 5,
            max_dim: 100,
            max_rank: 10,
            eps: DEFAULT_EPS,
            seed: None,
        }
    }
}

impl RankMap {
    pub fn get(&self, name: &str) -> Option<usize> {
        self.0.get(name).copied()
    }
}

impl fmt::Display for RankMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.0.iter().map(|(k, v)| format!("{k}: {v}"));
        write!(f, "{{{}}}", join_into_string(entries, ", "))
    }
}

impl ValidationRecord {
    pub fn passed(&self) -> bool {
        self.verdicts.iter().all(|v| v.equal)
    }
}

impl<E: TensorEngine> Runtime<E> {
    pub fn new(engine: E, config: RuntimeConfig) -> Self {
        Runtime::with_grammar(engine, config, EtGrammar)
    }

    pub fn with_grammar(engine: E, config: RuntimeConfig, grammar: impl Grammar + 'static) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Runtime {
            groups: GroupRegistry::new(),
            array_sig: ArraySignatures::new(),
            arrays: Arrays::new(),
            statements: Vec::new(),
            constraints: Vec::new(),
            call: None,
            outputs: Vec::new(),
            rng,
            config,
            engine,
            grammar: Box::new(grammar),
        }
    }

    pub fn parse_et_file(&mut self, path: impl AsRef<Path>) -> Result<(), RuntimeError> {
        let path = path.as_ref();
        info!("Loading specification from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        self.parse_et(&content)
    }

    /// Load a specification, replacing any previously loaded one.
    ///
    /// On error, the runtime is left with no program loaded.
    pub fn parse_et(&mut self, content: &str) -> Result<(), RuntimeError> {
        self.clear();

        let sections = split_sections(content);
        let mut sections = sections.iter();
        let statements_text = sections
            .next()
            .ok_or(RuntimeError::MissingSection("statements"))?;
        let call_text = sections
            .next()
            .ok_or(RuntimeError::MissingSection("call"))?
            .replace('\n', " ");
        let outputs_text = sections
            .next()
            .ok_or(RuntimeError::MissingSection("outputs"))?
            .replace('\n', " ");
        let constraints_text = sections.next();
        if sections.next().is_some() {
            warn!("Ignoring sections after the constraints section");
        }

        let mut statements = Vec::new();
        for line in statements_text.lines() {
            match self.parse_node(ParseMode::Statement, line)? {
                Node::Statement(st) => statements.push(st),
                other => return Err(unexpected(ParseMode::Statement, &other)),
            }
        }
        let call = match self.parse_node(ParseMode::Call, &call_text)? {
            Node::Call(call) => call,
            other => return Err(unexpected(ParseMode::Call, &other)),
        };
        let outputs = match self.parse_node(ParseMode::Outputs, &outputs_text)? {
            Node::Outputs(outputs) => outputs,
            other => return Err(unexpected(ParseMode::Outputs, &other)),
        };
        let mut constraints = Vec::new();
        for line in constraints_text.iter().flat_map(|t| t.lines()) {
            match self.parse_node(ParseMode::Constraint, line)? {
                Node::Constraint(con) => constraints.push(con),
                other => return Err(unexpected(ParseMode::Constraint, &other)),
            }
        }

        let mut groups = GroupRegistry::new();
        let mut array_sig = ArraySignatures::new();
        for st in &statements {
            st.post_parse_init(&mut groups, &mut array_sig)?;
        }
        for con in &constraints {
            con.post_parse_init(&groups)?;
        }
        call.post_parse_init(&groups, &array_sig)?;
        for out in &outputs {
            out.post_parse_init(&array_sig)?;
        }

        info!(
            "Loaded {} statements, {} constraints, and {} index groups",
            statements.len(),
            constraints.len(),
            groups.len()
        );
        self.groups = groups;
        self.array_sig = array_sig;
        self.statements = statements;
        self.constraints = constraints;
        self.call = Some(call);
        self.outputs = outputs;
        Ok(())
    }

    fn parse_node(&self, mode: ParseMode, text: &str) -> Result<Node, RuntimeError> {
        self.grammar
            .parse(mode, text)
            .map_err(|source| RuntimeError::Parse {
                mode,
                text: text.to_owned(),
                source,
            })
    }

    fn clear(&mut self) {
        self.groups = GroupRegistry::new();
        self.array_sig.clear();
        self.arrays.clear();
        self.statements.clear();
        self.constraints.clear();
        self.call = None;
        self.outputs.clear();
    }

    /// Enumerate rank assignments of the primary groups, calling `visitor` for each that
    /// satisfies every constraint.
    ///
    /// Assignments are visited in row-major order over ranks `0..max_rank`, the last-registered
    /// group varying fastest. Fresh dims are sampled for each candidate before constraints are
    /// checked.
    pub fn gen_shapes<F>(&mut self, mut visitor: F) -> Result<SearchStats, RuntimeError>
    where
        F: FnMut(&mut Self, &RankMap) -> Result<(), RuntimeError>,
    {
        let primaries = self
            .groups
            .iter()
            .filter(|g| g.is_primary())
            .map(|g| g.name().to_owned())
            .collect::<Vec<_>>();
        let space = vec![self.config.max_rank; primaries.len()];
        let mut stats = SearchStats::default();
        for ranks in MultiIndexIter::new(&space) {
            stats.candidates += 1;
            let rank_map = RankMap(
                primaries
                    .iter()
                    .cloned()
                    .zip(ranks.iter().map(|&r| r as usize))
                    .collect(),
            );
            self.set_ranks(&rank_map)?;
            if !self.constraints_hold()? {
                continue;
            }
            debug!("Accepted rank assignment {rank_map}");
            stats.accepted += 1;
            visitor(self, &rank_map)?;
        }
        debug!(
            "Search accepted {} of {} candidates",
            stats.accepted, stats.candidates
        );
        Ok(stats)
    }

    /// Give each named primary group the given rank, with dims sampled from
    /// `[min_dim, max_dim)`.
    pub fn set_ranks(&mut self, rank_map: &RankMap) -> Result<(), RuntimeError> {
        let (min, max) = (self.config.min_dim, self.config.max_dim);
        for (name, &rank) in &rank_map.0 {
            let id = self.groups.id(name)?;
            if !self.groups.group(id).is_primary() {
                return Err(GroupError::IllegalMutation(name.clone()).into());
            }
            if rank > 0 && min >= max {
                return Err(RuntimeError::InvalidDimRange { min, max });
            }
            let dims = (0..rank)
                .map(|_| self.rng.gen_range(min..max))
                .collect::<Dims>();
            self.groups.set_dims(id, dims)?;
        }
        Ok(())
    }

    pub fn set_dims(&mut self, dims_map: &DimsMap) -> Result<(), RuntimeError> {
        for (name, dims) in dims_map {
            let id = self.groups.id(name)?;
            self.groups.set_dims(id, dims.iter().copied())?;
        }
        Ok(())
    }

    pub fn set_one_dim(&mut self, name: &str, index: usize, dim: DimSize) -> Result<(), RuntimeError> {
        let id = self.groups.id(name)?;
        Ok(self.groups.set_dim(id, index, dim)?)
    }

    /// The current dims of every primary group.
    pub fn dims_map(&self) -> Result<DimsMap, RuntimeError> {
        self.primary_groups()
            .into_iter()
            .map(|g| Ok((g.name().to_owned(), g.dims()?.to_vec())))
            .collect()
    }

    fn constraints_hold(&self) -> Result<bool, RuntimeError> {
        for con in &self.constraints {
            if !con.value(&self.groups)? {
                debug!("Constraint '{con}' does not hold");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn evaluate_statements(&mut self) -> Result<(), RuntimeError> {
        self.arrays.clear();
        let mut ctx = EvalContext {
            groups: &self.groups,
            arrays: &mut self.arrays,
            rng: &mut self.rng,
        };
        for st in &self.statements {
            st.evaluate(&mut ctx)?;
        }
        Ok(())
    }

    /// Evaluate the statements under the current dims, returning the declared outputs.
    ///
    /// Returns `None` without evaluating anything if a constraint does not hold.
    pub fn run(&mut self) -> Result<Option<Vec<(String, DynArray)>>, RuntimeError> {
        if !self.constraints_hold()? {
            return Ok(None);
        }
        self.evaluate_statements()?;
        self.outputs
            .iter()
            .map(|out| Ok((out.name.clone(), out.value(&self.arrays)?)))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// Compare each declared output against the corresponding output of the call.
    pub fn validate(&mut self) -> Result<Vec<OutputVerdict>, RuntimeError> {
        self.evaluate_statements()?;
        let call = self.call.as_ref().ok_or(RuntimeError::NotLoaded)?;
        let (positional, keyword) = call.arguments(&self.groups, &self.arrays)?;
        let actual = self
            .engine
            .execute(&call.op_path, positional, keyword)
            .map_err(RuntimeError::Operation)?;
        if actual.len() != self.outputs.len() {
            warn!(
                "{} returned {} outputs; {} declared",
                call.op_path,
                actual.len(),
                self.outputs.len()
            );
        }
        self.outputs
            .iter()
            .enumerate()
            .map(|(i, out)| {
                let expected = out.value(&self.arrays)?;
                let equal = actual
                    .get(i)
                    .map_or(false, |a| equal_tens(&expected, a, self.config.eps));
                Ok(OutputVerdict {
                    name: out.name.clone(),
                    equal,
                })
            })
            .collect()
    }

    /// Run [Runtime::validate] for every accepted assignment, writing one line per assignment.
    pub fn validate_all(
        &mut self,
        out: &mut impl io::Write,
    ) -> Result<Vec<ValidationRecord>, RuntimeError> {
        let mut records = Vec::new();
        self.gen_shapes(|rt, rank_map| {
            let verdicts = rt.validate()?;
            writeln!(
                out,
                "{rank_map} [{}]",
                join_into_string(verdicts.iter().map(|v| v.equal), ", ")
            )?;
            records.push(ValidationRecord {
                ranks: rank_map.clone(),
                dims: rt.dims_map()?,
                verdicts,
            });
            Ok(())
        })?;
        Ok(records)
    }

    pub fn group(&self, name: &str) -> Result<Group<'_>, RuntimeError> {
        Ok(self.groups.get(name)?)
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    pub fn primary_groups(&self) -> Vec<Group<'_>> {
        self.groups.iter().filter(|g| g.is_primary()).collect()
    }

    pub fn dims(&self, name: &str) -> Result<&[DimSize], RuntimeError> {
        Ok(self.groups.get(name)?.dims()?)
    }

    pub fn rank(&self, name: &str) -> Result<usize, RuntimeError> {
        Ok(self.groups.get(name)?.rank()?)
    }

    pub fn nelem(&self, name: &str) -> Result<u64, RuntimeError> {
        Ok(self.groups.get(name)?.element_count()?)
    }

    /// Every combination of the named groups' multi-indices, one index per group.
    pub fn cycle(
        &self,
        names: &[&str],
    ) -> Result<impl Iterator<Item = Vec<Dims>>, RuntimeError> {
        let iters = names
            .iter()
            .map(|name| Ok(self.groups.get(name)?.indices()?))
            .collect::<Result<Vec<_>, RuntimeError>>()?;
        if iters.is_empty() {
            return Ok(Either::Left(std::iter::once(Vec::new())));
        }
        Ok(Either::Right(iters.into_iter().multi_cartesian_product()))
    }

    pub fn array(&self, name: &str) -> Option<&DynArray> {
        self.arrays.get(name)
    }

    /// The names of the groups indexing `name`, if it is a declared array.
    pub fn array_signature(&self, name: &str) -> Option<Vec<&str>> {
        let sig = self.array_sig.get(name)?;
        Some(sig.iter().map(|&id| self.groups.group(id).name()).collect())
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn call(&self) -> Option<&CallExpr> {
        self.call.as_ref()
    }

    pub fn outputs(&self) -> &[OutputRef] {
        &self.outputs
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }
}

fn unexpected(expected: ParseMode, found: &Node) -> RuntimeError {
    RuntimeError::UnexpectedNode {
        expected,
        found: found.kind(),
    }
}

impl<E: TensorEngine> fmt::Display for Runtime<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Tups:")?;
        {
            let mut w = LinePrefixWrite::new(&mut *f, "  ");
            for group in self.groups.iter() {
                writeln!(w, "{group}")?;
            }
        }
        writeln!(f, "\nArray Signatures:")?;
        {
            let mut w = LinePrefixWrite::new(&mut *f, "  ");
            for name in self.array_sig.keys() {
                let sig = self.array_signature(name).unwrap_or_default();
                writeln!(w, "{name}: [{}]", sig.join(", "))?;
            }
        }
        writeln!(f, "\nArray Shapes:")?;
        {
            let mut w = LinePrefixWrite::new(&mut *f, "  ");
            for (name, array) in &self.arrays {
                writeln!(w, "{name}: {:?}", array.shape())?;
            }
        }
        writeln!(f, "\nStatements:")?;
        {
            let mut w = LinePrefixWrite::new(&mut *f, "  ");
            for st in &self.statements {
                writeln!(w, "{st}")?;
            }
        }
        writeln!(f, "\nCall:")?;
        if let Some(call) = &self.call {
            writeln!(f, "  {call}")?;
        }
        writeln!(f, "\nOutputs:")?;
        writeln!(f, "  {}", join_into_string(&self.outputs, ", "))
    }
}
