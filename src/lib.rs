pub mod ast;
pub mod color;
pub mod common;
pub mod eintup;
pub mod grammar;
pub mod opcheck;
pub mod ops;
pub mod pprint;
pub mod runtime;
pub mod schema;
pub mod shape;
pub mod tensor;
pub mod utils;

pub use opcheck::{OpRegistry, Schema, TensorEngine};
pub use runtime::{Runtime, RuntimeConfig, RuntimeError};
