//! # scir-expr
//!
//! Expression language for scir statecharts.
//!
//! This crate provides:
//! - Parsing of condition/value expressions over a JSON data context
//! - Evaluation with JSON truthiness for conditions
//! - The [`Compiler`]/[`CompiledExpr`] boundary the interpreter core
//!   depends on, plus a cached default implementation

pub mod compile;
pub mod error;
pub mod expr;

pub use compile::{CompiledExpr, Compiler, DefaultCompiler};
pub use error::ExprError;
pub use expr::{get_path, is_truthy, remove_key, set_path, Expr};
