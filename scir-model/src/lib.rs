//! # scir-model
//!
//! Statechart model for scir.
//!
//! This crate provides:
//! - The immutable state tree (arena-allocated, index-linked)
//! - Nested JSON definition parsing
//! - Eager load-time validation with a structured error map
//! - Executable-content metadata with load-time-compiled expressions

pub mod action;
pub mod builder;
pub mod chart;
pub mod error;
pub mod raw;

pub use action::{
    Action, Attr, Branch, ChildMachine, InvokeSpec, QuerySpec, SendSpec, ValueSource,
};
pub use chart::{
    Chart, EventPattern, StateId, StateKind, StateNode, Transition, TransitionKind,
};
pub use error::{ModelError, ValidationErrors};
pub use raw::RawChart;
