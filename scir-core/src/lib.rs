//! # scir-core
//!
//! Statechart interpretation for scir.
//!
//! This crate provides:
//! - The active [`Configuration`] and its legality invariant
//! - Transition selection, conflict resolution and exit/entry sets
//! - The [`Interpreter`] run-to-completion loop
//! - History snapshots, delayed sends and child machine invocation
//! - The [`ServiceInvoker`] / [`ChildResolver`] boundary traits

pub mod config;
pub mod error;
pub mod event;
pub mod history;
pub mod interp;
pub mod sched;
pub mod select;
pub mod services;

pub use config::Configuration;
pub use error::{CoreError, EventSendError};
pub use event::{Event, EventOrigin, EventSender};
pub use history::HistoryStore;
pub use interp::{Interpreter, InterpreterOptions, Outcome, RunStatus};
pub use sched::SendScheduler;
pub use services::{
    ChildResolver, NullInvoker, ServiceError, ServiceInvoker, StaticResolver,
};
