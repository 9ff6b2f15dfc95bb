//! Runtime lock-order and deadlock validation.
//!
//! This crate vets the lock usage of a running program. Every instrumented
//! lock belongs to a [`class`](ClassId), an ordering domain; each class
//! accumulates a set of *prior* classes known safe to hold before it,
//! declared up front or learned from observed acquisition sequences. An
//! acquisition that contradicts the learned partial order is refused
//! before the thread ever blocks. An acquisition that must block first
//! walks the live graph of blocked threads and the records they wait on,
//! and is refused if the walk closes a verified cycle back to the caller.
//!
//! The validator never provides mutual exclusion itself and never blocks
//! beyond a brief admission wait: checks run synchronously and return a
//! verdict, and the embedding wrapper decides what a violation means.
//! Detection is best-effort: a walk that cannot obtain a consistent
//! snapshot of the mutating graph within a bounded number of retries
//! declines to report rather than flag a stale finding.
//!
//! State lives in an explicit [`Validator`] context, so tests and embedded
//! runtimes can run any number of independent instances. The [`sync`]
//! module wraps `parking_lot` primitives as a ready-made instrumentation
//! of the hook protocol: order check, blocking check, owner registration
//! on acquire; release-order check and owner release on drop.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod class;
pub mod config;
pub mod error;
pub mod record;
pub mod report;
pub mod sync;
pub mod thread;
pub mod validator;

mod arena;
mod backoff;
mod detect;
mod gate;
mod hash;
mod order;

pub use class::{ClassId, ClassPolicy, PriorRuleInfo, Subclass};
pub use config::Config;
pub use error::Violation;
pub use record::RecordId;
pub use report::{CollectSink, Complaint, Sink, TracingSink};
pub use thread::ThreadId;
pub use validator::Validator;
