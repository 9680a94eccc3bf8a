//! Template-driven pipeline job engine.
//!
//! A job is an instance of a [`template::Template`] bound to caller params.
//! The [`controller::JobController`] admits it, the [`scheduler::JobQueue`]
//! orders it by priority, and a [`worker::WorkerPool`] drives its steps in
//! order through the [`dispatcher::StepDispatcher`]. [`engine::Engine`]
//! wires these together.

pub mod admission;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod scheduler;
pub mod service;
pub mod simulated;
pub mod state_machine;
pub mod store;
pub mod template;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use controller::{Batch, CreateJob, EngineStats, JobController};
pub use engine::Engine;
pub use error::EngineError;
