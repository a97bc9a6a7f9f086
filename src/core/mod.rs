// src/core/mod.rs
mod accumulator;
mod acquirer;
mod batch_scheduler;
mod classifier;
mod engine;
mod models;
mod walker;

pub mod llm;
pub mod store;

pub use engine::{Engine, RunOutcome};
