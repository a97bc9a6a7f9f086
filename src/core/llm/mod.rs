//! Access to the external code-understanding capability
//!
//! `provider` speaks the wire protocol; `analyst` owns the prompts, the request
//! bounds and the degrade-to-placeholder policy of each call path.

mod analyst;
pub mod provider;

pub use analyst::{Availability, CodeAnalyst, FileAnalysis, SUMMARY_UNAVAILABLE};
pub use provider::{create_provider, CompletionProvider};
