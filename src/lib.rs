//! Conversation and message synchronization core for a chat client.
//!
//! The [`sync`] module holds the state machines (conversation store, message
//! stream, attachment pipeline, session binding) and the backend adapters;
//! [`llm`] provides the Ollama reply generator.

// Strict discipline: every warning is an error
#![deny(warnings)]
#![deny(unsafe_code)]
#![deny(missing_docs)] // Every public item is documented
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]
#![deny(unused_must_use)] // Result and Option must be handled
#![deny(nonstandard_style)]
#![forbid(unsafe_op_in_unsafe_fn)]

// Clippy
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::missing_const_for_fn)]
#![deny(clippy::unwrap_in_result)]
#![deny(clippy::module_inception)]
#![deny(clippy::redundant_clone)]
#![deny(clippy::shadow_unrelated)]
#![deny(clippy::too_many_arguments)]
#![deny(clippy::cognitive_complexity)]

// Robustness
#![deny(overflowing_literals)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

/// LLM-backed reply generators (Ollama).
pub mod llm;
/// Entry helpers for the `parley` binary.
pub mod start_parley;
/// Conversation and message synchronization core.
pub mod sync;
