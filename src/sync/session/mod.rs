//! Session lifecycle.

pub mod binding;

pub use binding::{SessionBinding, SessionTask, ensure_profile};
