//! Transition engine and per-instance lifecycle

mod lifecycle;
mod transition;

pub use lifecycle::LifecycleTokens;
pub use transition::{EngineParts, InstanceStatus, TransitionEngine, TransitionError};
