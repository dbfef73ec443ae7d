//! Persistence layer for workflow instances
//!
//! - [`WorkflowStore`]: keyed storage with compare-and-swap writes
//! - [`InMemoryWorkflowStore`]: for tests and single-process deployments
//! - [`PostgresWorkflowStore`]: production storage

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use postgres::PostgresWorkflowStore;
pub use store::{StoreError, WorkflowStore};
