//! Persistence port and its implementations.

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use postgres::PostgresWorkflowStore;
pub use store::{NewOutboxMessage, OrchestrationTx, StoreError, WorkflowStore};
