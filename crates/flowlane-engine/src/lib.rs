//! # Flowlane Engine
//!
//! A PostgreSQL-backed workflow orchestration engine for durable, event-driven
//! execution: a workflow definition is interpreted one event at a time, state
//! transitions and the next intent are written in a single transaction, and
//! delivery of that intent is handed off to an outbox relay so the write and
//! the dispatch can never diverge.
//!
//! ## Components
//!
//! - [`orchestrator::Orchestrator`]: drives instance state machines forward
//!   in response to [`flowlane_contracts::WorkflowEvent`]s.
//! - [`persistence`]: the `WorkflowStore` port, with Postgres and in-memory
//!   implementations.
//! - [`lock`]: per-instance mutual exclusion so exactly one orchestrator
//!   process advances a given instance at a time.
//! - [`broker`]: the claim-based queue abstraction shared by the outbox relay
//!   (publish) and the orchestrator/worker/sweeper binaries (claim/ack/nack).
//! - [`reliability`]: retry and circuit-breaker primitives shared by every
//!   component that calls out to something that can fail transiently.
//!
//! The relay, worker, and sweeper each live in their own crate
//! (`flowlane-relay`, `flowlane-worker`, `flowlane-sweeper`) and depend on
//! this crate for the store, lock, and broker ports.

pub mod broker;
pub mod domain;
pub mod lock;
pub mod orchestrator;
pub mod persistence;
pub mod reliability;

pub use broker::{Broker, BrokerError, ClaimedMessage, InMemoryBroker, NewBrokerMessage, PostgresQueueBroker};
pub use domain::{Connection, Instance, InstanceStatus, OutboxMessage, StepExecution, StepStatus, Version, Workflow};
pub use lock::{InMemoryLock, InstanceLock, LockError, LockGuard, PostgresAdvisoryLock, DEFAULT_LEASE};
pub use orchestrator::{Orchestrator, OrchestratorError, ProcessOutcome};
pub use persistence::{InMemoryWorkflowStore, NewOutboxMessage, OrchestrationTx, PostgresWorkflowStore, StoreError, WorkflowStore};
pub use reliability::{CircuitBreakerConfig, CircuitState, RetryPolicy};
