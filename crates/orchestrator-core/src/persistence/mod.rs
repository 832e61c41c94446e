//! Persistence layer: one [`OrchestrationStore`] trait, two backends.
//!
//! [`memory::InMemoryStore`] is used in tests and local development;
//! [`postgres::PostgresStore`] is the production backend. Mirrors the
//! teacher's dual `InMemoryWorkflowEventStore`/`PostgresWorkflowEventStore`
//! split over one `WorkflowEventStore` trait.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{OrchestrationStore, StoreError};
