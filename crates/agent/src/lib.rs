//! Collaborator clients and response logic.
//!
//! Everything between the router's decision and bytes on the wire:
//! - **Scoring** (`scoring`) - the qualification collaborator behind the
//!   `ScoringClient` trait, with an HTTP client, a deterministic in-process
//!   keyword scorer, and bounded-retry plumbing
//! - **Handlers** (`handlers`) - the cold/warm/hot response strategies
//! - **Responder** (`responder`) - idempotent outbound delivery
//! - **Transport** (`transport`) - the send-message contract and test doubles
//!
//! The scoring collaborator is strictly a signal source. It never routes;
//! routing is the deterministic decision of `triage_core::router`.

pub mod handlers;
pub mod responder;
pub mod scoring;
pub mod transport;

pub use handlers::{HandlerOutcome, HandlerRegistry, ResponseHandler};
pub use responder::{DeliveryResult, DeliveryStatus, Responder};
pub use scoring::{ScoringClient, ScoringError, ScoringOutcome};
pub use transport::{Transport, TransportError};
