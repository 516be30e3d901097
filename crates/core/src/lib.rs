//! Conversation orchestration core - pure domain logic, no I/O
//!
//! This crate holds everything the orchestration engine needs that does not
//! touch the network or a database:
//! - **Signature verification** (`signature`) - HMAC-SHA256 webhook auth with
//!   replay-window enforcement
//! - **Domain model** (`domain`) - `ConversationState`, `Message`, thread keys
//! - **Deduplication** (`dedupe`) - wire-shape-agnostic message identity
//! - **Routing** (`router`) - the supervisor state machine selecting a
//!   response handler by qualification band
//! - **Configuration** (`config`) - layered config (defaults, TOML, env)
//!
//! # Key Types
//!
//! - `ConversationState` - the unit of persistence, keyed by `ThreadKey`
//! - `ScoreBands` / `RoutingPolicy` - band thresholds and escalation bounds
//! - `Routing` - the router's decision per inbound event

pub mod config;
pub mod dedupe;
pub mod domain;
pub mod errors;
pub mod router;
pub mod signature;

pub use domain::conversation::{ConversationState, HandlerKind, Stage, ThreadKey};
pub use domain::message::{Message, Role};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use router::{Routing, RoutingPolicy, ScoreBands};

pub use chrono;
