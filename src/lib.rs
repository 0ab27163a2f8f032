//! # Telos Core - Event Distribution and Module Orchestration
//!
//! In-process core of a modular assistant runtime, providing:
//! - A semantic publish/subscribe bus with hierarchical types, single-segment
//!   wildcards and essence-label filtering
//! - A bounded, queryable event history (the Akashic Record)
//! - Correlation-id based request/response over the bus
//! - Module lifecycle management with capability resolution, Telos-driven
//!   prioritization and a resource budget
//! - A self-optimization loop that reacts to memory pressure, event
//!   congestion and module imbalance
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────────────────────┐
//!   consumers    →   │               Kernel                 │
//!                    │  ┌──────────┐      ┌──────────────┐  │
//!                    │  │ EventBus │ ←──→ │ ModuleManager│  │
//!                    │  │ + Akashic│      │  (registry)  │  │
//!                    │  └──────────┘      └──────────────┘  │
//!                    │  ┌──────────┐      ┌──────────────┐  │
//!                    │  │ Request  │      │SelfOptimizer │  │
//!                    │  │  Broker  │      │ (tokio loop) │  │
//!                    │  └──────────┘      └──────────────┘  │
//!                    └──────────────────────────────────────┘
//! ```
//!
//! Everything the core does on its own initiative is announced on the bus
//! (see [`events`]).

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod bus;
pub mod envelope;
pub mod events;
pub mod kernel;
pub mod modules;
pub mod request;
pub mod types;

// Internal utilities
pub mod observability;
pub mod validation;

pub use bus::{EventBus, HistoryQuery, PublishReceipt, SubscriptionHandle};
pub use envelope::{Envelope, EnvelopeDraft, EventPattern};
pub use kernel::{Kernel, SystemState};
pub use types::{Config, Error, Result};
