//! airoute - capability-aware routing of AI tasks across providers
//!
//! This library provides the core of the airoute router: provider
//! registration, health tracking with circuit breakers, cost/latency scoring,
//! fallback execution and usage accounting, plus an HTTP surface over them.

pub mod api;
pub mod config;
pub mod error;
pub mod provider;
pub mod router;
pub mod task;

pub use config::Config;
pub use error::{Error, Result, RouterError};
pub use router::{RouteSuccess, Router};
pub use task::{Constraints, TaskKind, TaskRequest};
