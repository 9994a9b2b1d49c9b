//! HTTP API module.
//!
//! Exposes task submission, the observability snapshot and admin actions over
//! axum.

mod handlers;
mod server;
pub mod types;

pub use handlers::{
    AIROUTE_COST_HEADER, AIROUTE_LATENCY_MS_HEADER, AIROUTE_PROVIDER_HEADER,
    AIROUTE_REQUEST_ID_HEADER,
};
pub use server::{build_http_client, create_router, run_server, AppState, RequestId};
