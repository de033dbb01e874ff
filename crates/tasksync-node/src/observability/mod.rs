//! # Observability
//!
//! - **Structured logging**: pretty or JSON output through `tracing`
//! - **Request ids**: an `x-request-id` on every HTTP request and response
//!
//! Hub counters are served as JSON by `/api/realtime/stats`.

mod logging;
pub mod middleware;

pub use logging::{default_filter, init_logging, LogFormat};
pub use middleware::{request_id_middleware, RequestId, REQUEST_ID_HEADER};
