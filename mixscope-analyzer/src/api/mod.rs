//! HTTP API handlers for mixscope-analyzer
//!
//! Job submission, status and cancellation over REST; lifecycle notifications over SSE.

pub mod health;
pub mod jobs;
pub mod sse;

pub use health::health_routes;
pub use jobs::job_routes;
pub use sse::job_event_stream;
