//! Request middleware. Per-request tracing spans come from
//! `tracing_actix_web::TracingLogger`; counters live here.

pub mod metrics;

pub use metrics::MetricsMiddleware;
