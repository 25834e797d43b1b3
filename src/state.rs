//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data<AppState>`.
//!
//! ## Contents:
//! - **config**: runtime-updatable configuration (`Arc<RwLock<AppConfig>>`)
//! - **metrics**: request counters written by the metrics middleware
//! - **live**: the process-wide voice session hub
//! - **http**: one pooled HTTP client reused by every model backend call
//!
//! ## Locking:
//! Config and metrics sit behind `std::sync::RwLock`; every method takes the
//! lock, copies what it needs and releases it before returning, so no lock is
//! ever held across an `.await`. The live hub does its own async locking.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::genai::{GeminiClient, OllamaClient};
use crate::live::hub::LiveHub;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Performance metrics, updated on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Owner of the live voice session
    pub live: Arc<LiveHub>,

    /// Shared connection pool for outbound HTTP
    pub http: reqwest::Client,
}

/// Counters collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Requests that ended in a 4xx/5xx
    pub error_count: u64,

    /// Clients currently attached to the live event feed
    pub feed_subscribers: u32,

    /// Per-endpoint statistics keyed by `"METHOD /path"`
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    /// Cumulative handling time in milliseconds
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            live: Arc::new(LiveHub::new()),
            http: reqwest::Client::new(),
        }
    }

    // A panic while a lock was held leaves plain counters and a validated
    // config behind, both still usable.
    fn read_config(&self) -> RwLockReadGuard<'_, AppConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_config(&self) -> RwLockWriteGuard<'_, AppConfig> {
        self.config.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.read_config().clone()
    }

    /// Apply a partial JSON update under the write lock.
    ///
    /// The update is all-or-nothing: an invalid patch leaves the current
    /// configuration as it was. Returns the configuration now in effect.
    pub fn update_config(&self, patch: &str) -> AppResult<AppConfig> {
        let mut config = self.write_config();
        config
            .update_from_json(patch)
            .map_err(|e| AppError::ValidationError(e.to_string()))?;
        Ok(config.clone())
    }

    /// Hosted model client bound to the current configuration.
    pub fn gemini(&self) -> GeminiClient {
        GeminiClient::new(self.http.clone(), &self.read_config())
    }

    /// Local model client bound to the current configuration.
    pub fn ollama(&self) -> OllamaClient {
        let config = self.read_config();
        OllamaClient::new(self.http.clone(), &config.ollama, config.gemini.request_timeout())
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    /// Record one finished request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn increment_feed_subscribers(&self) {
        self.write_metrics().feed_subscribers += 1;
    }

    pub fn decrement_feed_subscribers(&self) {
        let mut metrics = self.write_metrics();
        metrics.feed_subscribers = metrics.feed_subscribers.saturating_sub(1);
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /api/v1/health", 10, false);
        state.record_endpoint_request("GET /api/v1/health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /api/v1/health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_update_config_is_atomic() {
        let state = AppState::new(AppConfig::default());

        let updated = state.update_config(r#"{"live": {"frame_size": 1024}}"#).unwrap();
        assert_eq!(updated.live.frame_size, 1024);

        let err = state.update_config(r#"{"live": {"capture": "telepathy"}}"#).unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
        assert_eq!(state.get_config().live.capture, "none");
        assert_eq!(state.get_config().live.frame_size, 1024);
    }

    #[test]
    fn test_feed_subscribers_never_underflow() {
        let state = AppState::new(AppConfig::default());
        state.decrement_feed_subscribers();
        state.increment_feed_subscribers();
        assert_eq!(state.get_metrics_snapshot().feed_subscribers, 1);
    }
}
