//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every voice gateway actor.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: every handler and actor holds a cheap reference to the same data
//! - **RwLock**: many concurrent readers (config lookups on each connection) or one writer
//!   (runtime config updates, metrics increments)
//!
//! Locks are only held for the duration of a copy or an increment, never across an
//! `.await` or while talking to the upstream provider.
//!
//! The voice sessions themselves are not shared: each one lives inside its own
//! gateway actor. The only cross-session state is the session counter used to
//! enforce `max_concurrent_sessions`.

use crate::config::AppConfig;
use crate::store::{ConversationStore, MemoryStore};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state that's shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Counters updated by the middleware and the voice gateway
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Durable conversation history
    pub store: Arc<dyn ConversationStore>,

    /// Base system prompt, resolved once at startup
    pub system_prompt: Arc<str>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected since server start.
///
/// ## Voice metrics:
/// - **active_sessions**: browser connections currently holding a voice gateway
/// - **voice_sessions_started**: upstream connections opened
/// - **upstream_errors**: provider errors forwarded to browsers
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_sessions: u32,
    pub voice_sessions_started: u64,
    pub upstream_errors: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    /// Create a new AppState backed by an in-memory conversation store.
    pub fn new(config: AppConfig, system_prompt: impl Into<Arc<str>>) -> Self {
        Self::with_store(config, system_prompt, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(
        config: AppConfig,
        system_prompt: impl Into<Arc<str>>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            store,
            system_prompt: system_prompt.into(),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    fn with_metrics<R>(&self, f: impl FnOnce(&mut AppMetrics) -> R) -> R {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics)
    }

    pub fn increment_request_count(&self) {
        self.with_metrics(|m| m.request_count += 1);
    }

    /// Called for every 4xx/5xx response.
    pub fn increment_error_count(&self) {
        self.with_metrics(|m| m.error_count += 1);
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.with_metrics(|m| {
            let endpoint_metric = m.endpoint_metrics.entry(endpoint.to_string()).or_default();
            endpoint_metric.request_count += 1;
            endpoint_metric.total_duration_ms += duration_ms;
            if is_error {
                endpoint_metric.error_count += 1;
            }
        });
    }

    /// Reserve a session slot.
    ///
    /// Check and increment happen under one write lock, so two upgrades racing
    /// for the last slot cannot both succeed.
    pub fn try_open_session(&self, limit: usize) -> bool {
        self.with_metrics(|m| {
            if m.active_sessions as usize >= limit {
                return false;
            }
            m.active_sessions += 1;
            true
        })
    }

    /// Release a slot taken by [`try_open_session`](Self::try_open_session).
    pub fn close_session(&self) {
        self.with_metrics(|m| m.active_sessions = m.active_sessions.saturating_sub(1));
    }

    pub fn record_voice_session_started(&self) {
        self.with_metrics(|m| m.voice_sessions_started += 1);
    }

    pub fn record_upstream_error(&self) {
        self.with_metrics(|m| m.upstream_errors += 1);
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
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

    /// Fraction of failed requests, 0.0 to 1.0.
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

    fn state() -> AppState {
        AppState::new(AppConfig::default(), "Be brief.")
    }

    #[test]
    fn test_session_limit_is_enforced() {
        let state = state();
        assert!(state.try_open_session(2));
        assert!(state.try_open_session(2));
        assert!(!state.try_open_session(2));

        state.close_session();
        assert!(state.try_open_session(2));
        assert_eq!(state.get_metrics_snapshot().active_sessions, 2);
    }

    #[test]
    fn test_close_session_does_not_underflow() {
        let state = state();
        state.close_session();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_update_config_validates() {
        let state = state();
        let mut bad = state.get_config();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());
        assert_eq!(state.get_config().server.port, 3000);
    }
}
