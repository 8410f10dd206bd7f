//! One retry/fallback policy for every external call.
//!
//! [`RetryPolicy`] bounds a single provider: each attempt runs under
//! `call_timeout`, transient failures (and timeouts) are retried with
//! exponential backoff up to `max_attempts`. [`Resilient`] pairs a primary
//! provider with an optional fallback under that policy: once the primary is
//! exhausted the fallback gets the same treatment, and if both fail the call
//! surfaces as `RetrievalUnavailable`. Validation errors are returned
//! untouched and never retried.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use ragdb_core::config::RetrySettings;
use ragdb_core::traits::ExternalService;
use ragdb_core::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(2),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            initial_backoff: Duration::from_millis(s.initial_backoff_ms),
            multiplier: s.multiplier.max(1.0),
            max_backoff: Duration::from_millis(s.max_backoff_ms),
            call_timeout: Duration::from_millis(s.call_timeout_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based retries; 0 has no delay).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(i32::try_from(attempt - 1).unwrap_or(i32::MAX));
        self.initial_backoff.mul_f64(factor.min(1e6)).min(self.max_backoff)
    }

    /// Runs `call` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, service: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
            let err = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_retryable() => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => Error::provider(service, format!("timed out after {:?}", self.call_timeout), true),
            };
            warn!(service, attempt = attempt + 1, max_attempts = attempts, error = %err, "external call failed");
            last_error = Some(err);
        }
        Err(last_error.unwrap_or_else(|| Error::provider(service, "no attempts made", true)))
    }
}

/// Result of a [`Resilient`] call.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub fallback_used: bool,
    pub served_by: String,
}

/// A primary service, an optional fallback and the policy applied to both.
pub struct Resilient<P: ?Sized> {
    primary: Arc<P>,
    fallback: Option<Arc<P>>,
    policy: RetryPolicy,
}

impl<P: ?Sized + ExternalService> Resilient<P> {
    pub fn new(primary: Arc<P>, policy: RetryPolicy) -> Self {
        Self { primary, fallback: None, policy }
    }

    pub fn with_fallback(mut self, fallback: Arc<P>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn primary(&self) -> &Arc<P> {
        &self.primary
    }

    pub fn fallback(&self) -> Option<&Arc<P>> {
        self.fallback.as_ref()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn call<T, F, Fut>(&self, op: F) -> Result<Outcome<T>>
    where
        F: Fn(Arc<P>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let primary_name = self.primary.name().to_string();
        let primary_err = match self.policy.run(&primary_name, || op(Arc::clone(&self.primary))).await {
            Ok(value) => return Ok(Outcome { value, fallback_used: false, served_by: primary_name }),
            Err(e @ Error::Validation(_)) => return Err(e),
            Err(e) => e,
        };
        let Some(fallback) = &self.fallback else {
            return Err(Error::RetrievalUnavailable(format!("{primary_name}: {primary_err}")));
        };
        let fallback_name = fallback.name().to_string();
        warn!(primary = %primary_name, fallback = %fallback_name, error = %primary_err, "primary exhausted, using fallback");
        match self.policy.run(&fallback_name, || op(Arc::clone(fallback))).await {
            Ok(value) => {
                debug!(fallback = %fallback_name, "fallback succeeded");
                Ok(Outcome { value, fallback_used: true, served_by: fallback_name })
            }
            Err(e @ Error::Validation(_)) => Err(e),
            Err(fallback_err) => Err(Error::RetrievalUnavailable(format!(
                "{primary_name}: {primary_err}; fallback {fallback_name}: {fallback_err}"
            ))),
        }
    }
}
