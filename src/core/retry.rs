//! Bounded retries of idempotent backend calls.
//!
//! An attempt is retryable when it failed at the transport level, timed out, or the
//! backend answered 5xx. 4xx responses and successes end the loop immediately. Only
//! methods listed in the policy are retried and non-idempotent methods are never
//! listed; everything else gets exactly one attempt.
use std::{future::Future, time::Duration};

use axum::body::Body as AxumBody;
use http::{Method, Response};

use crate::{
    config::models::RetryConfig,
    metrics,
    ports::http_client::{HttpClientError, HttpClientResult},
};

const NON_IDEMPOTENT: [Method; 4] = [Method::POST, Method::PUT, Method::PATCH, Method::DELETE];

/// Exponential backoff between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub first: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(50),
            max: Duration::from_millis(500),
            factor: 2,
        }
    }
}

impl Backoff {
    /// Delay before attempt `attempt + 1` (attempts are 1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.factor.max(1).saturating_pow(exponent);
        self.first.saturating_mul(multiplier).min(self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub methods: Vec<Method>,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::single_attempt()
    }
}

impl RetryPolicy {
    /// Policy of routes without a retry filter.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            methods: Vec::new(),
            backoff: Backoff::default(),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Result<Self, String> {
        if config.max_attempts == 0 {
            return Err("Retry 'max_attempts' must be at least 1".to_string());
        }
        if config.backoff.factor == 0 {
            return Err("Retry backoff 'factor' must be at least 1".to_string());
        }

        let mut methods = Vec::with_capacity(config.methods.len());
        for name in &config.methods {
            let method = Method::from_bytes(name.to_ascii_uppercase().as_bytes())
                .map_err(|e| format!("Invalid retry method '{name}': {e}"))?;
            if NON_IDEMPOTENT.contains(&method) {
                return Err(format!("Method {method} is not idempotent and cannot be retried"));
            }
            methods.push(method);
        }

        let first = humantime::parse_duration(&config.backoff.first)
            .map_err(|e| format!("Invalid backoff 'first' '{}': {e}", config.backoff.first))?;
        let max = humantime::parse_duration(&config.backoff.max)
            .map_err(|e| format!("Invalid backoff 'max' '{}': {e}", config.backoff.max))?;
        if max < first {
            return Err("Retry backoff 'max' must not be shorter than 'first'".to_string());
        }

        Ok(Self {
            max_attempts: config.max_attempts,
            methods,
            backoff: Backoff {
                first,
                max,
                factor: config.backoff.factor,
            },
        })
    }

    pub fn allows(&self, method: &Method) -> bool {
        !NON_IDEMPOTENT.contains(method) && self.methods.contains(method)
    }

    /// Number of attempts granted to a request with `method`.
    pub fn attempts_for(&self, method: &Method) -> u32 {
        if self.allows(method) {
            self.max_attempts.max(1)
        } else {
            1
        }
    }
}

/// Terminal result of the last attempt.
#[derive(Debug)]
pub enum AttemptResult {
    /// 1xx-4xx response. Relayed as-is and counts as success for the breaker.
    Success(Response<AxumBody>),
    /// 5xx response from the backend.
    ServerError(Response<AxumBody>),
    /// Transport failure or attempt timeout.
    Failed(HttpClientError),
}

#[derive(Debug)]
pub struct RetryOutcome {
    pub attempts: u32,
    pub result: AttemptResult,
}

fn classify(result: HttpClientResult<Response<AxumBody>>) -> AttemptResult {
    match result {
        Ok(response) if response.status().is_server_error() => AttemptResult::ServerError(response),
        Ok(response) => AttemptResult::Success(response),
        Err(err) => AttemptResult::Failed(err),
    }
}

/// Drives the attempts of one request under a route's retry policy.
pub struct RetryExecutor<'a> {
    policy: &'a RetryPolicy,
    route_id: &'a str,
}

impl<'a> RetryExecutor<'a> {
    pub fn new(policy: &'a RetryPolicy, route_id: &'a str) -> Self {
        Self { policy, route_id }
    }

    /// Run `call` up to the number of attempts the policy grants `method`.
    ///
    /// `call` receives the 1-based attempt number and must build a fresh request each
    /// time. Each attempt is bounded by `attempt_timeout`.
    pub async fn execute<F, Fut>(
        &self,
        method: &Method,
        attempt_timeout: Duration,
        mut call: F,
    ) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = HttpClientResult<Response<AxumBody>>>,
    {
        let max_attempts = self.policy.attempts_for(method);
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(attempt_timeout, call(attempt)).await {
                Ok(result) => classify(result),
                Err(_) => AttemptResult::Failed(HttpClientError::Timeout(attempt_timeout)),
            };

            let retryable = !matches!(result, AttemptResult::Success(_));
            if !retryable || attempt >= max_attempts {
                return RetryOutcome {
                    attempts: attempt,
                    result,
                };
            }

            let delay = self.policy.backoff.delay_after(attempt);
            match &result {
                AttemptResult::ServerError(response) => tracing::info!(
                    route = self.route_id,
                    attempt,
                    status = response.status().as_u16(),
                    ?delay,
                    "Backend returned server error, retrying"
                ),
                AttemptResult::Failed(err) => tracing::info!(
                    route = self.route_id,
                    attempt,
                    error = %err,
                    ?delay,
                    "Backend call failed, retrying"
                ),
                AttemptResult::Success(_) => {}
            }
            metrics::increment_retry_attempts(self.route_id);

            // Release the failed response before sleeping.
            drop(result);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use http::StatusCode;

    use super::*;

    fn retry_get(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            methods: vec![Method::GET],
            backoff: Backoff {
                first: Duration::from_millis(1),
                max: Duration::from_millis(5),
                factor: 2,
            },
        }
    }

    fn response(status: StatusCode) -> HttpClientResult<Response<AxumBody>> {
        Ok(Response::builder()
            .status(status)
            .body(AxumBody::empty())
            .unwrap())
    }

    async fn run(
        policy: &RetryPolicy,
        method: Method,
        statuses: Vec<StatusCode>,
    ) -> (RetryOutcome, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = RetryExecutor::new(policy, "test")
            .execute(&method, Duration::from_secs(1), move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst) as usize;
                let status = statuses[n.min(statuses.len() - 1)];
                async move { response(status) }
            })
            .await;
        (outcome, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_get_retried_until_success() {
        let (outcome, calls) = run(
            &retry_get(3),
            Method::GET,
            vec![StatusCode::BAD_GATEWAY, StatusCode::SERVICE_UNAVAILABLE, StatusCode::OK],
        )
        .await;
        assert_eq!(calls, 3);
        assert_eq!(outcome.attempts, 3);
        assert!(matches!(outcome.result, AttemptResult::Success(ref r) if r.status() == StatusCode::OK));
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let (outcome, calls) =
            run(&retry_get(3), Method::GET, vec![StatusCode::INTERNAL_SERVER_ERROR]).await;
        assert_eq!(calls, 3);
        assert!(matches!(outcome.result, AttemptResult::ServerError(_)));
    }

    #[tokio::test]
    async fn test_post_is_attempted_once() {
        let (outcome, calls) =
            run(&retry_get(3), Method::POST, vec![StatusCode::INTERNAL_SERVER_ERROR]).await;
        assert_eq!(calls, 1);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let (outcome, calls) = run(&retry_get(3), Method::GET, vec![StatusCode::NOT_FOUND]).await;
        assert_eq!(calls, 1);
        assert!(matches!(outcome.result, AttemptResult::Success(ref r) if r.status() == StatusCode::NOT_FOUND));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_a_failure() {
        let policy = retry_get(2);
        let outcome = RetryExecutor::new(&policy, "test")
            .execute(&Method::GET, Duration::from_millis(100), |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                response(StatusCode::OK)
            })
            .await;
        assert_eq!(outcome.attempts, 2);
        assert!(matches!(
            outcome.result,
            AttemptResult::Failed(HttpClientError::Timeout(_))
        ));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_after(1), Duration::from_millis(50));
        assert_eq!(backoff.delay_after(2), Duration::from_millis(100));
        assert_eq!(backoff.delay_after(4), Duration::from_millis(400));
        assert_eq!(backoff.delay_after(5), Duration::from_millis(500));
        assert_eq!(backoff.delay_after(40), Duration::from_millis(500));
    }

    #[test]
    fn test_policy_rejects_non_idempotent_methods() {
        let config = RetryConfig {
            methods: vec!["get".to_string(), "post".to_string()],
            ..Default::default()
        };
        assert!(RetryPolicy::from_config(&config).is_err());

        let config = RetryConfig {
            methods: vec!["GET".to_string(), "HEAD".to_string()],
            ..Default::default()
        };
        let policy = RetryPolicy::from_config(&config).unwrap();
        assert_eq!(policy.attempts_for(&Method::HEAD), 3);
        assert_eq!(policy.attempts_for(&Method::OPTIONS), 1);
    }
}
