//! The three-layer retry regime from spec §4.1. This module implements
//! layer 1 (client) and exposes a helper for layer 2 (stage); layer 3
//! (pipeline, Map-only) lives in `pipeline::map` since it needs per-chunk
//! state across a whole pass, not just one call.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::GatewayError;

/// Client-layer retry: retries on rate-limit and timeout only, up to
/// `client_max_attempts`, with randomized exponential backoff capped at
/// `client_backoff_cap_secs`. Auth and 400-class errors fail immediately.
pub async fn with_client_retry<F, Fut, T>(
    cfg: &RetryConfig,
    mut call: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_client_retryable() && attempt < cfg.client_max_attempts => {
                let delay = backoff_delay(
                    attempt,
                    cfg.client_backoff_multiplier,
                    cfg.client_backoff_cap_secs,
                );
                if let GatewayError::RateLimited { retry_after_secs } = &err {
                    tracing::warn!(attempt, retry_after_secs, "rate limited, backing off");
                } else {
                    tracing::warn!(attempt, ?err, "transient LLM error, retrying");
                }
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Stage-layer retry: retries a JSON-parsing stage call on parse/schema
/// failures only, up to `stage_max_attempts`, with backoff in
/// `[stage_backoff_min_secs, stage_backoff_max_secs]`.
pub async fn with_stage_retry<F, Fut, T>(cfg: &RetryConfig, mut call: F) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(GatewayError::Parse(msg)) if attempt < cfg.stage_max_attempts => {
                let delay = stage_backoff_delay(
                    attempt,
                    cfg.stage_backoff_min_secs,
                    cfg.stage_backoff_max_secs,
                );
                tracing::warn!(attempt, error = %msg, "stage JSON parse failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Exponential backoff with full jitter: `min(cap, base * multiplier^attempt) * U(0.5, 1.0)`.
fn backoff_delay(attempt: u32, multiplier: f64, cap_secs: f64) -> Duration {
    let base = 1.0_f64;
    let raw = (base * multiplier.powi(attempt as i32)).min(cap_secs);
    let jittered = raw * rand::thread_rng().gen_range(0.5..=1.0);
    Duration::from_secs_f64(jittered.max(0.0))
}

/// Backoff within `[min_secs, max_secs]`, growing geometrically with attempt.
fn stage_backoff_delay(attempt: u32, min_secs: f64, max_secs: f64) -> Duration {
    let span = max_secs - min_secs;
    let growth = (attempt as f64 / 3.0).min(1.0);
    let raw = min_secs + span * growth;
    let jittered = raw * rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_secs_f64(jittered.clamp(min_secs, max_secs * 1.2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_rate_limited_then_succeeds() {
        let cfg = RetryConfig {
            client_max_attempts: 3,
            client_backoff_multiplier: 1.0,
            client_backoff_cap_secs: 0.01,
            ..RetryConfig::default()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result = with_client_retry(&cfg, move || {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(GatewayError::RateLimited {
                        retry_after_secs: 0,
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let cfg = RetryConfig::default();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<i32, GatewayError> = with_client_retry(&cfg, move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::Permanent {
                    status: 401,
                    message: "bad key".into(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stage_retry_gives_up_after_max_attempts() {
        let cfg = RetryConfig {
            stage_max_attempts: 2,
            stage_backoff_min_secs: 0.001,
            stage_backoff_max_secs: 0.002,
            ..RetryConfig::default()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<i32, GatewayError> = with_stage_retry(&cfg, move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::Parse("bad json".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
