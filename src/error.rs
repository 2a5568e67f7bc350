//! Typed error boundaries for the pieces a caller needs to distinguish
//! programmatically. Everything else propagates as `anyhow::Result`.

/// Errors the LLM Gateway can return, distinguishing the five kinds the
/// retry regime and stage logic need to tell apart.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// HTTP transport failure (connection reset, DNS, etc).
    #[error("LLM request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Provider rate-limited the request.
    #[error("LLM provider rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds to wait before retrying, per the provider's header or a default.
        retry_after_secs: u64,
    },

    /// Transient server-side failure (5xx, timeout) worth retrying.
    #[error("LLM provider transient error (status {status}): {message}")]
    Transient {
        /// HTTP status code.
        status: u16,
        /// Provider-reported message.
        message: String,
    },

    /// Auth failure or 400-class error; not retried.
    #[error("LLM provider permanent error (status {status}): {message}")]
    Permanent {
        /// HTTP status code.
        status: u16,
        /// Provider-reported message.
        message: String,
    },

    /// Response did not parse as JSON matching the schema hint.
    #[error("failed to parse LLM JSON response: {0}")]
    Parse(String),

    /// Provider refused the request on safety grounds.
    #[error("LLM provider returned a safety block")]
    SafetyBlocked,

    /// No provider is configured for the requested model tag.
    #[error("no provider configured for model tag '{0}'")]
    NotConfigured(String),

    /// Caller-initiated cancellation reached the Gateway mid-flight.
    #[error("LLM call cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Whether the client-layer retry loop should retry this error.
    pub fn is_client_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. } | GatewayError::Transient { .. }
        )
    }
}

/// Errors from the Store's read-only query surface.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to establish or configure the database connection.
    #[error("database connection error: {source}")]
    Connection {
        /// Underlying SQLx error.
        #[source]
        source: sqlx::Error,
    },

    /// Embedded migrations failed to apply.
    #[error("database migration error: {source}")]
    Migration {
        /// Underlying migration error.
        #[source]
        source: sqlx::migrate::MigrateError,
    },

    /// A query failed to execute.
    #[error("database query error: {source}")]
    Query {
        /// Underlying SQLx error.
        #[source]
        source: sqlx::Error,
    },
}

/// Errors surfaced by a per-expert pipeline stage. These never fail a whole
/// request; the Orchestrator downgrades them per spec §7's propagation policy.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The Store failed for this expert; fatal for the expert, not the request.
    #[error("store error for expert: {0}")]
    Store(#[from] StorageError),

    /// Every Map chunk failed; the expert gets a zero-source answer.
    #[error("all Map chunks failed for this expert")]
    MapTotalFailure,

    /// The stage's cancellation token fired mid-flight.
    #[error("stage cancelled")]
    Cancelled,
}
