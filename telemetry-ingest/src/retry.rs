use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

use crate::metrics_consts::{
    DEVICE_MULTIPLE_UPDATED, DEVICE_NOT_UPDATED, PATCH_DURATION_MS, PATCH_NON_RETRIABLE,
    PATCH_RETRIES,
};
use crate::registry::PatchOutcome;

/// Failure modes of applying one telemetry record to the registry.
///
/// `Retriable` is the transient data-access class (lock contention,
/// connection drops); everything else is terminal for the record.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("transient registry error: {0}")]
    Retriable(#[source] sqlx::Error),
    #[error("registry error: {0}")]
    Fatal(#[source] sqlx::Error),
    #[error("malformed telemetry payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl PatchError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, PatchError::Retriable(_))
    }

    /// Short label for the non-retriable error metric.
    pub fn kind(&self) -> &'static str {
        match self {
            PatchError::Retriable(_) => "transient",
            PatchError::Malformed(_) => "malformed_payload",
            PatchError::Fatal(e) => match e {
                sqlx::Error::Database(_) => "database",
                sqlx::Error::RowNotFound => "row_not_found",
                sqlx::Error::ColumnNotFound(_) => "column_not_found",
                sqlx::Error::Decode(_) => "decode",
                sqlx::Error::Protocol(_) => "protocol",
                _ => "other",
            },
        }
    }
}

// Postgres SQLSTATEs worth a retry: serialization_failure, deadlock_detected,
// lock_not_available.
const RETRIABLE_SQLSTATES: [&str; 3] = ["40001", "40P01", "55P03"];

/// Split driver errors into the transient class (worth a bounded retry) and
/// everything else. Unknown errors are fatal: an unclassified failure repeated
/// against the registry is worse than one dead-lettered record.
pub fn classify(error: sqlx::Error) -> PatchError {
    match &error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => PatchError::Retriable(error),
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if RETRIABLE_SQLSTATES.contains(&code.as_ref()) => {
                PatchError::Retriable(error)
            }
            _ => PatchError::Fatal(error),
        },
        _ => PatchError::Fatal(error),
    }
}

/// Bounded retry with fixed backoff around one registry patch. The single
/// source of truth for retry behavior in the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub wait: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, wait: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            wait,
        }
    }

    /// Run `op` until it succeeds, fails fatally, or `max_attempts` tries are
    /// used up. The first attempt runs immediately; each retry sleeps `wait`
    /// first. Retriable exhaustion returns the last attempt's error. Fatal
    /// errors return immediately without consuming further attempts.
    pub async fn run<F, Fut>(&self, device_type: &str, mut op: F) -> Result<PatchOutcome, PatchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<u64, PatchError>>,
    {
        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            match op().await {
                Ok(rows_affected) => {
                    let outcome = PatchOutcome::from_rows_affected(rows_affected);
                    match outcome {
                        PatchOutcome::NoRowsAffected => {
                            metrics::counter!(DEVICE_NOT_UPDATED, "device_type" => device_type.to_string())
                                .increment(1);
                        }
                        PatchOutcome::MultipleRowsAffected => {
                            metrics::counter!(DEVICE_MULTIPLE_UPDATED, "device_type" => device_type.to_string())
                                .increment(1);
                        }
                        PatchOutcome::OneRowAffected => {}
                    }
                    metrics::histogram!(PATCH_DURATION_MS, "device_type" => device_type.to_string())
                        .record(start.elapsed().as_millis() as f64);
                    return Ok(outcome);
                }
                Err(error) if error.is_retriable() => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        warn!(
                            device_type,
                            attempts = attempt,
                            "retries exhausted applying telemetry: {error}"
                        );
                        return Err(error);
                    }
                    metrics::counter!(PATCH_RETRIES, "device_type" => device_type.to_string())
                        .increment(1);
                    warn!(
                        device_type,
                        attempt, "transient failure applying telemetry, will retry: {error}"
                    );
                    tokio::time::sleep(self.wait).await;
                }
                Err(error) => {
                    metrics::counter!(
                        PATCH_NON_RETRIABLE,
                        "device_type" => device_type.to_string(),
                        "error" => error.kind()
                    )
                    .increment(1);
                    return Err(error);
                }
            }
        }
    }
}
