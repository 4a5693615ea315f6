// =============================================================================
// Engine error kinds
// =============================================================================
//
// Every I/O boundary returns Result<_, EngineError>. Scoring itself is a
// total function and never surfaces an error to callers; an internal scoring
// failure becomes a zero score with reason "internal".
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad user configuration (malformed DSL, missing credentials). The
    /// user tick is skipped for the rest of the day, no retry.
    #[error("config error: {0}")]
    Config(String),

    /// Series shorter than the scorer's minimum. The ticker is dropped
    /// from the snapshot, no alert.
    #[error("insufficient data for {ticker}: {got} bars, need {need}")]
    DataInsufficient {
        ticker: String,
        got: usize,
        need: usize,
    },

    /// The latest snapshot is older than the allowed age (or missing).
    /// The whole user tick aborts and retries next tick.
    #[error("snapshot stale: {0}")]
    StaleSnapshot(String),

    /// Timeout / 5xx / connection error from the broker. One immediate
    /// retry is allowed; persistent failure aborts the user tick.
    #[error("broker transient failure: {0}")]
    BrokerTransient(String),

    /// 4xx (other than rate limit) from the broker. Aborts the user tick
    /// and latches the user disabled for the rest of the day.
    #[error("broker permanent failure: {0}")]
    BrokerPermanent(String),

    /// Broker accepted the request but rejected the order.
    #[error("order rejected: {0}")]
    OrderRejected(String),

    /// Journal / database failure.
    #[error("journal error: {0}")]
    Journal(#[from] rusqlite::Error),

    /// Filesystem or CSV failure on universe / snapshot files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Exit code for the CLI surface.
    /// 0 success, 1 argument error, 2 snapshot stale/missing,
    /// 3 broker auth failure, 4 partial completion.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::StaleSnapshot(_) => 2,
            Self::BrokerPermanent(_) => 3,
            _ => 1,
        }
    }

    /// Transient errors may be retried once within the same call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BrokerTransient(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
