// =============================================================================
// Order executor abstraction
// =============================================================================
//
// One synchronous-feeling contract for both implementations: the live KIS
// REST client and the journal-backed paper simulator. Price 0 means a
// market order; anything positive is a limit. Nothing else is supported.
// =============================================================================

pub mod kis;
pub mod paper;

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::types::{AccountBalance, PendingOrder};

/// Broker acknowledgement of an accepted order.
#[derive(Debug, Clone)]
pub struct OrderReceipt {
    pub order_id: String,
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn get_account_balance(&self) -> EngineResult<AccountBalance>;

    /// Live price in KRW.
    async fn get_current_price(&self, ticker: &str) -> EngineResult<i64>;

    async fn get_pending_orders(&self) -> EngineResult<Vec<PendingOrder>>;

    /// price = 0 places a market order, price > 0 a limit order.
    async fn place_buy(&self, ticker: &str, quantity: i64, price: i64)
        -> EngineResult<OrderReceipt>;

    async fn place_sell(
        &self,
        ticker: &str,
        quantity: i64,
        price: i64,
    ) -> EngineResult<OrderReceipt>;
}

/// One immediate retry on a transient broker failure, then give up. Used
/// around every live call; permanent failures pass straight through.
pub async fn with_transient_retry<T, F, Fut>(mut call: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    match call().await {
        Ok(value) => Ok(value),
        Err(e) if e.is_transient() => {
            tracing::warn!(error = %e, "transient broker failure, retrying once");
            call().await
        }
        Err(e) => Err(e),
    }
}

/// Map an HTTP status to the engine's broker error taxonomy.
pub(crate) fn classify_status(status: u16, body: &str) -> EngineError {
    match status {
        429 | 500..=599 => {
            EngineError::BrokerTransient(format!("HTTP {status}: {body}"))
        }
        400..=499 => EngineError::BrokerPermanent(format!("HTTP {status}: {body}")),
        _ => EngineError::Internal(format!("unexpected HTTP {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_once() {
        let calls = AtomicU32::new(0);
        let result: EngineResult<i32> = with_transient_retry(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(EngineError::BrokerTransient("timeout".into()))
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
    async fn permanent_failure_does_not_retry() {
        let calls = AtomicU32::new(0);
        let result: EngineResult<i32> = with_transient_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::BrokerPermanent("403".into())) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::BrokerPermanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persistent_transient_fails_after_second_attempt() {
        let calls = AtomicU32::new(0);
        let result: EngineResult<i32> = with_transient_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::BrokerTransient("timeout".into())) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::BrokerTransient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(503, ""),
            EngineError::BrokerTransient(_)
        ));
        assert!(matches!(
            classify_status(429, ""),
            EngineError::BrokerTransient(_)
        ));
        assert!(matches!(
            classify_status(401, ""),
            EngineError::BrokerPermanent(_)
        ));
        assert!(matches!(
            classify_status(403, ""),
            EngineError::BrokerPermanent(_)
        ));
    }
}
