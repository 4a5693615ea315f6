// =============================================================================
// Paper broker: journal-backed virtual account
// =============================================================================
//
// Simulates fills against live (or last-known) prices. Cash lives in the
// journal's virtual_balance row; open positions are the journal's holdings
// view, repriced on demand. Commission is charged on both sides and the
// market-dependent transfer tax on sells, so realised P/L matches what the
// live executor would have produced.
//
// Invariants: cash never goes negative, and
// cash + sum(qty * price) tracks total assets up to fees.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::FeeSchedule;
use crate::error::{EngineError, EngineResult};
use crate::journal::TradeJournal;
use crate::marketdata::MarketDataProvider;
use crate::types::{AccountBalance, AccountSummary, HoldingInfo, PendingOrder};

use super::{BrokerClient, OrderReceipt};

/// Live-price lookup for repricing and market fills.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn price(&self, ticker: &str) -> EngineResult<i64>;
}

/// Prices from the market-data provider's latest daily close.
pub struct ProviderPrices {
    provider: Arc<dyn MarketDataProvider>,
}

impl ProviderPrices {
    pub fn new(provider: Arc<dyn MarketDataProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl PriceSource for ProviderPrices {
    async fn price(&self, ticker: &str) -> EngineResult<i64> {
        let series = self.provider.daily_bars(ticker, 2).await?;
        series
            .last()
            .map(|b| b.close as i64)
            .filter(|p| *p > 0)
            .ok_or_else(|| EngineError::Internal(format!("no price for {ticker}")))
    }
}

pub struct PaperBroker {
    journal: TradeJournal,
    user_id: i64,
    fees: FeeSchedule,
    prices: Arc<dyn PriceSource>,
    clock: Arc<dyn Clock>,
}

impl PaperBroker {
    pub fn new(
        journal: TradeJournal,
        user_id: i64,
        initial_cash: i64,
        fees: FeeSchedule,
        prices: Arc<dyn PriceSource>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        journal.init_virtual_balance(user_id, initial_cash, clock.now())?;
        Ok(Self {
            journal,
            user_id,
            fees,
            prices,
            clock,
        })
    }

    async fn fill_price(&self, ticker: &str, price: i64) -> EngineResult<i64> {
        if price > 0 {
            return Ok(price);
        }
        self.prices.price(ticker).await
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn get_account_balance(&self) -> EngineResult<AccountBalance> {
        let cash = self.journal.virtual_cash(self.user_id)?;
        let journal_holdings = self.journal.holdings(self.user_id)?;

        let mut holdings = Vec::with_capacity(journal_holdings.len());
        let mut total_eval = 0i64;
        let mut total_pnl = 0i64;

        for h in journal_holdings {
            let current = self
                .prices
                .price(&h.ticker)
                .await
                .unwrap_or(h.avg_price);
            let profit_rate = if h.avg_price > 0 {
                (current - h.avg_price) as f64 / h.avg_price as f64 * 100.0
            } else {
                0.0
            };
            total_eval += current * h.quantity;
            total_pnl += (current - h.avg_price) * h.quantity;
            holdings.push(HoldingInfo {
                ticker: h.ticker,
                name: h.name,
                quantity: h.quantity,
                avg_price: h.avg_price,
                current_price: current,
                profit_rate,
                market: h.market,
            });
        }

        debug!(
            user_id = self.user_id,
            cash,
            holdings = holdings.len(),
            "paper balance"
        );

        Ok(AccountBalance {
            holdings,
            summary: AccountSummary {
                d2_cash: cash,
                max_buy_amount: cash,
                total_eval_amount: total_eval,
                total_profit_loss: total_pnl,
            },
        })
    }

    async fn get_current_price(&self, ticker: &str) -> EngineResult<i64> {
        self.prices.price(ticker).await
    }

    async fn get_pending_orders(&self) -> EngineResult<Vec<PendingOrder>> {
        // Simulated fills are immediate; nothing ever rests.
        Ok(Vec::new())
    }

    async fn place_buy(
        &self,
        ticker: &str,
        quantity: i64,
        price: i64,
    ) -> EngineResult<OrderReceipt> {
        if quantity <= 0 {
            return Err(EngineError::OrderRejected("zero quantity".to_string()));
        }
        let fill = self.fill_price(ticker, price).await?;
        let amount = fill * quantity;
        let commission = (amount as f64 * self.fees.commission_rate) as i64;

        self.journal
            .virtual_buy(self.user_id, amount + commission, self.clock.now())
            .map_err(|e| match e {
                EngineError::Internal(msg) if msg.contains("overdraft") => {
                    EngineError::OrderRejected(msg)
                }
                other => other,
            })?;

        let order_id = format!("SIM-{}", Uuid::new_v4());
        info!(
            user_id = self.user_id,
            ticker, quantity, fill, commission, order_id, "paper buy filled"
        );
        Ok(OrderReceipt { order_id })
    }

    async fn place_sell(
        &self,
        ticker: &str,
        quantity: i64,
        price: i64,
    ) -> EngineResult<OrderReceipt> {
        if quantity <= 0 {
            return Err(EngineError::OrderRejected("zero quantity".to_string()));
        }
        let holding = self
            .journal
            .holding(self.user_id, ticker)?
            .ok_or_else(|| EngineError::OrderRejected(format!("not holding {ticker}")))?;
        if holding.quantity < quantity {
            return Err(EngineError::OrderRejected(format!(
                "holding {} < sell quantity {quantity}",
                holding.quantity
            )));
        }

        let fill = self.fill_price(ticker, price).await?;
        let sell_amount = fill * quantity;
        let cost_basis = holding.avg_price * quantity;

        let commission = (sell_amount as f64 * self.fees.commission_rate) as i64;
        let tax = (sell_amount as f64 * self.fees.tax_rate(holding.market)) as i64;
        let net_proceeds = sell_amount - commission - tax;

        // Realised P/L nets out both sides' commission plus the sell tax so
        // the simulator books what a live account would.
        let buy_commission = (cost_basis as f64 * self.fees.commission_rate) as i64;
        let realized = sell_amount - cost_basis - commission - tax - buy_commission;

        self.journal.virtual_sell(
            self.user_id,
            net_proceeds,
            cost_basis,
            realized,
            self.clock.now(),
        )?;

        let order_id = format!("SIM-{}", Uuid::new_v4());
        info!(
            user_id = self.user_id,
            ticker, quantity, fill, net_proceeds, realized, order_id, "paper sell filled"
        );
        Ok(OrderReceipt { order_id })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::journal::ApiKeySettings;
    use crate::policy::UserPolicy;
    use crate::types::{Market, TradeMode};
    use parking_lot::RwLock;
    use std::collections::HashMap;

    struct MapPrices {
        map: RwLock<HashMap<String, i64>>,
    }

    impl MapPrices {
        fn new(pairs: &[(&str, i64)]) -> Arc<Self> {
            Arc::new(Self {
                map: RwLock::new(
                    pairs
                        .iter()
                        .map(|(k, v)| (k.to_string(), *v))
                        .collect(),
                ),
            })
        }

        fn set(&self, ticker: &str, price: i64) {
            self.map.write().insert(ticker.to_string(), price);
        }
    }

    #[async_trait]
    impl PriceSource for MapPrices {
        async fn price(&self, ticker: &str) -> EngineResult<i64> {
            self.map
                .read()
                .get(ticker)
                .copied()
                .ok_or_else(|| EngineError::Internal(format!("no price for {ticker}")))
        }
    }

    fn setup(initial_cash: i64, prices: Arc<MapPrices>) -> (TradeJournal, PaperBroker) {
        let journal = TradeJournal::open_in_memory().unwrap();
        journal
            .upsert_user(
                1,
                &UserPolicy {
                    enabled: true,
                    mode: TradeMode::Auto,
                    ..Default::default()
                },
                &ApiKeySettings {
                    app_key: "k".into(),
                    app_secret: "s".into(),
                    account_number: "1-01".into(),
                    is_paper: true,
                },
            )
            .unwrap();
        let clock = Arc::new(FixedClock::at("2026-03-02 10:00:00"));
        let broker = PaperBroker::new(
            journal.clone(),
            1,
            initial_cash,
            FeeSchedule::default(),
            prices,
            clock,
        )
        .unwrap();
        (journal, broker)
    }

    #[tokio::test]
    async fn buy_deducts_cash_plus_commission() {
        let prices = MapPrices::new(&[("005930", 10_000)]);
        let (journal, broker) = setup(1_000_000, prices);

        broker.place_buy("005930", 50, 0).await.unwrap();

        // 500,000 + 75 commission (0.015%)
        let cash = journal.virtual_cash(1).unwrap();
        assert_eq!(cash, 1_000_000 - 500_000 - 75);
    }

    #[tokio::test]
    async fn overdraft_is_an_order_rejection() {
        let prices = MapPrices::new(&[("005930", 10_000)]);
        let (journal, broker) = setup(100_000, prices);

        let err = broker.place_buy("005930", 50, 0).await.unwrap_err();
        assert!(matches!(err, EngineError::OrderRejected(_)));
        // cash untouched (INV-7)
        assert_eq!(journal.virtual_cash(1).unwrap(), 100_000);
    }

    #[tokio::test]
    async fn sell_books_fees_and_tax_into_realized_pnl() {
        let prices = MapPrices::new(&[("005930", 10_000)]);
        let (journal, broker) = setup(10_000_000, prices.clone());
        let now = FixedClock::at("2026-03-02 10:00:00").now();

        broker.place_buy("005930", 100, 0).await.unwrap();
        journal
            .add_holding(1, "005930", "SamsungElec", 100, 10_000, Market::Kospi, "", None, now)
            .unwrap();

        // price rises 10%
        prices.set("005930", 11_000);
        broker.place_sell("005930", 100, 0).await.unwrap();

        // sell amount 1,100,000; commission 165; tax 1,980; buy commission 150
        // realised = 1,100,000 - 1,000,000 - 165 - 1,980 - 150 = 97,705
        let cash = journal.virtual_cash(1).unwrap();
        let expected_cash = 10_000_000 - 1_000_000 - 150 + (1_100_000 - 165 - 1_980);
        assert_eq!(cash, expected_cash);
    }

    #[tokio::test]
    async fn sell_requires_a_holding() {
        let prices = MapPrices::new(&[("005930", 10_000)]);
        let (_journal, broker) = setup(1_000_000, prices);
        let err = broker.place_sell("005930", 10, 0).await.unwrap_err();
        assert!(matches!(err, EngineError::OrderRejected(_)));
    }

    #[tokio::test]
    async fn balance_reprices_holdings() {
        let prices = MapPrices::new(&[("005930", 10_000)]);
        let (journal, broker) = setup(10_000_000, prices.clone());
        let now = FixedClock::at("2026-03-02 10:00:00").now();

        broker.place_buy("005930", 100, 0).await.unwrap();
        journal
            .add_holding(1, "005930", "SamsungElec", 100, 10_000, Market::Kospi, "", None, now)
            .unwrap();
        prices.set("005930", 12_000);

        let balance = broker.get_account_balance().await.unwrap();
        assert_eq!(balance.holdings.len(), 1);
        assert_eq!(balance.holdings[0].current_price, 12_000);
        assert!((balance.holdings[0].profit_rate - 20.0).abs() < 1e-9);
        assert_eq!(balance.summary.total_eval_amount, 1_200_000);

        // cash + eval tracks assets up to the commission paid
        let cash = journal.virtual_cash(1).unwrap();
        assert_eq!(balance.total_assets(), cash + 1_200_000);
    }

    #[tokio::test]
    async fn limit_price_fills_at_limit() {
        let prices = MapPrices::new(&[("005930", 10_000)]);
        let (journal, broker) = setup(1_000_000, prices);
        broker.place_buy("005930", 10, 9_900).await.unwrap();
        let commission = (99_000f64 * 0.00015) as i64;
        assert_eq!(
            journal.virtual_cash(1).unwrap(),
            1_000_000 - 99_000 - commission
        );
    }
}
