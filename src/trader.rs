// =============================================================================
// Per-user controller
// =============================================================================
//
// Composes policy, risk, broker, journal and suggestions for one user for
// one tick. Steps are strictly sequential: evaluate and submit sells first,
// then buys (or suggestions in semi mode), then the daily-performance row.
// Different users run concurrently; nothing here is shared across users.
//
// Error policy per the engine taxonomy: config errors skip the user for the
// day with ALERT_CONFIG; a stale snapshot aborts and retries next tick;
// transient broker failures get one immediate retry; permanent failures
// abort and latch the user disabled for the day (the scheduler owns the
// latch); a rejected order is journaled and still blacklists. After the
// first successful order side effect nothing is retried in the same tick.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::{with_transient_retry, BrokerClient};
use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::indicators::IndicatorCache;
use crate::journal::{DailyPerf, JournalHolding, OrderRecord, TradeJournal};
use crate::marketdata::MarketDataProvider;
use crate::plugin::{DecisionPlugin, PluginAction, PortfolioView};
use crate::policy::{self, parse_conditions, BuyCandidate, Condition, UserPolicy};
use crate::risk::{self, SellContext, SellTrigger};
use crate::scoring::{run_scorer, ExitPlan, ScoreExtras, ScorerRegistry};
use crate::snapshot::Snapshot;
use crate::types::{HoldingInfo, OrderSide, OrderStatus, TradeMode};

// =============================================================================
// Outcome
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum TickStatus {
    Completed,
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct UserTickOutcome {
    pub user_id: i64,
    pub status: TickStatus,
    pub sell_count: usize,
    pub buy_count: usize,
    pub suggestion_count: usize,
}

impl UserTickOutcome {
    fn skipped(user_id: i64, reason: impl Into<String>) -> Self {
        Self {
            user_id,
            status: TickStatus::Skipped(reason.into()),
            sell_count: 0,
            buy_count: 0,
            suggestion_count: 0,
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

pub struct UserController {
    pub user_id: i64,
    pub journal: TradeJournal,
    pub broker: Arc<dyn BrokerClient>,
    pub provider: Arc<dyn MarketDataProvider>,
    pub cache: Arc<IndicatorCache>,
    pub registry: Arc<ScorerRegistry>,
    pub clock: Arc<dyn Clock>,
    pub dry_run: bool,
    pub is_paper: bool,
    /// Fee schedule used for realised-P/L bookkeeping on sells.
    pub fees: crate::config::FeeSchedule,
    /// TTL of queued semi-mode suggestions.
    pub suggestion_expire_hours: i64,
    /// Previous-day NASDAQ change, the macro multiplier input.
    pub nasdaq_prev_change: Option<f64>,
    pub plugin: Option<Arc<dyn DecisionPlugin>>,
}

impl UserController {
    pub async fn run_tick(&self, snapshot: &Snapshot) -> EngineResult<UserTickOutcome> {
        let user_id = self.user_id;

        if !self.clock.is_market_hours() {
            return Ok(UserTickOutcome::skipped(user_id, "outside market hours"));
        }

        // --- Policy & DSL (ConfigError skips the user, no same-day retry) ---
        let Some(policy) = self.journal.policy(user_id)? else {
            self.alert("", "ALERT_CONFIG", "user settings missing")?;
            return Ok(UserTickOutcome::skipped(user_id, "no settings"));
        };
        if !policy.enabled {
            return Ok(UserTickOutcome::skipped(user_id, "trading disabled"));
        }

        let (buy_conditions, sell_conditions) =
            match (
                parse_conditions(&policy.buy_conditions),
                parse_conditions(&policy.sell_conditions),
            ) {
                (Ok(buy), Ok(sell)) => (buy, sell),
                (Err(e), _) | (_, Err(e)) => {
                    self.alert("", "ALERT_CONFIG", &e.to_string())?;
                    return Ok(UserTickOutcome::skipped(user_id, "bad condition dsl"));
                }
            };

        // Overdue semi-mode suggestions flip to expired at tick entry.
        self.journal.expire_suggestions(user_id, self.clock.now())?;

        // --- Broker snapshot -------------------------------------------------
        let mut ordered = false;
        let balance = self
            .broker_call(&mut ordered, || self.broker.get_account_balance())
            .await
            .map_err(|e| self.broker_failure(e))?;
        let pending = self
            .broker_call(&mut ordered, || self.broker.get_pending_orders())
            .await
            .unwrap_or_default();

        let holdings: Vec<HoldingInfo> = balance
            .holdings
            .iter()
            .filter(|h| h.quantity > 0)
            .cloned()
            .collect();
        let cash = balance.summary.max_buy_amount.max(0);

        info!(
            user_id,
            holdings = holdings.len(),
            cash,
            mode = %policy.mode,
            "user tick started"
        );

        // --- Greenlight hands the whole tick to the plugin -------------------
        if policy.mode == TradeMode::Greenlight {
            return self
                .run_greenlight(snapshot, &policy, &holdings, cash, &mut ordered)
                .await;
        }

        // --- (a) Sells -------------------------------------------------------
        let mut sell_count = 0usize;
        for holding in &holdings {
            let journal_holding = self.journal.holding(user_id, &holding.ticker)?;
            let trigger = self
                .evaluate_holding(snapshot, &policy, &buy_conditions, &sell_conditions, holding,
                    journal_holding.as_ref())
                .await;

            if let Some(trigger) = trigger {
                match self
                    .execute_sell(snapshot, &policy, holding, trigger, &mut ordered)
                    .await
                {
                    Ok(()) => sell_count += 1,
                    Err(EngineError::OrderRejected(msg)) => {
                        self.log_rejection(snapshot, holding, OrderSide::Sell, &msg)?;
                    }
                    Err(e) => return Err(self.broker_failure(e)),
                }
            }
        }

        // --- (b) Buys (blocked in the pre-close window) ----------------------
        let mut buy_count = 0usize;
        let mut suggestion_count = 0usize;

        let today = self.clock.today();
        let blacklist = self.journal.today_traded(user_id, today)?;
        let trades_so_far = self.journal.trades_today(user_id, today)?;

        if !self.clock.is_closing_window()
            && cash > 0
            && holdings.len() < policy.max_holdings
            && trades_so_far < policy.max_daily_trades
        {
            let held: HashSet<String> =
                holdings.iter().map(|h| h.ticker.clone()).collect();
            let pending_buys: HashSet<String> = pending
                .iter()
                .filter(|p| p.side == OrderSide::Buy)
                .map(|p| p.ticker.clone())
                .collect();
            let free_slots = policy.max_holdings - holdings.len();

            let candidates = policy::select_candidates(
                &snapshot.rows,
                &policy,
                &buy_conditions,
                self.clock.as_ref(),
                &held,
                &blacklist,
                &pending_buys,
                free_slots,
            );

            let budget = risk::per_ticker_budget(
                cash,
                holdings.len(),
                &policy,
                risk::macro_multiplier(self.nasdaq_prev_change),
            );

            let mut remaining_cash = cash;
            let mut remaining_trades =
                policy.max_daily_trades.saturating_sub(trades_so_far);

            for candidate in candidates {
                if remaining_trades == 0 {
                    debug!(user_id, "daily trade cap reached");
                    break;
                }

                // Live reprice, falling back to the snapshot close.
                let live_price = self
                    .broker
                    .get_current_price(&candidate.code)
                    .await
                    .unwrap_or(candidate.close)
                    .max(1);

                // The gap filter re-checks against the live print.
                if candidate.close > 0 {
                    let row = snapshot.row(&candidate.code);
                    if let Some(row) = row {
                        if row.prev_close > 0 {
                            let live_change = (live_price - row.prev_close) as f64
                                / row.prev_close as f64
                                * 100.0;
                            if live_change >= policy.gap_limit_pct {
                                debug!(
                                    user_id,
                                    code = %candidate.code,
                                    live_change,
                                    "GAP_OVER_LIMIT at live price"
                                );
                                continue;
                            }
                        }
                    }
                }

                if remaining_cash < live_price {
                    debug!(user_id, remaining_cash, "cash exhausted, stopping buys");
                    break;
                }

                let quantity = risk::order_quantity(budget, live_price);

                if policy.mode == TradeMode::Semi {
                    // Semi mode records a proposal even when cash is short,
                    // at a minimum of one share.
                    let quantity = quantity.max(1);
                    if self.queue_suggestion(&policy, &candidate, live_price, quantity)? {
                        suggestion_count += 1;
                        remaining_trades = remaining_trades.saturating_sub(1);
                    }
                    continue;
                }

                if quantity == 0 {
                    debug!(user_id, code = %candidate.code, "budget below one share");
                    continue;
                }

                match self
                    .execute_buy(&policy, &candidate, live_price, quantity, &mut ordered)
                    .await
                {
                    Ok(()) => {
                        buy_count += 1;
                        remaining_cash -= live_price * quantity;
                        remaining_trades = remaining_trades.saturating_sub(1);
                    }
                    Err(EngineError::OrderRejected(msg)) => {
                        let status = if snapshot.degraded && !snapshot.contains(&candidate.code)
                        {
                            // Degraded snapshots do not blacklist absent names.
                            OrderStatus::Cancelled
                        } else {
                            OrderStatus::Rejected
                        };
                        self.journal.log_order(
                            &OrderRecord {
                                user_id,
                                ticker: candidate.code.clone(),
                                name: candidate.name.clone(),
                                side: OrderSide::Buy,
                                quantity,
                                price: live_price,
                                order_no: None,
                                reason: format!("rejected: {msg}"),
                                status,
                                profit_loss: None,
                                profit_rate: None,
                            },
                            self.clock.now(),
                        )?;
                        self.alert(&candidate.code, "ALERT_BROKER", &msg)?;
                    }
                    Err(e) => return Err(self.broker_failure(e)),
                }
            }
        }

        self.write_daily_perf(&balance).await?;

        info!(
            user_id,
            sell_count, buy_count, suggestion_count, "user tick completed"
        );

        Ok(UserTickOutcome {
            user_id,
            status: TickStatus::Completed,
            sell_count,
            buy_count,
            suggestion_count,
        })
    }

    // -------------------------------------------------------------------------
    // Sell path
    // -------------------------------------------------------------------------

    /// Update the holding's latches, then walk the trigger ladder.
    async fn evaluate_holding(
        &self,
        snapshot: &Snapshot,
        policy: &UserPolicy,
        buy_conditions: &[Condition],
        sell_conditions: &[Condition],
        holding: &HoldingInfo,
        journal_holding: Option<&JournalHolding>,
    ) -> Option<SellTrigger> {
        let sma20 = self.sma20_for(&holding.ticker).await;

        // Arm the one-way latches before evaluating.
        let mut ma20_latched = journal_holding.map_or(false, |h| h.ma20_latched);
        if !ma20_latched && sma20.is_finite() && (holding.current_price as f64) > sma20 {
            if self.journal.set_ma20_latch(self.user_id, &holding.ticker).is_ok() {
                ma20_latched = true;
            }
        }

        let exit_plan = journal_holding.and_then(|h| h.exit_plan.clone());
        let mut trailing_armed = journal_holding.map_or(false, |h| h.trailing_armed);
        if let Some(plan) = &exit_plan {
            if let Some(trigger) = plan.trailing_trigger {
                if !trailing_armed && holding.current_price as f64 >= trigger {
                    if self
                        .journal
                        .set_trailing_armed(self.user_id, &holding.ticker)
                        .is_ok()
                    {
                        trailing_armed = true;
                    }
                }
            }
        }

        let days_held = journal_holding
            .map(|h| (self.clock.today() - h.opened_at.date()).num_days())
            .unwrap_or(0);

        let ctx = SellContext {
            holding,
            row: snapshot.row(&holding.ticker),
            policy,
            buy_conditions,
            sell_conditions,
            sma20,
            ma20_latched,
            trailing_armed,
            days_held,
            exit_plan: exit_plan.as_ref(),
        };
        risk::evaluate_sell(&ctx, self.clock.as_ref())
    }

    async fn execute_sell(
        &self,
        _snapshot: &Snapshot,
        _policy: &UserPolicy,
        holding: &HoldingInfo,
        trigger: SellTrigger,
        ordered: &mut bool,
    ) -> EngineResult<()> {
        let user_id = self.user_id;
        info!(
            user_id,
            ticker = %holding.ticker,
            quantity = holding.quantity,
            reason = trigger.reason(),
            "selling"
        );

        if self.dry_run {
            self.journal.log_order(
                &OrderRecord {
                    user_id,
                    ticker: holding.ticker.clone(),
                    name: holding.name.clone(),
                    side: OrderSide::Sell,
                    quantity: holding.quantity,
                    price: holding.current_price,
                    order_no: None,
                    reason: trigger.reason().to_string(),
                    status: OrderStatus::DryRun,
                    profit_loss: None,
                    profit_rate: None,
                },
                self.clock.now(),
            )?;
            return Ok(());
        }

        let receipt = self
            .broker_call(ordered, || {
                self.broker.place_sell(&holding.ticker, holding.quantity, 0)
            })
            .await?;
        *ordered = true;

        // Realised P/L, fees included, matching the paper simulator's books.
        let fees = self.fees;
        let sell_amount = holding.current_price * holding.quantity;
        let cost_basis = holding.avg_price * holding.quantity;
        let commission =
            ((sell_amount + cost_basis) as f64 * fees.commission_rate) as i64;
        let tax = (sell_amount as f64 * fees.tax_rate(holding.market)) as i64;
        let realized = sell_amount - cost_basis - commission - tax;
        let realized_rate = if cost_basis > 0 {
            realized as f64 / cost_basis as f64 * 100.0
        } else {
            0.0
        };

        self.journal.log_order(
            &OrderRecord {
                user_id,
                ticker: holding.ticker.clone(),
                name: holding.name.clone(),
                side: OrderSide::Sell,
                quantity: holding.quantity,
                price: holding.current_price,
                order_no: Some(receipt.order_id),
                reason: trigger.reason().to_string(),
                status: OrderStatus::Executed,
                profit_loss: Some(realized),
                profit_rate: Some(realized_rate),
            },
            self.clock.now(),
        )?;
        self.journal.remove_holding(user_id, &holding.ticker)?;
        self.alert(
            &holding.ticker,
            trigger.reason(),
            &format!("sold {} at {}", holding.quantity, holding.current_price),
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Buy path
    // -------------------------------------------------------------------------

    async fn execute_buy(
        &self,
        policy: &UserPolicy,
        candidate: &BuyCandidate,
        price: i64,
        quantity: i64,
        ordered: &mut bool,
    ) -> EngineResult<()> {
        let user_id = self.user_id;
        info!(
            user_id,
            ticker = %candidate.code,
            quantity,
            price,
            score = candidate.score,
            "buying"
        );

        if self.dry_run {
            self.journal.log_order(
                &OrderRecord {
                    user_id,
                    ticker: candidate.code.clone(),
                    name: candidate.name.clone(),
                    side: OrderSide::Buy,
                    quantity,
                    price,
                    order_no: None,
                    reason: format!("score {}", candidate.score),
                    status: OrderStatus::DryRun,
                    profit_loss: None,
                    profit_rate: None,
                },
                self.clock.now(),
            )?;
            return Ok(());
        }

        let receipt = self
            .broker_call(ordered, || {
                self.broker.place_buy(&candidate.code, quantity, 0)
            })
            .await?;
        *ordered = true;

        // Swing versions carry their exit plan into the position.
        let exit_plan = self.exit_plan_for(&candidate.code, &policy.score_version).await;

        self.journal.log_order(
            &OrderRecord {
                user_id,
                ticker: candidate.code.clone(),
                name: candidate.name.clone(),
                side: OrderSide::Buy,
                quantity,
                price,
                order_no: Some(receipt.order_id),
                reason: format!("score {} ({})", candidate.score, policy.score_version),
                status: OrderStatus::Executed,
                profit_loss: None,
                profit_rate: None,
            },
            self.clock.now(),
        )?;
        self.journal.add_holding(
            user_id,
            &candidate.code,
            &candidate.name,
            quantity,
            price,
            crate::types::Market::parse(&candidate.market),
            &format!("score {}", candidate.score),
            exit_plan.as_ref(),
            self.clock.now(),
        )?;
        Ok(())
    }

    fn queue_suggestion(
        &self,
        policy: &UserPolicy,
        candidate: &BuyCandidate,
        price: i64,
        quantity: i64,
    ) -> EngineResult<bool> {
        if self
            .journal
            .has_pending_suggestion(self.user_id, &candidate.code)?
        {
            debug!(
                user_id = self.user_id,
                code = %candidate.code,
                "pending suggestion already queued"
            );
            return Ok(false);
        }

        let reason = if policy.buy_conditions.is_empty() {
            format!("screen {} {}", policy.score_version, candidate.score)
        } else {
            format!(
                "V1={},V4={},V5={}",
                candidate.scores.get("v1").unwrap_or(&0),
                candidate.scores.get("v4").unwrap_or(&0),
                candidate.scores.get("v5").unwrap_or(&0),
            )
        };

        let id = self.journal.add_suggestion(
            self.user_id,
            &candidate.code,
            &candidate.name,
            price,
            quantity,
            candidate.score,
            &reason,
            &candidate.signals,
            self.suggestion_expire_hours,
            self.clock.now(),
        )?;
        info!(
            user_id = self.user_id,
            code = %candidate.code,
            suggestion_id = id,
            quantity,
            "buy suggestion queued"
        );
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Greenlight
    // -------------------------------------------------------------------------

    async fn run_greenlight(
        &self,
        snapshot: &Snapshot,
        policy: &UserPolicy,
        holdings: &[HoldingInfo],
        cash: i64,
        ordered: &mut bool,
    ) -> EngineResult<UserTickOutcome> {
        let user_id = self.user_id;

        if !self.is_paper {
            self.alert("", "ALERT_CONFIG", "greenlight requires a paper account")?;
            return Ok(UserTickOutcome::skipped(user_id, "greenlight on live account"));
        }
        let Some(plugin) = &self.plugin else {
            self.alert("", "ALERT_CONFIG", "no decision plugin registered")?;
            return Ok(UserTickOutcome::skipped(user_id, "no decision plugin"));
        };

        let portfolio = PortfolioView {
            holdings: holdings.to_vec(),
            cash,
            total_assets: cash + holdings.iter().map(|h| h.current_price * h.quantity).sum::<i64>(),
        };
        let decisions = plugin.decide(snapshot, &portfolio, "").await?;

        let mut sell_count = 0usize;
        let mut buy_count = 0usize;

        // Sells first, mirroring the standard ordering guarantee.
        for decision in decisions
            .iter()
            .filter(|d| matches!(d.action, PluginAction::Sell { .. }))
            .chain(
                decisions
                    .iter()
                    .filter(|d| matches!(d.action, PluginAction::Buy { .. })),
            )
        {
            match &decision.action {
                PluginAction::Sell { ticker, quantity } => {
                    if let Some(holding) = holdings.iter().find(|h| &h.ticker == ticker) {
                        let mut tailored = holding.clone();
                        tailored.quantity = (*quantity).min(holding.quantity);
                        match self
                            .execute_sell(
                                snapshot,
                                policy,
                                &tailored,
                                SellTrigger::SellCondition,
                                ordered,
                            )
                            .await
                        {
                            Ok(()) => sell_count += 1,
                            Err(e) => warn!(user_id, error = %e, "plugin sell failed"),
                        }
                    }
                }
                PluginAction::Buy { ticker, quantity } => {
                    let Some(row) = snapshot.row(ticker) else {
                        continue;
                    };
                    let candidate = BuyCandidate {
                        code: row.code.clone(),
                        name: row.name.clone(),
                        market: row.market.clone(),
                        score: row.score(&policy.score_version),
                        scores: row.scores(),
                        close: row.close,
                        change_pct: row.change_pct,
                        prev_amount: row.prev_amount,
                        volume_ratio: row.volume_ratio,
                        signals: row.signals.clone(),
                    };
                    match self
                        .execute_buy(policy, &candidate, row.close.max(1), *quantity, ordered)
                        .await
                    {
                        Ok(()) => buy_count += 1,
                        Err(e) => warn!(user_id, error = %e, "plugin buy failed"),
                    }
                }
            }
        }

        Ok(UserTickOutcome {
            user_id,
            status: TickStatus::Completed,
            sell_count,
            buy_count,
            suggestion_count: 0,
        })
    }

    // -------------------------------------------------------------------------
    // Support
    // -------------------------------------------------------------------------

    /// One retry before any order side effect; none after.
    async fn broker_call<T, F, Fut>(&self, ordered: &mut bool, mut call: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = EngineResult<T>>,
    {
        if *ordered {
            call().await
        } else {
            with_transient_retry(call).await
        }
    }

    fn broker_failure(&self, e: EngineError) -> EngineError {
        let _ = self.alert("", "ALERT_BROKER", &e.to_string());
        e
    }

    /// Journal a broker rejection. The row still blacklists the ticker for
    /// the day, except for names a degraded snapshot could not cover.
    fn log_rejection(
        &self,
        snapshot: &Snapshot,
        holding: &HoldingInfo,
        side: OrderSide,
        message: &str,
    ) -> EngineResult<()> {
        let status = if snapshot.degraded && !snapshot.contains(&holding.ticker) {
            OrderStatus::Cancelled
        } else {
            OrderStatus::Rejected
        };
        self.journal.log_order(
            &OrderRecord {
                user_id: self.user_id,
                ticker: holding.ticker.clone(),
                name: holding.name.clone(),
                side,
                quantity: holding.quantity,
                price: holding.current_price,
                order_no: None,
                reason: format!("rejected: {message}"),
                status,
                profit_loss: None,
                profit_rate: None,
            },
            self.clock.now(),
        )?;
        self.alert(&holding.ticker, "ALERT_BROKER", message)?;
        Ok(())
    }

    fn alert(&self, ticker: &str, kind: &str, message: &str) -> EngineResult<bool> {
        self.journal
            .record_alert(self.user_id, ticker, "", kind, message, self.clock.now())
    }

    /// SMA20 of the latest daily closes; NaN when history is unavailable.
    async fn sma20_for(&self, ticker: &str) -> f64 {
        match self.provider.daily_bars(ticker, 30).await {
            Ok(series) if series.len() >= 20 => {
                let closes = series.closes();
                closes[closes.len() - 20..].iter().sum::<f64>() / 20.0
            }
            _ => f64::NAN,
        }
    }

    /// Recompute the entry's exit plan for the swing score versions.
    async fn exit_plan_for(&self, ticker: &str, score_version: &str) -> Option<ExitPlan> {
        if !matches!(score_version, "v6" | "v7" | "v8") {
            return None;
        }
        let series = self.provider.daily_bars(ticker, 130).await.ok()?;
        if series.len() < 60 {
            return None;
        }
        let frame = self.cache.get_or_compute(&series);
        let scorer = self.registry.get(score_version)?;
        let extras = ScoreExtras {
            minutes_into_session: self.clock.minutes_into_session(),
            ..Default::default()
        };
        run_scorer(scorer, &frame, &extras).and_then(|r| r.exit_plan)
    }

    async fn write_daily_perf(
        &self,
        balance: &crate::types::AccountBalance,
    ) -> EngineResult<()> {
        let today = self.clock.today();
        let holdings_value: i64 = balance
            .holdings
            .iter()
            .map(|h| h.current_price * h.quantity)
            .sum();
        let invested: i64 = balance
            .holdings
            .iter()
            .map(|h| h.avg_price * h.quantity)
            .sum();
        let perf = DailyPerf {
            total_assets: balance.summary.d2_cash + holdings_value,
            d2_cash: balance.summary.d2_cash,
            holdings_value,
            invested,
            realized_pnl: self.journal.realized_pnl_today(self.user_id, today)?,
            n_holdings: balance.holdings.len() as i64,
        };
        self.journal.upsert_daily_perf(self.user_id, today, &perf)
    }
}
