// =============================================================================
// Risk manager: sizing, macro multiplier, sell triggers
// =============================================================================
//
// Everything here is a stateless calculation over inputs the controller
// gathers: the broker's holdings, the snapshot row, the user policy, and
// the latches the journal carries. Sell triggers evaluate in a fixed order
// and the first hit wins; a sell and a buy for the same ticker can never
// both fire inside one tick because sells run first and blacklist the code.
// =============================================================================

use crate::clock::Clock;
use crate::policy::{evaluate_conditions, Condition, UserPolicy};
use crate::scoring::ExitPlan;
use crate::snapshot::SnapshotRow;
use crate::types::HoldingInfo;

// =============================================================================
// Position sizing
// =============================================================================

/// NASDAQ previous-day change -> investment multiplier. An unknown change
/// (feed failure) keeps full size.
pub fn macro_multiplier(nasdaq_prev_change: Option<f64>) -> f64 {
    match nasdaq_prev_change {
        Some(change) if change <= -3.0 => 0.3,
        Some(change) if change <= -2.0 => 0.5,
        Some(change) if change <= -1.0 => 0.7,
        _ => 1.0,
    }
}

/// Per-ticker budget: the configured cap, bounded by spreading the cash
/// over the remaining slots, scaled by the macro multiplier.
pub fn per_ticker_budget(
    cash: i64,
    holdings_count: usize,
    policy: &UserPolicy,
    macro_mult: f64,
) -> i64 {
    let open_slots = policy.max_holdings.saturating_sub(holdings_count).max(1) as i64;
    let spread = cash / open_slots;
    let base = policy.per_ticker_budget.min(spread).max(0);
    (base as f64 * macro_mult) as i64
}

/// Whole shares the budget affords at `price`. Zero skips the buy.
pub fn order_quantity(budget: i64, price: i64) -> i64 {
    if price <= 0 {
        return 0;
    }
    (budget / price).max(0)
}

// =============================================================================
// Sell triggers
// =============================================================================

/// The first matching trigger wins. `reason()` is what the journal records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SellTrigger {
    StopLoss,
    SellCondition,
    ScoreDecay,
    Ma20Break,
    TimeStop,
    EodCleanup,
    ExitTarget,
    ExitStop,
    ExitTrailing,
    ExitTimeStop,
}

impl SellTrigger {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::StopLoss => "STOP_LOSS",
            Self::SellCondition => "SELL_CONDITION",
            Self::ScoreDecay => "SCORE_DECAY",
            Self::Ma20Break => "MA20_BREAK",
            Self::TimeStop => "TIME_STOP",
            Self::EodCleanup => "EOD_CLEANUP",
            Self::ExitTarget => "EXIT_TARGET",
            Self::ExitStop => "EXIT_STOP",
            Self::ExitTrailing => "EXIT_TRAILING",
            Self::ExitTimeStop => "EXIT_TIME_STOP",
        }
    }
}

/// Everything the sell evaluation needs for one holding.
pub struct SellContext<'a> {
    pub holding: &'a HoldingInfo,
    /// Today's snapshot row for the ticker, when present.
    pub row: Option<&'a SnapshotRow>,
    pub policy: &'a UserPolicy,
    pub buy_conditions: &'a [Condition],
    pub sell_conditions: &'a [Condition],
    /// Current SMA20 for the latch check (0 or NaN disables it).
    pub sma20: f64,
    /// One-way flag: the position has closed above SMA20 at least once.
    pub ma20_latched: bool,
    /// Trailing-trigger price has been touched at least once.
    pub trailing_armed: bool,
    pub days_held: i64,
    pub exit_plan: Option<&'a ExitPlan>,
}

/// Evaluate the trigger ladder for one holding.
pub fn evaluate_sell(ctx: &SellContext<'_>, clock: &dyn Clock) -> Option<SellTrigger> {
    let holding = ctx.holding;
    let profit_rate = if holding.avg_price > 0 {
        (holding.current_price - holding.avg_price) as f64 / holding.avg_price as f64 * 100.0
    } else {
        holding.profit_rate
    };

    // 1. Hard stop.
    if profit_rate <= -ctx.policy.stop_loss_rate.abs() {
        return Some(SellTrigger::StopLoss);
    }

    let scores = ctx.row.map(|r| r.scores());

    // 2. Custom sell DSL, with score decay as the no-DSL fallback.
    if let Some(scores) = &scores {
        if !ctx.sell_conditions.is_empty() {
            if evaluate_conditions(ctx.sell_conditions, scores) {
                return Some(SellTrigger::SellCondition);
            }
        } else {
            // 3. Score decay on the user's score version.
            let score = scores
                .get(&ctx.policy.score_version)
                .copied()
                .unwrap_or(0);
            if score <= ctx.policy.sell_score {
                return Some(SellTrigger::ScoreDecay);
            }
        }
    }

    // 4. MA20 break: only after the latch armed.
    if ctx.ma20_latched
        && ctx.sma20.is_finite()
        && ctx.sma20 > 0.0
        && (holding.current_price as f64) < ctx.sma20
    {
        return Some(SellTrigger::Ma20Break);
    }

    // 5. Time stop.
    if ctx.days_held > ctx.policy.max_hold_days {
        return Some(SellTrigger::TimeStop);
    }

    // 6. Pre-close tidy: keep only names that would still be bought.
    if clock.is_closing_window() {
        if let Some(scores) = &scores {
            let keep = if ctx.buy_conditions.is_empty() {
                let score = scores
                    .get(&ctx.policy.score_version)
                    .copied()
                    .unwrap_or(0);
                score > ctx.policy.min_buy_score + 5
            } else {
                evaluate_conditions(ctx.buy_conditions, scores)
            };
            if !keep {
                return Some(SellTrigger::EodCleanup);
            }
        }
    }

    // 7. Exit plan, when the entry carried one.
    if let Some(plan) = ctx.exit_plan {
        let price = holding.current_price as f64;
        if price >= plan.target_price {
            return Some(SellTrigger::ExitTarget);
        }
        if price <= plan.stop_price {
            return Some(SellTrigger::ExitStop);
        }
        if let Some(_trigger) = plan.trailing_trigger {
            // Once the trigger traded, the stop ratchets to entry.
            if ctx.trailing_armed && price <= plan.entry {
                return Some(SellTrigger::ExitTrailing);
            }
        }
        if ctx.days_held > plan.max_hold_days as i64 {
            return Some(SellTrigger::ExitTimeStop);
        }
    }

    None
}
