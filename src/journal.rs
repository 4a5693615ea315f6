// =============================================================================
// Trade journal: the relational store behind the engine
// =============================================================================
//
// One SQLite file per deployment, WAL mode. Tables: users, user_settings,
// api_key_settings, trade_log, holdings (materialised view of open
// positions), daily_performance, buy_suggestions, alert_history,
// virtual_balance.
//
// The per-user daily blacklist is not a table: it derives from trade_log as
// the distinct executed codes of the calendar date, read at tick entry.
// Alert history doubles as the (user, ticker, kind, day) dedupe ledger.
// =============================================================================

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::policy::UserPolicy;
use crate::scoring::ExitPlan;
use crate::types::{Market, OrderSide, OrderStatus, TradeMode};

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: i64,
    pub mode: TradeMode,
    pub is_paper: bool,
}

#[derive(Debug, Clone)]
pub struct ApiKeySettings {
    pub app_key: String,
    pub app_secret: String,
    pub account_number: String,
    pub is_paper: bool,
}

/// A journaled open position, including the engine-side latches the broker
/// knows nothing about.
#[derive(Debug, Clone)]
pub struct JournalHolding {
    pub ticker: String,
    pub name: String,
    pub quantity: i64,
    pub avg_price: i64,
    pub market: Market,
    pub opened_at: NaiveDateTime,
    pub ma20_latched: bool,
    pub trailing_armed: bool,
    pub exit_plan: Option<ExitPlan>,
}

#[derive(Debug, Clone, Default)]
pub struct DailyPerf {
    pub total_assets: i64,
    pub d2_cash: i64,
    pub holdings_value: i64,
    pub invested: i64,
    pub realized_pnl: i64,
    pub n_holdings: i64,
}

#[derive(Debug, Clone)]
pub struct Suggestion {
    pub id: i64,
    pub user_id: i64,
    pub ticker: String,
    pub name: String,
    pub price: i64,
    pub quantity: i64,
    pub score: i32,
    pub reason: String,
    pub status: String,
    pub expires_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub user_id: i64,
    pub ticker: String,
    pub name: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: i64,
    pub order_no: Option<String>,
    pub reason: String,
    pub status: OrderStatus,
    pub profit_loss: Option<i64>,
    pub profit_rate: Option<f64>,
}

// =============================================================================
// TradeJournal
// =============================================================================

#[derive(Clone)]
pub struct TradeJournal {
    conn: Arc<Mutex<Connection>>,
}

impl TradeJournal {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        let journal = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        journal.create_tables()?;
        info!(path = %path.as_ref().display(), "trade journal opened");
        Ok(journal)
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        let journal = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        journal.create_tables()?;
        Ok(journal)
    }

    fn create_tables(&self) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS user_settings (
                user_id INTEGER PRIMARY KEY,
                trading_enabled INTEGER NOT NULL DEFAULT 0,
                trade_mode TEXT NOT NULL DEFAULT 'manual',
                score_version TEXT NOT NULL DEFAULT 'v2',
                buy_conditions TEXT NOT NULL DEFAULT '',
                sell_conditions TEXT NOT NULL DEFAULT '',
                min_buy_score INTEGER NOT NULL DEFAULT 70,
                sell_score INTEGER NOT NULL DEFAULT 40,
                stop_loss_rate REAL NOT NULL DEFAULT 7.0,
                take_profit_rate REAL NOT NULL DEFAULT 20.0,
                max_holdings INTEGER NOT NULL DEFAULT 5,
                max_daily_trades INTEGER NOT NULL DEFAULT 10,
                max_holding_days INTEGER NOT NULL DEFAULT 5,
                max_per_stock INTEGER NOT NULL DEFAULT 1000000,
                min_volume_ratio REAL NOT NULL DEFAULT 0.0,
                gap_limit_pct REAL NOT NULL DEFAULT 15.0
            );
            CREATE TABLE IF NOT EXISTS api_key_settings (
                user_id INTEGER PRIMARY KEY,
                app_key TEXT,
                app_secret TEXT,
                account_number TEXT,
                is_mock INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS trade_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                stock_code TEXT NOT NULL,
                stock_name TEXT NOT NULL DEFAULT '',
                side TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price INTEGER NOT NULL,
                order_no TEXT,
                trade_reason TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'executed',
                profit_loss INTEGER,
                profit_rate REAL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trade_log_user_date
                ON trade_log(user_id, created_at);
            CREATE TABLE IF NOT EXISTS holdings (
                user_id INTEGER NOT NULL,
                stock_code TEXT NOT NULL,
                stock_name TEXT NOT NULL DEFAULT '',
                quantity INTEGER NOT NULL,
                avg_price INTEGER NOT NULL,
                market TEXT NOT NULL DEFAULT 'KOSDAQ',
                buy_reason TEXT NOT NULL DEFAULT '',
                opened_at TEXT NOT NULL,
                ma20_latched INTEGER NOT NULL DEFAULT 0,
                trailing_armed INTEGER NOT NULL DEFAULT 0,
                exit_plan TEXT,
                PRIMARY KEY (user_id, stock_code)
            );
            CREATE TABLE IF NOT EXISTS daily_performance (
                user_id INTEGER NOT NULL,
                date TEXT NOT NULL,
                total_assets INTEGER NOT NULL DEFAULT 0,
                d2_cash INTEGER NOT NULL DEFAULT 0,
                holdings_value INTEGER NOT NULL DEFAULT 0,
                invested INTEGER NOT NULL DEFAULT 0,
                realized_pnl INTEGER NOT NULL DEFAULT 0,
                n_holdings INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, date)
            );
            CREATE TABLE IF NOT EXISTS buy_suggestions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                stock_code TEXT NOT NULL,
                stock_name TEXT NOT NULL DEFAULT '',
                current_price INTEGER NOT NULL,
                quantity INTEGER NOT NULL,
                score INTEGER NOT NULL DEFAULT 0,
                reason TEXT NOT NULL DEFAULT '',
                signals TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_suggestions_user_status
                ON buy_suggestions(user_id, status);
            CREATE TABLE IF NOT EXISTS alert_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                stock_code TEXT NOT NULL DEFAULT '',
                stock_name TEXT NOT NULL DEFAULT '',
                alert_type TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alert_user_type_date
                ON alert_history(user_id, alert_type, created_at);
            CREATE TABLE IF NOT EXISTS virtual_balance (
                user_id INTEGER PRIMARY KEY,
                cash INTEGER NOT NULL,
                invested INTEGER NOT NULL DEFAULT 0,
                realized_pnl INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Users & settings
    // -------------------------------------------------------------------------

    /// Users whose automated trading is switched on and who have broker
    /// credentials configured.
    pub fn enabled_users(&self) -> EngineResult<Vec<UserRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT s.user_id, s.trade_mode, k.is_mock
             FROM user_settings s
             JOIN api_key_settings k ON s.user_id = k.user_id
             WHERE s.trading_enabled = 1 AND k.app_key IS NOT NULL
             ORDER BY s.user_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(UserRecord {
                user_id: row.get(0)?,
                mode: TradeMode::parse(&row.get::<_, String>(1)?),
                is_paper: row.get::<_, i64>(2)? != 0,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn policy(&self, user_id: i64) -> EngineResult<Option<UserPolicy>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT trading_enabled, trade_mode, score_version, buy_conditions,
                    sell_conditions, min_buy_score, sell_score, stop_loss_rate,
                    take_profit_rate, max_holdings, max_daily_trades,
                    max_holding_days, max_per_stock, min_volume_ratio,
                    gap_limit_pct
             FROM user_settings WHERE user_id = ?1",
        )?;
        let policy = stmt
            .query_row(params![user_id], |row| {
                Ok(UserPolicy {
                    enabled: row.get::<_, i64>(0)? != 0,
                    mode: TradeMode::parse(&row.get::<_, String>(1)?),
                    score_version: row.get(2)?,
                    buy_conditions: row.get(3)?,
                    sell_conditions: row.get(4)?,
                    min_buy_score: row.get(5)?,
                    sell_score: row.get(6)?,
                    stop_loss_rate: row.get(7)?,
                    take_profit_rate: row.get(8)?,
                    max_holdings: row.get::<_, i64>(9)? as usize,
                    max_daily_trades: row.get::<_, i64>(10)? as u32,
                    max_hold_days: row.get(11)?,
                    per_ticker_budget: row.get(12)?,
                    min_volume_ratio: row.get(13)?,
                    gap_limit_pct: row.get(14)?,
                })
            })
            .optional()?;
        Ok(policy)
    }

    pub fn api_keys(&self, user_id: i64) -> EngineResult<Option<ApiKeySettings>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT app_key, app_secret, account_number, is_mock
             FROM api_key_settings WHERE user_id = ?1",
        )?;
        let keys = stmt
            .query_row(params![user_id], |row| {
                Ok(ApiKeySettings {
                    app_key: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    app_secret: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    account_number: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    is_paper: row.get::<_, i64>(3)? != 0,
                })
            })
            .optional()?;
        Ok(keys)
    }

    /// Test / bootstrap helper: create a user with settings and keys.
    pub fn upsert_user(
        &self,
        user_id: i64,
        policy: &UserPolicy,
        keys: &ApiKeySettings,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO users (id, username) VALUES (?1, ?2)",
            params![user_id, format!("user{user_id}")],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO user_settings
             (user_id, trading_enabled, trade_mode, score_version, buy_conditions,
              sell_conditions, min_buy_score, sell_score, stop_loss_rate,
              take_profit_rate, max_holdings, max_daily_trades, max_holding_days,
              max_per_stock, min_volume_ratio, gap_limit_pct)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                user_id,
                policy.enabled as i64,
                policy.mode.as_str(),
                policy.score_version,
                policy.buy_conditions,
                policy.sell_conditions,
                policy.min_buy_score,
                policy.sell_score,
                policy.stop_loss_rate,
                policy.take_profit_rate,
                policy.max_holdings as i64,
                policy.max_daily_trades as i64,
                policy.max_hold_days,
                policy.per_ticker_budget,
                policy.min_volume_ratio,
                policy.gap_limit_pct,
            ],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO api_key_settings
             (user_id, app_key, app_secret, account_number, is_mock)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_id,
                keys.app_key,
                keys.app_secret,
                keys.account_number,
                keys.is_paper as i64,
            ],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Orders & blacklist
    // -------------------------------------------------------------------------

    pub fn log_order(&self, order: &OrderRecord, at: NaiveDateTime) -> EngineResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trade_log
             (user_id, stock_code, stock_name, side, quantity, price, order_no,
              trade_reason, status, profit_loss, profit_rate, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                order.user_id,
                order.ticker,
                order.name,
                order.side.as_str(),
                order.quantity,
                order.price,
                order.order_no,
                order.reason,
                order.status.as_str(),
                order.profit_loss,
                order.profit_rate,
                at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The round-trip-prevention set: distinct executed (or broker-
    /// rejected) codes for the calendar date at the executor's local clock.
    pub fn today_traded(&self, user_id: i64, date: NaiveDate) -> EngineResult<HashSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT stock_code FROM trade_log
             WHERE user_id = ?1 AND date(created_at) = ?2
               AND status IN ('executed', 'rejected')",
        )?;
        let rows = stmt.query_map(
            params![user_id, date.format("%Y-%m-%d").to_string()],
            |row| row.get::<_, String>(0),
        )?;
        Ok(rows.collect::<Result<HashSet<_>, _>>()?)
    }

    /// Executed orders today, for the max_daily_trades cap.
    pub fn trades_today(&self, user_id: i64, date: NaiveDate) -> EngineResult<u32> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trade_log
             WHERE user_id = ?1 AND date(created_at) = ?2 AND status = 'executed'",
            params![user_id, date.format("%Y-%m-%d").to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    // -------------------------------------------------------------------------
    // Holdings
    // -------------------------------------------------------------------------

    pub fn holdings(&self, user_id: i64) -> EngineResult<Vec<JournalHolding>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT stock_code, stock_name, quantity, avg_price, market,
                    opened_at, ma20_latched, trailing_armed, exit_plan
             FROM holdings WHERE user_id = ?1 ORDER BY stock_code",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            let opened: String = row.get(5)?;
            let plan_json: Option<String> = row.get(8)?;
            Ok(JournalHolding {
                ticker: row.get(0)?,
                name: row.get(1)?,
                quantity: row.get(2)?,
                avg_price: row.get(3)?,
                market: Market::parse(&row.get::<_, String>(4)?),
                opened_at: NaiveDateTime::parse_from_str(&opened, "%Y-%m-%d %H:%M:%S")
                    .unwrap_or_default(),
                ma20_latched: row.get::<_, i64>(6)? != 0,
                trailing_armed: row.get::<_, i64>(7)? != 0,
                exit_plan: plan_json.and_then(|j| serde_json::from_str(&j).ok()),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn holding(&self, user_id: i64, ticker: &str) -> EngineResult<Option<JournalHolding>> {
        Ok(self
            .holdings(user_id)?
            .into_iter()
            .find(|h| h.ticker == ticker))
    }

    /// First buy inserts; a repeat buy blends the average price. Quantity
    /// can only grow here; sells go through `remove_holding`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_holding(
        &self,
        user_id: i64,
        ticker: &str,
        name: &str,
        quantity: i64,
        price: i64,
        market: Market,
        reason: &str,
        exit_plan: Option<&ExitPlan>,
        at: NaiveDateTime,
    ) -> EngineResult<()> {
        if quantity <= 0 {
            return Err(EngineError::Internal(format!(
                "non-positive holding quantity for {ticker}"
            )));
        }
        let conn = self.conn.lock();

        let existing: Option<(i64, i64)> = conn
            .query_row(
                "SELECT quantity, avg_price FROM holdings
                 WHERE user_id = ?1 AND stock_code = ?2",
                params![user_id, ticker],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            Some((old_qty, old_avg)) => {
                let total_qty = old_qty + quantity;
                let blended =
                    (old_avg * old_qty + price * quantity) / total_qty.max(1);
                conn.execute(
                    "UPDATE holdings SET quantity = ?3, avg_price = ?4
                     WHERE user_id = ?1 AND stock_code = ?2",
                    params![user_id, ticker, total_qty, blended],
                )?;
            }
            None => {
                let plan_json = exit_plan.map(|p| serde_json::to_string(p).unwrap_or_default());
                conn.execute(
                    "INSERT INTO holdings
                     (user_id, stock_code, stock_name, quantity, avg_price, market,
                      buy_reason, opened_at, ma20_latched, trailing_armed, exit_plan)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0, ?9)",
                    params![
                        user_id,
                        ticker,
                        name,
                        quantity,
                        price,
                        market.as_str(),
                        reason,
                        at.format("%Y-%m-%d %H:%M:%S").to_string(),
                        plan_json,
                    ],
                )?;
            }
        }
        Ok(())
    }

    pub fn remove_holding(&self, user_id: i64, ticker: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM holdings WHERE user_id = ?1 AND stock_code = ?2",
            params![user_id, ticker],
        )?;
        Ok(())
    }

    /// Arm the one-way SMA20 latch.
    pub fn set_ma20_latch(&self, user_id: i64, ticker: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE holdings SET ma20_latched = 1
             WHERE user_id = ?1 AND stock_code = ?2",
            params![user_id, ticker],
        )?;
        Ok(())
    }

    /// Arm the trailing-stop trigger.
    pub fn set_trailing_armed(&self, user_id: i64, ticker: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE holdings SET trailing_armed = 1
             WHERE user_id = ?1 AND stock_code = ?2",
            params![user_id, ticker],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Daily performance
    // -------------------------------------------------------------------------

    pub fn upsert_daily_perf(
        &self,
        user_id: i64,
        date: NaiveDate,
        perf: &DailyPerf,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO daily_performance
             (user_id, date, total_assets, d2_cash, holdings_value, invested,
              realized_pnl, n_holdings)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user_id,
                date.format("%Y-%m-%d").to_string(),
                perf.total_assets,
                perf.d2_cash,
                perf.holdings_value,
                perf.invested,
                perf.realized_pnl,
                perf.n_holdings,
            ],
        )?;
        Ok(())
    }

    /// Realised P/L booked today, summed over executed sells.
    pub fn realized_pnl_today(&self, user_id: i64, date: NaiveDate) -> EngineResult<i64> {
        let conn = self.conn.lock();
        let pnl: Option<i64> = conn.query_row(
            "SELECT SUM(profit_loss) FROM trade_log
             WHERE user_id = ?1 AND date(created_at) = ?2
               AND side = 'sell' AND status = 'executed'",
            params![user_id, date.format("%Y-%m-%d").to_string()],
            |row| row.get(0),
        )?;
        Ok(pnl.unwrap_or(0))
    }

    pub fn daily_perf(&self, user_id: i64, date: NaiveDate) -> EngineResult<Option<DailyPerf>> {
        let conn = self.conn.lock();
        let perf = conn
            .query_row(
                "SELECT total_assets, d2_cash, holdings_value, invested,
                        realized_pnl, n_holdings
                 FROM daily_performance WHERE user_id = ?1 AND date = ?2",
                params![user_id, date.format("%Y-%m-%d").to_string()],
                |row| {
                    Ok(DailyPerf {
                        total_assets: row.get(0)?,
                        d2_cash: row.get(1)?,
                        holdings_value: row.get(2)?,
                        invested: row.get(3)?,
                        realized_pnl: row.get(4)?,
                        n_holdings: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(perf)
    }

    // -------------------------------------------------------------------------
    // Alerts (with the per-day dedupe read)
    // -------------------------------------------------------------------------

    /// Record an alert unless the same (user, code, kind) already fired
    /// today. Returns whether a row was written.
    pub fn record_alert(
        &self,
        user_id: i64,
        ticker: &str,
        name: &str,
        kind: &str,
        message: &str,
        at: NaiveDateTime,
    ) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let date = at.date().format("%Y-%m-%d").to_string();

        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM alert_history
             WHERE user_id = ?1 AND stock_code = ?2 AND alert_type = ?3
               AND date(created_at) = ?4",
            params![user_id, ticker, kind, date],
            |row| row.get(0),
        )?;
        if exists > 0 {
            debug!(user_id, ticker, kind, "alert deduped");
            return Ok(false);
        }

        conn.execute(
            "INSERT INTO alert_history
             (user_id, stock_code, stock_name, alert_type, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                ticker,
                name,
                kind,
                message,
                at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ],
        )?;
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Virtual balance (paper accounts)
    // -------------------------------------------------------------------------

    /// Seed the paper account once; later calls are no-ops.
    pub fn init_virtual_balance(
        &self,
        user_id: i64,
        initial_cash: i64,
        at: NaiveDateTime,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO virtual_balance
             (user_id, cash, invested, realized_pnl, updated_at)
             VALUES (?1, ?2, 0, 0, ?3)",
            params![
                user_id,
                initial_cash,
                at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn virtual_cash(&self, user_id: i64) -> EngineResult<i64> {
        let conn = self.conn.lock();
        let cash = conn
            .query_row(
                "SELECT cash FROM virtual_balance WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        Ok(cash)
    }

    /// Deduct a buy (amount already includes commission). Cash can never go
    /// negative; an overdraft is an internal error.
    pub fn virtual_buy(&self, user_id: i64, amount: i64, at: NaiveDateTime) -> EngineResult<()> {
        let conn = self.conn.lock();
        let cash: i64 = conn.query_row(
            "SELECT cash FROM virtual_balance WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        if cash < amount {
            return Err(EngineError::Internal(format!(
                "virtual overdraft: cash {cash} < amount {amount}"
            )));
        }
        conn.execute(
            "UPDATE virtual_balance
             SET cash = cash - ?2, invested = invested + ?2, updated_at = ?3
             WHERE user_id = ?1",
            params![user_id, amount, at.format("%Y-%m-%d %H:%M:%S").to_string()],
        )?;
        Ok(())
    }

    /// Credit a sell: net proceeds in, released cost basis out of invested.
    pub fn virtual_sell(
        &self,
        user_id: i64,
        net_proceeds: i64,
        cost_basis: i64,
        realized_pnl: i64,
        at: NaiveDateTime,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE virtual_balance
             SET cash = cash + ?2,
                 invested = MAX(0, invested - ?3),
                 realized_pnl = realized_pnl + ?4,
                 updated_at = ?5
             WHERE user_id = ?1",
            params![
                user_id,
                net_proceeds,
                cost_basis,
                realized_pnl,
                at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Buy suggestions (semi mode)
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn add_suggestion(
        &self,
        user_id: i64,
        ticker: &str,
        name: &str,
        price: i64,
        quantity: i64,
        score: i32,
        reason: &str,
        signals: &str,
        expire_hours: i64,
        at: NaiveDateTime,
    ) -> EngineResult<i64> {
        let conn = self.conn.lock();
        let expires = at + chrono::Duration::hours(expire_hours);
        conn.execute(
            "INSERT INTO buy_suggestions
             (user_id, stock_code, stock_name, current_price, quantity, score,
              reason, signals, status, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?10)",
            params![
                user_id,
                ticker,
                name,
                price,
                quantity,
                score,
                reason,
                signals,
                at.format("%Y-%m-%d %H:%M:%S").to_string(),
                expires.format("%Y-%m-%d %H:%M:%S").to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn has_pending_suggestion(&self, user_id: i64, ticker: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM buy_suggestions
             WHERE user_id = ?1 AND stock_code = ?2 AND status = 'pending'",
            params![user_id, ticker],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Flip overdue pendings to expired. Returns how many flipped.
    pub fn expire_suggestions(&self, user_id: i64, now: NaiveDateTime) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE buy_suggestions SET status = 'expired'
             WHERE user_id = ?1 AND status = 'pending' AND expires_at < ?2",
            params![user_id, now.format("%Y-%m-%d %H:%M:%S").to_string()],
        )?;
        Ok(changed)
    }

    pub fn set_suggestion_status(&self, id: i64, status: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE buy_suggestions SET status = ?2 WHERE id = ?1",
            params![id, status],
        )?;
        Ok(())
    }

    pub fn suggestions(&self, user_id: i64, status: &str) -> EngineResult<Vec<Suggestion>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, stock_code, stock_name, current_price, quantity,
                    score, reason, status, expires_at
             FROM buy_suggestions WHERE user_id = ?1 AND status = ?2
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id, status], |row| {
            let expires: String = row.get(9)?;
            Ok(Suggestion {
                id: row.get(0)?,
                user_id: row.get(1)?,
                ticker: row.get(2)?,
                name: row.get(3)?,
                price: row.get(4)?,
                quantity: row.get(5)?,
                score: row.get(6)?,
                reason: row.get(7)?,
                status: row.get(8)?,
                expires_at: NaiveDateTime::parse_from_str(&expires, "%Y-%m-%d %H:%M:%S")
                    .unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
