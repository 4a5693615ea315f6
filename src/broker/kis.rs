// =============================================================================
// KIS REST client (live broker)
// =============================================================================
//
// Korea Investment & Securities OpenAPI. Every account-scoped call is
// authenticated with a cached OAuth bearer token, refreshed when within a
// minute of expiry. TR ids differ between the real and the virtual
// (mock-account) endpoints; both speak the same JSON shapes.
//
// SECURITY: the app secret only ever travels in the token request body and
// is never logged.
// =============================================================================

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::types::{AccountBalance, AccountSummary, HoldingInfo, Market, OrderSide, PendingOrder};

use super::{classify_status, BrokerClient, OrderReceipt};

const REAL_BASE_URL: &str = "https://openapi.koreainvestment.com:9443";
const VIRTUAL_BASE_URL: &str = "https://openapivts.koreainvestment.com:29443";

/// TR id pairs (real, virtual).
const TR_BALANCE: (&str, &str) = ("TTTC8434R", "VTTC8434R");
const TR_BUY: (&str, &str) = ("TTTC0802U", "VTTC0802U");
const TR_SELL: (&str, &str) = ("TTTC0801U", "VTTC0801U");
const TR_PRICE: &str = "FHKST01010100";
const TR_PENDING: (&str, &str) = ("TTTC8036R", "VTTC8036R");

struct Token {
    value: String,
    acquired: Instant,
    lifetime: Duration,
}

impl Token {
    fn is_expiring(&self) -> bool {
        self.acquired.elapsed() + Duration::from_secs(60) >= self.lifetime
    }
}

pub struct KisClient {
    app_key: String,
    app_secret: String,
    /// "CANO-ACNT_PRDT_CD", e.g. "12345678-01".
    account_number: String,
    is_virtual: bool,
    base_url: String,
    client: reqwest::Client,
    token: Mutex<Option<Token>>,
}

impl KisClient {
    pub fn new(
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        account_number: impl Into<String>,
        is_virtual: bool,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");

        let base_url = if is_virtual {
            VIRTUAL_BASE_URL
        } else {
            REAL_BASE_URL
        };

        debug!(is_virtual, "KisClient initialised");

        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            account_number: account_number.into(),
            is_virtual,
            base_url: base_url.to_string(),
            client,
            token: Mutex::new(None),
        }
    }

    fn tr_id(&self, pair: (&'static str, &'static str)) -> &'static str {
        if self.is_virtual {
            pair.1
        } else {
            pair.0
        }
    }

    fn account_parts(&self) -> (String, String) {
        match self.account_number.split_once('-') {
            Some((cano, prdt)) => (cano.to_string(), prdt.to_string()),
            None => (self.account_number.clone(), "01".to_string()),
        }
    }

    fn map_transport(e: reqwest::Error) -> EngineError {
        if e.is_timeout() || e.is_connect() {
            EngineError::BrokerTransient(e.to_string())
        } else {
            EngineError::Internal(e.to_string())
        }
    }

    /// POST /oauth2/tokenP, cached until a minute before expiry.
    async fn bearer_token(&self) -> EngineResult<String> {
        {
            let token = self.token.lock();
            if let Some(t) = token.as_ref() {
                if !t.is_expiring() {
                    return Ok(t.value.clone());
                }
            }
        }

        let url = format!("{}/oauth2/tokenP", self.base_url);
        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.app_key,
            "appsecret": self.app_secret,
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_transport)?;

        let status = resp.status().as_u16();
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::BrokerTransient(format!("token body: {e}")))?;

        if status != 200 {
            // Auth failures are permanent: the user's keys are wrong.
            return Err(EngineError::BrokerPermanent(format!(
                "token request failed: HTTP {status}: {payload}"
            )));
        }

        let value = payload["access_token"]
            .as_str()
            .ok_or_else(|| {
                EngineError::BrokerPermanent(format!("token response missing access_token"))
            })?
            .to_string();
        let lifetime = payload["expires_in"].as_u64().unwrap_or(86_400);

        info!(lifetime_secs = lifetime, "KIS access token refreshed");

        let mut token = self.token.lock();
        *token = Some(Token {
            value: value.clone(),
            acquired: Instant::now(),
            lifetime: Duration::from_secs(lifetime),
        });
        Ok(value)
    }

    async fn authed_get(
        &self,
        path: &str,
        tr_id: &str,
        query: &[(&str, String)],
    ) -> EngineResult<serde_json::Value> {
        let token = self.bearer_token().await?;
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .get(&url)
            .query(query)
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .header("tr_id", tr_id)
            .send()
            .await
            .map_err(Self::map_transport)?;

        let status = resp.status().as_u16();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::BrokerTransient(format!("response body: {e}")))?;

        if status != 200 {
            return Err(classify_status(status, &body.to_string()));
        }
        Ok(body)
    }

    async fn authed_post(
        &self,
        path: &str,
        tr_id: &str,
        body: serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        let token = self.bearer_token().await?;
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .header("tr_id", tr_id)
            .send()
            .await
            .map_err(Self::map_transport)?;

        let status = resp.status().as_u16();
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::BrokerTransient(format!("response body: {e}")))?;

        if status != 200 {
            return Err(classify_status(status, &payload.to_string()));
        }
        Ok(payload)
    }

    async fn place_order(
        &self,
        side: OrderSide,
        ticker: &str,
        quantity: i64,
        price: i64,
    ) -> EngineResult<OrderReceipt> {
        let (cano, prdt) = self.account_parts();
        // "01" market, "00" limit.
        let ord_dvsn = if price == 0 { "01" } else { "00" };
        let tr_id = match side {
            OrderSide::Buy => self.tr_id(TR_BUY),
            OrderSide::Sell => self.tr_id(TR_SELL),
        };

        let body = json!({
            "CANO": cano,
            "ACNT_PRDT_CD": prdt,
            "PDNO": ticker,
            "ORD_DVSN": ord_dvsn,
            "ORD_QTY": quantity.to_string(),
            "ORD_UNPR": price.to_string(),
        });

        let payload = self
            .authed_post("/uapi/domestic-stock/v1/trading/order-cash", tr_id, body)
            .await?;

        let rt_cd = payload["rt_cd"].as_str().unwrap_or("");
        if rt_cd != "0" {
            let msg = payload["msg1"].as_str().unwrap_or("unknown rejection");
            warn!(ticker, %side, quantity, price, msg, "order rejected by broker");
            return Err(EngineError::OrderRejected(msg.to_string()));
        }

        let order_id = payload["output"]["ODNO"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        info!(ticker, %side, quantity, price, order_id, "order accepted");
        Ok(OrderReceipt { order_id })
    }
}

fn num(value: &serde_json::Value, key: &str) -> f64 {
    value[key]
        .as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| value[key].as_f64())
        .unwrap_or(0.0)
}

#[async_trait]
impl BrokerClient for KisClient {
    #[instrument(skip(self), name = "kis::get_account_balance")]
    async fn get_account_balance(&self) -> EngineResult<AccountBalance> {
        let (cano, prdt) = self.account_parts();
        let query = vec![
            ("CANO", cano),
            ("ACNT_PRDT_CD", prdt),
            ("AFHR_FLPR_YN", "N".to_string()),
            ("OFL_YN", String::new()),
            ("INQR_DVSN", "02".to_string()),
            ("UNPR_DVSN", "01".to_string()),
            ("FUND_STTL_ICLD_YN", "N".to_string()),
            ("FNCG_AMT_AUTO_RDPT_YN", "N".to_string()),
            ("PRCS_DVSN", "00".to_string()),
            ("CTX_AREA_FK100", String::new()),
            ("CTX_AREA_NK100", String::new()),
        ];

        let payload = self
            .authed_get(
                "/uapi/domestic-stock/v1/trading/inquire-balance",
                self.tr_id(TR_BALANCE),
                &query,
            )
            .await?;

        let mut holdings = Vec::new();
        if let Some(rows) = payload["output1"].as_array() {
            for row in rows {
                let quantity = num(row, "hldg_qty") as i64;
                if quantity <= 0 {
                    continue;
                }
                holdings.push(HoldingInfo {
                    ticker: row["pdno"].as_str().unwrap_or_default().to_string(),
                    name: row["prdt_name"].as_str().unwrap_or_default().to_string(),
                    quantity,
                    avg_price: num(row, "pchs_avg_pric") as i64,
                    current_price: num(row, "prpr") as i64,
                    profit_rate: num(row, "evlu_pfls_rt"),
                    market: Market::Kosdaq,
                });
            }
        }

        let summary_row = payload["output2"]
            .as_array()
            .and_then(|a| a.first())
            .cloned()
            .unwrap_or_default();
        let summary = AccountSummary {
            d2_cash: num(&summary_row, "prvs_rcdl_excc_amt") as i64,
            max_buy_amount: num(&summary_row, "nxdy_excc_amt") as i64,
            total_eval_amount: num(&summary_row, "scts_evlu_amt") as i64,
            total_profit_loss: num(&summary_row, "evlu_pfls_smtl_amt") as i64,
        };

        debug!(
            holdings = holdings.len(),
            d2_cash = summary.d2_cash,
            "balance retrieved"
        );
        Ok(AccountBalance { holdings, summary })
    }

    #[instrument(skip(self), name = "kis::get_current_price")]
    async fn get_current_price(&self, ticker: &str) -> EngineResult<i64> {
        let query = vec![
            ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
            ("FID_INPUT_ISCD", ticker.to_string()),
        ];
        let payload = self
            .authed_get(
                "/uapi/domestic-stock/v1/quotations/inquire-price",
                TR_PRICE,
                &query,
            )
            .await?;
        let price = num(&payload["output"], "stck_prpr") as i64;
        if price <= 0 {
            return Err(EngineError::BrokerTransient(format!(
                "no price for {ticker}"
            )));
        }
        Ok(price)
    }

    #[instrument(skip(self), name = "kis::get_pending_orders")]
    async fn get_pending_orders(&self) -> EngineResult<Vec<PendingOrder>> {
        let (cano, prdt) = self.account_parts();
        let query = vec![
            ("CANO", cano),
            ("ACNT_PRDT_CD", prdt),
            ("CTX_AREA_FK100", String::new()),
            ("CTX_AREA_NK100", String::new()),
            ("INQR_DVSN_1", "0".to_string()),
            ("INQR_DVSN_2", "0".to_string()),
        ];
        let payload = self
            .authed_get(
                "/uapi/domestic-stock/v1/trading/inquire-psbl-rvsecncl",
                self.tr_id(TR_PENDING),
                &query,
            )
            .await?;

        let mut pending = Vec::new();
        if let Some(rows) = payload["output"].as_array() {
            for row in rows {
                let side = if row["sll_buy_dvsn_cd"].as_str() == Some("02") {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                };
                pending.push(PendingOrder {
                    ticker: row["pdno"].as_str().unwrap_or_default().to_string(),
                    side,
                    quantity: num(row, "psbl_qty") as i64,
                    price: num(row, "ord_unpr") as i64,
                });
            }
        }
        Ok(pending)
    }

    async fn place_buy(
        &self,
        ticker: &str,
        quantity: i64,
        price: i64,
    ) -> EngineResult<OrderReceipt> {
        self.place_order(OrderSide::Buy, ticker, quantity, price).await
    }

    async fn place_sell(
        &self,
        ticker: &str,
        quantity: i64,
        price: i64,
    ) -> EngineResult<OrderReceipt> {
        self.place_order(OrderSide::Sell, ticker, quantity, price).await
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tr_ids_switch_on_account_kind() {
        let real = KisClient::new("k", "s", "12345678-01", false, Duration::from_secs(10));
        let mock = KisClient::new("k", "s", "12345678-01", true, Duration::from_secs(10));
        assert_eq!(real.tr_id(TR_BALANCE), "TTTC8434R");
        assert_eq!(mock.tr_id(TR_BALANCE), "VTTC8434R");
        assert_eq!(real.tr_id(TR_BUY), "TTTC0802U");
        assert_eq!(mock.tr_id(TR_SELL), "VTTC0801U");
    }

    #[test]
    fn account_number_splits() {
        let client = KisClient::new("k", "s", "12345678-01", true, Duration::from_secs(10));
        assert_eq!(
            client.account_parts(),
            ("12345678".to_string(), "01".to_string())
        );

        let bare = KisClient::new("k", "s", "12345678", true, Duration::from_secs(10));
        assert_eq!(
            bare.account_parts(),
            ("12345678".to_string(), "01".to_string())
        );
    }

    #[test]
    fn numeric_field_extraction_handles_strings() {
        let v = serde_json::json!({"prpr": "70100", "evlu_pfls_rt": "-3.42", "x": 5.0});
        assert_eq!(num(&v, "prpr"), 70_100.0);
        assert!((num(&v, "evlu_pfls_rt") + 3.42).abs() < 1e-9);
        assert_eq!(num(&v, "x"), 5.0);
        assert_eq!(num(&v, "missing"), 0.0);
    }

    #[test]
    fn token_expiry_window() {
        let token = Token {
            value: "t".into(),
            acquired: Instant::now(),
            lifetime: Duration::from_secs(30),
        };
        // 30s lifetime is inside the 60s refresh window immediately
        assert!(token.is_expiring());

        let token = Token {
            value: "t".into(),
            acquired: Instant::now(),
            lifetime: Duration::from_secs(86_400),
        };
        assert!(!token.is_expiring());
    }
}
