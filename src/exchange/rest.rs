//! Signed REST client for a Binance-style futures API (AsterDex)
//!
//! Signed endpoints carry `timestamp` and an HMAC-SHA256 hex `signature`
//! over the query string, with the API key in `X-MBX-APIKEY`.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info};

use super::Exchange;
use crate::config::ExchangeConfig;
use crate::errors::{TraderError, TraderResult};
use crate::types::{Candle, ExchangePosition, PositionSide};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    #[serde(default)]
    position_side: String,
    position_amt: String,
    entry_price: String,
    #[serde(rename = "unRealizedProfit")]
    unrealized_profit: String,
    leverage: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkPrice {
    mark_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionMode {
    dual_side_position: bool,
}

pub struct RestExchange {
    client: Client,
    base_url: String,
    api_key: String,
    secret_key: String,
}

impl RestExchange {
    pub fn new(config: &ExchangeConfig, api_key: String, secret_key: String) -> TraderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            secret_key,
        })
    }

    /// Build from the env vars named in the config
    pub fn from_env(config: &ExchangeConfig) -> TraderResult<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| TraderError::Config(format!("{} not set", config.api_key_env)))?;
        let secret_key = std::env::var(&config.secret_key_env)
            .map_err(|_| TraderError::Config(format!("{} not set", config.secret_key_env)))?;
        Self::new(config, api_key, secret_key)
    }

    fn sign(&self, payload: &str) -> TraderResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| TraderError::Config(format!("invalid exchange secret: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> TraderResult<String> {
        let mut query = encode_params(params);
        if signed {
            let timestamp = format!("timestamp={}", Utc::now().timestamp_millis());
            query = if query.is_empty() {
                timestamp
            } else {
                format!("{query}&{timestamp}")
            };
            let signature = self.sign(&query)?;
            query = format!("{query}&signature={signature}");
        }

        let mut url = format!("{}{}", self.base_url, endpoint);
        let builder = if method == Method::GET {
            if !query.is_empty() {
                url = format!("{url}?{query}");
            }
            self.client.request(method, &url)
        } else {
            self.client
                .request(method, &url)
                .header(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/x-www-form-urlencoded"),
                )
                .body(query)
        };
        let builder = if signed {
            builder.header("X-MBX-APIKEY", &self.api_key)
        } else {
            builder
        };

        let response = builder
            .send()
            .await
            .map_err(|e| TraderError::exchange(format!("{endpoint} request failed: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TraderError::exchange(format!("{endpoint} body unreadable: {e}")))?;

        if !status.is_success() {
            return Err(TraderError::exchange(format!(
                "API error [{}] on {endpoint}: {body}",
                status.as_u16()
            )));
        }
        Ok(body)
    }

    async fn ensure_hedge_mode(&self) -> TraderResult<()> {
        let body = self
            .request(Method::GET, "/fapi/v1/positionSide/dual", &[], true)
            .await?;
        let mode: PositionMode = serde_json::from_str(&body)?;
        if !mode.dual_side_position {
            info!("Enabling hedge position mode");
            self.request(
                Method::POST,
                "/fapi/v1/positionSide/dual",
                &[("dualSidePosition", "true".to_string())],
                true,
            )
            .await?;
        }
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> TraderResult<()> {
        self.request(
            Method::POST,
            "/fapi/v1/leverage",
            &[("symbol", symbol.to_string()), ("leverage", leverage.to_string())],
            true,
        )
        .await?;
        Ok(())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        order_side: &str,
        position_side: PositionSide,
        quantity: f64,
    ) -> TraderResult<()> {
        let params = [
            ("symbol", symbol.to_string()),
            ("side", order_side.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", format_quantity(quantity)),
            ("positionSide", position_side.to_string()),
        ];
        self.request(Method::POST, "/fapi/v1/order", &params, true)
            .await
            .map_err(|e| TraderError::OrderExecution {
                symbol: symbol.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

fn encode_params(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn format_quantity(quantity: f64) -> String {
    let formatted = format!("{:.8}", quantity.abs());
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

fn parse_f64(raw: &str, field: &str) -> TraderResult<f64> {
    raw.parse::<f64>()
        .map_err(|_| TraderError::exchange(format!("invalid {field}: {raw:?}")))
}

fn parse_positions(body: &str) -> TraderResult<Option<ExchangePosition>> {
    let rows: Vec<PositionRisk> = serde_json::from_str(body)?;
    for row in rows {
        let amount = parse_f64(&row.position_amt, "positionAmt")?;
        if amount == 0.0 {
            continue;
        }
        let side = match PositionSide::from_str(&row.position_side) {
            Some(PositionSide::Flat) | None if amount > 0.0 => PositionSide::Long,
            Some(PositionSide::Flat) | None => PositionSide::Short,
            Some(side) => side,
        };
        return Ok(Some(ExchangePosition {
            symbol: row.symbol,
            side,
            leverage: row.leverage.parse().unwrap_or(1),
            entry_price: parse_f64(&row.entry_price, "entryPrice")?,
            amount,
            unrealized_pnl: parse_f64(&row.unrealized_profit, "unRealizedProfit")?,
            timestamp: Utc::now(),
        }));
    }
    Ok(None)
}

fn parse_klines(body: &str) -> TraderResult<Vec<Candle>> {
    let rows: Vec<Vec<Value>> = serde_json::from_str(body)?;
    rows.iter()
        .map(|row| {
            let number = |i: usize| -> TraderResult<f64> {
                match row.get(i) {
                    Some(Value::String(s)) => parse_f64(s, "kline field"),
                    Some(Value::Number(n)) => n
                        .as_f64()
                        .ok_or_else(|| TraderError::exchange("kline number out of range")),
                    _ => Err(TraderError::exchange(format!("kline missing field {i}"))),
                }
            };
            let open_time = row
                .first()
                .and_then(Value::as_i64)
                .ok_or_else(|| TraderError::exchange("kline missing open time"))?;
            Ok(Candle {
                open_time,
                open: number(1)?,
                high: number(2)?,
                low: number(3)?,
                close: number(4)?,
                volume: number(5)?,
            })
        })
        .collect()
}

#[async_trait]
impl Exchange for RestExchange {
    fn name(&self) -> &'static str {
        "asterdex"
    }

    async fn get_position(&self, symbol: &str) -> TraderResult<Option<ExchangePosition>> {
        let body = self
            .request(
                Method::GET,
                "/fapi/v2/positionRisk",
                &[("symbol", symbol.to_string())],
                true,
            )
            .await?;
        parse_positions(&body)
    }

    async fn open_position(
        &self,
        symbol: &str,
        side: PositionSide,
        leverage: u32,
        quantity: f64,
    ) -> TraderResult<ExchangePosition> {
        if side.is_flat() {
            return Err(TraderError::OrderExecution {
                symbol: symbol.to_string(),
                reason: "cannot open a FLAT position".into(),
            });
        }
        self.ensure_hedge_mode().await?;
        self.set_leverage(symbol, leverage).await?;

        let order_side = if side == PositionSide::Long { "BUY" } else { "SELL" };
        self.place_market_order(symbol, order_side, side, quantity)
            .await?;
        info!(symbol, side = %side, quantity, leverage, "Market order filled");

        self.get_position(symbol)
            .await?
            .ok_or_else(|| TraderError::InconsistentState {
                symbol: symbol.to_string(),
                reason: "order filled but no position reported".into(),
            })
    }

    async fn close_position(&self, symbol: &str, side: PositionSide) -> TraderResult<()> {
        let position = self
            .get_position(symbol)
            .await?
            .filter(|p| p.amount != 0.0)
            .ok_or_else(|| TraderError::OrderExecution {
                symbol: symbol.to_string(),
                reason: "no open position to close".into(),
            })?;

        let order_side = if side == PositionSide::Long { "SELL" } else { "BUY" };
        self.place_market_order(symbol, order_side, side, position.amount)
            .await?;
        info!(symbol, side = %side, amount = position.amount, "Position closed");
        Ok(())
    }

    async fn get_mark_price(&self, symbol: &str) -> TraderResult<f64> {
        let body = self
            .request(
                Method::GET,
                "/fapi/v1/premiumIndex",
                &[("symbol", symbol.to_string())],
                false,
            )
            .await?;
        let mark: MarkPrice = serde_json::from_str(&body)?;
        parse_f64(&mark.mark_price, "markPrice")
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> TraderResult<Vec<Candle>> {
        let body = self
            .request(
                Method::GET,
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
                false,
            )
            .await?;
        let candles = parse_klines(&body)?;
        debug!(symbol, interval, count = candles.len(), "Klines fetched");
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RestExchange {
        let config = ExchangeConfig {
            base_url: "https://fapi.example.com/".into(),
            timeout_ms: 1_000,
            api_key_env: "UNUSED".into(),
            secret_key_env: "UNUSED".into(),
        };
        RestExchange::new(&config, "key".into(), "secret".into()).unwrap()
    }

    #[test]
    fn signature_is_hex_hmac_of_query() {
        let exchange = client();
        let sig = exchange.sign("symbol=BTCUSDT&timestamp=1").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, exchange.sign("symbol=BTCUSDT&timestamp=1").unwrap());
        assert_ne!(sig, exchange.sign("symbol=BTCUSDT&timestamp=2").unwrap());
        assert_eq!(exchange.base_url, "https://fapi.example.com");
    }

    #[test]
    fn quantity_is_trimmed() {
        assert_eq!(format_quantity(100.0), "100");
        assert_eq!(format_quantity(-0.125), "0.125");
    }

    #[test]
    fn positions_skip_empty_legs() {
        let body = r#"[
            {"symbol":"DOGEUSDT","positionSide":"LONG","positionAmt":"0","entryPrice":"0","unRealizedProfit":"0","leverage":"5"},
            {"symbol":"DOGEUSDT","positionSide":"SHORT","positionAmt":"-250","entryPrice":"0.1542","unRealizedProfit":"1.25","leverage":"5"}
        ]"#;
        let position = parse_positions(body).unwrap().unwrap();
        assert_eq!(position.side, PositionSide::Short);
        assert_eq!(position.amount, -250.0);
        assert_eq!(position.unrealized_pnl, 1.25);
        assert_eq!(position.leverage, 5);
    }

    #[test]
    fn one_way_position_side_comes_from_sign() {
        let body = r#"[{"symbol":"DOGEUSDT","positionSide":"BOTH","positionAmt":"-10","entryPrice":"1","unRealizedProfit":"0","leverage":"3"}]"#;
        let position = parse_positions(body).unwrap().unwrap();
        assert_eq!(position.side, PositionSide::Short);
        assert!(parse_positions("[]").unwrap().is_none());
    }

    #[test]
    fn klines_parse_string_prices() {
        let body = r#"[[1735689600000,"0.31","0.33","0.30","0.32","123456.7",1735693199999,"0",10,"0","0","0"]]"#;
        let candles = parse_klines(body).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].open_time, 1735689600000);
        assert_eq!(candles[0].high, 0.33);
        assert_eq!(candles[0].close, 0.32);
    }
}
