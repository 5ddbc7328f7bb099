//! Ethereum JSON-RPC ledger
//!
//! Range queries go through `eth_getLogs` over HTTP; the push subscription uses
//! `eth_subscribe("logs")` over a WebSocket when `ws_url` is configured.
//!
//! Placement log layout:
//! - `topics[0]`: event signature hash
//! - `topics[1]`: placer address (left-padded to 32 bytes)
//! - `data`: four 32-byte big-endian words `x, y, color, timestamp`

use super::{EntryStream, Ledger, LedgerEntry};
use crate::common::{Error, LedgerConfig, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

/// JSON-RPC error codes providers use for request throttling
const RATE_LIMIT_CODES: [i64; 2] = [-32005, -32029];

const WORD_LEN: usize = 32;

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    #[serde(default = "Option::default")]
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn into_error(self) -> Error {
        if RATE_LIMIT_CODES.contains(&self.code) {
            Error::RateLimited(self.message)
        } else {
            Error::Ledger(format!("{} (code {})", self.message, self.code))
        }
    }
}

/// Log object as returned by `eth_getLogs` and `eth_subscription`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    pub block_number: Option<String>,
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

impl RawLog {
    /// Decode into a loosely typed entry; anything unreadable stays `None`
    pub fn decode(&self) -> LedgerEntry {
        // reorged logs are not reconciled
        if self.removed {
            return LedgerEntry::default();
        }

        let words = decode_hex(&self.data).unwrap_or_default();
        let word = |i: usize| {
            words
                .get(i * WORD_LEN..(i + 1) * WORD_LEN)
                .and_then(word_to_u64)
        };

        LedgerEntry {
            user: self.topics.get(1).and_then(|t| address_from_topic(t)),
            x: word(0),
            y: word(1),
            color: word(2),
            timestamp: word(3),
            position: self.block_number.as_deref().and_then(parse_quantity),
            log_index: self.log_index.as_deref().and_then(parse_quantity),
        }
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    hex::decode(s.trim_start_matches("0x")).ok()
}

/// Big-endian 32-byte word that must fit in 64 bits
fn word_to_u64(word: &[u8]) -> Option<u64> {
    if word.len() != WORD_LEN || word[..WORD_LEN - 8].iter().any(|&b| b != 0) {
        return None;
    }
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&word[WORD_LEN - 8..]);
    Some(u64::from_be_bytes(tail))
}

fn address_from_topic(topic: &str) -> Option<String> {
    let bytes = decode_hex(topic)?;
    if bytes.len() != WORD_LEN {
        return None;
    }
    Some(format!("0x{}", hex::encode(&bytes[WORD_LEN - 20..])))
}

/// Parse a JSON-RPC hex quantity such as `"0x1b4"`
pub fn parse_quantity(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x")?;
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

fn quantity(n: u64) -> String {
    format!("0x{:x}", n)
}

pub struct RpcLedger {
    client: reqwest::Client,
    rpc_url: String,
    ws_url: Option<String>,
    address: String,
    topic: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcLedger {
    pub fn new(config: &LedgerConfig) -> Result<Self> {
        if decode_hex(&config.contract_address).map(|b| b.len()) != Some(20) {
            return Err(Error::InvalidConfig(format!(
                "ledger.contract_address is not a 20-byte hex address: {:?}",
                config.contract_address
            )));
        }
        if decode_hex(&config.event_topic).map(|b| b.len()) != Some(WORD_LEN) {
            return Err(Error::InvalidConfig(format!(
                "ledger.event_topic is not a 32-byte hex hash: {:?}",
                config.event_topic
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            rpc_url: config.rpc_url.clone(),
            ws_url: config.ws_url.clone(),
            address: config.contract_address.to_lowercase(),
            topic: config.event_topic.to_lowercase(),
            timeout: config.request_timeout(),
            next_id: AtomicU64::new(1),
        })
    }

    fn request(&self, method: &str, params: Value) -> (u64, Value) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        (id, body)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let (_, body) = self.request(method, params);
        let resp = self.client.post(&self.rpc_url).json(&body).send().await?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited(format!("{} returned 429", method)));
        }
        if !status.is_success() {
            return Err(Error::Ledger(format!("{} returned HTTP {}", method, status)));
        }

        let rpc: RpcResponse<T> = resp.json().await?;
        if let Some(err) = rpc.error {
            return Err(err.into_error());
        }
        rpc.result
            .ok_or_else(|| Error::Ledger(format!("{} returned no result", method)))
    }

    fn log_filter(&self) -> Value {
        json!({ "address": self.address, "topics": [self.topic] })
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn current_head(&self) -> Result<u64> {
        let head: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&head)
            .ok_or_else(|| Error::Ledger(format!("invalid block number {:?}", head)))
    }

    async fn query_range(&self, from: u64, to: u64) -> Result<Vec<LedgerEntry>> {
        let mut filter = self.log_filter();
        filter["fromBlock"] = json!(quantity(from));
        filter["toBlock"] = json!(quantity(to));

        let logs: Vec<RawLog> = self.call("eth_getLogs", json!([filter])).await?;
        Ok(logs.iter().map(RawLog::decode).collect())
    }

    async fn watch(&self, from: u64) -> Result<EntryStream> {
        let url = self
            .ws_url
            .clone()
            .ok_or_else(|| Error::WatchUnavailable("no ws_url configured".into()))?;

        let (mut ws, _) = tokio::time::timeout(
            self.timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await??;

        let (id, body) = self.request("eth_subscribe", json!(["logs", self.log_filter()]));
        ws.send(Message::Text(body.to_string())).await?;

        // wait for the subscription ack; notifications cannot arrive before it
        let ack = tokio::time::timeout(self.timeout, async {
            while let Some(msg) = ws.next().await {
                let Message::Text(text) = msg? else { continue };
                let value: Value = serde_json::from_str(&text)?;
                if value.get("id").and_then(Value::as_u64) != Some(id) {
                    continue;
                }
                let resp: RpcResponse<String> = serde_json::from_value(value)?;
                if let Some(err) = resp.error {
                    return Err(Error::WatchUnavailable(err.message));
                }
                return resp
                    .result
                    .ok_or_else(|| Error::WatchUnavailable("empty subscription id".into()));
            }
            Err(Error::WatchUnavailable("socket closed before subscription ack".into()))
        })
        .await??;

        tracing::info!(subscription = %ack, from, "Subscribed to ledger logs");

        let stream = async_stream::stream! {
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<Value>(&text)
                            .ok()
                            .and_then(|v| v.pointer("/params/result").cloned())
                            .and_then(|r| serde_json::from_value::<RawLog>(r).ok())
                        {
                            Some(log) => {
                                let entry = log.decode();
                                if entry.position.map_or(true, |p| p >= from) {
                                    yield Ok(entry);
                                }
                            }
                            None => tracing::debug!("Ignoring non-log websocket message"),
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        yield Err(Error::WatchUnavailable(format!("socket closed: {:?}", frame)));
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        yield Err(e.into());
                        break;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(n: u64) -> String {
        format!("{:064x}", n)
    }

    fn sample_log() -> RawLog {
        RawLog {
            topics: vec![
                format!("0x{}", "ab".repeat(32)),
                format!("0x{}{}", "00".repeat(12), "11".repeat(20)),
            ],
            data: format!("0x{}{}{}{}", word(5), word(7), word(0xff0000), word(1_700_000_000)),
            block_number: Some("0x1b4".into()),
            log_index: Some("0x2".into()),
            removed: false,
        }
    }

    #[test]
    fn test_decode_placement_log() {
        let entry = sample_log().decode();
        assert_eq!(entry.user.as_deref(), Some(format!("0x{}", "11".repeat(20)).as_str()));
        assert_eq!(entry.x, Some(5));
        assert_eq!(entry.y, Some(7));
        assert_eq!(entry.color, Some(0xff0000));
        assert_eq!(entry.timestamp, Some(1_700_000_000));
        assert_eq!(entry.position, Some(436));
        assert_eq!(entry.log_index, Some(2));
    }

    #[test]
    fn test_decode_short_data_leaves_fields_empty() {
        let mut log = sample_log();
        log.data = format!("0x{}", word(5));
        let entry = log.decode();
        assert_eq!(entry.x, Some(5));
        assert_eq!(entry.y, None);
        assert_eq!(entry.color, None);
    }

    #[test]
    fn test_decode_oversized_word() {
        let mut log = sample_log();
        log.data = format!("0x{}{}{}{}", "ff".repeat(32), word(7), word(1), word(1));
        assert_eq!(log.decode().x, None);
    }

    #[test]
    fn test_removed_log_is_empty() {
        let mut log = sample_log();
        log.removed = true;
        assert_eq!(log.decode(), LedgerEntry::default());
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x0"), Some(0));
        assert_eq!(parse_quantity("0x1b4"), Some(436));
        assert_eq!(parse_quantity("1b4"), None);
        assert_eq!(parse_quantity("0x"), None);
        assert_eq!(quantity(436), "0x1b4");
    }

    #[test]
    fn test_rpc_error_classification() {
        let limited = RpcError {
            code: -32005,
            message: "limit exceeded".into(),
        };
        assert!(matches!(limited.into_error(), Error::RateLimited(_)));

        let other = RpcError {
            code: -32000,
            message: "header not found".into(),
        };
        let err = other.into_error();
        assert!(matches!(err, Error::Ledger(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_config_validation() {
        let mut config = LedgerConfig::default();
        assert!(RpcLedger::new(&config).is_err());

        config.contract_address = format!("0x{}", "12".repeat(20));
        config.event_topic = format!("0x{}", "34".repeat(32));
        assert!(RpcLedger::new(&config).is_ok());
    }

    #[tokio::test]
    async fn test_watch_without_ws_url_is_unavailable() {
        let config = LedgerConfig {
            contract_address: format!("0x{}", "12".repeat(20)),
            event_topic: format!("0x{}", "34".repeat(32)),
            ..Default::default()
        };
        let ledger = RpcLedger::new(&config).unwrap();
        assert!(matches!(
            ledger.watch(0).await,
            Err(Error::WatchUnavailable(_))
        ));
    }
}
