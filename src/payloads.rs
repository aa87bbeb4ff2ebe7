//! Canonical payloads for the trading platform's streams
//!
//! Prices and sizes are fixed-point integers in the quote asset's smallest
//! unit (e.g. `150_000_000` = 150.000000).

use crate::schema::Payload;
use serde::{Deserialize, Serialize};

/// Oracle price tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub ticker: String,
    pub price: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Payload for PriceUpdate {
    fn check(&self) -> Result<(), String> {
        require_ticker(&self.ticker)?;
        if self.price == 0 {
            return Err("price must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Order submitted by a trading worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub order_id: String,
    pub wallet: String,
    pub ticker: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
}

impl Payload for OrderRequest {
    fn check(&self) -> Result<(), String> {
        require_ticker(&self.ticker)?;
        if self.order_id.is_empty() || self.wallet.is_empty() {
            return Err("orderId and wallet must not be empty".to_string());
        }
        if self.size == 0 {
            return Err("size must be positive".to_string());
        }
        if self.order_type == OrderType::Limit && self.limit_price.is_none() {
            return Err("limit orders require limitPrice".to_string());
        }
        Ok(())
    }
}

/// Execution report for a filled order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFilled {
    pub order_id: String,
    pub ticker: String,
    pub side: OrderSide,
    pub size: u64,
    pub fill_price: u64,
}

impl Payload for OrderFilled {
    fn check(&self) -> Result<(), String> {
        require_ticker(&self.ticker)?;
        if self.size == 0 || self.fill_price == 0 {
            return Err("size and fillPrice must be positive".to_string());
        }
        Ok(())
    }
}

/// A position closed by the liquidation engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionLiquidated {
    pub position_id: String,
    pub wallet: String,
    pub ticker: String,
    pub size: u64,
    pub liquidation_price: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_signature: Option<String>,
}

impl Payload for PositionLiquidated {
    fn check(&self) -> Result<(), String> {
        require_ticker(&self.ticker)
    }
}

/// Raw event observed by a blockchain listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEvent {
    pub kind: String,
    pub tx_signature: String,
    pub slot: u64,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Payload for ChainEvent {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// Alert raised by the risk engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAlert {
    pub level: AlertLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<String>,
}

impl Payload for RiskAlert {}

fn require_ticker(ticker: &str) -> Result<(), String> {
    if ticker.trim().is_empty() {
        return Err("ticker must not be empty".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Schema, TypedSchema};

    #[test]
    fn test_price_update_rejects_zero_price() {
        let schema = TypedSchema::<PriceUpdate>::new("price.update");
        assert!(schema
            .validate(&serde_json::json!({"ticker": "SOL", "price": 150000000u64}))
            .is_ok());
        let err = schema
            .validate(&serde_json::json!({"ticker": "SOL", "price": 0}))
            .unwrap_err();
        assert!(err.contains("positive"));
    }

    #[test]
    fn test_order_request_limit_requires_price() {
        let schema = TypedSchema::<OrderRequest>::new("order.request");
        let mut order = serde_json::json!({
            "orderId": "o-1",
            "wallet": "w-1",
            "ticker": "SOL",
            "side": "buy",
            "orderType": "limit",
            "size": 10
        });
        assert!(schema.validate(&order).unwrap_err().contains("limitPrice"));

        order["limitPrice"] = serde_json::json!(149_000_000u64);
        let canonical = schema.validate(&order).unwrap();
        assert_eq!(canonical["limitPrice"], 149_000_000u64);
        assert!(canonical.get("leverage").is_none());
    }

    #[test]
    fn test_order_request_missing_field() {
        let schema = TypedSchema::<OrderRequest>::new("order.request");
        let err = schema
            .validate(&serde_json::json!({"orderId": "o-1", "wallet": "w", "ticker": "SOL"}))
            .unwrap_err();
        assert!(err.contains("missing field"), "{}", err);
    }

    #[test]
    fn test_chain_event_defaults_data() {
        let schema = TypedSchema::<ChainEvent>::new("chain.event");
        let canonical = schema
            .validate(&serde_json::json!({"kind": "deposit", "txSignature": "abc", "slot": 9}))
            .unwrap();
        assert_eq!(canonical["data"], serde_json::Value::Null);
    }
}
