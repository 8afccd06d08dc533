use std::error::Error;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerError {
    InstrumentNotFound(String),
    Unavailable(String),
    Other(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BrokerError::InstrumentNotFound(s) => write!(f, "instrument not found: {}", s),
            BrokerError::Unavailable(msg) => write!(f, "broker unavailable: {}", msg),
            BrokerError::Other(msg) => write!(f, "broker error: {}", msg),
        }
    }
}

impl Error for BrokerError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub symbol: String,
    pub min_lot: f64,
    pub max_lot: f64,
    pub lot_step: f64,
    pub tick_size: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn for_side(&self, side: OrderSide) -> f64 {
        match side {
            OrderSide::Buy => self.ask,
            OrderSide::Sell => self.bid,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub lots: f64,
    pub price_hint: Option<f64>,
    /// Maximum accepted slippage in points.
    pub deviation: u32,
    /// Broker comment used to correlate the two legs of a spread.
    pub tag: String,
}

/// Result of a single order or close. Rejections are values, not errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderResult {
    pub success: bool,
    pub ticket: Option<u64>,
    pub filled_lots: f64,
    pub filled_price: f64,
    pub error: Option<String>,
}

impl OrderResult {
    pub fn filled(ticket: u64, filled_lots: f64, filled_price: f64) -> Self {
        Self {
            success: true,
            ticket: Some(ticket),
            filled_lots,
            filled_price,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            ticket: None,
            filled_lots: 0.0,
            filled_price: 0.0,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenPosition {
    pub ticket: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub lots: f64,
    pub open_price: f64,
    pub current_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct AccountSnapshot {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub margin_free: f64,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_instrument_spec(&self, symbol: &str) -> Result<InstrumentSpec, BrokerError>;

    async fn get_price(&self, symbol: &str) -> Result<Quote, BrokerError>;

    async fn place_order(&self, request: &OrderRequest) -> OrderResult;

    /// Closes `lots` of the position, or all of it when `None`.
    async fn close_position(&self, ticket: u64, lots: Option<f64>) -> OrderResult;

    async fn get_open_positions(
        &self,
        symbol_filter: Option<&str>,
    ) -> Result<Vec<OpenPosition>, BrokerError>;

    async fn get_account_snapshot(&self) -> Result<AccountSnapshot, BrokerError>;
}
