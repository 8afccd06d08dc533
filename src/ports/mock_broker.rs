use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::broker::{
    AccountSnapshot, Broker, BrokerError, InstrumentSpec, OpenPosition, OrderRequest, OrderResult,
    OrderSide, Quote,
};

/// In-memory broker for tests: records every call and fails on demand.
#[derive(Default)]
pub struct MockBroker {
    pub orders: Mutex<Vec<OrderRequest>>,
    pub closes: Mutex<Vec<(u64, Option<f64>)>>,
    next_ticket: AtomicU64,
    specs: Mutex<HashMap<String, InstrumentSpec>>,
    prices: Mutex<HashMap<String, Quote>>,
    positions: Mutex<BTreeMap<u64, OpenPosition>>,
    failing_symbols: Mutex<HashSet<String>>,
    failing_closes: Mutex<HashSet<u64>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            next_ticket: AtomicU64::new(1000),
            ..Self::default()
        }
    }

    pub fn with_instrument(self, symbol: &str, lot_step: f64, min_lot: f64, max_lot: f64) -> Self {
        self.specs.lock().unwrap().insert(
            symbol.to_string(),
            InstrumentSpec {
                symbol: symbol.to_string(),
                min_lot,
                max_lot,
                lot_step,
                tick_size: 0.01,
            },
        );
        self.set_price(symbol, 100.0, 100.0);
        self
    }

    pub fn set_price(&self, symbol: &str, bid: f64, ask: f64) {
        self.prices
            .lock()
            .unwrap()
            .insert(symbol.to_string(), Quote { bid, ask });
    }

    pub fn fail_orders_for(&self, symbol: &str) {
        self.failing_symbols
            .lock()
            .unwrap()
            .insert(symbol.to_string());
    }

    pub fn fail_close(&self, ticket: u64) {
        self.failing_closes.lock().unwrap().insert(ticket);
    }

    pub fn add_position(&self, ticket: u64, symbol: &str, side: OrderSide, lots: f64) {
        self.positions.lock().unwrap().insert(
            ticket,
            OpenPosition {
                ticket,
                symbol: symbol.to_string(),
                side,
                lots,
                open_price: 100.0,
                current_price: 100.0,
            },
        );
    }

    pub fn remove_position(&self, ticket: u64) {
        self.positions.lock().unwrap().remove(&ticket);
    }

    pub fn placed(&self) -> Vec<OrderRequest> {
        self.orders.lock().unwrap().clone()
    }

    pub fn open_tickets(&self) -> Vec<u64> {
        self.positions.lock().unwrap().keys().copied().collect()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn get_instrument_spec(&self, symbol: &str) -> Result<InstrumentSpec, BrokerError> {
        self.specs
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .ok_or_else(|| BrokerError::InstrumentNotFound(symbol.to_string()))
    }

    async fn get_price(&self, symbol: &str) -> Result<Quote, BrokerError> {
        self.prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::Unavailable(symbol.to_string()))
    }

    async fn place_order(&self, request: &OrderRequest) -> OrderResult {
        self.orders.lock().unwrap().push(request.clone());
        if self.failing_symbols.lock().unwrap().contains(&request.symbol) {
            return OrderResult::rejected("requote");
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        self.add_position(ticket, &request.symbol, request.side, request.lots);
        OrderResult::filled(ticket, request.lots, 100.0)
    }

    async fn close_position(&self, ticket: u64, lots: Option<f64>) -> OrderResult {
        self.closes.lock().unwrap().push((ticket, lots));
        if self.failing_closes.lock().unwrap().contains(&ticket) {
            return OrderResult::rejected("market closed");
        }
        match self.positions.lock().unwrap().remove(&ticket) {
            Some(p) => OrderResult::filled(ticket, p.lots, p.current_price),
            None => OrderResult::rejected(format!("position {} not found", ticket)),
        }
    }

    async fn get_open_positions(
        &self,
        symbol_filter: Option<&str>,
    ) -> Result<Vec<OpenPosition>, BrokerError> {
        Ok(self
            .positions
            .lock()
            .unwrap()
            .values()
            .filter(|p| symbol_filter.map_or(true, |s| p.symbol == s))
            .cloned()
            .collect())
    }

    async fn get_account_snapshot(&self) -> Result<AccountSnapshot, BrokerError> {
        Ok(AccountSnapshot {
            balance: 10_000.0,
            equity: 10_000.0,
            margin: 0.0,
            margin_free: 10_000.0,
        })
    }
}
