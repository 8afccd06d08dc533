use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;

use super::broker::{
    AccountSnapshot, Broker, BrokerError, InstrumentSpec, OpenPosition, OrderRequest, OrderResult,
    OrderSide, Quote,
};
use crate::config::InstrumentConfig;

const REPLAY_BALANCE: f64 = 10_000.0;
const REPLAY_LEVERAGE: f64 = 100.0;

// Data structures that mirror the JSONL price file
#[derive(Debug, Clone, Copy, Deserialize)]
struct ReplayQuote {
    bid: f64,
    ask: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct ReplayEntry {
    timestamp: i64,
    prices: HashMap<String, ReplayQuote>,
}

/// Broker that replays recorded quotes and fills every order at the current
/// bid/ask. Positions and realised PnL live in memory only.
#[derive(Debug)]
pub struct ReplayBroker {
    data: Vec<ReplayEntry>,
    cursor: AtomicUsize,
    instruments: HashMap<String, (InstrumentSpec, f64)>,
    fill_probability: f64,
    next_ticket: AtomicU64,
    positions: Mutex<HashMap<u64, OpenPosition>>,
    realized_pnl: Mutex<f64>,
}

impl ReplayBroker {
    pub fn new(
        path: &str,
        instruments: &[InstrumentConfig],
        fill_probability: f64,
    ) -> Result<Self, BrokerError> {
        let file = File::open(path)
            .map_err(|e| BrokerError::Other(format!("failed to open replay file: {}", e)))?;
        let reader = BufReader::new(file);
        let mut lines = Vec::new();
        for line in reader.lines() {
            let line = line
                .map_err(|e| BrokerError::Other(format!("failed to read replay line: {}", e)))?;
            lines.push(line);
        }
        Self::from_lines(lines, instruments, fill_probability)
    }

    pub fn from_lines<I, S>(
        lines: I,
        instruments: &[InstrumentConfig],
        fill_probability: f64,
    ) -> Result<Self, BrokerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut data = Vec::new();
        for line in lines {
            let line = line.as_ref();
            if line.trim().is_empty() {
                continue;
            }
            let entry: ReplayEntry = serde_json::from_str(line).map_err(|e| {
                BrokerError::Other(format!("failed to parse replay entry '{}': {}", line, e))
            })?;
            data.push(entry);
        }
        if data.is_empty() {
            return Err(BrokerError::Other(
                "replay file is empty or invalid".to_string(),
            ));
        }

        let instruments = instruments
            .iter()
            .map(|i| (i.symbol.clone(), (i.to_spec(), i.contract_size)))
            .collect();
        Ok(Self {
            data,
            cursor: AtomicUsize::new(0),
            instruments,
            fill_probability: fill_probability.clamp(0.0, 1.0),
            next_ticket: AtomicU64::new(u64::from(rand::random::<u32>()) + 1),
            positions: Mutex::new(HashMap::new()),
            realized_pnl: Mutex::new(0.0),
        })
    }

    // Advances the replay by one entry. Returns false once the end is reached.
    pub fn tick(&self) -> bool {
        let current_cursor = self.cursor.load(AtomicOrdering::SeqCst);
        if current_cursor < self.data.len() - 1 {
            self.cursor.fetch_add(1, AtomicOrdering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn current_timestamp_secs(&self) -> Option<i64> {
        let current_cursor = self.cursor.load(AtomicOrdering::SeqCst);
        self.data.get(current_cursor).map(|e| e.timestamp / 1000) // stored as ms
    }

    fn quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        let current_cursor = self.cursor.load(AtomicOrdering::SeqCst);
        let entry = self
            .data
            .get(current_cursor)
            .ok_or_else(|| BrokerError::Other("cursor out of bounds".to_string()))?;
        let q = entry.prices.get(symbol).ok_or_else(|| {
            BrokerError::Unavailable(format!(
                "symbol '{}' not found in replay entry at cursor {}",
                symbol, current_cursor
            ))
        })?;
        Ok(Quote {
            bid: q.bid,
            ask: q.ask,
        })
    }

    fn contract_size(&self, symbol: &str) -> f64 {
        self.instruments
            .get(symbol)
            .map(|(_, size)| *size)
            .unwrap_or(1.0)
    }

    fn mark_to_market(&self, position: &OpenPosition) -> (f64, f64) {
        let current = self
            .quote(&position.symbol)
            .map(|q| q.for_side(position.side.opposite()))
            .unwrap_or(position.current_price);
        let direction = match position.side {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        };
        let pnl = direction
            * (current - position.open_price)
            * position.lots
            * self.contract_size(&position.symbol);
        (current, pnl)
    }
}

#[async_trait]
impl Broker for ReplayBroker {
    async fn get_instrument_spec(&self, symbol: &str) -> Result<InstrumentSpec, BrokerError> {
        self.instruments
            .get(symbol)
            .map(|(spec, _)| spec.clone())
            .ok_or_else(|| BrokerError::InstrumentNotFound(symbol.to_string()))
    }

    async fn get_price(&self, symbol: &str) -> Result<Quote, BrokerError> {
        self.quote(symbol)
    }

    async fn place_order(&self, request: &OrderRequest) -> OrderResult {
        if !self.instruments.contains_key(&request.symbol) {
            return OrderResult::rejected(format!("unknown symbol {}", request.symbol));
        }
        let quote = match self.quote(&request.symbol) {
            Ok(q) => q,
            Err(e) => return OrderResult::rejected(e.to_string()),
        };
        if self.fill_probability < 1.0 && rand::random::<f64>() >= self.fill_probability {
            log::info!(
                "[REPLAY] emulated rejection: {} {} {}",
                request.side,
                request.lots,
                request.symbol
            );
            return OrderResult::rejected("emulated rejection");
        }

        let fill_price = quote.for_side(request.side);
        let ticket = self.next_ticket.fetch_add(1, AtomicOrdering::SeqCst);
        let position = OpenPosition {
            ticket,
            symbol: request.symbol.clone(),
            side: request.side,
            lots: request.lots,
            open_price: fill_price,
            current_price: fill_price,
        };
        match self.positions.lock() {
            Ok(mut positions) => {
                positions.insert(ticket, position);
            }
            Err(_) => return OrderResult::rejected("position book poisoned"),
        }
        log::info!(
            "[REPLAY_FILL] ticket={} symbol={} side={} lots={} price={} tag={}",
            ticket,
            request.symbol,
            request.side,
            request.lots,
            fill_price,
            request.tag
        );
        OrderResult::filled(ticket, request.lots, fill_price)
    }

    async fn close_position(&self, ticket: u64, lots: Option<f64>) -> OrderResult {
        let Ok(mut positions) = self.positions.lock() else {
            return OrderResult::rejected("position book poisoned");
        };
        let Some(position) = positions.get(&ticket).cloned() else {
            return OrderResult::rejected(format!("position {} not found", ticket));
        };
        let close_lots = lots.unwrap_or(position.lots).min(position.lots);
        let (price, pnl) = self.mark_to_market(&position);
        let realized = pnl * close_lots / position.lots;
        if close_lots >= position.lots - 1e-12 {
            positions.remove(&ticket);
        } else if let Some(p) = positions.get_mut(&ticket) {
            p.lots -= close_lots;
        }
        drop(positions);
        if let Ok(mut total) = self.realized_pnl.lock() {
            *total += realized;
        }
        log::info!(
            "[REPLAY_CLOSE] ticket={} lots={} price={} pnl={:.2}",
            ticket,
            close_lots,
            price,
            realized
        );
        OrderResult::filled(ticket, close_lots, price)
    }

    async fn get_open_positions(
        &self,
        symbol_filter: Option<&str>,
    ) -> Result<Vec<OpenPosition>, BrokerError> {
        let positions = self
            .positions
            .lock()
            .map_err(|_| BrokerError::Other("position book poisoned".to_string()))?;
        let mut out: Vec<OpenPosition> = positions
            .values()
            .filter(|p| symbol_filter.map_or(true, |s| p.symbol == s))
            .map(|p| {
                let (current, _) = self.mark_to_market(p);
                OpenPosition {
                    current_price: current,
                    ..p.clone()
                }
            })
            .collect();
        out.sort_by_key(|p| p.ticket);
        Ok(out)
    }

    async fn get_account_snapshot(&self) -> Result<AccountSnapshot, BrokerError> {
        let balance = REPLAY_BALANCE
            + *self
                .realized_pnl
                .lock()
                .map_err(|_| BrokerError::Other("pnl poisoned".to_string()))?;
        let positions = self
            .positions
            .lock()
            .map_err(|_| BrokerError::Other("position book poisoned".to_string()))?;
        let mut unrealized = 0.0;
        let mut margin = 0.0;
        for p in positions.values() {
            let (current, pnl) = self.mark_to_market(p);
            unrealized += pnl;
            margin += current * p.lots * self.contract_size(&p.symbol) / REPLAY_LEVERAGE;
        }
        let equity = balance + unrealized;
        Ok(AccountSnapshot {
            balance,
            equity,
            margin,
            margin_free: equity - margin,
        })
    }
}
