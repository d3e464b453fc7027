//! Simulated broker ledger: cash, long-only positions and a trade log.
//!
//! Buys are not balance-checked, so cash may go negative. Sells are
//! clamped to the held quantity; the log keeps the order as requested.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

use crate::logging::{log_fill, log_order_submit};

/// 5 bps per fill, on the executed notional.
pub const FEE_RATE: f64 = 0.0005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_direction(direction: i8) -> Self {
        if direction >= 0 {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub symbol: String,
    pub qty: f64,
    pub side: Side,
    pub price: f64,
}

impl Order {
    pub fn new(symbol: &str, qty: f64, side: Side, price: f64) -> Result<Self> {
        if !qty.is_finite() || qty < 0.0 {
            bail!("order qty must be finite and non-negative, got {}", qty);
        }
        if !price.is_finite() || price <= 0.0 {
            bail!("order price must be finite and positive, got {}", price);
        }
        Ok(Self { symbol: symbol.to_string(), qty, side, price })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FillAck {
    pub order: Order,
    /// Quantity actually executed (sells may be clamped).
    pub filled_qty: f64,
    pub fee: f64,
    pub cash_after: f64,
    pub position_after: f64,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    cash: f64,
    fee_rate: f64,
    positions: HashMap<String, f64>,
    trades: Vec<Order>,
}

pub type SharedLedger = Arc<Mutex<Ledger>>;

impl Ledger {
    pub fn new(cash: f64) -> Self {
        Self::with_fee_rate(cash, FEE_RATE)
    }

    pub fn with_fee_rate(cash: f64, fee_rate: f64) -> Self {
        Self {
            cash,
            fee_rate,
            positions: HashMap::new(),
            trades: Vec::new(),
        }
    }

    pub fn shared(self) -> SharedLedger {
        Arc::new(Mutex::new(self))
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn position(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).copied().unwrap_or(0.0)
    }

    pub fn positions(&self) -> &HashMap<String, f64> {
        &self.positions
    }

    pub fn trades(&self) -> &[Order] {
        &self.trades
    }

    /// Mark-to-market value given a price per symbol; unpriced holdings count as 0.
    pub fn equity(&self, prices: &HashMap<String, f64>) -> f64 {
        self.cash
            + self
                .positions
                .iter()
                .map(|(s, q)| q * prices.get(s).copied().unwrap_or(0.0))
                .sum::<f64>()
    }

    pub fn submit(&mut self, order: Order) -> FillAck {
        log_order_submit(&order.symbol, order.side.as_str(), order.qty, order.price);
        let held = self.position(&order.symbol);
        let (filled_qty, fee) = match order.side {
            Side::Buy => {
                let notional = order.qty * order.price;
                let fee = notional * self.fee_rate;
                self.cash -= notional + fee;
                self.positions.insert(order.symbol.clone(), held + order.qty);
                (order.qty, fee)
            }
            Side::Sell => {
                let qty = order.qty.min(held.max(0.0));
                let notional = qty * order.price;
                let fee = notional * self.fee_rate;
                self.cash += notional - fee;
                self.positions.insert(order.symbol.clone(), held - qty);
                (qty, fee)
            }
        };
        let position_after = self.position(&order.symbol);
        log_fill(&order.symbol, order.side.as_str(), order.price, filled_qty, fee, self.cash);
        self.trades.push(order.clone());
        FillAck {
            order,
            filled_qty,
            fee,
            cash_after: self.cash,
            position_after,
        }
    }
}

/// Lock the shared ledger, mapping poisoning into an error.
pub fn lock(ledger: &SharedLedger) -> Result<MutexGuard<'_, Ledger>> {
    ledger.lock().map_err(|_| anyhow!("ledger mutex poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buy_charges_notional_plus_fee() {
        let mut ledger = Ledger::new(100_000.0);
        let ack = ledger.submit(Order::new("SPY", 10.0, Side::Buy, 100.0).unwrap());
        assert!((100_000.0 - ledger.cash() - 1000.5).abs() < 1e-9);
        assert_eq!(ledger.position("SPY"), 10.0);
        assert!((ack.fee - 0.5).abs() < 1e-12);
        assert_eq!(ack.filled_qty, 10.0);
    }

    #[test]
    fn test_sell_clamped_to_holdings() {
        let mut ledger = Ledger::new(0.0);
        ledger.submit(Order::new("QQQ", 5.0, Side::Buy, 10.0).unwrap());
        let cash_before = ledger.cash();
        let ack = ledger.submit(Order::new("QQQ", 8.0, Side::Sell, 12.0).unwrap());
        assert_eq!(ack.filled_qty, 5.0);
        assert_eq!(ledger.position("QQQ"), 0.0);
        let expected = 5.0 * 12.0 * (1.0 - FEE_RATE);
        assert!((ledger.cash() - cash_before - expected).abs() < 1e-9);
        // log keeps the unclamped request
        assert_eq!(ledger.trades()[1].qty, 8.0);
    }

    #[test]
    fn test_sell_without_position_is_noop_fill() {
        let mut ledger = Ledger::new(1_000.0);
        let ack = ledger.submit(Order::new("VTI", 3.0, Side::Sell, 50.0).unwrap());
        assert_eq!(ack.filled_qty, 0.0);
        assert_eq!(ack.fee, 0.0);
        assert_eq!(ledger.cash(), 1_000.0);
        assert_eq!(ledger.position("VTI"), 0.0);
        assert_eq!(ledger.trades().len(), 1);
    }

    #[test]
    fn test_positions_never_negative() {
        let mut ledger = Ledger::new(10_000.0);
        let script = [
            (Side::Sell, 1.0),
            (Side::Buy, 2.5),
            (Side::Sell, 1.0),
            (Side::Sell, 4.0),
            (Side::Buy, 0.5),
            (Side::Sell, 0.25),
            (Side::Sell, 100.0),
        ];
        for (side, qty) in script {
            ledger.submit(Order::new("BTC-USD", qty, side, 20.0).unwrap());
            assert!(ledger.position("BTC-USD") >= 0.0);
        }
        assert_eq!(ledger.trades().len(), script.len());
    }

    #[test]
    fn test_buy_may_overdraw_cash() {
        let mut ledger = Ledger::new(100.0);
        ledger.submit(Order::new("ETH-USD", 1.0, Side::Buy, 1_000.0).unwrap());
        assert!(ledger.cash() < 0.0);
    }

    #[test]
    fn test_order_validation() {
        assert!(Order::new("SPY", -1.0, Side::Buy, 10.0).is_err());
        assert!(Order::new("SPY", 1.0, Side::Buy, 0.0).is_err());
        assert!(Order::new("SPY", f64::NAN, Side::Sell, 10.0).is_err());
        assert!(Order::new("SPY", 0.0, Side::Sell, 10.0).is_ok());
    }

    #[test]
    fn test_equity_marks_positions() {
        let mut ledger = Ledger::with_fee_rate(1_000.0, 0.0);
        ledger.submit(Order::new("SPY", 2.0, Side::Buy, 100.0).unwrap());
        let prices: HashMap<String, f64> = [("SPY".to_string(), 150.0)].into_iter().collect();
        assert_eq!(ledger.equity(&prices), 800.0 + 300.0);
    }

    #[test]
    fn test_side_from_direction() {
        assert_eq!(Side::from_direction(1), Side::Buy);
        assert_eq!(Side::from_direction(0), Side::Buy);
        assert_eq!(Side::from_direction(-1), Side::Sell);
    }
}
