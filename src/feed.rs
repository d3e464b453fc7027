//! Tick streams.
//!
//! A producer task emits `PriceTick`s into a per-symbol channel; the live
//! loop consumes the receiving end through `TickSource`. The producer stops
//! when its receiver is dropped and is aborted when its `FeedHandle` drops.

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickSourceTag {
    Simulated,
    Replay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub ts_ns: i64,
    pub price: f64,
    pub source: TickSourceTag,
}

impl PriceTick {
    pub fn now(symbol: &str, price: f64, source: TickSourceTag) -> Self {
        Self {
            symbol: symbol.to_string(),
            ts_ns: Utc::now().timestamp_nanos_opt().unwrap_or(0),
            price,
            source,
        }
    }
}

#[async_trait]
pub trait TickSource: Send {
    /// Next tick, or `None` once the stream has ended or broken.
    async fn next_tick(&mut self) -> Option<PriceTick>;
}

#[async_trait]
impl TickSource for mpsc::Receiver<PriceTick> {
    async fn next_tick(&mut self) -> Option<PriceTick> {
        self.recv().await
    }
}

#[async_trait]
impl<T: TickSource + ?Sized> TickSource for Box<T> {
    async fn next_tick(&mut self) -> Option<PriceTick> {
        (**self).next_tick().await
    }
}

/// Owns a producer task; dropping it aborts the producer.
#[derive(Debug)]
pub struct FeedHandle {
    producer: JoinHandle<()>,
}

impl FeedHandle {
    pub fn abort(&self) {
        self.producer.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.producer.is_finished()
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

// =============================================================================
// Simulated source
// =============================================================================

/// Mean-reverting random walk around 100, floored at 0.01.
#[derive(Debug, Clone)]
pub struct RandomWalk {
    price: f64,
    rng: StdRng,
}

impl RandomWalk {
    pub const ANCHOR: f64 = 100.0;
    const SHOCK_STD: f64 = 0.05;
    const REVERSION: f64 = 0.01;
    const FLOOR: f64 = 0.01;

    pub fn new(seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let price = Self::ANCHOR + rng.gen::<f64>();
        Self { price, rng }
    }

    /// Standard normal via Box-Muller.
    fn gaussian(&mut self) -> f64 {
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    pub fn step(&mut self) -> f64 {
        let shock = self.gaussian() * Self::SHOCK_STD;
        self.price += shock - Self::REVERSION * (self.price - Self::ANCHOR);
        self.price = self.price.max(Self::FLOOR);
        self.price
    }
}

pub struct SimulatedFeed;

impl SimulatedFeed {
    /// Spawn a producer for `symbol` emitting one tick per `interval`.
    pub fn spawn(
        symbol: &str,
        interval: Duration,
        seed: Option<u64>,
    ) -> (mpsc::Receiver<PriceTick>, FeedHandle) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let symbol = symbol.to_string();
        let producer = tokio::spawn(async move {
            let mut walk = RandomWalk::new(seed);
            loop {
                let tick = PriceTick::now(&symbol, walk.step(), TickSourceTag::Simulated);
                if tx.send(tick).await.is_err() {
                    break;
                }
                sleep(interval).await;
            }
        });
        (rx, FeedHandle { producer })
    }
}

/// Emit a finite sequence of prices as ticks, then close the stream.
pub fn replay_feed(symbol: &str, prices: Vec<f64>) -> (mpsc::Receiver<PriceTick>, FeedHandle) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let symbol = symbol.to_string();
    let producer = tokio::spawn(async move {
        for (i, price) in prices.into_iter().enumerate() {
            let tick = PriceTick {
                symbol: symbol.clone(),
                ts_ns: i as i64,
                price,
                source: TickSourceTag::Replay,
            };
            if tx.send(tick).await.is_err() {
                break;
            }
        }
    });
    (rx, FeedHandle { producer })
}
