pub mod backtest;
pub mod capsule;
pub mod feed;
pub mod indicators;
pub mod ledger;
pub mod live;
pub mod logging;
pub mod metrics;
pub mod risk;
pub mod signals;
pub mod state;
pub mod storage;
