/*
[INPUT]:  YAML configuration file
[OUTPUT]: Parsed and validated engine configuration
[POS]:    Configuration layer - engine setup
[UPDATE]: When adding new configuration options
*/

use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Quoting mode. Offset-Maker additionally watches depth imbalance and keeps
/// the protective stop pinned to the current quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteMode {
    #[default]
    Maker,
    OffsetMaker,
}

/// Configuration for one engine instance (one account, one symbol).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Trading symbol (e.g., "BTCUSDT")
    pub symbol: String,
    #[serde(default)]
    pub mode: QuoteMode,
    /// Tick period in milliseconds
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    /// Minimum price increment
    pub price_tick: Decimal,
    /// Minimum quantity increment
    pub qty_step: Decimal,
    /// Base entry quantity
    pub trade_amount: Decimal,
    /// Entry size multiplier (>= 1)
    #[serde(default = "default_volume_boost")]
    pub volume_boost: Decimal,
    /// Offset below top bid for entry buys
    #[serde(default)]
    pub bid_offset: Decimal,
    /// Offset above top ask for entry sells
    #[serde(default)]
    pub ask_offset: Decimal,
    /// Stop-loss target in quote currency
    pub loss_limit: Decimal,
    /// Slippage guard for reduce-only closes (fraction, e.g. 0.05 = 5%)
    #[serde(default = "default_max_close_slippage_pct")]
    pub max_close_slippage_pct: Decimal,
    /// Force IOC limit orders for closes instead of market orders
    #[serde(default)]
    pub strict_limit_only: bool,
    /// Minimum time between reprices of a same-side entry; defaults to
    /// max(1500ms, 3x refresh interval) when unset
    #[serde(default)]
    pub reprice_dwell_ms: Option<u64>,
    /// Minimum tick distance before an entry is repriced
    #[serde(default = "default_min_reprice_ticks")]
    pub min_reprice_ticks: u32,
    /// Trade log ring capacity
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

fn default_refresh_interval_ms() -> u64 {
    1_000
}

fn default_volume_boost() -> Decimal {
    Decimal::ONE
}

fn default_max_close_slippage_pct() -> Decimal {
    // 5%
    Decimal::new(5, 2)
}

fn default_min_reprice_ticks() -> u32 {
    1
}

fn default_max_log_entries() -> usize {
    200
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {path}"))?;
        let config: Self = serde_yaml::from_str(&content).context("parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            bail!("symbol must not be empty");
        }
        if self.refresh_interval_ms == 0 {
            bail!("refresh_interval_ms must be positive");
        }
        if self.price_tick <= Decimal::ZERO {
            bail!("price_tick must be positive");
        }
        if self.qty_step <= Decimal::ZERO {
            bail!("qty_step must be positive");
        }
        if self.trade_amount <= Decimal::ZERO {
            bail!("trade_amount must be positive");
        }
        if self.volume_boost < Decimal::ONE {
            bail!("volume_boost must be >= 1");
        }
        if self.bid_offset < Decimal::ZERO || self.ask_offset < Decimal::ZERO {
            bail!("quote offsets must be >= 0");
        }
        if self.loss_limit <= Decimal::ZERO {
            bail!("loss_limit must be positive");
        }
        if self.max_close_slippage_pct <= Decimal::ZERO {
            bail!("max_close_slippage_pct must be positive");
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Dwell window between reprices of a same-side entry.
    pub fn reprice_dwell(&self) -> Duration {
        match self.reprice_dwell_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis(1_500).max(3 * self.refresh_interval()),
        }
    }

    /// Coordinator slot-lock deadline.
    pub fn lock_timeout(&self) -> Duration {
        4 * self.refresh_interval()
    }

    /// Decimal places implied by the price tick (0.1 -> 1, 0.01 -> 2).
    pub fn tick_decimals(&self) -> u32 {
        self.price_tick.normalize().scale()
    }
}
