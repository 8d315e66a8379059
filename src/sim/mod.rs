//! Simulation collaborators
//!
//! Synthetic stand-ins for the market feed and the forecast model, used in
//! simulation mode and by the integration tests:
//! - [`SimMarket`]: seeded random-walk OHLC bars per agent with an ATR volatility
//! - [`SimModel`]: naive forecaster (last close plus momentum, ATR bands)

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::collaborators::{
    FineTuneRequest, ForecastModel, MarketDataProvider, PerformanceReport, QuoteSource, TrainingPlan,
};
use crate::utils::helpers::{average_true_range, mean};
use crate::utils::types::{AgentId, Bar, Forecast, MarketWindow, Quote};

const ATR_PERIOD: usize = 14;
const MAX_SERIES_LEN: usize = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_start_price")]
    pub start_price: f64,
    /// Largest close-to-close move of one bar
    #[serde(default = "default_step")]
    pub step: f64,
    #[serde(default = "default_spread")]
    pub spread: f64,
    /// Bars generated before the first window is served
    #[serde(default = "default_history_bars")]
    pub history_bars: usize,
    /// Simulated duration of a full retrain
    #[serde(default)]
    pub train_delay_ms: u64,
}

fn default_seed() -> u64 { 42 }
fn default_start_price() -> f64 { 100.0 }
fn default_step() -> f64 { 1.0 }
fn default_spread() -> f64 { 0.02 }
fn default_history_bars() -> usize { 500 }

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            start_price: default_start_price(),
            step: default_step(),
            spread: default_spread(),
            history_bars: default_history_bars(),
            train_delay_ms: 0,
        }
    }
}

/// Bar length in seconds for a timeframe label such as `M15`, `H1` or `D1`
pub fn timeframe_seconds(timeframe: &str) -> i64 {
    let (unit, count) = timeframe.split_at(timeframe.len().min(1));
    let count: i64 = count.parse().unwrap_or(1).max(1);
    match unit {
        "M" => 60 * count,
        "H" => 3_600 * count,
        "D" => 86_400 * count,
        "W" => 604_800 * count,
        _ => 3_600,
    }
}

/// Timeframes of one instrument share a price path
fn instrument_seed(seed: u64, instrument: &str) -> u64 {
    // FNV-1a
    instrument
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325 ^ seed, |hash, b| {
            (hash ^ b as u64).wrapping_mul(0x0100_0000_01b3)
        })
}

struct Series {
    bars: Vec<Bar>,
    rng: StdRng,
    step_secs: i64,
}

impl Series {
    fn new(agent: &AgentId, config: &SimConfig) -> Self {
        let mut series = Self {
            bars: Vec::with_capacity(config.history_bars + 1),
            rng: StdRng::seed_from_u64(instrument_seed(config.seed, &agent.instrument)),
            step_secs: timeframe_seconds(&agent.timeframe),
        };
        for _ in 0..config.history_bars.max(2) {
            series.advance(config);
        }
        series
    }

    fn advance(&mut self, config: &SimConfig) -> Bar {
        let (time, open) = match self.bars.last() {
            Some(prev) => (prev.time + self.step_secs, prev.close),
            None => (0, config.start_price),
        };
        let step = config.step;
        let close = (open + self.rng.gen_range(-step..=step)).max(step);
        let high = open.max(close) + self.rng.gen_range(0.0..=step / 2.0);
        let low = (open.min(close) - self.rng.gen_range(0.0..=step / 2.0)).max(step / 2.0);
        let bar = Bar {
            time,
            open,
            high,
            low,
            close,
            volume: self.rng.gen_range(100.0..1_000.0),
        };

        self.bars.push(bar);
        if self.bars.len() > MAX_SERIES_LEN {
            self.bars.remove(0);
        }
        bar
    }

    fn tail(&self, n: usize) -> &[Bar] {
        &self.bars[self.bars.len().saturating_sub(n)..]
    }

    fn volatility(&self) -> Option<f64> {
        average_true_range(self.tail(ATR_PERIOD + 1), ATR_PERIOD)
    }
}

/// Random-walk market shared by all simulated agents
pub struct SimMarket {
    config: SimConfig,
    series: DashMap<AgentId, Series>,
    last_price: DashMap<String, f64>,
}

impl SimMarket {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            series: DashMap::new(),
            last_price: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Close one more bar for `agent`
    pub fn advance(&self, agent: &AgentId) -> Bar {
        let mut series = self
            .series
            .entry(agent.clone())
            .or_insert_with(|| Series::new(agent, &self.config));
        let bar = series.advance(&self.config);
        self.last_price.insert(agent.instrument.clone(), bar.close);
        bar
    }

    pub fn bars(&self, agent: &AgentId, limit: usize) -> Vec<Bar> {
        self.series
            .entry(agent.clone())
            .or_insert_with(|| Series::new(agent, &self.config))
            .tail(limit)
            .to_vec()
    }

    pub fn volatility(&self, agent: &AgentId) -> Option<f64> {
        self.series
            .entry(agent.clone())
            .or_insert_with(|| Series::new(agent, &self.config))
            .volatility()
    }
}

#[async_trait]
impl MarketDataProvider for SimMarket {
    /// Every call closes a new bar
    async fn latest_window(&self, agent: &AgentId, window_size: usize) -> Result<Option<MarketWindow>> {
        self.advance(agent);
        let bars = self.bars(agent, window_size);
        let Some(volatility) = self.volatility(agent) else {
            return Ok(None);
        };
        Ok(Some(MarketWindow { bars, volatility }))
    }

    async fn recent_bars(&self, agent: &AgentId, limit: usize) -> Result<Vec<Bar>> {
        Ok(self.bars(agent, limit))
    }

    async fn latest_volatility(&self, agent: &AgentId) -> Result<Option<f64>> {
        Ok(self.volatility(agent))
    }
}

#[async_trait]
impl QuoteSource for SimMarket {
    async fn quote(&self, instrument: &str) -> Result<Option<Quote>> {
        Ok(self.last_price.get(instrument).map(|price| {
            let half = self.config.spread / 2.0;
            Quote {
                bid: *price - half,
                ask: *price + half,
            }
        }))
    }
}

/// Naive forecaster over a [`SimMarket`]
pub struct SimModel {
    market: Arc<SimMarket>,
    /// Added to every forecast close
    bias: f64,
    rejecting: AtomicBool,
    trained: DashMap<AgentId, u32>,
    fine_tunes: DashMap<AgentId, u32>,
}

impl SimModel {
    pub fn new(market: Arc<SimMarket>) -> Self {
        Self {
            market,
            bias: 0.0,
            rejecting: AtomicBool::new(false),
            trained: DashMap::new(),
            fine_tunes: DashMap::new(),
        }
    }

    pub fn with_bias(mut self, bias: f64) -> Self {
        self.bias = bias;
        self
    }

    /// Make every performance test fail with a large error
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn retrain_count(&self, agent: &AgentId) -> u32 {
        self.trained.get(agent).map(|n| *n).unwrap_or(0)
    }

    pub fn fine_tune_count(&self, agent: &AgentId) -> u32 {
        self.fine_tunes.get(agent).map(|n| *n).unwrap_or(0)
    }

    fn forecast(&self, bars: &[Bar]) -> Option<Forecast> {
        let last = bars.last()?;
        let momentum = match bars.len() {
            0 | 1 => 0.0,
            n => (last.close - bars[n - 2].close) * 0.5,
        };
        let band = average_true_range(bars, ATR_PERIOD).unwrap_or(last.high - last.low);
        let close = last.close + momentum + self.bias;
        Some(Forecast::new(close, close + band, close - band))
    }
}

#[async_trait]
impl ForecastModel for SimModel {
    async fn load_weights(&self, agent: &AgentId) -> Result<bool> {
        Ok(self.retrain_count(agent) > 0)
    }

    async fn predict(&self, _agent: &AgentId, window: &[Bar]) -> Result<Forecast> {
        self.forecast(window)
            .ok_or_else(|| anyhow::anyhow!("empty window"))
    }

    async fn full_retrain(&self, agent: &AgentId, _plan: &TrainingPlan) -> Result<bool> {
        let delay = self.market.config().train_delay_ms;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        *self.trained.entry(agent.clone()).or_insert(0) += 1;
        Ok(true)
    }

    async fn fine_tune(&self, agent: &AgentId, _recent: &[Bar], _request: &FineTuneRequest) -> Result<()> {
        *self.fine_tunes.entry(agent.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn evaluate_performance(&self, agent: &AgentId) -> Result<PerformanceReport> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Ok(PerformanceReport { passed: false, error_metric: f64::MAX });
        }

        let bars = self.market.bars(agent, 60);
        let errors: Vec<f64> = (ATR_PERIOD + 1..bars.len())
            .filter_map(|i| self.forecast(&bars[..i]).map(|f| f.squared_error(&bars[i])))
            .collect();
        let error_metric = mean(errors.into_iter()).unwrap_or(0.0);
        Ok(PerformanceReport { passed: true, error_metric })
    }
}
