//! Risk Gate
//!
//! Turns a forecast into an entry decision and decides early exits:
//! - Volatility pre-filter on the forecast range
//! - Reward:risk rule on live bid/ask, spread and commission
//! - Trailing-forecast exits when the model's outlook turns against a position

use anyhow::Result;
use tracing::{debug, info};

use crate::collaborators::ExecutionGateway;
use crate::config::RiskConfig;
use crate::utils::types::{AgentId, Direction, Forecast, OrderRequest, Position, Quote, Signal};

/// Why a position is being closed early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    ForecastDrop,
    ForecastRise,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::ForecastDrop => "Forecast Drop",
            ExitReason::ForecastRise => "Forecast Rise",
        }
    }
}

/// Early exit decided by the trailing-forecast check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrailingExit {
    pub position_id: String,
    pub reason: ExitReason,
}

/// Entry evaluation detail, kept for logging
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryEvaluation {
    pub signal: Signal,
    pub profit: f64,
    pub risk: f64,
}

impl EntryEvaluation {
    fn none() -> Self {
        Self {
            signal: Signal::None,
            profit: 0.0,
            risk: 0.0,
        }
    }
}

/// Risk gate for one agent
#[derive(Debug, Clone)]
pub struct RiskGate {
    agent: AgentId,
    commission: f64,
    reward_risk_ratio: f64,
    volatility_filter_ratio: f64,
}

impl RiskGate {
    pub fn new(agent: AgentId, config: &RiskConfig) -> Self {
        Self {
            agent,
            commission: config.commission,
            reward_risk_ratio: config.reward_risk_ratio,
            volatility_filter_ratio: config.volatility_filter_ratio,
        }
    }

    /// Entry decision for a fresh forecast
    pub fn evaluate_entry(&self, quote: &Quote, forecast: &Forecast, volatility: f64) -> Signal {
        self.evaluate(quote, forecast, volatility).signal
    }

    /// Entry decision with the profit and risk that produced it
    pub fn evaluate(&self, quote: &Quote, forecast: &Forecast, volatility: f64) -> EntryEvaluation {
        if forecast.range() < volatility * self.volatility_filter_ratio {
            debug!(
                agent = %self.agent,
                range = forecast.range(),
                volatility,
                "Forecast range too narrow for current volatility"
            );
            return EntryEvaluation::none();
        }

        let spread = quote.spread();

        if forecast.close > quote.ask {
            let profit = forecast.close - quote.ask;
            let risk = (quote.ask - forecast.low) + spread + self.commission;
            if risk > 0.0 && profit >= self.reward_risk_ratio * risk {
                return EntryEvaluation { signal: Signal::Buy, profit, risk };
            }
        } else if forecast.close < quote.bid {
            let profit = quote.bid - forecast.close;
            let risk = (forecast.high - quote.bid) + spread + self.commission;
            if risk > 0.0 && profit >= self.reward_risk_ratio * risk {
                return EntryEvaluation { signal: Signal::Sell, profit, risk };
            }
        }

        EntryEvaluation::none()
    }

    /// Positions whose direction the new forecast has turned against
    pub fn trailing_exits(
        positions: &[Position],
        new_forecast_close: f64,
        previous_forecast_close: Option<f64>,
    ) -> Vec<TrailingExit> {
        let Some(previous) = previous_forecast_close else {
            return Vec::new();
        };

        positions
            .iter()
            .filter_map(|p| match p.direction {
                Direction::Long if new_forecast_close < previous => Some(TrailingExit {
                    position_id: p.id.clone(),
                    reason: ExitReason::ForecastDrop,
                }),
                Direction::Short if new_forecast_close > previous => Some(TrailingExit {
                    position_id: p.id.clone(),
                    reason: ExitReason::ForecastRise,
                }),
                _ => None,
            })
            .collect()
    }

    /// Close this agent's positions that the new forecast no longer supports.
    /// Returns the number of positions closed.
    pub async fn check_trailing_forecast(
        &self,
        gateway: &dyn ExecutionGateway,
        new_forecast_close: f64,
        previous_forecast_close: Option<f64>,
    ) -> Result<usize> {
        if previous_forecast_close.is_none() {
            return Ok(0);
        }

        let positions = gateway.open_positions(&self.agent).await?;
        let exits = Self::trailing_exits(&positions, new_forecast_close, previous_forecast_close);

        let mut closed = 0;
        for exit in exits {
            if gateway.close_position(&exit.position_id, exit.reason.as_str()).await? {
                info!(
                    agent = %self.agent,
                    position = %exit.position_id,
                    reason = exit.reason.as_str(),
                    "Trailing forecast exit"
                );
                metrics::counter!("forecast_supervisor_trailing_exits_total").increment(1);
                closed += 1;
            }
        }
        Ok(closed)
    }
}

/// Order for an entry signal: target at the forecast close, stop at the
/// opposite forecast extreme
pub fn order_for(signal: Signal, forecast: &Forecast) -> Option<OrderRequest> {
    match signal {
        Signal::Buy => Some(OrderRequest {
            direction: Direction::Long,
            target: forecast.close,
            stop: forecast.low,
        }),
        Signal::Sell => Some(OrderRequest {
            direction: Direction::Short,
            target: forecast.close,
            stop: forecast.high,
        }),
        Signal::None => None,
    }
}

/// Hierarchical confirmation: the slow forecast must extend the fast one
/// in the direction the fast forecast moves away from the last close.
pub fn hierarchy_confirms(last_close: f64, fast_close: f64, slow_close: f64) -> bool {
    (fast_close > last_close && slow_close > fast_close)
        || (fast_close < last_close && slow_close < fast_close)
}
