//! Execution Module
//!
//! Paper execution gateway:
//! - Global trading-allowed veto applied to every entry
//! - Order planning: minimum profit distance, minimum stop distance
//! - Positions filled at the live quote and tracked in a [`PositionBook`]

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::collaborators::{ExecutionGateway, QuoteSource};
use crate::config::{RiskConfig, SharedFlags};
use crate::position::{PositionBook, TradeRecord};
use crate::utils::types::{AgentId, Direction, OrderRequest, Position, Quote};

/// Fill plan for an order at the current quote
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderPlan {
    pub entry: f64,
    pub target: f64,
    pub stop: f64,
}

/// Price an order against the quote.
///
/// Returns `None` when the target is closer than `min_profit`. A stop
/// closer than `min_stop_distance` is widened to twice that distance.
pub fn plan_order(order: &OrderRequest, quote: &Quote, risk: &RiskConfig) -> Option<OrderPlan> {
    let (entry, profit_distance) = match order.direction {
        Direction::Long => (quote.ask, order.target - quote.ask),
        Direction::Short => (quote.bid, quote.bid - order.target),
    };
    if profit_distance < risk.min_profit {
        return None;
    }

    let stop_distance = match order.direction {
        Direction::Long => entry - order.stop,
        Direction::Short => order.stop - entry,
    };
    let stop = if stop_distance < risk.min_stop_distance {
        let widened = risk.min_stop_distance * 2.0;
        match order.direction {
            Direction::Long => entry - widened,
            Direction::Short => entry + widened,
        }
    } else {
        order.stop
    };

    Some(OrderPlan {
        entry,
        target: order.target,
        stop,
    })
}

/// Paper execution gateway
pub struct PaperExecution {
    book: Arc<PositionBook>,
    quotes: Arc<dyn QuoteSource>,
    flags: Arc<SharedFlags>,
    risk: RiskConfig,
}

impl PaperExecution {
    pub fn new(
        book: Arc<PositionBook>,
        quotes: Arc<dyn QuoteSource>,
        flags: Arc<SharedFlags>,
        risk: RiskConfig,
    ) -> Self {
        Self {
            book,
            quotes,
            flags,
            risk,
        }
    }

    pub fn book(&self) -> &Arc<PositionBook> {
        &self.book
    }

    /// Stop/target and breakeven management for one agent
    pub async fn manage(&self, agent: &AgentId) -> Result<Vec<TradeRecord>> {
        if self.book.for_agent(agent).is_empty() {
            return Ok(Vec::new());
        }
        match self.quotes.quote(&agent.instrument).await? {
            Some(quote) => Ok(self.book.mark_to_market(agent, &quote)),
            None => Ok(Vec::new()),
        }
    }

    /// Close every open position of every agent
    pub async fn close_everything(&self, reason: &str) -> Result<usize> {
        let mut closed = 0;
        for agent in self.book.agents() {
            closed += self.close_agent(&agent, reason).await?;
        }
        Ok(closed)
    }

    async fn close_agent(&self, agent: &AgentId, reason: &str) -> Result<usize> {
        let mut closed = 0;
        for position in self.book.for_agent(agent) {
            if self.close_position(&position.id, reason).await? {
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn exit_price(&self, position: &Position) -> Result<f64> {
        let quote = self.quotes.quote(&position.agent.instrument).await?;
        Ok(match (quote, position.direction) {
            (Some(q), Direction::Long) => q.bid,
            (Some(q), Direction::Short) => q.ask,
            (None, _) => position.entry_price,
        })
    }
}

#[async_trait]
impl ExecutionGateway for PaperExecution {
    async fn open_position(&self, agent: &AgentId, order: OrderRequest) -> Result<Option<String>> {
        if !self.flags.trading_allowed() {
            warn!(agent = %agent, "Order rejected: trading is not allowed");
            return Ok(None);
        }

        let Some(quote) = self.quotes.quote(&agent.instrument).await? else {
            debug!(agent = %agent, "Order skipped: no quote");
            return Ok(None);
        };

        let Some(plan) = plan_order(&order, &quote, &self.risk) else {
            info!(agent = %agent, direction = %order.direction, "Order skipped: profit below minimum");
            return Ok(None);
        };

        let position = Position::new(agent.clone(), order.direction, plan.entry, plan.target, plan.stop);
        Ok(Some(self.book.open(position)))
    }

    async fn close_position(&self, position_id: &str, reason: &str) -> Result<bool> {
        let Some(position) = self.book.get(position_id) else {
            return Ok(false);
        };
        let price = self.exit_price(&position).await?;
        Ok(self.book.close(position_id, price, reason).is_some())
    }

    async fn close_all_for_agent(&self, agent: &AgentId) -> Result<usize> {
        self.close_agent(agent, "Close All").await
    }

    async fn open_positions(&self, agent: &AgentId) -> Result<Vec<Position>> {
        Ok(self.book.for_agent(agent))
    }
}
