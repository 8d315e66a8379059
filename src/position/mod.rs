//! Position Book
//!
//! Paper position tracking:
//! - Open positions keyed by id, owned by one agent each
//! - Stop/target hits against live quotes
//! - Breakeven once price has covered half the distance to target
//! - Realized P&L and closed-trade history

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::utils::types::{AgentId, Direction, Position, Quote};

/// Fraction of the target distance after which the stop moves to entry
pub const BREAKEVEN_TRIGGER: f64 = 0.5;
const MAX_HISTORY: usize = 1000;

/// Atomic floating point wrapper using u64 bit representation
#[derive(Debug, Default)]
pub struct AtomicF64 {
    inner: AtomicU64,
}

impl AtomicF64 {
    pub fn new(val: f64) -> Self {
        Self {
            inner: AtomicU64::new(val.to_bits()),
        }
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.inner.load(Ordering::SeqCst))
    }

    pub fn fetch_add(&self, delta: f64) -> f64 {
        let mut current = self.inner.load(Ordering::SeqCst);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .inner
                .compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(previous) => return f64::from_bits(previous),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Closed trade
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub position_id: String,
    pub agent: AgentId,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub reason: String,
    pub closed_at: i64,
}

/// Paper position store
pub struct PositionBook {
    open: DashMap<String, Position>,
    realized_pnl: AtomicF64,
    history: RwLock<Vec<TradeRecord>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            open: DashMap::new(),
            realized_pnl: AtomicF64::new(0.0),
            history: RwLock::new(Vec::new()),
        }
    }

    pub fn open(&self, position: Position) -> String {
        let id = position.id.clone();
        info!(
            agent = %position.agent,
            position = %id,
            direction = %position.direction,
            entry = position.entry_price,
            target = position.target,
            stop = position.stop,
            "Position opened"
        );
        self.open.insert(id.clone(), position);
        id
    }

    pub fn get(&self, id: &str) -> Option<Position> {
        self.open.get(id).map(|p| p.value().clone())
    }

    pub fn for_agent(&self, agent: &AgentId) -> Vec<Position> {
        self.open
            .iter()
            .filter(|p| &p.agent == agent)
            .map(|p| p.value().clone())
            .collect()
    }

    pub fn agents(&self) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self.open.iter().map(|p| p.agent.clone()).collect();
        agents.sort();
        agents.dedup();
        agents
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Close at `exit_price`; `None` if the position is not open
    pub fn close(&self, id: &str, exit_price: f64, reason: &str) -> Option<TradeRecord> {
        let (_, position) = self.open.remove(id)?;
        let pnl = position.favourable_move(exit_price);
        self.realized_pnl.fetch_add(pnl);

        let record = TradeRecord {
            position_id: position.id,
            agent: position.agent,
            direction: position.direction,
            entry_price: position.entry_price,
            exit_price,
            pnl,
            reason: reason.to_string(),
            closed_at: chrono::Utc::now().timestamp_millis(),
        };
        info!(
            agent = %record.agent,
            position = %record.position_id,
            exit = exit_price,
            pnl,
            reason,
            "Position closed"
        );

        let mut history = self.history.write();
        history.push(record.clone());
        if history.len() > MAX_HISTORY {
            history.remove(0);
        }
        Some(record)
    }

    /// Apply stop/target hits and breakeven moves for one agent's positions
    pub fn mark_to_market(&self, agent: &AgentId, quote: &Quote) -> Vec<TradeRecord> {
        let mut exits = Vec::new();
        for position in self.for_agent(agent) {
            // Longs exit at the bid, shorts at the ask
            let price = match position.direction {
                Direction::Long => quote.bid,
                Direction::Short => quote.ask,
            };

            let stop_hit = match position.direction {
                Direction::Long => price <= position.stop,
                Direction::Short => price >= position.stop,
            };
            let target_hit = match position.direction {
                Direction::Long => price >= position.target,
                Direction::Short => price <= position.target,
            };

            if stop_hit {
                exits.extend(self.close(&position.id, price, "Stop Loss"));
            } else if target_hit {
                exits.extend(self.close(&position.id, price, "Take Profit"));
            } else if breakeven_due(&position, price) {
                if let Some(mut open) = self.open.get_mut(&position.id) {
                    open.stop = open.entry_price;
                    info!(agent = %agent, position = %position.id, "Stop moved to breakeven");
                }
            }
        }
        exits
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl.load()
    }

    pub fn history(&self) -> Vec<TradeRecord> {
        self.history.read().clone()
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

fn breakeven_due(position: &Position, price: f64) -> bool {
    let target_distance = match position.direction {
        Direction::Long => position.target - position.entry_price,
        Direction::Short => position.entry_price - position.target,
    };
    let stop_below_entry = match position.direction {
        Direction::Long => position.stop < position.entry_price,
        Direction::Short => position.stop > position.entry_price,
    };
    target_distance > 0.0
        && stop_below_entry
        && position.favourable_move(price) >= target_distance * BREAKEVEN_TRIGGER
}
