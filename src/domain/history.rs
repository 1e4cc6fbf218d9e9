//! History provider: the only path from a running script to stored data.

use std::sync::Arc;

use tracing::{debug, error};

use crate::domain::row::HistoryPoint;
use crate::ports::data_port::DataPort;

pub const MIN_DAYS: i64 = 1;
pub const MAX_DAYS: i64 = 1000;
pub const DEFAULT_DAYS: i64 = 250;

/// Day count as supplied by a script, before normalisation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RequestedDays {
    Int(i64),
    Float(f64),
    /// Missing, or a value of any other type.
    Invalid,
}

impl RequestedDays {
    /// Clamps to `[MIN_DAYS, MAX_DAYS]`; unusable requests become `DEFAULT_DAYS`.
    pub fn resolve(self) -> usize {
        let days = match self {
            RequestedDays::Int(n) => n.clamp(MIN_DAYS, MAX_DAYS),
            RequestedDays::Float(f) if f.is_finite() => {
                (f.trunc().clamp(MIN_DAYS as f64, MAX_DAYS as f64)) as i64
            }
            RequestedDays::Float(_) | RequestedDays::Invalid => DEFAULT_DAYS,
        };
        days as usize
    }
}

pub struct HistoryProvider {
    port: Arc<dyn DataPort>,
}

impl HistoryProvider {
    pub fn new(port: Arc<dyn DataPort>) -> Self {
        Self { port }
    }

    /// Most-recent-first history for `symbol`. Never fails: an empty symbol or
    /// a store failure yields an empty series.
    pub fn get_history(&self, symbol: &str, days: RequestedDays) -> Vec<HistoryPoint> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Vec::new();
        }
        let limit = days.resolve();
        match self.port.fetch_history(symbol, limit) {
            Ok(mut points) => {
                points.truncate(limit);
                debug!(symbol, limit, returned = points.len(), "history fetched");
                points
            }
            Err(e) => {
                error!(symbol, limit, error = %e, "history query failed");
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for HistoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryProvider").finish_non_exhaustive()
    }
}
