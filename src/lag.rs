//! Look-back delay features.
//!
//! Lags are positional: slot `n` holds the `n`-th most recent stored delay
//! of the line strictly before the target time, whatever its age. Missing
//! periods shift the slots instead of leaving gaps.

use crate::model::{LaggedFeatureRow, LineName};
use chrono::{DateTime, Utc};

/// Look-back offsets in minutes, one per lag slot.
pub const DEFAULT_LAG_OFFSETS: [u32; 4] = [15, 30, 45, 60];

/// A stored `delay_current` value of a line.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayObservation {
    pub timestamp: DateTime<Utc>,
    pub line: LineName,
    pub delay_current: Option<f64>,
}

/// Observations of `line` strictly before `before`, most recent first.
pub fn prior_observations(
    history: &[DelayObservation],
    line: LineName,
    before: DateTime<Utc>,
) -> Vec<&DelayObservation> {
    let mut prior: Vec<_> = history
        .iter()
        .filter(|o| o.line == line && o.timestamp < before)
        .collect();
    prior.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    prior
}

/// The first `slots` prior delays of `line`; slots past the available
/// history are `None`.
pub fn lagged_delays(
    history: &[DelayObservation],
    line: LineName,
    before: DateTime<Utc>,
    slots: usize,
) -> Vec<Option<f64>> {
    let prior = prior_observations(history, line, before);
    (0..slots)
        .map(|i| prior.get(i).and_then(|o| o.delay_current))
        .collect()
}

/// Joins the current delay of `line` with its lagged values.
pub fn lagged_row(
    history: &[DelayObservation],
    line: LineName,
    timestamp: DateTime<Utc>,
    delay_current: Option<f64>,
    offsets: &[u32],
) -> LaggedFeatureRow {
    let lags = lagged_delays(history, line, timestamp, offsets.len());
    LaggedFeatureRow {
        timestamp,
        line,
        delay_current,
        lags: offsets.iter().copied().zip(lags).collect(),
    }
}
