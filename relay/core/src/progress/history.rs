//! Totals of completed streams, shared across streams
//!
//! Every [`StreamPipeline`](crate::StreamPipeline) seeds its estimator from
//! this store when it opens and records its total when it finishes, so the
//! estimate of the next stream for the same model is calibrated by the ones
//! before it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::MAX_HISTORICAL_TOTALS;

/// Key used for streams without a model
const GENERIC_KEY: &str = "";

/// Recent stream totals per model
///
/// Cloning is cheap and every clone shares the same store.
#[derive(Clone, Debug, Default)]
pub struct CompletionHistory {
    totals: Arc<Mutex<HashMap<String, VecDeque<u64>>>>,
}

impl CompletionHistory {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Totals recorded for `model`, oldest first
    #[must_use]
    pub fn totals(&self, model: Option<&str>) -> Vec<u64> {
        self.totals
            .lock()
            .get(model.unwrap_or(GENERIC_KEY))
            .map(|totals| totals.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Record the total of a finished stream
    ///
    /// Keeps the last [`MAX_HISTORICAL_TOTALS`] per model. Empty streams are
    /// not recorded.
    pub fn record(&self, model: Option<&str>, total: u64) {
        if total == 0 {
            return;
        }
        let key = model.unwrap_or(GENERIC_KEY);
        let mut totals = self.totals.lock();
        let entry = totals.entry(key.to_string()).or_default();
        if entry.len() == MAX_HISTORICAL_TOTALS {
            entry.pop_front();
        }
        entry.push_back(total);
        tracing::trace!(model = key, total, recorded = entry.len(), "Stream total recorded");
    }

    /// Drop every recorded total
    pub fn clear(&self) {
        self.totals.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_are_kept_per_model() {
        let history = CompletionHistory::new();
        history.record(Some("llama3"), 300);
        history.record(None, 120);
        history.record(Some("llama3"), 340);

        assert_eq!(history.totals(Some("llama3")), vec![300, 340]);
        assert_eq!(history.totals(None), vec![120]);
        assert!(history.totals(Some("gpt-4")).is_empty());
    }

    #[test]
    fn test_oldest_total_dropped_at_cap() {
        let history = CompletionHistory::new();
        for total in 1..=(MAX_HISTORICAL_TOTALS as u64 + 3) {
            history.record(None, total);
        }
        let totals = history.totals(None);
        assert_eq!(totals.len(), MAX_HISTORICAL_TOTALS);
        assert_eq!(totals[0], 4);
    }

    #[test]
    fn test_clones_share_state_and_empty_streams_skip() {
        let history = CompletionHistory::new();
        let other = history.clone();
        other.record(None, 0);
        other.record(None, 50);
        assert_eq!(history.totals(None), vec![50]);

        history.clear();
        assert!(other.totals(None).is_empty());
    }
}
