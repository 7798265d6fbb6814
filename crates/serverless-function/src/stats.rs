//! Phase transition statistics
//!
//! Records how long a Function took to reach each True condition. A
//! transition is recorded once per `(Function, ConditionType)` and
//! generation: a new generation forgets what was recorded for the previous
//! one and starts timing from the moment it was first observed. Entries are
//! keyed by `namespace/name`; a Function recreated under the same name gets
//! a new UID and starts over.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use parking_lot::Mutex;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use serverless_common::crd::{Condition, ConditionStatus, ConditionType, Function, SourceType};
use serverless_common::metrics::record_phase_transition;

/// Receives every condition the reconciler persists
#[cfg_attr(test, automock)]
pub trait StatsCollector: Send + Sync {
    /// Account for `condition` just written on `function`
    fn update_reconcile_stats(&self, function: &Function, condition: &Condition);

    /// Drop whatever is kept for the Function stored under `namespace/name`
    fn forget_function(&self, namespace: &str, name: &str);
}

#[derive(Debug)]
struct Tracked {
    uid: String,
    generation: i64,
    started: DateTime<Utc>,
    recorded: HashSet<ConditionType>,
}

fn tracking_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// [`StatsCollector`] feeding the phase transition histogram
#[derive(Debug, Default)]
pub struct PhaseStatsCollector {
    tracked: Mutex<HashMap<String, Tracked>>,
}

impl PhaseStatsCollector {
    /// Empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Seconds to report for `condition`, or `None` when nothing is recorded
    fn observe(&self, function: &Function, condition: &Condition, now: DateTime<Utc>) -> Option<f64> {
        if condition.status != ConditionStatus::True {
            return None;
        }
        let uid = function.uid()?;
        let generation = function.metadata.generation.unwrap_or_default();
        let key = tracking_key(
            &function.namespace().unwrap_or_default(),
            &function.name_any(),
        );

        let mut tracked = self.tracked.lock();
        let entry = tracked.entry(key).or_insert_with(|| Tracked {
            uid: uid.clone(),
            generation,
            started: function
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .unwrap_or(now),
            recorded: HashSet::new(),
        });
        if entry.uid != uid {
            entry.uid = uid;
            entry.generation = generation;
            entry.started = function
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .unwrap_or(now);
            entry.recorded.clear();
        } else if entry.generation != generation {
            entry.generation = generation;
            entry.started = now;
            entry.recorded.clear();
        }
        if !entry.recorded.insert(condition.type_) {
            return None;
        }
        let elapsed = (now - entry.started).num_milliseconds().max(0) as f64 / 1000.0;
        Some(elapsed)
    }
}

impl StatsCollector for PhaseStatsCollector {
    fn update_reconcile_stats(&self, function: &Function, condition: &Condition) {
        if let Some(seconds) = self.observe(function, condition, Utc::now()) {
            let source = match function.spec.source_type() {
                SourceType::Inline => "inline",
                SourceType::Git => "git",
            };
            debug!(
                function = %function.name_any(),
                condition = %condition.type_,
                seconds,
                "phase reached"
            );
            record_phase_transition(condition.type_, source, seconds);
        }
    }

    fn forget_function(&self, namespace: &str, name: &str) {
        self.tracked.lock().remove(&tracking_key(namespace, name));
    }
}
