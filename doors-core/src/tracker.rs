//! Result ledger: execute each delivered call once, buffer outcomes until uploaded.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::package::{Call, Package, Payload, Seq};

/// Outcome of one executed call: value, or error message.
pub type Outcome = Result<Value, String>;

/// Buffered outcomes keyed by the package's end sequence number.
pub type Results = BTreeMap<Seq, Outcome>;

/// Host side of call execution.
pub trait ActionExecutor {
    fn execute(&mut self, call: &Call, payload: &Payload) -> Outcome;
}

impl<F> ActionExecutor for F
where
    F: FnMut(&Call, &Payload) -> Outcome,
{
    fn execute(&mut self, call: &Call, payload: &Payload) -> Outcome {
        self(call, payload)
    }
}

pub struct Tracker {
    buffered: Results,
    /// Highest sequence number already executed.
    executed_through: Seq,
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            buffered: Results::new(),
            executed_through: 0,
        }
    }

    /// Execute the package's call (if any) and buffer its outcome.
    pub fn process(&mut self, package: &Package, executor: &mut dyn ActionExecutor) {
        if package.end <= self.executed_through {
            warn!(end = package.end, "package already executed, skipping");
            return;
        }
        self.executed_through = package.end;
        let Some(call) = &package.call else {
            return;
        };
        let outcome = executor.execute(call, &package.payload);
        if let Err(e) = &outcome {
            debug!(seq = package.end, action = %call.action, error = %e, "action failed");
        }
        self.buffered.insert(package.end, outcome);
    }

    /// Take everything buffered for upload.
    pub fn collect(&mut self) -> Results {
        std::mem::take(&mut self.buffered)
    }

    /// Put back results whose upload was never acknowledged.
    pub fn give_back(&mut self, results: Results) {
        for (seq, outcome) in results {
            self.buffered.entry(seq).or_insert(outcome);
        }
    }

    pub fn is_done(&self) -> bool {
        self.buffered.is_empty()
    }

    pub fn executed_through(&self) -> Seq {
        self.executed_through
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}
