//! `reports` actuator
//!
//! Prints the expanded promiser. Repeated convergence passes would emit the
//! same line several times, so duplicates within one run are suppressed.

use accord_core::{AccordResult, Outcome, Promise};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::actuators::Actuator;
use crate::context::EvalContext;
use crate::state::EngineState;

pub struct ReportsActuator {
    seen: Mutex<HashSet<String>>,
    sink: Option<Arc<Mutex<Vec<String>>>>,
}

impl ReportsActuator {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            sink: None,
        }
    }

    /// Collect reports into `sink` as well as printing them; used by
    /// embedders and tests.
    pub fn with_sink(sink: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            sink: Some(sink),
        }
    }
}

impl Default for ReportsActuator {
    fn default() -> Self {
        Self::new()
    }
}

impl Actuator for ReportsActuator {
    fn actuate(
        &self,
        _state: &EngineState,
        _ctx: &mut EvalContext,
        promise: &Promise,
        _now: i64,
    ) -> AccordResult<Outcome> {
        let message = promise.promiser.clone();

        let fresh = match self.seen.lock() {
            Ok(mut seen) => seen.insert(message.clone()),
            Err(_) => true,
        };
        if !fresh {
            return Ok(Outcome::Kept);
        }

        println!("{}", message);
        if let Some(sink) = &self.sink {
            if let Ok(mut sink) = sink.lock() {
                sink.push(message);
            }
        }
        Ok(Outcome::Kept)
    }
}
