//! Engine state
//!
//! Everything process-wide that the original design kept in globals lives in
//! one [`EngineState`] value created at startup and threaded through every
//! call; the only permitted global is the pending-termination flag in
//! [`term`](crate::term).

use accord_core::{AccordResult, AgentConfig};
use accord_store::{LockRegistry, StoreRegistry};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::functions::FunctionTable;

/// Shared engine services for one agent process.
pub struct EngineState {
    pub config: AgentConfig,
    pub stores: StoreRegistry,
    pub locks: LockRegistry,
    pub functions: FunctionTable,
}

impl EngineState {
    /// Build the state, creating the state directory as needed. Databases
    /// already present under the work directory are honoured in place.
    pub fn new(config: AgentConfig) -> AccordResult<Self> {
        std::fs::create_dir_all(&config.state_dir)?;
        let stores = StoreRegistry::new(&config.state_dir, Some(config.work_dir.clone()));
        let locks = LockRegistry::new(stores.clone());
        Ok(Self {
            config,
            stores,
            locks,
            functions: FunctionTable::standard(),
        })
    }

    /// Current unix time; the single clock read the engine uses.
    pub fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}
