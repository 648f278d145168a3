//! Start-up database verification
//!
//! A repair flag file in the state directory requests an integrity sweep of
//! every known database on the next start. The flag is removed once the
//! sweep has run so a crash during verification re-triggers it.

use accord_core::StoreError;
use std::path::Path;

use crate::registry::StoreRegistry;

/// Run the verification sweep when the flag file is present and checking has
/// not been disabled. Returns whether the sweep ran.
///
/// `skip_db_check`: `Some(true)` disables the sweep outright, `Some(false)`
/// and `None` let the flag file decide.
pub fn process_repair_flag(
    registry: &StoreRegistry,
    flag_path: &Path,
    skip_db_check: Option<bool>,
) -> Result<bool, StoreError> {
    if !flag_path.exists() {
        return Ok(false);
    }
    if skip_db_check == Some(true) {
        tracing::info!(flag = %flag_path.display(), "repair flag present but database check skipped");
        return Ok(false);
    }

    tracing::info!(flag = %flag_path.display(), "repair flag present, verifying databases");
    let entries = registry.verify_all()?;
    tracing::info!(entries, "database verification sweep complete");

    std::fs::remove_file(flag_path)?;
    Ok(true)
}
