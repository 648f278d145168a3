//! Database identifiers
//!
//! Every persistent database the agent touches is named here; paths derive
//! from the state directory. A legacy copy under the work directory is
//! honoured only when it already exists - new databases are never created
//! at the old path.

use std::fmt;
use std::path::{Path, PathBuf};

/// Identifier of one persistent database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DbId {
    Classes,
    Variables,
    Performance,
    Checksums,
    Filestats,
    Changes,
    Observations,
    State,
    Lastseen,
    Audit,
    Locks,
    History,
    PackagesInstalled,
}

impl DbId {
    /// Every known database, in path order. The repair sweep and shutdown
    /// drain iterate this list.
    pub fn all() -> &'static [DbId] {
        &[
            DbId::Classes,
            DbId::Variables,
            DbId::Performance,
            DbId::Checksums,
            DbId::Filestats,
            DbId::Changes,
            DbId::Observations,
            DbId::State,
            DbId::Lastseen,
            DbId::Audit,
            DbId::Locks,
            DbId::History,
            DbId::PackagesInstalled,
        ]
    }

    /// Directory name of the database under the state directory.
    pub fn dir_name(&self) -> &'static str {
        match self {
            DbId::Classes => "classes.lmdb",
            DbId::Variables => "variables.lmdb",
            DbId::Performance => "performance.lmdb",
            DbId::Checksums => "checksums.lmdb",
            DbId::Filestats => "filestats.lmdb",
            DbId::Changes => "changes.lmdb",
            DbId::Observations => "observations.lmdb",
            DbId::State => "statedb.lmdb",
            DbId::Lastseen => "lastseen.lmdb",
            DbId::Audit => "audit.lmdb",
            DbId::Locks => "locks.lmdb",
            DbId::History => "history.lmdb",
            DbId::PackagesInstalled => "packages_installed.lmdb",
        }
    }

    /// Resolve this database's path: the legacy work-directory copy when one
    /// is already there, otherwise the state-directory path.
    pub fn resolve_path(&self, state_dir: &Path, legacy_dir: Option<&Path>) -> PathBuf {
        if let Some(legacy) = legacy_dir {
            let legacy_path = legacy.join(self.dir_name());
            if legacy_path.exists() {
                return legacy_path;
            }
        }
        state_dir.join(self.dir_name())
    }
}

impl fmt::Display for DbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}
