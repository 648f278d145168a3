//! Accord Store - persistent host state
//!
//! A family of named LMDB databases under the state directory, used for
//! promise locks, persistent classes, last-seen peers, change tracking and
//! software inventory. Handles are reference counted with a freeze ladder
//! for unrecoverable errors, and a broken database is renamed aside and
//! recreated rather than taking the agent down.

mod cursor;
mod db_id;
mod kv;
mod lock;
mod registry;
mod repair;

pub use cursor::Cursor;
pub use db_id::DbId;
pub use kv::{string_key, KvDb};
pub use lock::{promise_lock_key, HeldLock, LockAttrs, LockRegistry};
pub use registry::{DbHandle, StoreRegistry};
pub use repair::process_repair_flag;
