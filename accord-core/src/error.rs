//! Error types for Accord operations

use thiserror::Error;

/// Policy loading and structural errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Parse error at {file}:{line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    #[error("Unknown promise type '{keyword}' at {file}:{line}")]
    UnknownPromiseType {
        keyword: String,
        file: String,
        line: usize,
    },

    #[error("Unknown bundle type '{keyword}' at {file}:{line}")]
    UnknownBundleType {
        keyword: String,
        file: String,
        line: usize,
    },

    #[error("Duplicate bundle {namespace}:{name}")]
    DuplicateBundle { namespace: String, name: String },

    #[error("Unknown body {body_type} {name}")]
    UnknownBody { body_type: String, name: String },

    #[error("Body inheritance cycle through {body}: {chain:?}")]
    InheritanceCycle { body: String, chain: Vec<String> },

    #[error("Bundle not found: {name}")]
    MissingBundle { name: String },

    #[error("Too many policy errors ({count}), aborting before execution")]
    TooManyErrors { count: usize },
}

/// Evaluation-time errors raised by the context, expansion or dispatch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("No frame provides scope '{scope}'")]
    ScopeAbsent { scope: String },

    #[error("Frame stack underflow")]
    FrameUnderflow,

    #[error("Popped frame kind {got} where {expected} was pushed")]
    FrameKindMismatch { expected: String, got: String },

    #[error("Bundle {namespace}:{name} is not defined")]
    UnknownBundle { namespace: String, name: String },

    #[error("Invalid class expression '{expr}': {reason}")]
    ClassExpression { expr: String, reason: String },

    #[error("Function {name} failed: {reason}")]
    Function { name: String, reason: String },

    #[error("Type mismatch for {context}: expected {expected}, got {got}")]
    TypeMismatch {
        context: String,
        expected: String,
        got: String,
    },
}

/// Persistent store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open database {name}: {reason}")]
    Open { name: String, reason: String },

    #[error("Database {name} is broken")]
    Broken { name: String },

    #[error("Database {name} is frozen after an unrecoverable error")]
    Frozen { name: String },

    #[error("Transaction error on {name}: {reason}")]
    Transaction { name: String, reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Registry shut down with {outstanding} handle(s) still open")]
    ShutdownTimeout { outstanding: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lock registry results that are not plain errors: contention surfaces as
/// a skipped promise, never as a failure.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Too soon: last completion {elapsed_secs}s ago, ifelapsed {ifelapsed_min}m")]
    TooSoon {
        elapsed_secs: i64,
        ifelapsed_min: i64,
    },

    #[error("Locked by another process since unix time {since}")]
    LockedByOther { since: i64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Lock file error: {0}")]
    Io(#[from] std::io::Error),
}

impl LockError {
    /// Contention (as opposed to infrastructure failure) degrades the
    /// promise to `Skipped`.
    pub fn is_contention(&self) -> bool {
        matches!(self, LockError::TooSoon { .. } | LockError::LockedByOther { .. })
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Accord errors.
#[derive(Debug, Error)]
pub enum AccordError {
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Accord operations.
pub type AccordResult<T> = Result<T, AccordError>;
