//! Accord Engine - policy evaluation
//!
//! Turns a parsed policy into a stream of idempotent actions: the evaluation
//! context tracks classes and variables across a stack of frames, the
//! expansion engine rewrites `$(x)`/`@(x)` references, the iteration engine
//! drives list cross-products in odometer order, and the dispatcher applies
//! class guards and hands fully-resolved promises to typed actuators.

pub mod actuators;
pub mod classes;
pub mod context;
pub mod discover;
pub mod dispatch;
pub mod expand;
pub mod functions;
pub mod iterate;
pub mod run;
pub mod state;
pub mod term;

pub use actuators::{Actuator, ActuatorTable};
pub use classes::eval_class_expr;
pub use context::{EvalContext, FrameKind, VarBinding};
pub use dispatch::{dispatch_promise, run_policy};
pub use expand::{expand_rval, expand_scalar};
pub use functions::{FnCtx, FnKind, FunctionTable};
pub use iterate::PromiseIterator;
pub use run::agent_run;
pub use state::EngineState;
pub use term::{clear_pending_termination, pending_termination, set_pending_termination};
