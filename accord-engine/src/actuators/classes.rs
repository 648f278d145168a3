//! `classes` actuator
//!
//! Defines the promiser as a class when its `expression` holds. Scope is
//! the surrounding bundle unless `scope => "namespace"` widens it; a
//! `persistence` constraint (minutes) writes the class through to the
//! classes database with an expiry.

use accord_core::{AccordResult, Outcome, PersistentClassPolicy, Promise, Rval};

use crate::actuators::{constraint_i64, Actuator};
use crate::context::EvalContext;
use crate::state::EngineState;

pub struct ClassesActuator;

impl Actuator for ClassesActuator {
    fn actuate(
        &self,
        _state: &EngineState,
        ctx: &mut EvalContext,
        promise: &Promise,
        now: i64,
    ) -> AccordResult<Outcome> {
        let expression = match promise.constraint("expression") {
            Some(Rval::Scalar(s)) => s.clone(),
            Some(Rval::FnCall(_)) => {
                // Still waiting on arguments; retry next pass.
                return Ok(Outcome::Skipped);
            }
            Some(other) => {
                tracing::error!(promiser = %promise.promiser, rval = %other, "expression must be scalar");
                return Ok(Outcome::Fail);
            }
            // A bare classes promise defines unconditionally.
            None => "any".to_string(),
        };

        // Boolean-returning functions arrive as literal true/false.
        let defined = match expression.as_str() {
            "true" => true,
            "false" => false,
            expr => match ctx.class_is_defined(expr, now) {
                Ok(defined) => defined,
                Err(e) => {
                    tracing::error!(promiser = %promise.promiser, error = %e, "invalid class expression");
                    return Ok(Outcome::Fail);
                }
            },
        };

        if !defined {
            return Ok(Outcome::Kept);
        }

        if let Some(minutes) = constraint_i64(promise, "persistence") {
            let policy = match promise.constraint("timer_policy").and_then(Rval::as_scalar) {
                Some("preserve") => PersistentClassPolicy::Preserve,
                _ => PersistentClassPolicy::Reset,
            };
            ctx.class_put_persistent(&promise.promiser, minutes, policy, now);
            return Ok(Outcome::Kept);
        }

        let namespace_scoped = promise
            .constraint("scope")
            .and_then(Rval::as_scalar)
            .map(|s| s == "namespace")
            .unwrap_or(false);

        if namespace_scoped {
            ctx.class_put_hard(&promise.promiser, None);
        } else if let Err(e) = ctx.class_put_soft(&promise.promiser) {
            tracing::error!(promiser = %promise.promiser, error = %e, "soft class outside a bundle");
            return Ok(Outcome::Fail);
        }
        Ok(Outcome::Kept)
    }
}
