//! `vars` (and `meta`) actuator
//!
//! Binds the promiser as a typed variable in the current bundle scope. A
//! value that is still an unevaluated function call is left for a later
//! pass.

use accord_core::{AccordResult, Outcome, Promise, Rval, VarRef, VarType};

use crate::actuators::Actuator;
use crate::context::EvalContext;
use crate::state::EngineState;

pub struct VarsActuator;

const TYPE_KEYWORDS: &[&str] = &["string", "int", "real", "boolean", "slist", "rlist", "data"];

impl Actuator for VarsActuator {
    fn actuate(
        &self,
        _state: &EngineState,
        ctx: &mut EvalContext,
        promise: &Promise,
        _now: i64,
    ) -> AccordResult<Outcome> {
        let (keyword, rval) = match TYPE_KEYWORDS
            .iter()
            .find_map(|kw| promise.constraint(kw).map(|r| (*kw, r)))
        {
            Some(found) => found,
            None => return Ok(Outcome::Kept), // bare meta promises carry only tags
        };

        if matches!(rval, Rval::FnCall(_)) {
            // Arguments were not resolvable yet; a later pass will retry.
            tracing::trace!(promiser = %promise.promiser, "variable value deferred");
            return Ok(Outcome::Skipped);
        }

        let var_type = VarType::from_keyword(keyword).unwrap_or(VarType::String);
        let value = coerce(rval.clone(), var_type);

        let tags = promise
            .constraint("meta")
            .and_then(Rval::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_scalar().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let r = VarRef::parse(&promise.promiser);
        match ctx.variable_put(&r, value, var_type, tags) {
            Ok(()) => Ok(Outcome::Kept),
            Err(e) => {
                tracing::error!(promiser = %promise.promiser, error = %e, "variable binding failed");
                Ok(Outcome::Fail)
            }
        }
    }
}

/// Nudge the value into the declared shape where the conversion is obvious.
fn coerce(value: Rval, var_type: VarType) -> Rval {
    match (var_type, value) {
        // A container result is acceptable for list types element-wise.
        (VarType::Slist | VarType::Rlist, Rval::Container(serde_json::Value::Array(items))) => {
            Rval::List(
                items
                    .into_iter()
                    .map(|v| match v {
                        serde_json::Value::String(s) => Rval::Scalar(s),
                        other => Rval::Scalar(other.to_string()),
                    })
                    .collect(),
            )
        }
        (VarType::Container, Rval::Scalar(text)) => match serde_json::from_str(&text) {
            Ok(value) => Rval::Container(value),
            Err(_) => Rval::Scalar(text),
        },
        (_, value) => value,
    }
}
