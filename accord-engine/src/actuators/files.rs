//! `files` actuator
//!
//! Converges a path onto the promised state: existence, literal content,
//! and permission bits. Each check compares before it mutates so a kept
//! promise touches nothing.

use accord_core::{AccordResult, Outcome, Promise, Rval};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::actuators::{constraint_bool, with_promise_lock, Actuator};
use crate::context::EvalContext;
use crate::state::EngineState;

pub struct FilesActuator;

impl Actuator for FilesActuator {
    fn actuate(
        &self,
        state: &EngineState,
        ctx: &mut EvalContext,
        promise: &Promise,
        now: i64,
    ) -> AccordResult<Outcome> {
        let path = promise.promiser.clone();
        let dry_run = state.config.dry_run;
        with_promise_lock(
            state,
            ctx,
            accord_core::PromiseType::Files,
            promise,
            now,
            || converge_file(&path, promise, dry_run),
        )
    }
}

fn converge_file(path: &str, promise: &Promise, dry_run: bool) -> AccordResult<Outcome> {
    let target = Path::new(path);
    let mut outcome = Outcome::Kept;

    if constraint_bool(promise, "create") && !target.exists() {
        if dry_run {
            tracing::warn!(path, "dry-run: would create");
            return Ok(Outcome::Warn);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::File::create(target)?;
        tracing::info!(path, "created");
        outcome = outcome.worst(Outcome::Repaired);
    }

    if let Some(content) = promise.constraint("content").and_then(Rval::as_scalar) {
        let current = fs::read_to_string(target).unwrap_or_default();
        if current != content {
            if dry_run {
                tracing::warn!(path, "dry-run: would rewrite content");
                return Ok(outcome.worst(Outcome::Warn));
            }
            fs::write(target, content)?;
            tracing::info!(path, "content converged");
            outcome = outcome.worst(Outcome::Repaired);
        }
    }

    if let Some(mode_text) = promise.constraint("perms").and_then(Rval::as_scalar) {
        match u32::from_str_radix(mode_text, 8) {
            Ok(mode) => {
                let current = fs::metadata(target)?.permissions().mode() & 0o7777;
                if current != mode {
                    if dry_run {
                        tracing::warn!(path, mode = %mode_text, "dry-run: would chmod");
                        return Ok(outcome.worst(Outcome::Warn));
                    }
                    fs::set_permissions(target, fs::Permissions::from_mode(mode))?;
                    tracing::info!(path, mode = %mode_text, "permissions converged");
                    outcome = outcome.worst(Outcome::Repaired);
                }
            }
            Err(_) => {
                tracing::error!(path, mode = %mode_text, "perms is not an octal mode");
                return Ok(Outcome::Fail);
            }
        }
    }

    if outcome == Outcome::Kept && !target.exists() {
        // A files promise with nothing to enforce still vouches for the path.
        tracing::warn!(path, "promised file is absent");
        return Ok(Outcome::Warn);
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_core::Constraint;

    fn promise_for(path: &std::path::Path) -> Promise {
        let mut promise = Promise::new(path.display().to_string());
        promise
            .constraints
            .push(Constraint::new("create", Rval::scalar("true")));
        promise
    }

    #[test]
    fn test_create_then_kept() {
        let tmp = tempfile::tempdir().expect("tempdir should succeed");
        let path = tmp.path().join("made");
        let promise = promise_for(&path);

        let first = converge_file(&path.display().to_string(), &promise, false)
            .expect("converge should succeed");
        assert_eq!(first, Outcome::Repaired);
        assert!(path.exists());

        let second = converge_file(&path.display().to_string(), &promise, false)
            .expect("converge should succeed");
        assert_eq!(second, Outcome::Kept);
    }

    #[test]
    fn test_dry_run_warns_without_touching() {
        let tmp = tempfile::tempdir().expect("tempdir should succeed");
        let path = tmp.path().join("untouched");
        let promise = promise_for(&path);

        let outcome = converge_file(&path.display().to_string(), &promise, true)
            .expect("converge should succeed");
        assert_eq!(outcome, Outcome::Warn);
        assert!(!path.exists());
    }

    #[test]
    fn test_content_convergence() {
        let tmp = tempfile::tempdir().expect("tempdir should succeed");
        let path = tmp.path().join("conf");
        std::fs::write(&path, "old").expect("write should succeed");

        let mut promise = Promise::new(path.display().to_string());
        promise
            .constraints
            .push(Constraint::new("content", Rval::scalar("new")));

        let outcome = converge_file(&path.display().to_string(), &promise, false)
            .expect("converge should succeed");
        assert_eq!(outcome, Outcome::Repaired);
        assert_eq!(
            std::fs::read_to_string(&path).expect("read should succeed"),
            "new"
        );
    }

    #[test]
    fn test_perms_convergence() {
        let tmp = tempfile::tempdir().expect("tempdir should succeed");
        let path = tmp.path().join("mode");
        std::fs::write(&path, "x").expect("write should succeed");

        let mut promise = Promise::new(path.display().to_string());
        promise
            .constraints
            .push(Constraint::new("perms", Rval::scalar("600")));

        let outcome = converge_file(&path.display().to_string(), &promise, false)
            .expect("converge should succeed");
        assert_eq!(outcome, Outcome::Repaired);
        let mode = std::fs::metadata(&path)
            .expect("metadata should succeed")
            .permissions()
            .mode()
            & 0o7777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_absent_with_no_enforcement_warns() {
        let tmp = tempfile::tempdir().expect("tempdir should succeed");
        let path = tmp.path().join("ghost");
        let promise = Promise::new(path.display().to_string());

        let outcome = converge_file(&path.display().to_string(), &promise, false)
            .expect("converge should succeed");
        assert_eq!(outcome, Outcome::Warn);
    }
}
