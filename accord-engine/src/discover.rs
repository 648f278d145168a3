//! Environment discovery
//!
//! Seeds the context with hard classes and `sys.*` variables describing the
//! host: platform, hostname, directory layout, and the time classes the
//! scheduler matches its run windows against. Re-run on every (re)load.

use accord_core::{canonify, AgentConfig, Rval};
use chrono::{Datelike, Local, TimeZone, Timelike};

use crate::context::EvalContext;

/// Populate hard classes and `sys` variables for the current host and time.
pub fn discover_environment(ctx: &mut EvalContext, config: &AgentConfig) {
    ctx.class_put_hard("any", None);
    ctx.class_put_hard("accord_agent", None);

    for class in platform_classes() {
        ctx.class_put_hard(class, None);
    }

    let host = hostname();
    ctx.class_put_hard(&canonify(&host), None);
    ctx.sys_var_put("host", Rval::scalar(host.clone()));
    ctx.sys_var_put("fqhost", Rval::scalar(host.clone()));
    ctx.sys_var_put("uqhost", Rval::scalar(
        host.split('.').next().unwrap_or(&host).to_string(),
    ));

    ctx.sys_var_put(
        "workdir",
        Rval::scalar(config.work_dir.display().to_string()),
    );
    ctx.sys_var_put(
        "statedir",
        Rval::scalar(config.state_dir.display().to_string()),
    );
    ctx.sys_var_put(
        "inputdir",
        Rval::scalar(config.inputs_dir.display().to_string()),
    );
    ctx.sys_var_put("version", Rval::scalar(env!("CARGO_PKG_VERSION")));

    for class in time_classes(&Local::now()) {
        ctx.class_put_hard(&class, None);
    }
}

fn platform_classes() -> Vec<&'static str> {
    let mut classes = Vec::new();
    if cfg!(unix) {
        classes.push("unix");
    }
    if cfg!(target_os = "linux") {
        classes.push("linux");
    }
    if cfg!(target_os = "macos") {
        classes.push("macos");
    }
    if cfg!(target_os = "freebsd") {
        classes.push("freebsd");
    }
    if cfg!(target_arch = "x86_64") {
        classes.push("x86_64");
        classes.push("64_bit");
    }
    if cfg!(target_arch = "aarch64") {
        classes.push("aarch64");
        classes.push("64_bit");
    }
    classes
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// The time classes for a given instant: hour, minute, five-minute window,
/// day, weekday, month, year, quarter, and the period of day.
pub fn time_classes<Tz: TimeZone>(t: &chrono::DateTime<Tz>) -> Vec<String> {
    let mut classes = Vec::new();

    classes.push(format!("Hr{:02}", t.hour()));
    classes.push(format!("Min{:02}", t.minute()));

    let window_start = (t.minute() / 5) * 5;
    let window_end = (window_start + 5) % 60;
    classes.push(format!("Min{:02}_{:02}", window_start, window_end));

    classes.push(format!("Day{}", t.day()));
    classes.push(t.weekday().to_string());
    classes.push(month_name(t.month()).to_string());
    classes.push(format!("Yr{}", t.year()));
    classes.push(format!("Q{}", (t.month() - 1) / 3 + 1));

    classes.push(
        match t.hour() {
            0..=5 => "Night",
            6..=11 => "Morning",
            12..=17 => "Afternoon",
            _ => "Evening",
        }
        .to_string(),
    );

    if matches!(t.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun) {
        classes.push("Weekend".to_string());
    } else {
        classes.push("Weekday".to_string());
    }

    classes
}

fn month_name(month: u32) -> &'static str {
    match month {
        1 => "January",
        2 => "February",
        3 => "March",
        4 => "April",
        5 => "May",
        6 => "June",
        7 => "July",
        8 => "August",
        9 => "September",
        10 => "October",
        11 => "November",
        _ => "December",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_time_classes_known_instant() {
        // 2026-08-01 07:03:20 UTC is a Saturday.
        let t = Utc.with_ymd_and_hms(2026, 8, 1, 7, 3, 20).single()
            .expect("timestamp should be valid");
        let classes = time_classes(&t);

        assert!(classes.contains(&"Hr07".to_string()));
        assert!(classes.contains(&"Min03".to_string()));
        assert!(classes.contains(&"Min00_05".to_string()));
        assert!(classes.contains(&"Day1".to_string()));
        assert!(classes.contains(&"Sat".to_string()));
        assert!(classes.contains(&"August".to_string()));
        assert!(classes.contains(&"Yr2026".to_string()));
        assert!(classes.contains(&"Q3".to_string()));
        assert!(classes.contains(&"Morning".to_string()));
        assert!(classes.contains(&"Weekend".to_string()));
    }

    #[test]
    fn test_five_minute_window_wraps() {
        let t = Utc.with_ymd_and_hms(2026, 8, 1, 23, 57, 0).single()
            .expect("timestamp should be valid");
        let classes = time_classes(&t);
        assert!(classes.contains(&"Min55_00".to_string()));
        assert!(classes.contains(&"Evening".to_string()));
    }

    #[test]
    fn test_discovery_defines_baseline() {
        let mut ctx = EvalContext::new();
        let config = AgentConfig::default();
        discover_environment(&mut ctx, &config);

        assert!(ctx.has_class("any"));
        assert!(ctx.has_class("accord_agent"));
        assert!(ctx
            .variable_get(&accord_core::VarRef::parse("sys.workdir"))
            .is_some());
    }
}
