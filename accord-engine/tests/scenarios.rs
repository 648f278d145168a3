//! End-to-end scenarios: policy text through the parser, engine and
//! standard actuators, observed through a reports sink and the filesystem.

use accord_core::{AgentConfig, Outcome, PromiseType};
use accord_dsl::parse_policy;
use accord_engine::actuators::ReportsActuator;
use accord_engine::{agent_run, ActuatorTable, EngineState};
use std::sync::{Arc, Mutex};

struct Harness {
    state: EngineState,
    sink: Arc<Mutex<Vec<String>>>,
    actuators: ActuatorTable,
    _tmp: tempfile::TempDir,
}

fn harness_with(defines: &[&str]) -> Harness {
    let tmp = tempfile::tempdir().expect("tempdir should succeed");
    let mut config = AgentConfig::default().with_workdir(tmp.path());
    config.define_classes = defines.iter().map(|s| s.to_string()).collect();
    let state = EngineState::new(config).expect("state should build");

    let sink = Arc::new(Mutex::new(Vec::new()));
    let mut actuators = ActuatorTable::standard();
    actuators.register(
        PromiseType::Reports,
        Box::new(ReportsActuator::with_sink(Arc::clone(&sink))),
    );

    Harness {
        state,
        sink,
        actuators,
        _tmp: tmp,
    }
}

fn reports_of(harness: &Harness) -> Vec<String> {
    harness.sink.lock().expect("lock should succeed").clone()
}

#[test]
fn scenario_vars_expand_into_reports() {
    let harness = harness_with(&["DEBUG"]);
    let policy = parse_policy(
        r#"
        bundle agent main
        {
          vars:
            "x" string => "world";

          reports:
            DEBUG::
              "hello $(x)";
        }
        "#,
        "s1.acc",
    )
    .expect("parse should succeed");

    agent_run(&harness.state, &policy, &harness.actuators).expect("run should succeed");
    assert_eq!(reports_of(&harness), ["hello world".to_string()]);
}

#[test]
fn scenario_class_guard_gates_report() {
    let source = |guard: &str| {
        format!(
            r#"
            bundle agent main
            {{
              classes:
                "ok" expression => "any";

              reports:
                {}::
                  "reached";
            }}
            "#,
            guard
        )
    };

    let harness = harness_with(&[]);
    let policy = parse_policy(&source("ok"), "s2.acc").expect("parse should succeed");
    agent_run(&harness.state, &policy, &harness.actuators).expect("run should succeed");
    assert_eq!(reports_of(&harness), ["reached".to_string()]);

    let negated = harness_with(&[]);
    let policy = parse_policy(&source("!ok"), "s2b.acc").expect("parse should succeed");
    agent_run(&negated.state, &policy, &negated.actuators).expect("run should succeed");
    assert!(reports_of(&negated).is_empty());
}

#[test]
fn scenario_naked_list_actuates_per_element() {
    let harness = harness_with(&[]);
    let target = harness._tmp.path().join("out");
    std::fs::create_dir_all(&target).expect("mkdir should succeed");

    let policy = parse_policy(
        &format!(
            r#"
            bundle agent main
            {{
              vars:
                "l" slist => {{ "a", "b" }};

              files:
                "{}/$(l)"
                  create => "true";

              reports:
                "made $(l)";
            }}
            "#,
            target.display()
        ),
        "s4.acc",
    )
    .expect("parse should succeed");

    let tally = agent_run(&harness.state, &policy, &harness.actuators).expect("run should succeed");
    assert!(target.join("a").exists());
    assert!(target.join("b").exists());
    assert_eq!(
        reports_of(&harness),
        ["made a".to_string(), "made b".to_string()]
    );
    assert!(tally.repaired >= 2);
}

#[test]
fn scenario_cross_product_order() {
    let harness = harness_with(&[]);
    let policy = parse_policy(
        r#"
        bundle agent main
        {
          vars:
            "xs" slist => { "1", "2" };
            "ys" slist => { "p", "q" };

          reports:
            "pair $(xs)$(ys)";
        }
        "#,
        "order.acc",
    )
    .expect("parse should succeed");

    agent_run(&harness.state, &policy, &harness.actuators).expect("run should succeed");
    assert_eq!(
        reports_of(&harness),
        [
            "pair 1p".to_string(),
            "pair 1q".to_string(),
            "pair 2p".to_string(),
            "pair 2q".to_string(),
        ]
    );
}

#[test]
fn scenario_commands_rate_limited_by_ifelapsed() {
    let harness = harness_with(&[]);
    let policy = parse_policy(
        r#"
        body action quick
        {
          ifelapsed => "1";
          expireafter => "2";
        }
        bundle agent main
        {
          commands:
            "/bin/true"
              action => quick;
        }
        "#,
        "s3.acc",
    )
    .expect("parse should succeed");

    let first = agent_run(&harness.state, &policy, &harness.actuators).expect("run should succeed");
    assert_eq!(first.repaired, 1, "first run executes the command");

    let second =
        agent_run(&harness.state, &policy, &harness.actuators).expect("run should succeed");
    assert_eq!(second.repaired, 0, "second run is rate-limited");
    assert!(second.skipped >= 1);
}

#[test]
fn scenario_bundlesequence_controls_order() {
    let harness = harness_with(&[]);
    let policy = parse_policy(
        r#"
        body common control
        {
          bundlesequence => { "second", "first" };
        }
        bundle agent first
        {
          reports:
            "from first";
        }
        bundle agent second
        {
          reports:
            "from second";
        }
        bundle agent ignored
        {
          reports:
            "never scheduled";
        }
        "#,
        "seq.acc",
    )
    .expect("parse should succeed");

    agent_run(&harness.state, &policy, &harness.actuators).expect("run should succeed");
    assert_eq!(
        reports_of(&harness),
        ["from second".to_string(), "from first".to_string()]
    );
}

#[test]
fn scenario_methods_call_with_arguments() {
    let harness = harness_with(&[]);
    let policy = parse_policy(
        r#"
        bundle agent main
        {
          methods:
            "greeting" usebundle => greet("operator");
        }
        bundle agent greet(who)
        {
          reports:
            "hello $(who)";
        }
        "#,
        "methods.acc",
    )
    .expect("parse should succeed");

    agent_run(&harness.state, &policy, &harness.actuators).expect("run should succeed");
    assert_eq!(reports_of(&harness), ["hello operator".to_string()]);
}

// Regression for the second pre-evaluation pass: a common-bundle variable
// defined from another variable that appears later in the same section only
// resolves once the first pass has populated the table.
#[test]
fn dynamic_inputs_two_pass() {
    let harness = harness_with(&[]);
    let policy = parse_policy(
        r#"
        bundle common g
        {
          vars:
            "derived" string => "$(base)/sub";
            "base" string => "root";
        }
        bundle agent main
        {
          reports:
            "derived is $(g.derived)";
        }
        "#,
        "twopass.acc",
    )
    .expect("parse should succeed");

    agent_run(&harness.state, &policy, &harness.actuators).expect("run should succeed");
    assert_eq!(reports_of(&harness), ["derived is root/sub".to_string()]);
}

#[test]
fn scenario_dry_run_warns_instead_of_mutating() {
    let tmp = tempfile::tempdir().expect("tempdir should succeed");
    let mut config = AgentConfig::default().with_workdir(tmp.path());
    config.dry_run = true;
    let state = EngineState::new(config).expect("state should build");
    let actuators = ActuatorTable::standard();

    let target = tmp.path().join("would-create");
    let policy = parse_policy(
        &format!(
            r#"
            bundle agent main
            {{
              files:
                "{}"
                  create => "true";
            }}
            "#,
            target.display()
        ),
        "dry.acc",
    )
    .expect("parse should succeed");

    let tally = agent_run(&state, &policy, &actuators).expect("run should succeed");
    assert!(!target.exists(), "dry-run must not create the file");
    assert!(tally.warned >= 1);
    assert_eq!(tally.repaired, 0);
    assert_eq!(accord_engine::run::tally_worst(&tally), Outcome::Warn);
}
