use run_gate::config::GateConfig;
use run_gate::error::GateError;
use run_gate::simulate::{load_scenario, simulate, Scenario, SimulationReport};
use run_gate::types::Status;

fn scenario(toml_str: &str) -> Scenario {
    toml::from_str(toml_str).expect("parse scenario")
}

async fn replay(toml_str: &str) -> SimulationReport {
    simulate(&scenario(toml_str), &GateConfig::default())
        .await
        .expect("simulate")
}

const TWO_DEPLOYS: &str = r#"
[[runs]]
name = "first"
repo_id = 1
concurrency_group = "ci"
workflow = """
jobs:
  build: {}
  deploy:
    needs: build
"""

[[runs]]
name = "second"
repo_id = 1
concurrency_group = "ci"
workflow = """
jobs:
  build: {}
  deploy:
    needs: build
"""
"#;

// =============================================================================
// Submission only
// =============================================================================

#[tokio::test]
async fn runs_are_submitted_in_file_order_without_steps() {
    let report = replay(TWO_DEPLOYS).await;

    assert_eq!(report.runs.len(), 2);
    let first = &report.runs[0];
    let second = &report.runs[1];
    assert_eq!((first.name.as_str(), first.index), ("first", 1));
    assert_eq!(first.status, Status::Waiting);
    assert_eq!(second.status, Status::Blocked);
    assert!(second.jobs.iter().all(|j| j.status == Status::Blocked));
}

// =============================================================================
// Steps
// =============================================================================

#[tokio::test]
async fn finishing_the_first_run_releases_the_second() {
    let steps = r#"
[[steps]]
action = "submit"
run = "first"

[[steps]]
action = "submit"
run = "second"

[[steps]]
action = "report"
run = "first"
job = "build"
status = "success"

[[steps]]
action = "report"
run = "first"
job = "deploy"
status = "success"
"#;
    let report = replay(&format!("{}{}", TWO_DEPLOYS, steps)).await;

    assert_eq!(report.runs[0].status, Status::Success);
    assert_eq!(report.runs[1].status, Status::Waiting);
    let build = report.runs[1].jobs.iter().find(|j| j.job_id == "build").unwrap();
    assert_eq!(build.status, Status::Waiting);
}

#[tokio::test]
async fn unsubmitted_runs_are_left_out() {
    let steps = r#"
[[steps]]
action = "submit"
run = "second"
"#;
    let report = replay(&format!("{}{}", TWO_DEPLOYS, steps)).await;
    assert_eq!(report.runs.len(), 1);
    assert_eq!(report.runs[0].name, "second");
    assert_eq!(report.runs[0].status, Status::Waiting);
}

#[tokio::test]
async fn approve_and_cancel_steps() {
    let report = replay(
        r#"
[[runs]]
name = "fork"
repo_id = 1
need_approval = true
workflow = "jobs:\n  build: {}\n"

[[runs]]
name = "stale"
repo_id = 1
workflow = "jobs:\n  build: {}\n"

[[steps]]
action = "submit"
run = "fork"

[[steps]]
action = "submit"
run = "stale"

[[steps]]
action = "approve"
run = "fork"

[[steps]]
action = "cancel"
run = "stale"
"#,
    )
    .await;

    assert_eq!(report.runs[0].status, Status::Waiting);
    assert_eq!(report.runs[1].status, Status::Cancelled);
}

#[tokio::test]
async fn variables_feed_group_expressions() {
    let report = replay(
        r#"
[[variables]]
owner_id = 1
repo_id = 7
name = "ENV"
value = "staging"

[[runs]]
name = "deploy"
repo_id = 7
workflow = """
jobs:
  deploy:
    concurrency: deploy-${{ vars.ENV }}
"""
"#,
    )
    .await;

    assert_eq!(report.runs[0].jobs[0].concurrency_group, "deploy-staging");
}

#[tokio::test]
async fn reporting_unknown_run_is_a_scenario_error() {
    let err = simulate(
        &scenario(
            r#"
[[steps]]
action = "approve"
run = "ghost"
"#,
        ),
        &GateConfig::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, GateError::Scenario(ref msg) if msg.contains("ghost")));
}

#[tokio::test]
async fn report_json_omits_empty_groups() {
    let report = replay("[[runs]]\nname = \"plain\"\nrepo_id = 1\nworkflow = \"jobs:\\n  a: {}\\n\"\n").await;
    let json = serde_json::to_value(&report).unwrap();
    let run = &json["runs"][0];
    assert_eq!(run["status"], "waiting");
    assert!(run.get("concurrency_group").is_none());
    assert_eq!(run["jobs"][0]["job_id"], "a");
}

// =============================================================================
// Loading
// =============================================================================

#[test]
fn load_scenario_reads_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scenario.toml");
    std::fs::write(&path, TWO_DEPLOYS).unwrap();

    let loaded = load_scenario(&path).unwrap();
    assert_eq!(loaded.runs.len(), 2);
    assert_eq!(loaded.runs[0].ref_name, "refs/heads/main");
    assert!(loaded.steps.is_empty());
}

#[test]
fn load_scenario_rejects_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_scenario(&dir.path().join("nope.toml")).unwrap_err();
    assert!(matches!(err, GateError::Scenario(_)));
}
