use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use tempfile::TempDir;

fn loopeval() -> Command {
    let mut cmd = Command::cargo_bin("loopeval").unwrap();
    cmd.env_remove("LOOPEVAL_LOG");
    cmd
}

fn init_sample(dir: &TempDir) -> std::path::PathBuf {
    let file = dir.path().join("loopeval.yaml");
    loopeval()
        .arg("init")
        .arg("--file")
        .arg(&file)
        .assert()
        .success()
        .stderr(contains("created"));
    file
}

fn run_json(file: &std::path::Path, db: &std::path::Path) -> (i32, Value) {
    let out = loopeval()
        .args(["run", "--format", "json", "--timeout-secs", "30"])
        .arg("--file")
        .arg(file)
        .arg("--db")
        .arg(db)
        .output()
        .unwrap();
    let report: Value = serde_json::from_slice(&out.stdout).unwrap_or(Value::Null);
    (out.status.code().unwrap_or(-1), report)
}

#[test]
fn test_init_does_not_overwrite() {
    let dir = TempDir::new().unwrap();
    let file = init_sample(&dir);
    fs::write(&file, "name: mine\n").unwrap();

    loopeval()
        .arg("init")
        .arg("--file")
        .arg(&file)
        .assert()
        .success()
        .stderr(contains("already exists"));
    assert_eq!(fs::read_to_string(&file).unwrap(), "name: mine\n");
}

#[test]
fn test_sample_experiment_passes() {
    let dir = TempDir::new().unwrap();
    let file = init_sample(&dir);
    let db = dir.path().join("state/eval.db");

    let (code, report) = run_json(&file, &db);
    assert_eq!(code, 0, "report: {}", report);
    assert_eq!(report["experiment"]["status"], "success");
    assert_eq!(report["stats"]["success_cnt"], 2);

    let evaluators = report["evaluators"].as_array().unwrap();
    let exact = evaluators.iter().find(|e| e["name"] == "exact").unwrap();
    assert_eq!(exact["average"], 0.5);
    assert_eq!(exact["passed"], true);
    assert!(db.exists());
}

#[test]
fn test_threshold_miss_exits_one() {
    let dir = TempDir::new().unwrap();
    let file = init_sample(&dir);
    let raw = fs::read_to_string(&file).unwrap().replace("exact: 0.5", "exact: 0.9");
    fs::write(&file, raw).unwrap();

    let (code, report) = run_json(&file, &dir.path().join("eval.db"));
    assert_eq!(code, 1);
    let exact = &report["evaluators"].as_array().unwrap()[0];
    assert_eq!(exact["passed"], false);
}

#[test]
fn test_invalid_file_is_config_error() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("bad.yaml");
    fs::write(
        &file,
        r#"
name: bad
dataset:
  items:
    - input: a
evaluators:
  - name: judge
    template: correctness
"#,
    )
    .unwrap();

    loopeval()
        .arg("run")
        .arg("--file")
        .arg(&file)
        .arg("--db")
        .arg(dir.path().join("eval.db"))
        .assert()
        .code(2)
        .stderr(contains("llm.provider"));

    loopeval()
        .arg("run")
        .arg("--file")
        .arg(dir.path().join("missing.yaml"))
        .assert()
        .code(2)
        .stderr(contains("failed to read"));
}

#[test]
fn test_fake_judge_and_results_command() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("judge.yaml");
    fs::write(
        &file,
        r#"
name: judged
dataset:
  fields: [input, reference_output]
  items:
    - input: "2+2"
      reference_output: "4"
      answer: "4"
target:
  kind: code
  config:
    outputs:
      actual_output: "{{answer}}"
evaluators:
  - name: judge
    template: correctness
thresholds:
  judge: 1.0
llm:
  provider: fake
  fallback: '{"score": 1, "reason": "matches"}'
"#,
    )
    .unwrap();
    let db = dir.path().join("eval.db");

    let (code, report) = run_json(&file, &db);
    assert_eq!(code, 0, "report: {}", report);
    let expt_id = report["experiment"]["id"].as_i64().unwrap();

    // Second run against the same database gets a fresh experiment name.
    let (code, again) = run_json(&file, &db);
    assert_eq!(code, 0);
    assert_eq!(again["experiment"]["name"], "judged-2");

    let out = loopeval()
        .args(["results", "--format", "json"])
        .arg("--db")
        .arg(&db)
        .arg("--expt-id")
        .arg(expt_id.to_string())
        .output()
        .unwrap();
    assert!(out.status.success());
    let stored: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(stored["experiment"]["name"], "judged");
    let turns = stored["turns"].as_array().unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0]["status"], "success");

    loopeval()
        .arg("results")
        .arg("--db")
        .arg(&db)
        .arg("--expt-id")
        .arg("424242")
        .assert()
        .code(2)
        .stderr(contains("not found"));
}

#[test]
fn test_version_prints_package_version() {
    loopeval()
        .arg("version")
        .assert()
        .success()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}
