use std::fs;
use std::time::Duration;

use kura_testing::TestRunner;

const SCHEMA: &str = r#"
schemas:
  - id: network
    plural: networks
    schema:
      properties:
        name:
          type: string
policies:
  - id: admin
    principal: admin
    action: "*"
    resource:
      path: ".*"
extensions:
  - id: guard
    path: "networks$"
    code: |
      register_handler("pre_create", |ctx| {
        if ctx.name == "x" { throw CustomException("nope", 409); }
        ctx
      });
"#;

const SCRIPT: &str = r#"
// schemas: schema.yaml
// path: /networks

fn setUp() {
    model_create(#{}, "network", #{ name: "seed" });
}

fn test_seeded_network_is_listed() {
    let rows = model_list(#{}, "network", #{});
    assert_eq(rows.len(), 1);
    assert_eq(rows[0].name, "seed");
}

fn test_each_test_has_fresh_database() {
    model_create(#{}, "network", #{ name: "second" });
    assert_eq(model_list(#{}, "network", #{}).len(), 2);
}

fn test_config_is_mocked() {
    mock("config").expect(["answer", 0]).returns(42);
    assert_eq(config("answer", 0), 42);
}

fn test_mocked_failure_can_be_caught() {
    mock("exec").throws("no such binary");
    let caught = false;
    try {
        exec("missing", []);
    } catch (err) {
        caught = true;
    }
    assert_true(caught, "exec should have raised");
}

fn test_unconsumed_mock_fails() {
    mock("http").returns(#{ status_code: 200 });
}

fn test_assertion_reports_values() {
    assert_eq(1, 2);
}

fn test_trigger_captures_exception() {
    let ctx = kura_trigger("pre_create", #{ name: "x" });
    assert_eq(ctx.exception.name, "CustomException");
    assert_eq(ctx.exception.code, 409);
}
"#;

#[tokio::test(flavor = "multi_thread")]
async fn runs_every_test_in_isolation() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("schema.yaml"), SCHEMA).unwrap();
    let script = dir.path().join("network_test.rhai");
    fs::write(&script, SCRIPT).unwrap();

    let report = TestRunner::new()
        .time_limit(Duration::from_secs(10))
        .run_files(&[&script])
        .await
        .unwrap();

    let status: Vec<(&str, bool)> = report
        .outcomes
        .iter()
        .map(|o| (o.name.as_str(), o.passed()))
        .collect();
    assert_eq!(
        status,
        vec![
            ("test_assertion_reports_values", false),
            ("test_config_is_mocked", true),
            ("test_each_test_has_fresh_database", true),
            ("test_mocked_failure_can_be_caught", true),
            ("test_seeded_network_is_listed", true),
            ("test_trigger_captures_exception", true),
            ("test_unconsumed_mock_fails", false),
        ]
    );

    let failure = |name: &str| {
        report
            .outcomes
            .iter()
            .find(|o| o.name == name)
            .and_then(|o| o.failure.clone())
            .unwrap()
    };
    assert!(failure("test_assertion_reports_values").contains("assertion failed: 1 != 2"));
    assert!(failure("test_unconsumed_mock_fails").contains("1 expected call(s) to http were not made"));
    assert_eq!((report.passed(), report.failed()), (5, 2));
}

#[tokio::test(flavor = "multi_thread")]
async fn only_selects_matching_tests() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("schema.yaml"), SCHEMA).unwrap();
    let script = dir.path().join("network_test.rhai");
    fs::write(&script, SCRIPT).unwrap();

    let report = TestRunner::new().only("seeded").run_files(&[&script]).await.unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert!(report.success());
}
