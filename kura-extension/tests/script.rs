use std::sync::Arc;
use std::time::{Duration, Instant};

use kura_extension::{
    Context, Environment, EnvironmentManager, ExtensionError, FsCap, GlobalStore, HookOutcome, Host,
    MultiEnvironment, ScriptEnvironment,
};
use kura_schema::{Extension, Manager, Schema};
use serde_json::json;

fn manager() -> Arc<Manager> {
    let mut manager = Manager::new();
    manager
        .register_schema(
            Schema::from_value(&json!({
                "id": "network",
                "plural": "networks",
                "schema": {"properties": {"name": {"type": "string"}}}
            }))
            .unwrap(),
        )
        .unwrap();
    Arc::new(manager)
}

fn host() -> Arc<Host> {
    Host::builder(manager())
        .time_limit(Duration::from_secs(5))
        .config(json!({"keystone": {"url": "http://keystone"}}))
        .build()
}

fn env_with(host: Arc<Host>, code: &str) -> ScriptEnvironment {
    ScriptEnvironment::new("network", host, vec![("test".into(), code.into())]).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn handlers_update_context_in_registration_order() {
    let env = env_with(
        host(),
        r#"
        register_handler("pre_create", |ctx| { ctx.trail = ["first"]; ctx });
        register_handler("pre_create", |ctx| { ctx.trail.push("second"); ctx.name = ctx.name + "!"; ctx });
        register_handler("post_create", |ctx| { ctx.never = true; ctx });
        "#,
    );
    let mut ctx = Context::new();
    ctx.insert("name", json!("net"));
    let out = env.handle_event("pre_create", &mut ctx).await.unwrap();
    assert_eq!(out, HookOutcome::Completed);
    assert_eq!(ctx.get("trail"), Some(&json!(["first", "second"])));
    assert_eq!(ctx.get("name"), Some(&json!("net!")));
    assert!(ctx.get("never").is_none());

    let out = env.handle_event("pre_delete", &mut ctx).await.unwrap();
    assert_eq!(out, HookOutcome::NotHandled);
}

#[tokio::test(flavor = "multi_thread")]
async fn unit_return_leaves_context_alone() {
    let env = env_with(host(), r#"register_handler("pre_list", |ctx| { let x = 1; });"#);
    let mut ctx = Context::new();
    ctx.insert("kept", json!(1));
    env.handle_event("pre_list", &mut ctx).await.unwrap();
    assert_eq!(ctx.get("kept"), Some(&json!(1)));
}

#[tokio::test(flavor = "multi_thread")]
async fn response_is_reported() {
    let env = env_with(
        host(),
        r#"register_handler("pre_show", |ctx| { ctx.response = #{ id: "fixed" }; ctx });"#,
    );
    let mut ctx = Context::new();
    let out = env.handle_event("pre_show", &mut ctx).await.unwrap();
    assert_eq!(out, HookOutcome::Responded(json!({"id": "fixed"})));
}

#[tokio::test(flavor = "multi_thread")]
async fn typed_exception_is_captured_into_context() {
    let env = env_with(
        host(),
        r#"
        register_handler("pre_create", |ctx| { ctx.touched = true; ctx });
        register_handler("pre_create", |ctx| { throw CustomException("boom", 390); });
        register_handler("pre_create", |ctx| { ctx.after = true; ctx });
        "#,
    );
    let mut ctx = Context::new();
    let out = env.handle_event("pre_create", &mut ctx).await.unwrap();
    match out {
        HookOutcome::Exception(info) => {
            assert_eq!(info.name, "CustomException");
            assert_eq!(info.code, Some(390));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(
        ctx.get("exception"),
        Some(&json!({"name": "CustomException", "message": "boom", "code": 390}))
    );
    assert_eq!(ctx.get("exception_message"), Some(&json!("pre_create: CustomException(boom)")));
    assert_eq!(ctx.get("touched"), Some(&json!(true)));
    assert!(ctx.get("after").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn untyped_throw_is_an_error() {
    let env = env_with(host(), r#"register_handler("pre_update", |ctx| { throw "plain"; });"#);
    let mut ctx = Context::new();
    let err = env.handle_event("pre_update", &mut ctx).await.unwrap_err();
    assert!(matches!(err, ExtensionError::Script { ref event, .. } if event == "pre_update"), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn response_code_becomes_custom_exception() {
    let env = env_with(
        host(),
        r#"register_handler("pre_delete", |ctx| { ctx.response_code = 409; ctx.response = "busy"; ctx });"#,
    );
    let mut ctx = Context::new();
    let out = env.handle_event("pre_delete", &mut ctx).await.unwrap();
    let info = match out {
        HookOutcome::Exception(info) => info,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert_eq!(info.message, "busy");
    assert_eq!(info.code, Some(409));
    assert!(ctx.get("response_code").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn busy_loop_times_out() {
    let host = Host::builder(manager()).time_limit(Duration::from_millis(200)).build();
    let env = env_with(host, r#"register_handler("pre_list", |ctx| { let n = 0; loop { n += 1; } });"#);
    let mut ctx = Context::new();
    let started = Instant::now();
    let err = env.handle_event("pre_list", &mut ctx).await.unwrap_err();
    assert!(matches!(err, ExtensionError::Timeout(ref e) if e == "pre_list"), "{err}");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(err.to_string().starts_with("exceed timeout for extension execution"));
}

#[tokio::test(flavor = "multi_thread")]
async fn sleeping_builtin_is_cancelled_and_cannot_be_caught() {
    let host = Host::builder(manager()).time_limit(Duration::from_millis(100)).build();
    let env = env_with(
        host,
        r#"register_handler("pre_list", |ctx| { try { sleep(10000); } catch (e) { ctx.caught = true; } ctx });"#,
    );
    let mut ctx = Context::new();
    let started = Instant::now();
    let err = env.handle_event("pre_list", &mut ctx).await.unwrap_err();
    assert!(matches!(err, ExtensionError::Timeout(_)), "{err}");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(ctx.get("caught").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn clones_do_not_share_script_state() {
    let code = r#"
        let seen = [];
        register_handler("count", |ctx| { seen.push(1); ctx.count = seen.len(); ctx });
    "#;
    let env = env_with(host(), code);
    let mut ctx = Context::new();
    env.handle_event("count", &mut ctx).await.unwrap();
    env.handle_event("count", &mut ctx).await.unwrap();
    assert_eq!(ctx.get("count"), Some(&json!(2)));

    let clone = env.clone_env();
    let mut fresh = Context::new();
    clone.handle_event("count", &mut fresh).await.unwrap();
    assert_eq!(fresh.get("count"), Some(&json!(1)));
}

#[tokio::test(flavor = "multi_thread")]
async fn family_globals_follow_clones_and_process_globals_span_environments() {
    let host = host();
    let code = r#"
        register_handler("bump", |ctx| {
            let family = kura_global("counters");
            let process = kura_process_global("counters");
            family.set("n", if family.contains("n") { family.get("n") + 1 } else { 1 });
            process.set("n", if process.contains("n") { process.get("n") + 1 } else { 1 });
            ctx.family = family.get("n");
            ctx.process = process.get("n");
            ctx
        });
    "#;
    let parent = env_with(host.clone(), code);
    let clone = parent.clone_env();
    let stranger = env_with(host, code);

    let mut ctx = Context::new();
    parent.handle_event("bump", &mut ctx).await.unwrap();
    clone.handle_event("bump", &mut ctx).await.unwrap();
    assert_eq!(ctx.get("family"), Some(&json!(2)));
    assert_eq!(ctx.get("process"), Some(&json!(2)));

    stranger.handle_event("bump", &mut ctx).await.unwrap();
    assert_eq!(ctx.get("family"), Some(&json!(1)));
    assert_eq!(ctx.get("process"), Some(&json!(3)));
}

#[tokio::test(flavor = "multi_thread")]
async fn process_globals_can_be_supplied() {
    let globals = Arc::new(GlobalStore::new());
    globals.map("shared").set("greeting", rhai::Dynamic::from("hi".to_string()));
    let host = Host::builder(manager()).process_globals(globals).build();
    let env = env_with(
        host,
        r#"register_handler("read", |ctx| { ctx.greeting = kura_process_global("shared").get("greeting"); ctx });"#,
    );
    let mut ctx = Context::new();
    env.handle_event("read", &mut ctx).await.unwrap();
    assert_eq!(ctx.get("greeting"), Some(&json!("hi")));
}

#[tokio::test(flavor = "multi_thread")]
async fn utilities_are_available() {
    let env = env_with(
        host(),
        r#"
        register_handler("util", |ctx| {
            ctx.id = uuid();
            ctx.greeting = template("hello {{name}}", #{ name: "kura" });
            ctx.url = config("keystone/url", "none");
            ctx.missing = config("keystone/port", 5000);
            ctx.schema_url = schema_url("network");
            ctx.schema_count = schemas().len();
            let h = create_hash("sha256");
            h.update("abc");
            ctx.digest = h.digest("hex");
            ctx
        });
        "#,
    );
    let mut ctx = Context::new();
    env.handle_event("util", &mut ctx).await.unwrap();
    let id = ctx.get("id").and_then(|v| v.as_str()).unwrap();
    assert!(uuid::Uuid::parse_str(id).is_ok());
    assert_eq!(ctx.get("greeting"), Some(&json!("hello kura")));
    assert_eq!(ctx.get("url"), Some(&json!("http://keystone")));
    assert_eq!(ctx.get("missing"), Some(&json!(5000)));
    assert_eq!(ctx.get("schema_url"), Some(&json!("/networks")));
    assert_eq!(ctx.get("schema_count"), Some(&json!(1)));
    assert_eq!(
        ctx.get("digest"),
        Some(&json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn trigger_event_runs_other_handlers() {
    let env = env_with(
        host(),
        r#"
        register_handler("inner", |ctx| { ctx.inner = true; ctx });
        register_handler("outer", |ctx| { trigger_event("inner", ctx) });
        "#,
    );
    let mut ctx = Context::new();
    env.handle_event("outer", &mut ctx).await.unwrap();
    assert_eq!(ctx.get("inner"), Some(&json!(true)));
}

#[tokio::test(flavor = "multi_thread")]
async fn file_builtins_stay_in_sandbox() {
    let dir = tempfile::tempdir().unwrap();
    let host = Host::builder(manager()).fs(FsCap::open(dir.path()).unwrap()).build();
    let env = env_with(
        host,
        r#"
        register_handler("files", |ctx| {
            make_dir("out/nested");
            write_file("out/nested/a.txt", "payload");
            ctx.exists = file_exists("out/nested/a.txt");
            ctx.content = read_file("out/nested/a.txt");
            ctx.listing = read_dir("out/nested");
            try { read_file("../escape.txt"); } catch (e) { ctx.escaped = false; }
            ctx
        });
        "#,
    );
    let mut ctx = Context::new();
    env.handle_event("files", &mut ctx).await.unwrap();
    assert_eq!(ctx.get("exists"), Some(&json!(true)));
    assert_eq!(ctx.get("content"), Some(&json!("payload")));
    assert_eq!(ctx.get("listing"), Some(&json!(["a.txt"])));
    assert_eq!(ctx.get("escaped"), Some(&json!(false)));
    assert!(dir.path().join("out/nested/a.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn http_respects_allow_list() {
    let host = Host::builder(manager())
        .net(kura_extension::NetCap::AllowDomains(vec!["allowed.example".into()]))
        .build();
    let env = env_with(
        host,
        r#"
        register_handler("call", |ctx| {
            try { http("GET", "http://denied.example/x", #{}, ()); } catch (e) { ctx.error = e; }
            ctx
        });
        "#,
    );
    let mut ctx = Context::new();
    env.handle_event("call", &mut ctx).await.unwrap();
    assert_eq!(ctx.get("error"), Some(&json!("egress to denied.example is not allowed")));
}

#[test]
fn compile_errors_surface_at_construction() {
    let err = ScriptEnvironment::new("broken", host(), vec![("bad".into(), "let = ;".into())])
        .err()
        .unwrap();
    assert!(matches!(err, ExtensionError::Compile { ref name, .. } if name == "bad"));
}

#[tokio::test(flavor = "multi_thread")]
async fn manager_loads_environments_from_extensions() {
    let mut manager = Manager::new();
    manager
        .register_schema(Schema::from_value(&json!({"id": "network", "plural": "networks", "schema": {}})).unwrap())
        .unwrap();
    manager
        .register_schema(Schema::from_value(&json!({"id": "port", "plural": "ports", "schema": {}})).unwrap())
        .unwrap();
    manager.register_extension(
        Extension::new("net", r#"register_handler("pre_list", |ctx| { ctx.net = true; ctx });"#, Some("^/networks")).unwrap(),
    );
    let host = Host::builder(Arc::new(manager)).build();
    let envs = EnvironmentManager::new();
    assert_eq!(envs.load_extensions(&host).unwrap(), 1);
    assert!(envs.get("port").is_none());

    let env = envs.get("network").unwrap();
    let mut ctx = Context::new();
    env.handle_event("pre_list", &mut ctx).await.unwrap();
    assert_eq!(ctx.get("net"), Some(&json!(true)));
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_environment_runs_script_children_in_order() {
    let host = host();
    let a: Arc<dyn Environment> = Arc::new(env_with(
        host.clone(),
        r#"register_handler("pre_create", |ctx| { ctx.order = ["a"]; ctx });"#,
    ));
    let b: Arc<dyn Environment> = Arc::new(env_with(host.clone(), r#"register_handler("other", |ctx| ctx);"#));
    let c: Arc<dyn Environment> = Arc::new(env_with(
        host,
        r#"register_handler("pre_create", |ctx| { ctx.order.push("c"); ctx });"#,
    ));
    let multi = MultiEnvironment::new("network", vec![a, b, c]).clone_env();
    let mut ctx = Context::new();
    assert_eq!(multi.handle_event("pre_create", &mut ctx).await.unwrap(), HookOutcome::Completed);
    assert_eq!(ctx.get("order"), Some(&json!(["a", "c"])));
}
