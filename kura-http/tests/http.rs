use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use kura_db::{init_db_with_schemas, Db, SqlDb};
use kura_extension::{EnvironmentManager, Host};
use kura_resources::Resources;
use kura_schema::Manager;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

struct App {
    _dir: TempDir,
    _host: Arc<Host>,
    router: Router,
}

async fn app() -> App {
    let definitions = json!({
        "schemas": [
            {"id": "network", "plural": "networks",
             "schema": {"properties": {"name": {"type": "string"}, "tenant_id": {"type": "string"}}},
             "actions": {"reboot": {"method": "POST", "path": "/:id/reboot"}}}
        ],
        "policies": [
            {"id": "admin", "principal": "admin", "action": "*", "resource": {"path": ".*"}}
        ],
        "extensions": [
            {"id": "reboot", "path": "networks$", "code": r#"
                register_handler("reboot", |ctx| { ctx.response = #{ rebooted: ctx.id }; ctx });
            "#}
        ]
    });
    let mut manager = Manager::new();
    manager.load_value(&definitions, Path::new(".")).unwrap();
    let manager = Arc::new(manager);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kura.db");
    let db: Arc<dyn Db> = Arc::new(SqlDb::connect(Arc::clone(&manager), path.to_str().unwrap(), 4).await.unwrap());
    init_db_with_schemas(db.as_ref(), &manager, true, false, false).await.unwrap();

    let host = Host::builder(Arc::clone(&manager)).time_limit(Duration::from_secs(5)).build();
    let envs = Arc::new(EnvironmentManager::new());
    envs.load_extensions(&host).unwrap();
    let resources = Resources::bind(&host, db, envs);
    App {
        _dir: dir,
        _host: host,
        router: kura_http::router(resources),
    }
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-roles", "admin")
        .header("x-tenant-id", "t1");
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &App, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test(flavor = "multi_thread")]
async fn crud_round_trip() {
    let app = app().await;

    let (status, body) = send(&app, request("POST", "/networks", Some(json!({"network": {"name": "n1"}})))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["network"]["tenant_id"], json!("t1"));
    let id = body["network"]["id"].as_str().unwrap().to_string();

    let response = app.router.clone().oneshot(request("GET", "/networks", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-total-count"], "1");

    let (status, body) = send(&app, request("PUT", &format!("/networks/{id}"), Some(json!({"name": "n2"})))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["network"]["name"], json!("n2"));

    let (status, body) = send(&app, request("GET", &format!("/networks/{id}"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["network"]["name"], json!("n2"));

    let (status, _) = send(&app, request("DELETE", &format!("/networks/{id}"), None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, request("GET", &format!("/networks/{id}"), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_roles_is_unauthorized() {
    let app = app().await;
    let req = Request::builder().uri("/networks").body(Body::empty()).unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("No X-Roles header in request"));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_query_parameter_is_bad_request() {
    let app = app().await;
    let (status, _) = send(&app, request("GET", "/networks?colour=red", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn actions_are_routed_to_extensions() {
    let app = app().await;
    let (_, body) = send(&app, request("POST", "/networks", Some(json!({"name": "n"})))).await;
    let id = body["network"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, request("POST", &format!("/networks/{id}/reboot"), Some(json!({})))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"rebooted": id}));

    let (status, _) = send(&app, request("POST", &format!("/networks/{id}/explode"), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn healthz_answers_without_credentials() {
    let app = app().await;
    let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let response = app.router.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
