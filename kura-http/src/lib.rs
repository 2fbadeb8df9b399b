//! HTTP surface over the resource pipeline.
//!
//! Every concrete schema gets:
//!
//! - `GET <url>` list, `POST <url>` create
//! - `GET <url>/:id` show, `PUT <url>/:id` update, `DELETE <url>/:id` delete
//! - `POST <url>/:id/:action` custom action
//!
//! Errors are rendered as `{"error": message}` with the problem's status.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use kura_extension::Context;
use kura_resources::Resources;
use kura_schema::Schema;
use kura_types::ResourceError;
use serde_json::{json, Map, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

pub mod auth;

pub const TOTAL_COUNT: &str = "x-total-count";

#[derive(Clone)]
pub struct AppState {
    pub resources: Arc<Resources>,
}

/// Pipeline failure rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ResourceError);

impl From<ResourceError> for ApiError {
    fn from(err: ResourceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        debug!(status = status.as_u16(), error = %self.0.message(), "request failed");
        (status, Json(json!({"error": self.0.message()}))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn context(headers: &HeaderMap) -> ApiResult<Context> {
    Ok(Context::with_auth(auth::authorization(headers)?))
}

/// `{"<singular>": {...}}` or the bare object.
fn payload(schema: &Schema, body: Value) -> ApiResult<Map<String, Value>> {
    match body {
        Value::Object(mut map) => match map.remove(&schema.singular) {
            Some(Value::Object(inner)) => Ok(inner),
            Some(other) => {
                map.insert(schema.singular.clone(), other);
                Ok(map)
            }
            None => Ok(map),
        },
        _ => Err(ResourceError::wrong_data("request body should be a JSON object").into()),
    }
}

fn query_map(pairs: Vec<(String, String)>) -> kura_extension::Query {
    let mut query = kura_extension::Query::new();
    for (key, value) in pairs {
        query.entry(key).or_default().push(value);
    }
    query
}

async fn list(
    state: AppState,
    schema: Arc<Schema>,
    headers: HeaderMap,
    pairs: Vec<(String, String)>,
) -> ApiResult<Response> {
    let mut ctx = context(&headers)?;
    let (rows, total) = state.resources.list(&mut ctx, &schema, &query_map(pairs)).await?;
    let mut response = Json(json!({ schema.plural.as_str(): rows })).into_response();
    if let Ok(value) = HeaderValue::from_str(&total.to_string()) {
        response.headers_mut().insert(TOTAL_COUNT, value);
    }
    Ok(response)
}

async fn show(state: AppState, schema: Arc<Schema>, headers: HeaderMap, id: String) -> ApiResult<Json<Value>> {
    let mut ctx = context(&headers)?;
    let row = state.resources.show(&mut ctx, &schema, &id).await?;
    Ok(Json(json!({ schema.singular.as_str(): row })))
}

async fn create(
    state: AppState,
    schema: Arc<Schema>,
    headers: HeaderMap,
    body: Value,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let mut ctx = context(&headers)?;
    let data = payload(&schema, body)?;
    let row = state.resources.create(&mut ctx, &schema, data).await?;
    Ok((StatusCode::CREATED, Json(json!({ schema.singular.as_str(): row }))))
}

async fn update(
    state: AppState,
    schema: Arc<Schema>,
    headers: HeaderMap,
    id: String,
    body: Value,
) -> ApiResult<Json<Value>> {
    let mut ctx = context(&headers)?;
    let data = payload(&schema, body)?;
    let row = state.resources.update(&mut ctx, &schema, &id, data).await?;
    Ok(Json(json!({ schema.singular.as_str(): row })))
}

async fn delete(state: AppState, schema: Arc<Schema>, headers: HeaderMap, id: String) -> ApiResult<StatusCode> {
    let mut ctx = context(&headers)?;
    state.resources.delete(&mut ctx, &schema, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn action(
    state: AppState,
    schema: Arc<Schema>,
    headers: HeaderMap,
    id: String,
    action_id: String,
    body: Option<Value>,
) -> ApiResult<Json<Value>> {
    let mut ctx = context(&headers)?;
    let input = body.unwrap_or_else(|| json!({}));
    let out = state
        .resources
        .action(&mut ctx, &schema, &action_id, Some(&id), input)
        .await?;
    Ok(Json(out))
}

fn schema_routes(schema: &Arc<Schema>) -> Router<AppState> {
    let collection = schema.url.clone();
    let single = format!("{collection}/:id");
    let acting = format!("{collection}/:id/:action");

    let (s1, s2, s3, s4, s5, s6) = (
        schema.clone(),
        schema.clone(),
        schema.clone(),
        schema.clone(),
        schema.clone(),
        schema.clone(),
    );
    Router::new()
        .route(
            &collection,
            get(
                move |State(st): State<AppState>, headers: HeaderMap, Query(pairs): Query<Vec<(String, String)>>| {
                    list(st, s1.clone(), headers, pairs)
                },
            )
            .post(move |State(st): State<AppState>, headers: HeaderMap, Json(body): Json<Value>| {
                create(st, s2.clone(), headers, body)
            }),
        )
        .route(
            &single,
            get(move |State(st): State<AppState>, headers: HeaderMap, Path(id): Path<String>| {
                show(st, s3.clone(), headers, id)
            })
            .put(
                move |State(st): State<AppState>, headers: HeaderMap, Path(id): Path<String>, Json(body): Json<Value>| {
                    update(st, s4.clone(), headers, id, body)
                },
            )
            .delete(move |State(st): State<AppState>, headers: HeaderMap, Path(id): Path<String>| {
                delete(st, s5.clone(), headers, id)
            }),
        )
        .route(
            &acting,
            post(
                move |State(st): State<AppState>,
                      headers: HeaderMap,
                      Path((id, action_id)): Path<(String, String)>,
                      body: Option<Json<Value>>| {
                    action(st, s6.clone(), headers, id, action_id, body.map(|Json(v)| v))
                },
            ),
        )
}

async fn healthz() -> &'static str {
    "ok"
}

/// Routes for every concrete schema of the pipeline's registry.
pub fn router(resources: Arc<Resources>) -> Router {
    let mut app = Router::new().route("/healthz", get(healthz));
    for schema in resources.manager().schemas().iter().filter(|s| !s.is_abstract) {
        debug!(schema = %schema.id, url = %schema.url, "mounting routes");
        app = app.merge(schema_routes(schema));
    }
    app.with_state(AppState { resources }).layer(TraceLayer::new_for_http())
}

/// Serves `app` until ctrl-c.
pub async fn serve(addr: SocketAddr, app: Router) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "kura HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
