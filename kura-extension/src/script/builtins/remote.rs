use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, Url};
use rhai::{Dynamic, Engine, EvalAltResult};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::script::convert::{map_to_json, to_dynamic, to_json};
use crate::script::{runtime_error, EnvState};

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

fn header_map(headers: &Map<String, Value>) -> RhaiResult<HeaderMap> {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| runtime_error(format!("header {name}: {e}")))?;
        let value = HeaderValue::from_str(&text).map_err(|e| runtime_error(format!("header value {text}: {e}")))?;
        out.insert(name, value);
    }
    Ok(out)
}

async fn send(
    client: reqwest::Client,
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Value,
) -> Result<Value, reqwest::Error> {
    let plain = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/plain"));
    let mut request = client.request(method, url).headers(headers);
    request = match body {
        Value::Null => request,
        Value::String(text) if plain => request.body(text),
        other if plain => request.body(other.to_string()),
        other => request.json(&other),
    };
    let response = request.send().await?;
    let status = response.status().as_u16();
    let headers: Map<String, Value> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), Value::String(v.to_string()))))
        .collect();
    let body = response.text().await?;
    Ok(json!({"status_code": status, "headers": headers, "body": body}))
}

pub(super) fn register(engine: &mut Engine, state: &Arc<EnvState>) {
    let st = state.clone();
    engine.register_fn(
        "http",
        move |method: &str, url: &str, headers: rhai::Map, body: Dynamic| -> RhaiResult<Dynamic> {
            let args = [
                Dynamic::from(method.to_string()),
                Dynamic::from(url.to_string()),
                Dynamic::from_map(headers.clone()),
                body.clone(),
            ];
            if let Some(out) = st.intercept("http", &args) {
                return out;
            }
            let parsed = Url::parse(url).map_err(|e| runtime_error(format!("invalid url {url}: {e}")))?;
            let host = parsed.host_str().unwrap_or_default().to_string();
            if !st.host.net.allows(&host) {
                return Err(runtime_error(format!("egress to {host} is not allowed")));
            }
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(|e| runtime_error(format!("invalid method {method}: {e}")))?;
            debug!(target: "extension", %method, %url, "http call");
            let headers = header_map(&map_to_json(&headers))?;
            let client = st.host.client.clone();
            let response = st
                .block_on(send(client, method, parsed, headers, to_json(&body)))?
                .map_err(|e| runtime_error(e.to_string()))?;
            Ok(to_dynamic(&response))
        },
    );
}
