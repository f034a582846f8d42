//! HTTP tool executor.

use indexmap::IndexMap;
use reqwest::Method;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::ExecError;

#[allow(clippy::too_many_arguments)]
pub async fn execute(
    client: &reqwest::Client,
    method: &str,
    url: &str,
    headers: &IndexMap<String, String>,
    params: &IndexMap<String, String>,
    payload: Option<&Value>,
    timeout_ms: Option<u64>,
    cancel: &CancellationToken,
) -> Result<Value, ExecError> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|_| ExecError::Tool(format!("invalid http method `{method}`")))?;

    let mut request = client.request(method, url);
    for (name, value) in headers {
        request = request.header(name, value);
    }
    if !params.is_empty() {
        let query: Vec<(&str, &str)> = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        request = request.query(&query);
    }
    if let Some(payload) = payload {
        request = request.json(payload);
    }
    if let Some(timeout_ms) = timeout_ms {
        request = request.timeout(std::time::Duration::from_millis(timeout_ms));
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(ExecError::Cancelled),
        response = request.send() => {
            response.map_err(|e| ExecError::Tool(format!("http request failed: {e}")))?
        }
    };

    let status = response.status();
    let headers_out: Value = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), Value::String(v.to_string())))
        })
        .collect::<serde_json::Map<String, Value>>()
        .into();

    let body_text = tokio::select! {
        _ = cancel.cancelled() => return Err(ExecError::Cancelled),
        body = response.text() => {
            body.map_err(|e| ExecError::Tool(format!("http body read failed: {e}")))?
        }
    };

    if !status.is_success() {
        return Err(ExecError::Tool(format!(
            "http status {}: {}",
            status.as_u16(),
            truncate(&body_text, 512)
        )));
    }

    let body: Value = serde_json::from_str(&body_text)
        .unwrap_or_else(|_| Value::String(body_text));

    Ok(json!({
        "status": status.as_u16(),
        "headers": headers_out,
        "body": body,
    }))
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((offset, _)) => &text[..offset],
        None => text,
    }
}
