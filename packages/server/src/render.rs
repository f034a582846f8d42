//! Context render service: deterministic rendering of a node's spec against
//! the execution's accumulated results.
//!
//! The renderer itself is pure; this wrapper does the I/O around it. It
//! rebuilds the accumulated context from the event log and transient vars,
//! and prefetches the credentials an action references so the actual render
//! never touches the database.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use playbook::{ActionSpec, CredentialResolver, RenderError, Renderer, ResolvedAction};

use crate::broker::Progress;
use crate::kernel::ServerKernel;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum RenderServiceError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("template error: {0}")]
    Template(String),

    #[error("credential `{name}` unavailable: {message}")]
    Credential { name: String, message: String },
}

impl From<RenderError> for RenderServiceError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::Template(message) => RenderServiceError::Template(message),
            RenderError::Credential { name, message } => {
                RenderServiceError::Credential { name, message }
            }
        }
    }
}

/// Rendered spec plus the context it was rendered against.
#[derive(Debug)]
pub struct Rendered {
    pub rendered_spec: Value,
    pub input_context: Value,
}

pub struct RenderService {
    kernel: Arc<ServerKernel>,
}

impl RenderService {
    pub fn new(kernel: Arc<ServerKernel>) -> Self {
        Self { kernel }
    }

    pub async fn render_for_node(
        &self,
        execution_id: i64,
        _node_id: &str,
        raw_spec: &Value,
    ) -> Result<Rendered, RenderServiceError> {
        let kernel = &self.kernel;
        let execution = kernel.executions.find(execution_id).await?;
        let events = kernel.events.read(execution_id, None, None).await?;
        let vars = kernel.vars.snapshot(execution_id).await?;
        let progress = Progress::fold(&events);
        let mut ctx =
            progress.accumulated_context(execution_id, &execution.workload, &vars);

        // Iterator children carry their bindings in the spec itself.
        if let Ok(resolved) = serde_json::from_value::<ResolvedAction>(raw_spec.clone()) {
            if let ActionSpec::IteratorChild {
                element_name,
                element,
                index,
                ..
            } = &resolved.action
            {
                if let Value::Object(map) = &mut ctx {
                    map.insert(element_name.clone(), element.clone());
                    map.insert(
                        "_loop".into(),
                        serde_json::json!({ "index": index, "element": element }),
                    );
                    map.insert(
                        "this".into(),
                        serde_json::json!({ "index": index, "element": element }),
                    );
                }
            }
        }

        let credentials = self.prefetch_credentials(raw_spec).await?;
        let renderer = Renderer::new(Arc::new(credentials));
        let rendered_spec = render_spec_value(&renderer, raw_spec, &ctx)?;

        Ok(Rendered {
            rendered_spec,
            input_context: ctx,
        })
    }

    /// Scan the spec for `credential('name')` references and fetch them
    /// decrypted, so rendering proper stays free of I/O.
    async fn prefetch_credentials(
        &self,
        raw_spec: &Value,
    ) -> Result<PrefetchedCredentials, RenderServiceError> {
        let text = raw_spec.to_string();
        let mut resolved = HashMap::new();
        for name in referenced_credentials(&text) {
            match self.kernel.credentials.fetch(&name, true).await {
                Ok(view) => {
                    resolved.insert(name, view.data.unwrap_or(Value::Null));
                }
                Err(StorageError::NotFound(_)) => {
                    return Err(RenderServiceError::Credential {
                        name,
                        message: "not found".into(),
                    });
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(PrefetchedCredentials(resolved))
    }
}

/// Render a job payload, leaving late-bound templates alone.
///
/// `retry_when`/`stop_when` and `save.value` are evaluated by the worker
/// against contexts that only exist after execution (`{error, attempt}`,
/// `this.data`); rendering them here against the accumulated context would
/// destroy them. Everything else renders now.
fn render_spec_value(
    renderer: &Renderer,
    raw_spec: &Value,
    ctx: &Value,
) -> Result<Value, RenderError> {
    let Value::Object(spec) = raw_spec else {
        return renderer.render_value(raw_spec, ctx);
    };
    if !spec.contains_key("action") {
        return renderer.render_value(raw_spec, ctx);
    }

    let mut rendered = serde_json::Map::with_capacity(spec.len());
    for (key, value) in spec {
        match key.as_str() {
            "retry" => {
                rendered.insert(key.clone(), value.clone());
            }
            "save" => {
                let Value::Object(save) = value else {
                    rendered.insert(key.clone(), value.clone());
                    continue;
                };
                let mut save_rendered = serde_json::Map::with_capacity(save.len());
                for (save_key, save_value) in save {
                    if save_key == "value" {
                        save_rendered.insert(save_key.clone(), save_value.clone());
                    } else {
                        save_rendered
                            .insert(save_key.clone(), renderer.render_value(save_value, ctx)?);
                    }
                }
                rendered.insert(key.clone(), Value::Object(save_rendered));
            }
            _ => {
                rendered.insert(key.clone(), renderer.render_value(value, ctx)?);
            }
        }
    }
    Ok(Value::Object(rendered))
}

fn referenced_credentials(text: &str) -> Vec<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r#"credential\(\s*['"]([A-Za-z0-9_.\-]+)['"]\s*\)"#)
            .expect("credential pattern compiles")
    });
    let mut names: Vec<String> = pattern
        .captures_iter(text)
        .map(|captures| captures[1].to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

struct PrefetchedCredentials(HashMap<String, Value>);

impl CredentialResolver for PrefetchedCredentials {
    fn resolve(&self, name: &str) -> Result<Value, RenderError> {
        self.0.get(name).cloned().ok_or_else(|| RenderError::Credential {
            name: name.to_string(),
            message: "not prefetched".into(),
        })
    }
}
