//! Deterministic template rendering.
//!
//! Rendering is a pure function of `(template, context)`: same inputs, same
//! bytes out. The environment exposes no clock, no randomness and no state;
//! the single escape hatch is credential resolution, which is an explicit
//! capability injected by the caller rather than ambient I/O.
//!
//! Context shape supplied by callers:
//!
//! ```json
//! {
//!   "execution_id": 42,
//!   "workload": {...},
//!   "<step>": {"data": ...},      // one entry per completed step
//!   "this": {...},                // the current step's own view
//!   "_loop": {"index": 0, "element": ...},
//!   "vars": {...}                 // transient variables
//! }
//! ```
//!
//! A string that is exactly one `{{ ... }}` expression renders to the
//! expression's value with its JSON type preserved; anything else renders to
//! a string. `tojson` and `default` are available as filters.

use std::sync::{Arc, Mutex};

use minijinja::{Environment, Error as MjError, ErrorKind as MjErrorKind, Value as MjValue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::RenderError;

/// Capability for resolving stored credentials during a render.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<Value, RenderError>;
}

/// Resolver that refuses every lookup. Used where credentials must not be
/// reachable, e.g. rendering input contexts that get persisted.
pub struct NoCredentials;

impl CredentialResolver for NoCredentials {
    fn resolve(&self, name: &str) -> Result<Value, RenderError> {
        Err(RenderError::Credential {
            name: name.to_string(),
            message: "credential resolution is not available in this context".into(),
        })
    }
}

#[derive(Clone)]
pub struct Renderer {
    credentials: Arc<dyn CredentialResolver>,
}

impl Renderer {
    pub fn new(credentials: Arc<dyn CredentialResolver>) -> Self {
        Self { credentials }
    }

    /// Renderer without credential access.
    pub fn sealed() -> Self {
        Self::new(Arc::new(NoCredentials))
    }

    /// Render a template string to a string.
    pub fn render_str(&self, template: &str, context: &Value) -> Result<String, RenderError> {
        if !template.contains("{{") && !template.contains("{%") {
            return Ok(template.to_string());
        }
        let failure = FailureSlot::default();
        let env = self.environment(&failure);
        let rendered = env.render_str(template, context);
        failure.take_or(rendered)
    }

    /// Evaluate a single expression, preserving the value's JSON type.
    ///
    /// Accepts both `workload.go` and `{{ workload.go }}` spellings.
    pub fn eval_expr(&self, expr: &str, context: &Value) -> Result<Value, RenderError> {
        let failure = FailureSlot::default();
        let env = self.environment(&failure);
        let result = eval_in(&env, expr, context);
        failure.take_or(result)
    }

    /// Evaluate an expression for truthiness (Jinja truth rules).
    pub fn eval_bool(&self, expr: &str, context: &Value) -> Result<bool, RenderError> {
        let failure = FailureSlot::default();
        let env = self.environment(&failure);
        let result: Result<bool, minijinja::Error> = (|| {
            let compiled = env.compile_expression(strip_expr(expr))?;
            let value = compiled.eval(context)?;
            Ok(value.is_true())
        })();
        failure.take_or(result)
    }

    /// Recursively render every string inside a JSON value.
    ///
    /// Strings that are exactly one expression keep the evaluated type, so
    /// `"{{ workload.cities }}"` becomes the array itself, not its display
    /// form.
    pub fn render_value(&self, value: &Value, context: &Value) -> Result<Value, RenderError> {
        match value {
            Value::String(s) => {
                if let Some(expr) = as_single_expression(s) {
                    self.eval_expr(expr, context)
                } else {
                    Ok(Value::String(self.render_str(s, context)?))
                }
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item, context))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut rendered = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    let key = if key.contains("{{") {
                        self.render_str(key, context)?
                    } else {
                        key.clone()
                    };
                    rendered.insert(key, self.render_value(item, context)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    /// Render every template-bearing field of a serde-shaped spec.
    pub fn render_spec<T>(&self, spec: &T, context: &Value) -> Result<T, RenderError>
    where
        T: Serialize + DeserializeOwned,
    {
        let raw = serde_json::to_value(spec)
            .map_err(|e| RenderError::Template(format!("spec is not json-shaped: {e}")))?;
        let rendered = self.render_value(&raw, context)?;
        serde_json::from_value(rendered)
            .map_err(|e| RenderError::Template(format!("rendered spec no longer parses: {e}")))
    }

    fn environment<'source>(&self, failure: &FailureSlot) -> Environment<'source> {
        let mut env = Environment::new();
        let resolver = Arc::clone(&self.credentials);
        let slot = failure.clone();
        env.add_function(
            "credential",
            move |name: String| -> Result<MjValue, MjError> {
                match resolver.resolve(&name) {
                    Ok(value) => Ok(MjValue::from_serialize(&value)),
                    Err(err) => {
                        let message = err.to_string();
                        slot.set(err);
                        Err(MjError::new(MjErrorKind::InvalidOperation, message))
                    }
                }
            },
        );
        env
    }
}

fn eval_in<'s>(env: &Environment<'s>, expr: &'s str, context: &Value) -> Result<Value, RenderError> {
    let compiled = env.compile_expression(strip_expr(expr))?;
    let value = compiled.eval(context)?;
    serde_json::to_value(&value)
        .map_err(|e| RenderError::Template(format!("expression result is not json: {e}")))
}

/// `{{ expr }}` → `expr`; anything else passes through.
fn strip_expr(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Some(expr) when the whole string is a single `{{ ... }}` expression.
fn as_single_expression(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Carries a credential failure out of a minijinja callback, where only
/// `minijinja::Error` can cross.
#[derive(Clone, Default)]
struct FailureSlot(Arc<Mutex<Option<RenderError>>>);

impl FailureSlot {
    fn set(&self, err: RenderError) {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        slot.get_or_insert(err);
    }

    fn take_or<T, E: Into<RenderError>>(&self, result: Result<T, E>) -> Result<T, RenderError> {
        let stored = self.0.lock().unwrap_or_else(|e| e.into_inner()).take();
        match (result, stored) {
            (Ok(value), _) => Ok(value),
            (Err(_), Some(credential)) => Err(credential),
            (Err(err), None) => Err(err.into()),
        }
    }
}
