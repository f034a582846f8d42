//! Inline code executor.
//!
//! The source is written to a scratch file and handed to the configured
//! interpreter. The rendered input context arrives as JSON on stdin; stdout
//! is the result, parsed as JSON when it parses, kept as a string otherwise.
//! A non-zero exit is a tool error carrying stderr.

use std::process::Stdio;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::ExecError;

pub async fn execute(
    runtime: &str,
    source: &str,
    input: &Value,
    cancel: &CancellationToken,
) -> Result<Value, ExecError> {
    let scratch = tempfile::NamedTempFile::new()
        .map_err(|e| ExecError::Tool(format!("cannot create scratch file: {e}")))?;
    std::fs::write(scratch.path(), source)
        .map_err(|e| ExecError::Tool(format!("cannot write source: {e}")))?;

    let mut argv = runtime.split_whitespace();
    let program = argv
        .next()
        .ok_or_else(|| ExecError::Tool("empty code runtime".into()))?;

    let mut child = Command::new(program)
        .args(argv)
        .arg(scratch.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecError::Tool(format!("cannot spawn `{program}`: {e}")))?;

    let context_json = serde_json::to_vec(input)
        .map_err(|e| ExecError::Tool(format!("input context does not serialize: {e}")))?;
    if let Some(mut stdin) = child.stdin.take() {
        // A program that never reads stdin is fine; a write error other than
        // a closed pipe is not.
        if let Err(e) = stdin.write_all(&context_json).await {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(ExecError::Tool(format!("cannot write context: {e}")));
            }
        }
        drop(stdin);
    }

    // kill_on_drop reaps the interpreter if we bail on cancellation.
    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(ExecError::Cancelled),
        output = child.wait_with_output() => {
            output.map_err(|e| ExecError::Tool(format!("interpreter failed: {e}")))?
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExecError::Tool(format!(
            "code exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
}
