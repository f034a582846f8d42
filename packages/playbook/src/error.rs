use thiserror::Error;

/// Errors raised while parsing or validating a playbook document.
#[derive(Debug, Error)]
pub enum PlaybookError {
    #[error("invalid playbook yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("workflow has no `{0}` step")]
    MissingTerminal(&'static str),

    #[error("duplicate step `{0}` in workflow")]
    DuplicateStep(String),

    #[error("step `{step}` transitions to unknown step `{target}`")]
    UnknownTransition { step: String, target: String },

    #[error("step `{step}` references unknown workbook task `{task}`")]
    UnknownTask { step: String, task: String },

    #[error("duplicate workbook task `{0}`")]
    DuplicateTask(String),

    #[error("step `{0}` is an iterator but has no action to run per item")]
    IteratorWithoutAction(String),

    #[error("step `{0}`: {1}")]
    InvalidStep(String, String),
}

/// Errors raised by template rendering.
///
/// Rendering is pure except for credential resolution, so the two failure
/// classes are kept apart: a `Template` error is the author's problem, a
/// `Credential` error is an environment problem.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template error: {0}")]
    Template(String),

    #[error("credential `{name}` could not be resolved: {message}")]
    Credential { name: String, message: String },
}

impl From<minijinja::Error> for RenderError {
    fn from(err: minijinja::Error) -> Self {
        RenderError::Template(err.to_string())
    }
}
