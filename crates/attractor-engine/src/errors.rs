use crate::validate::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttractorError {
    #[error("DOT parse error: {0}")]
    DotParse(String),
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("git error: {0}")]
    Git(String),
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("run canceled: {0}")]
    Canceled(String),
}

impl AttractorError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

#[derive(Debug, Error, Clone)]
#[error("validation failed with {errors_count} error(s)")]
pub struct ValidationError {
    pub diagnostics: Vec<Diagnostic>,
    pub errors_count: usize,
}

impl ValidationError {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        let errors_count = diagnostics.iter().filter(|d| d.is_error()).count();
        Self {
            diagnostics,
            errors_count,
        }
    }
}
