use std::path::PathBuf;

/// Errors raised while loading scripts, resolving parameters and issuing requests.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to load {}: {source}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: Box<rhai::EvalAltResult>,
    },

    /// A required parameter has neither a stored value nor a default.
    #[error("missing parameter: {name}")]
    MissingParameter { name: String },

    #[error("duplicate parameter '{name}' in {scope}")]
    DuplicateParameter { scope: String, name: String },

    #[error("invalid {kind} '{value}'")]
    InvalidIdentifier { kind: &'static str, value: String },

    /// Raised by a script-defined group, route or generator function.
    #[error(transparent)]
    Script(#[from] Box<rhai::EvalAltResult>),

    /// Raised by a natively declared group or route.
    #[error("{name}: {message}")]
    Callable { name: String, message: String },

    #[error("route '{0}' did not return a request")]
    NotARequest(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Two routes of one script share a function name and would share storage.
    #[error("route '{0}' is declared more than once")]
    DuplicateRoute(String),

    #[error("unknown route '{0}'")]
    UnknownRoute(String),

    #[error("route '{route}' has no parameter '{name}'")]
    UnknownParameter { route: String, name: String },

    #[error("parameter '{0}' has no generator")]
    NoGenerator(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn callable(name: &str, message: impl Into<String>) -> Error {
        return Error::Callable {
            name: name.to_string(),
            message: message.into(),
        };
    }

    /// Name of the missing parameter when this is a [`Error::MissingParameter`].
    pub fn missing_parameter(&self) -> Option<&str> {
        match self {
            Error::MissingParameter { name } => Some(name),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
