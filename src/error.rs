/// `error.rs` - error taxonomy shared by every scripting component.

use thiserror::Error;

/// Every failure a script operation can surface to its caller.
///
/// Compile diagnostics are not errors: they are recorded on the script and
/// only turn into [`ScriptError::NotExecutable`] when the script is called.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// Malformed or unrecognized header line in `write()` input.
    #[error("{0}")]
    DirectiveParse(String),

    /// Invocation attempted while no compiled artifact is present.
    #[error("Script (Lua) {id} has errors.")]
    NotExecutable { id: String },

    /// A guarded attribute access or import was refused.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A mutating operation was refused by proxy-role validation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Ordinary value error, e.g. a converted termination signal.
    #[error("ValueError: {0}")]
    Value(String),

    /// Arguments did not match the script's parameter list.
    #[error("TypeError: {0}")]
    Signature(String),

    /// Error raised by the script body itself.
    #[error("{0}")]
    Runtime(String),

    /// Ad-hoc execution of a body that did not compile.
    #[error("compilation failed: {}", .0.join("; "))]
    Compile(Vec<String>),

    /// Script id collides with a name bound into every script's scope.
    #[error("\"{0}\" is reserved and cannot be used as a script id")]
    ReservedId(String),

    #[error("script \"{0}\" not found")]
    NotFound(String),

    /// Binary `write()` input could not be decoded.
    #[error("cannot decode script source as {0}")]
    Encoding(String),

    #[error(transparent)]
    Lua(#[from] mlua::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ScriptError {
    /// True for both authorization error kinds.
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::Forbidden(_))
    }
}

pub type ScriptResult<T> = Result<T, ScriptError>;
