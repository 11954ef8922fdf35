pub mod config;
pub mod db;
pub mod error;
pub mod host;
pub mod scripting;
pub mod security;

pub use config::ScriptingConfig;
pub use error::{ScriptError, ScriptResult};
pub use scripting::engine::ScriptEngine;
pub use scripting::script::{Invocation, Script};
