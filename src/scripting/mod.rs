/// `scripting/` - restricted Lua scripts
///
/// A script is stored as source, compiled once into a guarded artifact and
/// executed in its own isolated Lua VM (mlua) on every call.
/// Body errors are returned to the caller; they never poison the registry.
pub mod api;
pub mod bindings;
pub mod cache;
pub mod compiler;
pub mod directives;
pub mod engine;
pub mod proxy;
pub mod sandbox;
pub mod script;
pub mod signature;
pub mod standard;
pub mod version;
