/// `scripting/version.rs` - stale artifact detection.
///
/// Every artifact is stamped with the interpreter's bytecode header and with
/// [`SCRIPT_MAGIC`]. A stored artifact whose stamps differ from the running
/// process is thrown away and rebuilt from source.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use mlua::Lua;
use serde::{Deserialize, Serialize};

/// Bump only to force every stored script to recompile.
pub const SCRIPT_MAGIC: u32 = 1;

/// Signature, version, format, data check, type sizes and test values.
const HEADER_LEN: usize = 31;

const COMPLAINT: &str = "Some of your scripts have stale code cached. Since this runtime \
cannot use that code, loading will be slightly slower until these scripts are edited. \
Run `scriptctl recompile` to rebuild and persist every script with this problem.";

/// Hex of the running interpreter's bytecode header.
pub fn runtime_version_tag() -> &'static str {
    static TAG: OnceLock<String> = OnceLock::new();
    TAG.get_or_init(|| {
        let lua = Lua::new();
        match lua.load("").into_function() {
            Ok(f) => {
                let dump = f.dump(true);
                hex::encode(&dump[..dump.len().min(HEADER_LEN)])
            }
            Err(e) => {
                log::error!("[version_guard] cannot compute runtime tag: {e}");
                String::new()
            }
        }
    })
}

/// The two stamps recorded on a successful compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionStamps {
    pub runtime_tag: String,
    pub script_magic: u32,
}

impl VersionStamps {
    pub fn current() -> Self {
        Self {
            runtime_tag: runtime_version_tag().to_string(),
            script_magic: SCRIPT_MAGIC,
        }
    }
}

/// Decides whether stored stamps are usable and complains once when not.
///
/// The complaint flag lives for the guard's lifetime; the process-wide guard
/// from [`VersionGuard::shared`] therefore complains once per process.
#[derive(Debug, Default)]
pub struct VersionGuard {
    complained: AtomicBool,
}

impl VersionGuard {
    pub const fn new() -> Self {
        Self {
            complained: AtomicBool::new(false),
        }
    }

    pub fn shared() -> Arc<VersionGuard> {
        static SHARED: OnceLock<Arc<VersionGuard>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(VersionGuard::new())))
    }

    pub fn is_current(&self, stamps: Option<&VersionStamps>) -> bool {
        stamps.is_some_and(|s| *s == VersionStamps::current())
    }

    /// Log the stale-code notice; true only for the first call.
    pub fn complain_once(&self) -> bool {
        if self.complained.swap(true, Ordering::SeqCst) {
            return false;
        }
        log::info!("[version_guard] {COMPLAINT}");
        true
    }

    pub fn has_complained(&self) -> bool {
        self.complained.load(Ordering::SeqCst)
    }
}
