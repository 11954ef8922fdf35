/// `security.rs` - principals, the authorization collaborator and the
/// per-request security manager.
///
/// The core never decides on its own whether an attribute read is allowed: it
/// asks a [`SecurityPolicy`]. The [`SecurityManager`] only tracks who is
/// calling and which executable (with which proxy roles) is running. A manager
/// may be shared by concurrent invocations, so each thread keeps its own stack
/// of executables.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use serde::{Deserialize, Serialize};

use crate::error::ScriptError;
use crate::host::HostObject;

/// Role every principal implicitly holds.
pub const ANONYMOUS: &str = "Anonymous";
/// Host's top administrative role.
pub const MANAGER: &str = "Manager";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(name: &str, roles: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("Anonymous User", &[])
    }

    pub fn has_role(&self, role: &str) -> bool {
        role == ANONYMOUS || self.roles.iter().any(|r| r == role)
    }

    /// True when the principal holds at least one of `roles`.
    pub fn allowed(&self, roles: &[String]) -> bool {
        roles.iter().any(|r| self.has_role(r))
    }
}

/// External authorization collaborator.
pub trait SecurityPolicy: Send + Sync {
    /// May a caller holding `roles` read `name` on `object`?
    fn validate(&self, roles: &[String], object: &dyn HostObject, name: &str) -> bool;
}

/// Role intersection against the object's (or attribute's) declared roles.
#[derive(Debug, Default, Clone, Copy)]
pub struct RolePolicy;

impl SecurityPolicy for RolePolicy {
    fn validate(&self, roles: &[String], object: &dyn HostObject, name: &str) -> bool {
        let required = object.attribute_roles(name).unwrap_or_else(|| object.roles());
        required
            .iter()
            .any(|r| r == ANONYMOUS || roles.iter().any(|held| held == r))
    }
}

/// An executable currently running on behalf of the principal.
#[derive(Debug, Clone)]
struct ExecutableContext {
    serial: u64,
    script_id: String,
    proxy_roles: Vec<String>,
}

/// Per-request view of who is calling and what is executing.
pub struct SecurityManager {
    principal: Principal,
    policy: Arc<dyn SecurityPolicy>,
    contexts: Mutex<HashMap<ThreadId, Vec<ExecutableContext>>>,
    next_serial: AtomicU64,
}

impl SecurityManager {
    pub fn new(principal: Principal, policy: Arc<dyn SecurityPolicy>) -> Self {
        Self {
            principal,
            policy,
            contexts: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Shorthand for [`RolePolicy`] managers, the common case in hosts and tests.
    pub fn with_roles(principal: Principal) -> Arc<Self> {
        Arc::new(Self::new(principal, Arc::new(RolePolicy)))
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<ThreadId, Vec<ExecutableContext>>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Innermost executable running on the calling thread.
    fn innermost<R>(&self, f: impl FnOnce(&ExecutableContext) -> R) -> Option<R> {
        self.contexts()
            .get(&thread::current().id())
            .and_then(|stack| stack.last())
            .map(f)
    }

    /// Push an executable for the calling thread; the returned guard removes
    /// it on every exit path.
    pub fn add_context(&self, script_id: &str, proxy_roles: &[String]) -> ContextGuard<'_> {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let thread = thread::current().id();
        self.contexts().entry(thread).or_default().push(ExecutableContext {
            serial,
            script_id: script_id.to_string(),
            proxy_roles: proxy_roles.to_vec(),
        });
        ContextGuard {
            manager: self,
            thread,
            serial,
        }
    }

    /// Id of the innermost script executing on this thread, if any.
    pub fn current_script(&self) -> Option<String> {
        self.innermost(|c| c.script_id.clone())
    }

    /// Proxy roles of the innermost executable replace the principal's roles.
    pub fn effective_roles(&self) -> Vec<String> {
        if let Some(roles) = self.innermost(|c| c.proxy_roles.clone()) {
            if !roles.is_empty() {
                return roles;
            }
        }
        let mut roles = self.principal.roles.clone();
        roles.push(ANONYMOUS.to_string());
        roles
    }

    /// Consult the policy for an attribute read.
    pub fn validate(&self, object: &dyn HostObject, name: &str) -> Result<(), ScriptError> {
        if self.policy.validate(&self.effective_roles(), object, name) {
            return Ok(());
        }
        Err(ScriptError::Unauthorized(format!(
            "You are not allowed to access '{name}' in this context"
        )))
    }
}

/// Removes its own executable from the stack it was pushed on when dropped.
pub struct ContextGuard<'a> {
    manager: &'a SecurityManager,
    thread: ThreadId,
    serial: u64,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        let mut contexts = self.manager.contexts();
        if let Some(stack) = contexts.get_mut(&self.thread) {
            stack.retain(|c| c.serial != self.serial);
            if stack.is_empty() {
                contexts.remove(&self.thread);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::SimpleObject;
    use std::sync::Barrier;

    #[test]
    fn role_policy_checks_object_and_attribute_roles() {
        let obj = SimpleObject::new("Folder", &["guarded"])
            .with_roles(&[MANAGER])
            .with_protected_attribute("public", serde_json::json!(1), &[ANONYMOUS]);
        let policy = RolePolicy;
        let nobody = vec![ANONYMOUS.to_string()];
        assert!(!policy.validate(&nobody, &obj, "id"));
        assert!(policy.validate(&nobody, &obj, "public"));
        assert!(policy.validate(&[MANAGER.to_string()], &obj, "id"));
    }

    #[test]
    fn proxy_roles_apply_only_inside_the_context() {
        let security = SecurityManager::with_roles(Principal::new("bob", &["Member"]));
        let obj = SimpleObject::new("Folder", &["guarded"]).with_roles(&[MANAGER]);
        assert!(security.validate(&obj, "id").is_err());
        {
            let _ctx = security.add_context("ps", &[MANAGER.to_string()]);
            assert_eq!(security.current_script().as_deref(), Some("ps"));
            assert!(security.validate(&obj, "id").is_ok());
        }
        assert!(security.current_script().is_none());
        assert!(security.validate(&obj, "id").is_err());
    }

    #[test]
    fn guards_remove_their_own_context() {
        let security = SecurityManager::with_roles(Principal::anonymous());
        let outer = security.add_context("outer", &[]);
        let inner = security.add_context("inner", &[MANAGER.to_string()]);
        drop(outer);
        assert_eq!(security.current_script().as_deref(), Some("inner"));
        assert_eq!(security.effective_roles(), vec![MANAGER.to_string()]);
        drop(inner);
        assert!(security.current_script().is_none());
    }

    #[test]
    fn proxy_roles_do_not_leak_across_threads() {
        let security = SecurityManager::with_roles(Principal::anonymous());
        let obj = Arc::new(SimpleObject::new("Folder", &["guarded"]).with_roles(&[MANAGER]));
        let entered = Arc::new(Barrier::new(2));
        let checked = Arc::new(Barrier::new(2));

        let elevated = {
            let (security, entered, checked) =
                (Arc::clone(&security), Arc::clone(&entered), Arc::clone(&checked));
            let obj = Arc::clone(&obj);
            thread::spawn(move || {
                let _ctx = security.add_context("elevated", &[MANAGER.to_string()]);
                entered.wait();
                let allowed = security.validate(&*obj, "id").is_ok();
                checked.wait();
                allowed
            })
        };
        let plain = {
            let (security, entered, checked) =
                (Arc::clone(&security), Arc::clone(&entered), Arc::clone(&checked));
            let obj = Arc::clone(&obj);
            thread::spawn(move || {
                let _ctx = security.add_context("plain", &[]);
                entered.wait();
                let current = security.current_script();
                let allowed = security.validate(&*obj, "id").is_ok();
                checked.wait();
                (current, allowed)
            })
        };

        assert!(elevated.join().unwrap());
        let (current, allowed) = plain.join().unwrap();
        assert_eq!(current.as_deref(), Some("plain"));
        assert!(!allowed);
        assert!(security.current_script().is_none());
    }

    #[test]
    fn principal_allowed_intersects_roles() {
        let p = Principal::new("alice", &["Editor"]);
        assert!(p.allowed(&["Editor".to_string(), MANAGER.to_string()]));
        assert!(!p.allowed(&[MANAGER.to_string()]));
        assert!(p.allowed(&[ANONYMOUS.to_string()]));
        assert!(!p.allowed(&[]));
    }
}
