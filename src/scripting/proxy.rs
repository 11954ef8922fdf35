/// `scripting/proxy.rs` - proxy role checks on mutating operations.

use crate::error::ScriptError;
use crate::security::{SecurityManager, MANAGER};

/// Permit when `roles` is empty or the principal holds one of them.
pub fn validate_proxy(
    script_id: &str,
    roles: &[String],
    security: &SecurityManager,
) -> Result<(), ScriptError> {
    if roles.is_empty() {
        return Ok(());
    }
    let principal = security.principal();
    if principal.allowed(roles) {
        return Ok(());
    }
    Err(ScriptError::Forbidden(format!(
        "You are not authorized to change {script_id} because you do not have proxy roles. \
         ({}, [{}])",
        principal.name,
        roles.join(", ")
    )))
}

/// Changing the proxy roles checks both the stored and the requested set.
pub fn validate_proxy_change(
    script_id: &str,
    current: &[String],
    requested: &[String],
    security: &SecurityManager,
) -> Result<(), ScriptError> {
    if security.principal().has_role(MANAGER) {
        return Ok(());
    }
    validate_proxy(script_id, requested, security)?;
    validate_proxy(script_id, current, security)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::Principal;

    fn roles(r: &[&str]) -> Vec<String> {
        r.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_roles_always_pass() {
        let sec = SecurityManager::with_roles(Principal::anonymous());
        assert!(validate_proxy("s", &[], &sec).is_ok());
    }

    #[test]
    fn missing_role_is_forbidden() {
        let sec = SecurityManager::with_roles(Principal::new("bob", &["Member"]));
        let err = validate_proxy("s", &roles(&[MANAGER]), &sec).unwrap_err();
        assert!(matches!(err, ScriptError::Forbidden(_)));
        let msg = err.to_string();
        assert!(msg.contains("change s") && msg.contains("bob"), "{msg}");
        assert!(validate_proxy("s", &roles(&["Member"]), &sec).is_ok());
    }

    #[test]
    fn change_checks_both_sets() {
        let sec = SecurityManager::with_roles(Principal::new("bob", &["Member"]));
        assert!(validate_proxy_change("s", &[], &roles(&["Member"]), &sec).is_ok());
        assert!(validate_proxy_change("s", &roles(&[MANAGER]), &roles(&["Member"]), &sec).is_err());
        assert!(validate_proxy_change("s", &[], &roles(&[MANAGER]), &sec).is_err());

        let admin = SecurityManager::with_roles(Principal::new("root", &[MANAGER]));
        assert!(validate_proxy_change("s", &roles(&["Owner"]), &roles(&["Other"]), &admin).is_ok());
    }
}
