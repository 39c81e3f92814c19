//! # Credential Substitution
//!
//! The secure-fill tool names an environment variable; only this module
//! turns that name into its value, immediately before dispatch. The name
//! never reaches the extension and the value never reaches a log line:
//! the resolved credential redacts itself from debug formatting and is
//! serialized straight into the outgoing command payload.

use std::fmt;

use serde_json::{json, Value};

use crate::error::{BridgeError, Result};

/// A selector paired with the resolved secret. Constructed only by
/// [`resolve`]; formatting redacts the value.
pub struct ResolvedCredential {
    selector: String,
    value: String,
}

impl ResolvedCredential {
    /// Payload for the extension's `secure_fill` command.
    pub fn into_params(self) -> Value {
        json!({ "selector": self.selector, "value": self.value })
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("selector", &self.selector)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Resolves `credential_env` from the server's environment.
pub fn resolve(selector: &str, credential_env: &str) -> Result<ResolvedCredential> {
    match std::env::var(credential_env) {
        Ok(value) => Ok(ResolvedCredential {
            selector: selector.to_string(),
            value,
        }),
        Err(_) => Err(BridgeError::EnvVarUnset(credential_env.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_present_variables() {
        std::env::set_var("BRIDGE_TEST_CREDENTIAL", "hunter2");
        let cred = resolve("#password", "BRIDGE_TEST_CREDENTIAL").unwrap();
        assert_eq!(cred.selector(), "#password");
        let params = cred.into_params();
        assert_eq!(params["value"], "hunter2");
    }

    #[test]
    fn absent_variables_fail_env_var_unset() {
        let err = resolve("#password", "BRIDGE_TEST_NOT_SET").unwrap_err();
        assert!(matches!(err, BridgeError::EnvVarUnset(name) if name == "BRIDGE_TEST_NOT_SET"));
    }

    #[test]
    fn debug_formatting_redacts_the_value() {
        std::env::set_var("BRIDGE_TEST_SECRET", "s3cr3t");
        let cred = resolve("#user", "BRIDGE_TEST_SECRET").unwrap();
        let rendered = format!("{:?}", cred);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("s3cr3t"));
    }
}
