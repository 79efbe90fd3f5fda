//! Answers the queue can produce without calling the backend.

use regex::Regex;

use crate::error::ResolverError;
use crate::principal::Principal;

/// A local answer source consulted before a chat task is sent.
///
/// `Ok(None)` means the input is not for this resolver and the task goes to
/// the backend. Errors are swallowed by the queue the same way.
pub trait LocalResolver: Send + Sync {
    fn resolve(&self, input: &str) -> Result<Option<String>, ResolverError>;
}

/// Dash-grouped base32 text: groups of five, last group 1-5 characters.
const PRINCIPAL_SHAPE: &str = r"(?i)^[a-z2-7]{5}(-[a-z2-7]{5})*-[a-z2-7]{1,5}$";

/// Turns a principal id into its default ledger account id.
pub struct PrincipalResolver {
    shape: Option<Regex>,
}

impl PrincipalResolver {
    pub fn new() -> Self {
        Self {
            shape: Regex::new(PRINCIPAL_SHAPE).ok(),
        }
    }

    pub fn matches(&self, input: &str) -> bool {
        self.shape
            .as_ref()
            .is_some_and(|shape| shape.is_match(input.trim()))
    }
}

impl Default for PrincipalResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalResolver for PrincipalResolver {
    fn resolve(&self, input: &str) -> Result<Option<String>, ResolverError> {
        if !self.matches(input) {
            return Ok(None);
        }

        let text = input.trim();
        let principal = Principal::from_text(text).map_err(|source| ResolverError::Principal {
            text: text.to_string(),
            source,
        })?;

        Ok(Some(format!(
            "Account ID for {}:\n{}",
            principal,
            principal.account_id()
        )))
    }
}
