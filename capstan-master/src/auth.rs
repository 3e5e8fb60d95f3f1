//! Connection authentication
//!
//! Policy lives outside the core: the supervisor hands the presented token to
//! an `Authorizer` and only cares about the resulting owner name.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::MasterError;

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Resolve a presented token to the owning user, or refuse
    async fn authenticate(&self, token: &str) -> Result<String, MasterError>;
}

/// Token table authorizer; token -> owner
#[derive(Default)]
pub struct StaticAuthorizer {
    tokens: HashMap<String, String>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, owner: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), owner.into());
        self
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authenticate(&self, token: &str) -> Result<String, MasterError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| MasterError::Auth("unknown token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_authorizer() {
        let authorizer = StaticAuthorizer::new().with_token("secret", "ops");
        assert_eq!(authorizer.authenticate("secret").await.unwrap(), "ops");
        assert!(authorizer.authenticate("wrong").await.is_err());
    }
}
