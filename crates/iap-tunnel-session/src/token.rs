//! Access token providers
//!
//! Sessions ask for a bearer token once per open. Providers do not cache:
//! a refresher running outside this process can rotate the token file and
//! the next session picks it up.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::{SessionError, SessionResult};

/// Source of bearer tokens for session establishment
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetch the current access token, `None` when no credentials apply
    async fn access_token(&self) -> SessionResult<Option<String>>;
}

/// Provider for unauthenticated transports
#[derive(Debug, Clone, Copy, Default)]
pub struct NoToken;

#[async_trait]
impl TokenProvider for NoToken {
    async fn access_token(&self) -> SessionResult<Option<String>> {
        Ok(None)
    }
}

/// Fixed token supplied on the command line or through the environment
#[derive(Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticToken").finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> SessionResult<Option<String>> {
        Ok(Some(self.token.clone()))
    }
}

/// Token read from a file on every request
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl TokenProvider for TokenFile {
    async fn access_token(&self) -> SessionResult<Option<String>> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SessionError::Token(format!(
                "Failed to read token file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let token = contents.trim();
        if token.is_empty() {
            return Err(SessionError::Token(format!(
                "Token file {} is empty",
                self.path.display()
            )));
        }

        Ok(Some(token.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_no_token() {
        assert_eq!(NoToken.access_token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_static_token() {
        let provider = StaticToken::new("ya29.token");
        assert_eq!(
            provider.access_token().await.unwrap(),
            Some("ya29.token".to_string())
        );
        assert!(!format!("{:?}", provider).contains("ya29"));
    }

    #[tokio::test]
    async fn test_token_file_is_reread() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "first-token").unwrap();

        let provider = TokenFile::new(file.path());
        assert_eq!(
            provider.access_token().await.unwrap(),
            Some("first-token".to_string())
        );

        std::fs::write(file.path(), "  rotated-token\n").unwrap();
        assert_eq!(
            provider.access_token().await.unwrap(),
            Some("rotated-token".to_string())
        );
    }

    #[tokio::test]
    async fn test_token_file_errors() {
        let missing = TokenFile::new("/nonexistent/iap-tunnel/token");
        assert!(matches!(
            missing.access_token().await,
            Err(SessionError::Token(_))
        ));

        let empty = tempfile::NamedTempFile::new().unwrap();
        let provider = TokenFile::new(empty.path());
        let err = provider.access_token().await.unwrap_err();
        assert!(err.to_string().contains("is empty"));
    }
}
