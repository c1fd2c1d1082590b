use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use std::path::Path;
use yup_oauth2::{
    AuthorizedUserAuthenticator, ApplicationSecret, authorized_user::AuthorizedUserSecret,
    read_application_secret,
};

use crate::config::GmailConfig;
use crate::error::MailboxError;

pub const SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.modify"];

/// The OAuth client this deployment is registered as.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
}

/// A freshly exchanged access token, still in plaintext.
#[derive(Debug, Clone)]
pub struct FreshToken {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthClient {
    pub async fn load_secret<P: AsRef<Path>>(path: P) -> Result<ApplicationSecret> {
        read_application_secret(path)
            .await
            .context("Failed to read application secret")
    }

    /// Explicit id/secret win over a credentials file.
    pub async fn from_config(config: &GmailConfig) -> Result<Self> {
        if let (Some(client_id), Some(client_secret)) = (&config.client_id, &config.client_secret)
        {
            return Ok(Self {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            });
        }
        match &config.credentials_file {
            Some(path) => {
                let secret = Self::load_secret(path).await?;
                Ok(Self {
                    client_id: secret.client_id,
                    client_secret: secret.client_secret,
                })
            }
            None => bail!("Gmail OAuth client is not configured"),
        }
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<FreshToken, MailboxError> {
        let secret = AuthorizedUserSecret {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            refresh_token: refresh_token.to_string(),
            key_type: "authorized_user".to_string(),
        };

        let auth = AuthorizedUserAuthenticator::builder(secret)
            .build()
            .await
            .map_err(|e| MailboxError::Refresh(e.to_string()))?;

        let token = auth
            .token(SCOPES)
            .await
            .map_err(|e| MailboxError::Refresh(e.to_string()))?;

        let access_token = token
            .token()
            .ok_or_else(|| MailboxError::Refresh("token endpoint returned no access token".to_string()))?
            .to_string();
        let expires_at = token
            .expiration_time()
            .and_then(|t| DateTime::from_timestamp(t.unix_timestamp(), 0));

        Ok(FreshToken {
            access_token,
            expires_at,
        })
    }
}
