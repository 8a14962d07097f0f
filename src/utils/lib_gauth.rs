use std::path::Path;

use log::info;
use yup_oauth2::ServiceAccountAuthenticator;

use crate::error::EtlError;

pub const WEBMASTERS_READONLY: &str = "https://www.googleapis.com/auth/webmasters.readonly";

/// Mint an OAuth2 access token from a service account key file.
///
/// One token is requested per run.  Tokens are valid for an hour, which is
/// far longer than a daily query takes.
pub async fn access_token(key_path: &Path, scopes: &[&str]) -> Result<String, EtlError> {
    let key = yup_oauth2::read_service_account_key(key_path)
        .await
        .map_err(|e| {
            EtlError::Auth(format!(
                "can't read service account key {}: {}",
                key_path.display(),
                e
            ))
        })?;
    info!("authenticating as {}", key.client_email);

    let auth = ServiceAccountAuthenticator::builder(key)
        .build()
        .await
        .map_err(|e| EtlError::Auth(e.to_string()))?;
    let token = auth
        .token(scopes)
        .await
        .map_err(|e| EtlError::Auth(e.to_string()))?;
    match token.token() {
        Some(t) => Ok(t.to_string()),
        None => Err(EtlError::Auth("token response had no access token".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, path::Path};

    use super::*;

    #[tokio::test]
    async fn missing_key_file() {
        let res = access_token(
            Path::new("/nonexistent/service-account.json"),
            &[WEBMASTERS_READONLY],
        )
        .await;
        assert!(matches!(res, Err(EtlError::Auth(_))));
    }

    #[ignore]
    #[tokio::test]
    async fn live_token() -> Result<(), Box<dyn Error>> {
        dotenvy::from_path(Path::new(".env/test.env"))?;
        let path = std::env::var("GOOGLE_APPLICATION_CREDENTIALS")?;
        let token = access_token(Path::new(&path), &[WEBMASTERS_READONLY]).await?;
        assert!(!token.is_empty());
        Ok(())
    }
}
