use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthStrategy {
    /// OAuth bearer token for Google Cloud APIs.
    Gcp,
    /// SOAR platform key, sent as `AppKey`.
    SoarApiKey,
    /// BindPlane key, sent as `X-Bindplane-Api-Key`.
    BindplaneApiKey,
}

impl AuthStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStrategy::Gcp => "GCP",
            AuthStrategy::SoarApiKey => "SOAR_API_KEY",
            AuthStrategy::BindplaneApiKey => "BINDPLANE_API_KEY",
        }
    }

    /// Vault entry name that holds this strategy's secret.
    pub fn secret_name(&self) -> &'static str {
        match self {
            AuthStrategy::Gcp => "gcp_access_token",
            AuthStrategy::SoarApiKey => "soar_api_key",
            AuthStrategy::BindplaneApiKey => "bindplane_api_key",
        }
    }
}

impl fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthStrategy {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GCP" => Ok(AuthStrategy::Gcp),
            "SOAR_API_KEY" => Ok(AuthStrategy::SoarApiKey),
            "BINDPLANE_API_KEY" => Ok(AuthStrategy::BindplaneApiKey),
            other => Err(AuthError::UnknownStrategy(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("credentials missing for {strategy}: {secret} is not configured")]
    CredentialsMissing {
        strategy: AuthStrategy,
        secret: &'static str,
    },
    #[error("unknown auth strategy: {0}")]
    UnknownStrategy(String),
}

/// Per-tenant secrets. Values are loaded from the vault and never logged.
#[derive(Clone, Default)]
pub struct TenantCredentials {
    pub gcp_access_token: Option<String>,
    pub soar_api_key: Option<String>,
    pub bindplane_api_key: Option<String>,
}

impl fmt::Debug for TenantCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantCredentials")
            .field("gcp_access_token", &self.gcp_access_token.is_some())
            .field("soar_api_key", &self.soar_api_key.is_some())
            .field("bindplane_api_key", &self.bindplane_api_key.is_some())
            .finish()
    }
}

impl TenantCredentials {
    fn secret_for(&self, strategy: AuthStrategy) -> Option<&str> {
        let raw = match strategy {
            AuthStrategy::Gcp => self.gcp_access_token.as_deref(),
            AuthStrategy::SoarApiKey => self.soar_api_key.as_deref(),
            AuthStrategy::BindplaneApiKey => self.bindplane_api_key.as_deref(),
        };
        raw.filter(|v| !v.trim().is_empty())
    }
}

/// Outbound headers for one authenticated request sequence.
#[derive(Clone, Default)]
pub struct AuthContext {
    headers: Vec<(String, String)>,
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.headers.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("AuthContext").field("headers", &names).finish()
    }
}

impl AuthContext {
    /// No credentials attached. Used by tests and public endpoints.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

pub fn resolve(
    strategy: AuthStrategy,
    creds: &TenantCredentials,
) -> Result<AuthContext, AuthError> {
    let secret = creds
        .secret_for(strategy)
        .ok_or(AuthError::CredentialsMissing {
            strategy,
            secret: strategy.secret_name(),
        })?;

    let header = match strategy {
        AuthStrategy::Gcp => ("Authorization".to_string(), format!("Bearer {}", secret)),
        AuthStrategy::SoarApiKey => ("AppKey".to_string(), secret.to_string()),
        AuthStrategy::BindplaneApiKey => ("X-Bindplane-Api-Key".to_string(), secret.to_string()),
    };

    Ok(AuthContext {
        headers: vec![header],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_strategy_sets_its_own_header() {
        let creds = TenantCredentials {
            gcp_access_token: Some("ya29.token".into()),
            soar_api_key: Some("soar-key".into()),
            bindplane_api_key: Some("bp-key".into()),
        };

        let gcp = resolve(AuthStrategy::Gcp, &creds).unwrap();
        assert_eq!(
            gcp.headers(),
            &[("Authorization".to_string(), "Bearer ya29.token".to_string())]
        );
        let soar = resolve(AuthStrategy::SoarApiKey, &creds).unwrap();
        assert_eq!(soar.headers()[0].0, "AppKey");
        let bp = resolve(AuthStrategy::BindplaneApiKey, &creds).unwrap();
        assert_eq!(bp.headers()[0], ("X-Bindplane-Api-Key".into(), "bp-key".into()));
    }

    #[test]
    fn missing_or_blank_secret_is_credentials_missing() {
        let creds = TenantCredentials {
            soar_api_key: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(
            resolve(AuthStrategy::SoarApiKey, &creds).unwrap_err(),
            AuthError::CredentialsMissing {
                strategy: AuthStrategy::SoarApiKey,
                secret: "soar_api_key",
            }
        );
        assert!(resolve(AuthStrategy::Gcp, &creds).is_err());
    }

    #[test]
    fn strategy_round_trips_through_its_tag() {
        for s in [
            AuthStrategy::Gcp,
            AuthStrategy::SoarApiKey,
            AuthStrategy::BindplaneApiKey,
        ] {
            assert_eq!(s.as_str().parse::<AuthStrategy>().unwrap(), s);
        }
        assert!("OAUTH".parse::<AuthStrategy>().is_err());
    }

    #[test]
    fn debug_output_hides_secrets() {
        let creds = TenantCredentials {
            soar_api_key: Some("super-secret".into()),
            ..Default::default()
        };
        let ctx = resolve(AuthStrategy::SoarApiKey, &creds).unwrap();
        assert!(!format!("{:?} {:?}", creds, ctx).contains("super-secret"));
    }
}
