use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use metrics::counter;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::AuthConfig;
use crate::context::AuthClaims;
use crate::error::{GatewayError, Result as GatewayResult};
use super::matches_any_prefix;

/// External token-verification collaborator: signature and expiry checks only.
/// The gateway never issues or refreshes tokens.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> GatewayResult<AuthClaims>;
}

/// Claims as they appear on the wire
#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
    exp: u64,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
}

impl From<TokenClaims> for AuthClaims {
    fn from(claims: TokenClaims) -> Self {
        let mut scopes = claims.scopes;
        if let Some(scope) = claims.scope {
            scopes.extend(scope.split_whitespace().map(str::to_string));
        }
        scopes.dedup();

        AuthClaims {
            subject: claims.sub,
            expiry: claims.exp,
            scopes,
        }
    }
}

/// HMAC-signed JWT verifier
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let algorithm = match config.algorithm.as_str() {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => anyhow::bail!("Unsupported JWT algorithm: {}", other),
        };

        let mut validation = Validation::new(algorithm);
        validation.set_required_spec_claims(&["exp", "sub"]);
        validation.validate_exp = true;
        validation.leeway = config.leeway_secs;
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }

        Ok(Self {
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        })
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> GatewayResult<AuthClaims> {
        match decode::<TokenClaims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => {
                if data.claims.sub.is_empty() {
                    return Err(GatewayError::Unauthorized("token has an empty subject".to_string()));
                }
                Ok(data.claims.into())
            }
            Err(e) => {
                let detail = match e.kind() {
                    ErrorKind::ExpiredSignature => "token expired".to_string(),
                    ErrorKind::InvalidSignature => "invalid token signature".to_string(),
                    ErrorKind::InvalidIssuer => "unexpected token issuer".to_string(),
                    _ => format!("token rejected: {}", e),
                };
                Err(GatewayError::Unauthorized(detail))
            }
        }
    }
}

/// Bearer-token gate with an exemption list
pub struct AuthGate {
    verifier: Arc<dyn TokenVerifier>,
    exempt_paths: Vec<String>,
}

impl AuthGate {
    pub fn new(verifier: Arc<dyn TokenVerifier>, exempt_paths: Vec<String>) -> Self {
        Self {
            verifier,
            exempt_paths,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let verifier = JwtVerifier::new(config)?;
        Ok(Self::new(Arc::new(verifier), config.exempt_paths.clone()))
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        matches_any_prefix(path, &self.exempt_paths)
    }

    /// Exempt paths get anonymous claims; everything else needs a valid token
    pub async fn authorize(&self, path: &str, token: Option<&str>) -> GatewayResult<AuthClaims> {
        if self.is_exempt(path) {
            return Ok(AuthClaims::anonymous());
        }

        let token = token.ok_or_else(|| {
            counter!("gateway_auth_failures_total").increment(1);
            GatewayError::Unauthorized("missing bearer token".to_string())
        })?;

        match self.verifier.verify(token).await {
            Ok(claims) => {
                debug!("Token verified for subject {}", claims.subject);
                Ok(claims)
            }
            Err(e) => {
                counter!("gateway_auth_failures_total").increment(1);
                info!("Rejected credential on {}: {}", path, e.detail());
                Err(e)
            }
        }
    }
}

/// Extract the token from `Authorization: Bearer <token>`
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    pub(crate) const SECRET: &str = "test-secret";

    fn now_secs() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    pub(crate) fn mint(secret: &str, sub: &str, exp_offset: i64) -> String {
        let claims = json!({
            "sub": sub,
            "exp": (now_secs() as i64 + exp_offset) as u64,
            "scope": "leads:read leads:write",
        });
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    pub(crate) fn auth_config() -> AuthConfig {
        AuthConfig {
            secret: SECRET.to_string(),
            ..AuthConfig::default()
        }
    }

    #[tokio::test]
    async fn test_valid_token_yields_claims() {
        let gate = AuthGate::from_config(&auth_config()).unwrap();
        let token = mint(SECRET, "user-1", 3600);

        let claims = gate.authorize("/api/v1/leads", Some(&token)).await.unwrap();
        assert_eq!(claims.subject, "user-1");
        assert!(claims.scopes.iter().any(|scope| scope == "leads:write"));
        assert!(claims.expiry > now_secs());
    }

    #[tokio::test]
    async fn test_missing_expired_and_forged_tokens_are_unauthorized() {
        let gate = AuthGate::from_config(&auth_config()).unwrap();

        let missing = gate.authorize("/api/v1/leads", None).await;
        assert!(matches!(missing, Err(GatewayError::Unauthorized(_))));

        let expired = mint(SECRET, "user-1", -3600);
        match gate.authorize("/api/v1/leads", Some(&expired)).await {
            Err(GatewayError::Unauthorized(detail)) => assert_eq!(detail, "token expired"),
            other => panic!("expected Unauthorized, got {:?}", other),
        }

        let forged = mint("someone-else", "user-1", 3600);
        match gate.authorize("/api/v1/leads", Some(&forged)).await {
            Err(GatewayError::Unauthorized(detail)) => assert_eq!(detail, "invalid token signature"),
            other => panic!("expected Unauthorized, got {:?}", other),
        }

        let garbage = gate.authorize("/api/v1/leads", Some("not-a-jwt")).await;
        assert!(matches!(garbage, Err(GatewayError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_exempt_paths_ignore_credentials() {
        let gate = AuthGate::from_config(&auth_config()).unwrap();

        let claims = gate.authorize("/health", None).await.unwrap();
        assert!(claims.is_anonymous());

        let forged = mint("someone-else", "user-1", 3600);
        assert!(gate.authorize("/documentation/json", Some(&forged)).await.is_ok());
    }

    #[tokio::test]
    async fn test_issuer_is_enforced_when_configured() {
        let mut config = auth_config();
        config.issuer = Some("solar-crm".to_string());
        let gate = AuthGate::from_config(&config).unwrap();

        let token = mint(SECRET, "user-1", 3600);
        assert!(gate.authorize("/api/v1/leads", Some(&token)).await.is_err());
    }

    #[test]
    fn test_unsupported_algorithm_is_rejected() {
        let mut config = auth_config();
        config.algorithm = "RS256".to_string();
        assert!(JwtVerifier::new(&config).is_err());
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer   xyz "));
        assert_eq!(bearer_token(&headers), Some("xyz"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(bearer_token(&headers), None);
    }
}
