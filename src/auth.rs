//! Identity assertion verification
//!
//! The verification policy is chosen once from configuration. `Dev` never
//! looks at the request, `Misconfigured` fails closed on every request, and
//! `Access` verifies the signed assertion header against the provider's key
//! set. Client-visible failures are deliberately uniform; the reason a token
//! was rejected is only logged.

use crate::config::{AuthConfig, GatewayMode};
use crate::jwks::{KeySetCache, KeySetError, CERTS_PATH, LOGOUT_PATH};
use chrono::Utc;
use hyper::header::HeaderName;
use hyper::http::request::Parts;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

pub const DEV_EMAIL: &str = "dev@localhost";
pub const DEV_SUBJECT: &str = "dev-user";

pub const ERR_CONFIGURATION: &str = "configuration error";
pub const ERR_NO_TOKEN: &str = "no token";
pub const ERR_INVALID_TOKEN: &str = "invalid or expired token";

/// Header consulted for the original scheme when the request target is relative
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// The identity downstream handlers see
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthUser {
    pub email: String,
    pub subject: String,
}

impl AuthUser {
    pub fn dev() -> Self {
        Self {
            email: DEV_EMAIL.to_string(),
            subject: DEV_SUBJECT.to_string(),
        }
    }
}

/// Outcome of validating one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Authenticated(AuthUser),
    Denied {
        error: &'static str,
        /// Where the client can log in; absent when the failure is not
        /// user-recoverable
        redirect_url: Option<String>,
    },
}

impl AuthResult {
    pub fn authenticated(&self) -> bool {
        matches!(self, AuthResult::Authenticated(_))
    }

    pub fn user(&self) -> Option<&AuthUser> {
        match self {
            AuthResult::Authenticated(user) => Some(user),
            AuthResult::Denied { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&'static str> {
        match self {
            AuthResult::Authenticated(_) => None,
            AuthResult::Denied { error, .. } => Some(error),
        }
    }

    pub fn redirect_url(&self) -> Option<&str> {
        match self {
            AuthResult::Authenticated(_) => None,
            AuthResult::Denied { redirect_url, .. } => redirect_url.as_deref(),
        }
    }
}

/// `aud` may be a single string or an array
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, tag: &str) -> bool {
        match self {
            Audience::One(aud) => aud == tag,
            Audience::Many(auds) => auds.iter().any(|aud| aud == tag),
        }
    }
}

/// Decoded assertion claims
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssertionClaims {
    #[serde(default)]
    pub email: String,
    pub sub: String,
    pub aud: Audience,
    pub iss: String,
    #[serde(default)]
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("malformed token: {0}")]
    Malformed(#[source] jsonwebtoken::errors::Error),
    #[error("unsupported signing algorithm {0:?}")]
    UnsupportedAlgorithm(Algorithm),
    #[error("signing key unavailable: {0}")]
    KeySet(#[from] KeySetError),
    #[error("signature verification failed")]
    BadSignature,
    #[error("audience does not include the policy audience")]
    AudienceMismatch,
    #[error("issuer does not match {0}")]
    IssuerMismatch(String),
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),
}

/// Derive the issuer base URL from a configured identity domain.
///
/// Full URLs pass through, dotted host names get a scheme, and bare team
/// names expand to the provider's hosted form.
pub fn issuer_url(identity_domain: &str, hosted_suffix: &str) -> String {
    let domain = identity_domain.trim().trim_end_matches('/');
    if domain.starts_with("https://") || domain.starts_with("http://") {
        domain.to_string()
    } else if domain.contains('.') {
        format!("https://{}", domain)
    } else {
        format!("https://{}.{}", domain, hosted_suffix.trim_matches('.'))
    }
}

pub fn login_url(issuer: &str, original_url: &str) -> String {
    format!("{}?redirect_url={}", issuer, urlencoding::encode(original_url))
}

pub fn logout_url(issuer: &str) -> String {
    format!("{}{}", issuer, LOGOUT_PATH)
}

/// Reconstruct the absolute URL the client requested
pub fn original_url(parts: &Parts) -> String {
    if parts.uri.scheme().is_some() && parts.uri.authority().is_some() {
        return parts.uri.to_string();
    }

    let scheme = parts
        .headers
        .get(X_FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| *v == "http" || *v == "https")
        .unwrap_or("http");

    let host = parts
        .headers
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.authority().map(|a| a.as_str()))
        .unwrap_or("localhost");

    let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    format!("{}://{}{}", scheme, host, path)
}

/// Verifies signed assertions for one issuer and audience
pub struct AccessVerifier {
    issuer: String,
    audience: String,
    header: HeaderName,
    keys: KeySetCache,
}

impl AccessVerifier {
    pub fn new(
        identity_domain: &str,
        policy_audience: &str,
        config: &AuthConfig,
    ) -> Result<Self, KeySetError> {
        let issuer = issuer_url(identity_domain, &config.hosted_domain_suffix);
        let keys = KeySetCache::new(
            format!("{}{}", issuer, CERTS_PATH),
            config.key_cache_ttl(),
            config.key_refresh_cooldown(),
        )?;
        let header = HeaderName::from_bytes(config.token_header.trim().as_bytes())
            .unwrap_or_else(|_| HeaderName::from_static("cf-access-jwt-assertion"));

        Ok(Self {
            issuer,
            audience: policy_audience.trim().to_string(),
            header,
            keys,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn header(&self) -> &HeaderName {
        &self.header
    }

    pub fn keys(&self) -> &KeySetCache {
        &self.keys
    }

    /// Verify signature, issuer, audience, and expiry
    pub async fn verify(&self, token: &str) -> Result<AssertionClaims, VerifyError> {
        let header = decode_header(token).map_err(VerifyError::Malformed)?;
        if !matches!(header.alg, Algorithm::RS256 | Algorithm::ES256) {
            return Err(VerifyError::UnsupportedAlgorithm(header.alg));
        }

        let key = self.keys.decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = 0;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let claims = decode::<AssertionClaims>(token, &key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => VerifyError::BadSignature,
                ErrorKind::InvalidAudience => VerifyError::AudienceMismatch,
                ErrorKind::InvalidIssuer => VerifyError::IssuerMismatch(self.issuer.clone()),
                ErrorKind::ExpiredSignature => VerifyError::Expired,
                _ => VerifyError::Invalid(e),
            })?
            .claims;

        // Expiry is strict: a token expiring this second is already stale
        if claims.exp <= Utc::now().timestamp() {
            return Err(VerifyError::Expired);
        }
        if !claims.aud.contains(&self.audience) {
            return Err(VerifyError::AudienceMismatch);
        }
        if claims.iss != self.issuer {
            return Err(VerifyError::IssuerMismatch(self.issuer.clone()));
        }

        Ok(claims)
    }
}

/// Verification policy, selected once at startup
pub enum AuthPolicy {
    Dev,
    Access(AccessVerifier),
    Misconfigured {
        missing: Vec<&'static str>,
        /// Set when only the audience is missing; logout still reaches the provider
        issuer: Option<String>,
    },
}

impl AuthPolicy {
    pub fn from_config(config: &AuthConfig) -> Result<Self, KeySetError> {
        if config.mode == GatewayMode::Dev {
            return Ok(AuthPolicy::Dev);
        }

        let missing = config.missing_secrets();
        match (&config.identity_domain, &config.policy_audience) {
            (Some(domain), Some(audience)) if missing.is_empty() => Ok(AuthPolicy::Access(
                AccessVerifier::new(domain, audience, config)?,
            )),
            _ => Ok(AuthPolicy::Misconfigured {
                missing,
                issuer: config
                    .identity_domain
                    .as_deref()
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(|d| issuer_url(d, &config.hosted_domain_suffix)),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthPolicy::Dev => "dev",
            AuthPolicy::Access(_) => "access",
            AuthPolicy::Misconfigured { .. } => "misconfigured",
        }
    }

    /// Issuer base, when one is configured
    pub fn issuer(&self) -> Option<&str> {
        match self {
            AuthPolicy::Access(verifier) => Some(verifier.issuer()),
            AuthPolicy::Misconfigured { issuer, .. } => issuer.as_deref(),
            AuthPolicy::Dev => None,
        }
    }

    /// Validate one request's identity
    pub async fn validate(&self, parts: &Parts) -> AuthResult {
        let verifier = match self {
            AuthPolicy::Dev => return AuthResult::Authenticated(AuthUser::dev()),
            AuthPolicy::Misconfigured { missing, .. } => {
                error!(missing = ?missing, "Identity verification is not configured, denying request");
                return AuthResult::Denied {
                    error: ERR_CONFIGURATION,
                    redirect_url: None,
                };
            }
            AuthPolicy::Access(verifier) => verifier,
        };

        let redirect_url = Some(login_url(verifier.issuer(), &original_url(parts)));

        let token = parts
            .headers
            .get(verifier.header())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty());

        let Some(token) = token else {
            debug!(path = parts.uri.path(), "No identity assertion presented");
            return AuthResult::Denied {
                error: ERR_NO_TOKEN,
                redirect_url,
            };
        };

        match verifier.verify(token).await {
            Ok(claims) => AuthResult::Authenticated(AuthUser {
                email: claims.email,
                subject: claims.sub,
            }),
            Err(e) => {
                warn!(path = parts.uri.path(), error = %e, "Identity assertion rejected");
                AuthResult::Denied {
                    error: ERR_INVALID_TOKEN,
                    redirect_url,
                }
            }
        }
    }
}
