//! Gateway entry: per-request routing
//!
//! Order of evaluation for every request:
//!
//! 1. `GET /logout` redirects before any authentication.
//! 2. The auth policy runs for everything else, `/health` included. Denials
//!    become a login redirect or a 403 JSON body.
//! 3. `GET /health` answers locally.
//! 4. Anything else is forwarded to the supervised backend. Upgrade
//!    requests are tunnelled and keep their lease until the tunnel closes.

use crate::auth::{logout_url, AuthPolicy, AuthResult, AuthUser};
use crate::config::Config;
use crate::error::{json_error_response, GatewayErrorCode};
use crate::forwarder::{is_upgrade_request, Forwarder, GatewayBody, PoolConfig};
use crate::jwks::KeySetError;
use crate::supervisor::Supervisor;
use chrono::{SecondsFormat, Utc};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, LOCATION};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header carrying a caller-supplied request id
pub const X_REQUEST_ID: &str = "x-request-id";

pub const LOGOUT_ROUTE: &str = "/logout";
pub const HEALTH_ROUTE: &str = "/health";

/// Identity and bookkeeping for one authenticated request
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user: AuthUser,
    pub request_id: String,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    timestamp: String,
}

pub struct Gateway {
    policy: AuthPolicy,
    supervisor: Arc<Supervisor>,
    forwarder: Forwarder,
}

impl Gateway {
    pub fn new(policy: AuthPolicy, supervisor: Arc<Supervisor>, forwarder: Forwarder) -> Self {
        Self {
            policy,
            supervisor,
            forwarder,
        }
    }

    /// Build the policy, supervisor and forwarder from configuration
    pub fn from_config(config: &Config) -> Result<Self, KeySetError> {
        let policy = AuthPolicy::from_config(&config.auth)?;
        let supervisor = Supervisor::new(config.container.clone());
        let forwarder = Forwarder::new(PoolConfig::from(&config.server));
        Ok(Self::new(policy, supervisor, forwarder))
    }

    pub fn policy(&self) -> &AuthPolicy {
        &self.policy
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    /// Handle one request. Never fails: every error becomes a response.
    pub async fn handle(&self, req: Request<GatewayBody>) -> Response<GatewayBody> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if req.method() == Method::GET && req.uri().path() == LOGOUT_ROUTE {
            return self.logout(&request_id);
        }

        let (parts, body) = req.into_parts();

        let user = match self.policy.validate(&parts).await {
            AuthResult::Authenticated(user) => user,
            AuthResult::Denied {
                redirect_url: Some(url),
                error,
            } => {
                debug!(request_id = %request_id, path = parts.uri.path(), reason = error, "Redirecting to login");
                return redirect(&url);
            }
            AuthResult::Denied {
                error,
                redirect_url: None,
            } => {
                return json_error_response(GatewayErrorCode::Unauthorized, error);
            }
        };

        let ctx = RequestContext { user, request_id };

        if parts.method == Method::GET && parts.uri.path() == HEALTH_ROUTE {
            return health_response();
        }

        self.proxy(&ctx, Request::from_parts(parts, body)).await
    }

    fn logout(&self, request_id: &str) -> Response<GatewayBody> {
        let target = match (&self.policy, self.policy.issuer()) {
            (AuthPolicy::Dev, _) => "/".to_string(),
            (_, Some(issuer)) => logout_url(issuer),
            (_, None) => "/".to_string(),
        };
        debug!(request_id, location = %target, "Logout");
        redirect(&target)
    }

    async fn proxy(&self, ctx: &RequestContext, req: Request<GatewayBody>) -> Response<GatewayBody> {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let lease = match self.supervisor.get_or_start(self.supervisor.binding()).await {
            Ok(lease) => lease,
            Err(e) => {
                error!(request_id = %ctx.request_id, error = %e, "Backend failed to start");
                return json_error_response(
                    GatewayErrorCode::BackendStartFailed,
                    "Backend is not available",
                );
            }
        };

        let port = lease.port();
        let result = if is_upgrade_request(&req) {
            self.forwarder.tunnel(req, lease).await
        } else {
            self.forwarder.forward(req, &lease).await
        };

        match result {
            Ok(response) => {
                info!(
                    request_id = %ctx.request_id,
                    user = %ctx.user.email,
                    method = %method,
                    path = %path,
                    status = response.status().as_u16(),
                    latency_ms = start.elapsed().as_millis(),
                    "Request completed"
                );
                response
            }
            Err(e) => {
                error!(
                    request_id = %ctx.request_id,
                    port,
                    error = %e,
                    "Backend request failed"
                );
                json_error_response(GatewayErrorCode::ConnectionFailed, "Backend request failed")
            }
        }
    }
}

fn empty() -> GatewayBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn redirect(location: &str) -> Response<GatewayBody> {
    match Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location)
        .body(empty())
    {
        Ok(response) => response,
        Err(e) => {
            error!(location, error = %e, "Redirect target is not a valid header value");
            json_error_response(GatewayErrorCode::InternalError, "Internal Server Error")
        }
    }
}

fn health_response() -> Response<GatewayBody> {
    let body = HealthBody {
        status: "ok",
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    let json = serde_json::to_string(&body).unwrap_or_else(|_| r#"{"status":"ok"}"#.to_string());

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(json)).map_err(|never| match never {}).boxed())
        .expect("valid response with static headers")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, ContainerConfig};
    use crate::error::X_GATEWAY_ERROR;

    fn gateway(auth: AuthConfig) -> Gateway {
        let mut container = ContainerConfig::attached(closed_port());
        container.startup_timeout_secs = 1;
        container.health_check_interval_ms = 20;
        Gateway::new(
            AuthPolicy::from_config(&auth).unwrap(),
            Supervisor::new(container),
            Forwarder::new(PoolConfig::default()),
        )
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn request(method: Method, path: &str) -> Request<GatewayBody> {
        Request::builder()
            .method(method)
            .uri(path)
            .header("host", "app.example.com")
            .body(empty())
            .unwrap()
    }

    async fn json_body(response: Response<GatewayBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_dev_health() {
        let gateway = gateway(AuthConfig::dev());
        let response = gateway.handle(request(Method::GET, "/health")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        let timestamp = body["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
        assert!(timestamp.ends_with('Z'));
    }

    #[tokio::test]
    async fn test_dev_logout_redirects_home() {
        let gateway = gateway(AuthConfig::dev());
        let response = gateway.handle(request(Method::GET, "/logout")).await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/");
    }

    #[tokio::test]
    async fn test_prod_logout_redirects_to_provider() {
        let gateway = gateway(AuthConfig::prod("team", "policy-123"));
        let response = gateway.handle(request(Method::GET, "/logout")).await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[LOCATION],
            "https://team.cloudflareaccess.com/cdn-cgi/access/logout"
        );
    }

    #[tokio::test]
    async fn test_logout_without_identity_domain_redirects_home() {
        let gateway = gateway(AuthConfig::default());
        let response = gateway.handle(request(Method::GET, "/logout")).await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/");
    }

    #[tokio::test]
    async fn test_misconfigured_prod_returns_403_json() {
        let gateway = gateway(AuthConfig::default());

        for path in ["/", "/health", "/anything"] {
            let response = gateway.handle(request(Method::GET, path)).await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
            assert_eq!(response.headers()[X_GATEWAY_ERROR], "UNAUTHORIZED");
            let body = json_body(response).await;
            assert_eq!(
                body,
                serde_json::json!({"error": "Unauthorized", "message": "configuration error"})
            );
        }
    }

    #[tokio::test]
    async fn test_health_requires_authentication() {
        let gateway = gateway(AuthConfig::prod("team", "policy-123"));
        let response = gateway.handle(request(Method::GET, "/health")).await;

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()[LOCATION].to_str().unwrap();
        assert_eq!(
            location,
            "https://team.cloudflareaccess.com?redirect_url=http%3A%2F%2Fapp.example.com%2Fhealth"
        );
    }

    #[tokio::test]
    async fn test_post_logout_is_not_a_logout() {
        let gateway = gateway(AuthConfig::prod("team", "policy-123"));
        let response = gateway.handle(request(Method::POST, "/logout")).await;

        // Falls through to authentication like any other path
        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(response.headers()[LOCATION]
            .to_str()
            .unwrap()
            .contains("redirect_url="));
    }

    #[tokio::test]
    async fn test_backend_start_failure_is_503() {
        let gateway = gateway(AuthConfig::dev());
        let response = gateway.handle(request(Method::GET, "/app")).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[X_GATEWAY_ERROR], "BACKEND_START_FAILED");
        assert_eq!(gateway.supervisor().stats().errors(), 1);
    }
}
