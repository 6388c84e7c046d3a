//! Gateway-internal endpoints: health, registration and version

use crate::app::AppDefinition;
use crate::error::RegistrationError;
use crate::registration::Registrar;
use crate::supervisor::{ProcessStatus, StatusCache};
use futures::future::try_join_all;
use http_body_util::{combinators::BoxBody, BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted registration payload
pub const MAX_REGISTRATION_BODY: usize = 1024 * 1024;

pub const HEALTH_PATH: &str = "/health";
pub const HEALTH_APP_PREFIX: &str = "/health/";
pub const REGISTER_PATH: &str = "/register-app";
pub const VERSION_PATH: &str = "/version";

fn full(body: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Helper to create a JSON response - infallible with valid StatusCode
fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full(body.to_string()))
        .expect("valid response with StatusCode enum and static header")
}

fn status_message(status: StatusCode, outcome: &str, message: impl Into<String>) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_response(
        status,
        &serde_json::json!({ "status": outcome, "message": message.into() }),
    )
}

/// Redirect to `location` with 302 Found
pub fn redirect(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, location)
        .body(full(Bytes::new()))
        .unwrap_or_else(|_| {
            let mut response = Response::new(full(Bytes::new()));
            *response.status_mut() = StatusCode::FOUND;
            response
        })
}

pub fn version() -> Response<BoxBody<Bytes, hyper::Error>> {
    json_response(
        StatusCode::OK,
        &serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
    )
}

#[derive(Debug, Serialize)]
struct AppHealth {
    name: String,
    status: Option<ProcessStatus>,
    mem: Option<u64>,
    cpu: Option<f64>,
}

/// `GET /health`: status of every admitted application
pub async fn health_summary(apps: Vec<AppDefinition>, status: &StatusCache) -> Response<BoxBody<Bytes, hyper::Error>> {
    let lookups = apps.iter().map(|app| async move {
        let info = status.describe(&app.name).await?;
        Ok::<_, crate::error::SupervisorError>(AppHealth {
            name: app.name.clone(),
            status: info.as_ref().map(|i| i.status),
            mem: info.as_ref().and_then(|i| i.memory_bytes),
            cpu: info.as_ref().and_then(|i| i.cpu_percent),
        })
    });

    match try_join_all(lookups).await {
        Ok(apps) => json_response(StatusCode::OK, &serde_json::json!({ "status": "ok", "apps": apps })),
        Err(e) => {
            error!(error = %e, "Health summary failed");
            status_message(StatusCode::INTERNAL_SERVER_ERROR, "error", e.to_string())
        }
    }
}

/// `GET /health/{name}`: status of one application
pub async fn app_health(name: &str, status: &StatusCache) -> Response<BoxBody<Bytes, hyper::Error>> {
    match status.describe(name).await {
        Ok(info) => json_response(
            StatusCode::OK,
            &serde_json::json!({ "name": name, "status": info.map(|i| i.status) }),
        ),
        Err(e) => {
            error!(app = name, error = %e, "Health check failed");
            status_message(StatusCode::INTERNAL_SERVER_ERROR, "error", e.to_string())
        }
    }
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    bearer_matches(
        req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
        expected_token,
    )
}

/// `Authorization: Bearer <token>` carrying exactly `expected_token`
fn bearer_matches(header: Option<&str>, expected_token: &str) -> bool {
    header
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| constant_time_compare(token, expected_token))
        .unwrap_or(false)
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// `POST /register-app`
pub async fn register_app(
    req: Request<Incoming>,
    registrar: Arc<Registrar>,
    token: Option<&str>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if let Some(expected) = token {
        if !check_auth(&req, expected) {
            warn!("Unauthorized registration request");
            return status_message(StatusCode::UNAUTHORIZED, "error", "unauthorized");
        }
    }

    let body = match Limited::new(req.into_body(), MAX_REGISTRATION_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return status_message(StatusCode::PAYLOAD_TOO_LARGE, "error", "Payload too large");
        }
        Err(e) => {
            debug!(error = %e, "Failed to read registration body");
            return status_message(StatusCode::BAD_REQUEST, "error", "Failed to read request body");
        }
    };

    let app: AppDefinition = match serde_json::from_slice(&body) {
        Ok(app) => app,
        Err(e) => {
            return status_message(StatusCode::BAD_REQUEST, "error", format!("Invalid app definition: {}", e));
        }
    };

    info!(app = %app.name, port = %app.port_display(), path = %app.path, "Registration requested");

    // Run detached so a client disconnect cannot cancel a start or restart midway
    let result = tokio::spawn(async move { registrar.register(app).await }).await;

    match result {
        Ok(Ok(outcome)) => status_message(StatusCode::OK, "ok", outcome.message()),
        Ok(Err(e @ (RegistrationError::Conflict(_) | RegistrationError::Invalid(_)))) => {
            status_message(StatusCode::BAD_REQUEST, "error", e.to_string())
        }
        Ok(Err(RegistrationError::Supervisor(e))) => {
            error!(error = %e, "Registration failed");
            status_message(StatusCode::INTERNAL_SERVER_ERROR, "error", e.to_string())
        }
        Err(e) => {
            error!(error = %e, "Registration task failed");
            status_message(StatusCode::INTERNAL_SERVER_ERROR, "error", "Registration failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SupervisorError;
    use crate::supervisor::{LaunchSpec, ProcessInfo, ProcessSupervisor};
    use async_trait::async_trait;
    use std::time::Duration;

    struct FixedSupervisor {
        fail: bool,
    }

    #[async_trait]
    impl ProcessSupervisor for FixedSupervisor {
        async fn describe(&self, name: &str) -> Result<Option<ProcessInfo>, SupervisorError> {
            if self.fail {
                return Err(SupervisorError::Describe {
                    name: name.to_string(),
                    reason: "unreachable".to_string(),
                });
            }
            if name.contains("ghost") {
                return Ok(None);
            }
            let mut info = ProcessInfo::new(name, ProcessStatus::Online);
            info.memory_bytes = Some(4096);
            info.cpu_percent = Some(1.5);
            Ok(Some(info))
        }

        async fn start(&self, _spec: LaunchSpec) -> Result<(), SupervisorError> {
            Ok(())
        }

        async fn restart(&self, _name: &str) -> Result<(), SupervisorError> {
            Ok(())
        }

        async fn stop(&self, _name: &str) -> Result<(), SupervisorError> {
            Ok(())
        }
    }

    fn cache(fail: bool) -> StatusCache {
        StatusCache::new(Arc::new(FixedSupervisor { fail }), Duration::ZERO)
    }

    async fn body_json(response: Response<BoxBody<Bytes, hyper::Error>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_version_response() {
        let json = body_json(version()).await;
        assert_eq!(json["name"], PKG_NAME);
        assert_eq!(json["version"], VERSION);
    }

    #[tokio::test]
    async fn test_health_summary_lists_apps() {
        let apps = vec![
            AppDefinition::new("@ck/a@v1", "a.js", 7000, "/a"),
            AppDefinition::new("@ck/ghost@v1", "g.js", 7001, "/g"),
        ];
        let response = health_summary(apps, &cache(false)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["apps"][0]["name"], "@ck/a@v1");
        assert_eq!(json["apps"][0]["status"], "online");
        assert_eq!(json["apps"][0]["mem"], 4096);
        assert_eq!(json["apps"][1]["status"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_health_summary_failure_is_500() {
        let apps = vec![AppDefinition::new("@ck/a@v1", "a.js", 7000, "/a")];
        let response = health_summary(apps, &cache(true)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_app_health() {
        let response = app_health("@ck/a@v1", &cache(false)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["name"], "@ck/a@v1");
        assert_eq!(json["status"], "online");
    }

    #[test]
    fn test_bearer_token_required() {
        assert!(bearer_matches(Some("Bearer s3cret"), "s3cret"));
        assert!(!bearer_matches(Some("s3cret"), "s3cret"));
        assert!(!bearer_matches(Some("Basic s3cret"), "s3cret"));
        assert!(!bearer_matches(Some("Bearer s3cre"), "s3cret"));
        assert!(!bearer_matches(Some("Bearer s3cret!"), "s3cret"));
        assert!(!bearer_matches(None, "s3cret"));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "abcd"));
    }

    #[test]
    fn test_redirect_sets_location() {
        let response = redirect("/error");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get("location").unwrap(), "/error");
    }
}
