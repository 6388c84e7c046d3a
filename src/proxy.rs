//! HTTP listener, internal endpoints and the health-gated reverse proxy

use crate::admin;
use crate::config::ServerConfig;
use crate::error::{json_error_response, GatewayErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registration::Registrar;
use crate::router::{requested_version, select_target};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Request-handling settings taken from `[server]`
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub expose_health_checks: bool,
    pub error_path: String,
    pub registration_token: Option<String>,
    pub request_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for GatewaySettings {
    fn from(server: &ServerConfig) -> Self {
        Self {
            expose_health_checks: server.expose_health_checks,
            error_path: server.error_path.clone(),
            registration_token: server.registration_token.clone(),
            request_timeout: server.request_timeout(),
        }
    }
}

/// Shared state behind every connection
pub struct Gateway {
    registrar: Arc<Registrar>,
    pool: Arc<ConnectionPool>,
    settings: GatewaySettings,
}

impl Gateway {
    pub fn new(registrar: Arc<Registrar>, settings: GatewaySettings, pool_config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            registrar,
            pool: Arc::new(ConnectionPool::new(pool_config)),
            settings,
        })
    }
}

/// The gateway's HTTP listener
pub struct GatewayServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(bind_addr: SocketAddr, gateway: Arc<Gateway>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gateway).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { handle_request(req, gateway, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::GET {
        if let Some(response) = handle_internal(&path, &gateway).await {
            return Ok(response);
        }
    }

    if method == Method::POST && path == admin::REGISTER_PATH {
        let token = gateway.settings.registration_token.as_deref();
        return Ok(admin::register_app(req, Arc::clone(&gateway.registrar), token).await);
    }

    proxy_request(req, gateway, client_addr).await
}

/// GET health and version endpoints. Health routes fall through to normal
/// routing unless they are exposed.
async fn handle_internal(path: &str, gateway: &Gateway) -> Option<Response<BoxBody<Bytes, hyper::Error>>> {
    if path == admin::VERSION_PATH {
        return Some(admin::version());
    }

    if !gateway.settings.expose_health_checks {
        return None;
    }

    let registrar = &gateway.registrar;
    if path == admin::HEALTH_PATH {
        let apps = registrar.registry().snapshot();
        return Some(admin::health_summary(apps, registrar.status()).await);
    }

    let name = path.strip_prefix(admin::HEALTH_APP_PREFIX)?;
    let name = urlencoding::decode(name).ok()?;
    if !registrar.routes().has_health_endpoint(&name) {
        return None;
    }
    Some(admin::app_health(&name, registrar.status()).await)
}

async fn proxy_request(
    mut req: Request<Incoming>,
    gateway: Arc<Gateway>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path = req.uri().path().to_string();
    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let registrar = &gateway.registrar;
    let Some(prefix) = registrar.routes().match_prefix(&path) else {
        return Ok(json_error_response(
            GatewayErrorCode::RouteNotFound,
            format!("No application serves {}", path),
        ));
    };

    let version = requested_version(req.uri().query());
    let Some(target) = select_target(registrar.registry(), &prefix, version.as_deref()) else {
        return Ok(json_error_response(
            GatewayErrorCode::RouteNotFound,
            format!("No application serves {}", path),
        ));
    };

    let Some(port) = target.port else {
        warn!(app = %target.name, "Target has no port");
        return Ok(admin::redirect(&gateway.settings.error_path));
    };

    // Health gate: only online backends receive traffic
    match registrar.status().describe(&target.name).await {
        Ok(Some(info)) if info.is_online() => {}
        Ok(info) => {
            debug!(
                app = %target.name,
                status = info.map(|i| i.status.as_str()).unwrap_or("unknown"),
                "Backend not online, redirecting"
            );
            return Ok(admin::redirect(&gateway.settings.error_path));
        }
        Err(e) => {
            error!(app = %target.name, error = %e, "Failed to query backend status");
            return Ok(json_error_response(
                GatewayErrorCode::SupervisorUnavailable,
                "Backend status unavailable",
            ));
        }
    }

    // Overwrite X-Forwarded-* rather than appending; the gateway is the first trusted hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let request_timeout = gateway.settings.request_timeout;
    let result = tokio::time::timeout(request_timeout, gateway.pool.send_request(req, port)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(app = %target.name, port, error = %e, "Failed to forward request");
            Ok(json_error_response(
                GatewayErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
        Err(_) => {
            warn!(
                app = %target.name,
                port,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                GatewayErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", request_timeout.as_secs()),
            ))
        }
    }
}
