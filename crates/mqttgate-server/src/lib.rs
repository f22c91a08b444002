use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{FromRequest, MatchedPath, Multipart, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use mqttgate_bridge::{Bridge, BridgeError, Connector, Endpoint, MqttConnector, Qos, Reply};
use mqttgate_config::{Config, Enctype, Methods, HEALTH_PATH};
use mqttgate_contracts::{ErrorResponse, Params};
use mqttgate_kernel::Policy;
use serde_json::json;
use tracing::{error, info, warn};

/// Largest URL-encoded request body read into parameters.
pub const MAX_FORM_BYTES: usize = 1024 * 1024;

type Failure = (StatusCode, Json<ErrorResponse>);

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;
    let routes = cfg.routes.len();

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, routes, "mqttgate listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    build_app_with_connector(cfg, Arc::new(MqttConnector)).await
}

/// Same as [`build_app`] with the broker transport supplied by the caller.
pub async fn build_app_with_connector(
    cfg: Config,
    connector: Arc<dyn Connector>,
) -> Result<Router, String> {
    mqttgate_config::validate_runtime_support(&cfg).map_err(|e| e.to_string())?;
    let state = AppState::new(&cfg, connector)?;

    let mut router = Router::new().route(HEALTH_PATH, get(healthz));
    for path in state.routes.keys() {
        router = router.route(path, get(bridge_request).post(bridge_request));
    }
    Ok(router.with_state(state))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[derive(Clone)]
struct AppState {
    bridge: Bridge,
    routes: Arc<HashMap<String, RouteState>>,
}

struct RouteState {
    enabled: bool,
    methods: Methods,
    enctype: Enctype,
    route: mqttgate_bridge::Route,
}

impl AppState {
    fn new(cfg: &Config, connector: Arc<dyn Connector>) -> Result<Self, String> {
        let mut routes = HashMap::new();
        for r in &cfg.routes {
            let broker = r.resolved_broker(&cfg.broker);
            let qos = Qos::try_from(r.qos).map_err(|e| format!("route {}: {e}", r.path))?;
            let route = mqttgate_bridge::Route {
                endpoint: Endpoint {
                    host: broker.host,
                    port: broker.port,
                    keepalive: Duration::from_secs(broker.keepalive_secs),
                    username: broker.username,
                    password: broker.password,
                    max_packet_size: broker.max_packet_size,
                },
                pub_topic: r.pub_topic.clone(),
                sub_topic: r.sub_topic.clone(),
                policy: Policy::new(r.allow_list(), r.checks.clone()),
                qos,
                timeout: Duration::from_millis(r.timeout_ms),
            };
            routes.insert(
                r.path.clone(),
                RouteState {
                    enabled: r.enabled,
                    methods: r.methods,
                    enctype: r.enctype,
                    route,
                },
            );
        }
        Ok(Self {
            bridge: Bridge::new(connector, cfg.broker.client_id_prefix.clone()),
            routes: Arc::new(routes),
        })
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn bridge_request(
    State(state): State<AppState>,
    matched: MatchedPath,
    request: Request,
) -> Result<Response, Failure> {
    let path = matched.as_str();
    let Some(entry) = state.routes.get(path).filter(|r| r.enabled) else {
        return Err(failure(
            StatusCode::NOT_FOUND,
            "route_disabled",
            format!("{path} is not enabled"),
        ));
    };

    let allowed = match *request.method() {
        Method::GET => entry.methods.allows_get(),
        Method::POST => entry.methods.allows_post(),
        _ => false,
    };
    if !allowed {
        return Err(failure(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            format!("{} is not accepted on {path}", request.method()),
        ));
    }

    let params = read_params(entry.enctype, request).await?;
    let reply = state
        .bridge
        .request(&entry.route, &params)
        .await
        .map_err(|e| bridge_failure(path, e))?;
    reply_response(reply).map_err(|e| bridge_failure(path, e))
}

/// Collects query parameters, then body parameters, as the route's
/// encoding restriction permits.
async fn read_params(enctype: Enctype, request: Request) -> Result<Params, Failure> {
    let mut params = match request.uri().query() {
        Some(query) if enctype.reads_query() => Params::from_query(query),
        _ => Params::new(),
    };
    if *request.method() != Method::POST {
        return Ok(params);
    }

    match BodyKind::of(&request) {
        BodyKind::Multipart => {
            if !enctype.accepts_multipart() {
                return Err(unsupported_encoding("multipart/form-data"));
            }
            params.append(read_multipart(request).await?);
        }
        BodyKind::UrlEncoded => {
            let bytes = axum::body::to_bytes(request.into_body(), MAX_FORM_BYTES)
                .await
                .map_err(|e| failure(StatusCode::BAD_REQUEST, "invalid_body", e.to_string()))?;
            if !bytes.is_empty() {
                if !enctype.accepts_urlencoded() {
                    return Err(unsupported_encoding("application/x-www-form-urlencoded"));
                }
                params.append(Params::from_query(&String::from_utf8_lossy(&bytes)));
            }
        }
        BodyKind::Other(content_type) => return Err(unsupported_encoding(&content_type)),
    }
    Ok(params)
}

enum BodyKind {
    Multipart,
    UrlEncoded,
    Other(String),
}

impl BodyKind {
    /// A body without a content type is read as URL-encoded.
    fn of(request: &Request<Body>) -> Self {
        let Some(value) = request.headers().get(header::CONTENT_TYPE) else {
            return BodyKind::UrlEncoded;
        };
        let content_type = value.to_str().unwrap_or_default().to_ascii_lowercase();
        let essence = content_type.split(';').next().unwrap_or_default().trim();
        match essence {
            "multipart/form-data" => BodyKind::Multipart,
            "application/x-www-form-urlencoded" | "" => BodyKind::UrlEncoded,
            other => BodyKind::Other(other.to_string()),
        }
    }
}

/// Text fields only; file parts are skipped.
async fn read_multipart(request: Request) -> Result<Params, Failure> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| failure(StatusCode::BAD_REQUEST, "invalid_body", e.body_text()))?;
    let mut params = Params::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| failure(StatusCode::BAD_REQUEST, "invalid_body", e.body_text()))?
    {
        if field.file_name().is_some() {
            continue;
        }
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let value = field
            .text()
            .await
            .map_err(|e| failure(StatusCode::BAD_REQUEST, "invalid_body", e.body_text()))?;
        params.push(name, value);
    }
    Ok(params)
}

fn reply_response(reply: Reply) -> Result<Response, BridgeError> {
    let content_type = HeaderValue::from_str(&reply.content_type).map_err(|_| {
        BridgeError::Decode(format!(
            "reply content type {:?} is not a valid header value",
            reply.content_type
        ))
    })?;
    Ok(([(header::CONTENT_TYPE, content_type)], reply.body).into_response())
}

fn bridge_failure(path: &str, e: BridgeError) -> Failure {
    let (status, code) = match &e {
        BridgeError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
        BridgeError::Template(_) => (StatusCode::INTERNAL_SERVER_ERROR, "template_error"),
        BridgeError::Encode(_) => (StatusCode::INTERNAL_SERVER_ERROR, "encode_error"),
        BridgeError::Decode(_) => (StatusCode::INTERNAL_SERVER_ERROR, "decode_error"),
        BridgeError::Connect(_) => (StatusCode::SERVICE_UNAVAILABLE, "connect_failed"),
        BridgeError::Publish(_) => (StatusCode::SERVICE_UNAVAILABLE, "publish_failed"),
        BridgeError::Subscribe(_) => (StatusCode::SERVICE_UNAVAILABLE, "subscribe_failed"),
        BridgeError::TimedOut(_) => (StatusCode::SERVICE_UNAVAILABLE, "timeout"),
    };
    if status.is_server_error() {
        error!(path, code, error = %e, "bridge request failed");
    } else {
        warn!(path, code, error = %e, "bridge request rejected");
    }

    let body = match &e {
        BridgeError::Validation(v) => {
            ErrorResponse::new(code, e.to_string()).with_details(json!({ "key": v.key() }))
        }
        _ => ErrorResponse::new(code, e.to_string()),
    };
    (status, Json(body))
}

fn unsupported_encoding(content_type: &str) -> Failure {
    failure(
        StatusCode::UNSUPPORTED_MEDIA_TYPE,
        "unsupported_encoding",
        format!("{content_type} bodies are not accepted on this route"),
    )
}

fn failure(status: StatusCode, code: &str, message: impl Into<String>) -> Failure {
    (status, Json(ErrorResponse::new(code, message)))
}
