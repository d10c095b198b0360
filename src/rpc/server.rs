//! The HTTP control surface.
//!
//! One handler sees every request and walks the same gauntlet the
//! permission model requires, in order: brute-force lockout, peer-address
//! whitelist, CORS preflight, basic auth, location routing, host-header
//! whitelist, and the CSRF session id. Only then does a JSON body reach
//! the method dispatcher.

use std::io::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::engine::{general_purpose, Engine as _};
use rand::Rng as _;
use serde_json::{json, Value as Json};
use tracing::{info, warn};

pub const SESSION_ID_HEADER: &str = "X-Transmission-Session-Id";

const SESSION_ID_LEN: usize = 48;
const DEFLATE_MIN_SAVINGS: usize = 64;

const START_RETRY_COUNT: u32 = 10;
const START_RETRY_DELAY_STEP: u64 = 5;
const START_RETRY_MAX_DELAY: u64 = 60;

/// The JSON method sink the server forwards parsed requests to.
pub trait RpcHandler: Send + Sync + 'static {
    /// `Ok(arguments)` becomes `result: "success"`; `Err(text)` is passed
    /// through as the free-text `result` the protocol requires.
    fn dispatch(&self, method: &str, arguments: &Json) -> Result<Json, String>;
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub url_prefix: String,

    pub username: String,
    pub password: String,
    pub auth_required: bool,

    pub whitelist: Vec<String>,
    pub whitelist_enabled: bool,

    pub host_whitelist: Vec<String>,
    pub host_whitelist_enabled: bool,

    pub anti_brute_force_enabled: bool,
    pub anti_brute_force_threshold: u32,

    pub web_root: PathBuf,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            port: 9091,
            url_prefix: "/transmission/".to_string(),
            username: String::new(),
            password: String::new(),
            auth_required: false,
            whitelist: vec!["127.0.0.1".to_string(), "::1".to_string()],
            whitelist_enabled: true,
            host_whitelist: Vec::new(),
            host_whitelist_enabled: true,
            anti_brute_force_enabled: false,
            anti_brute_force_threshold: 100,
            web_root: PathBuf::from("web"),
        }
    }
}

pub struct RpcServer {
    state: Arc<RpcState>,
}

struct RpcState {
    config: RpcConfig,
    session_id: String,
    login_attempts: AtomicU32,
    handler: Arc<dyn RpcHandler>,
}

impl RpcServer {
    pub fn new(config: RpcConfig, handler: Arc<dyn RpcHandler>) -> Self {
        Self {
            state: Arc::new(RpcState {
                config,
                session_id: make_session_id(),
                login_attempts: AtomicU32::new(0),
                handler,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle)
            .with_state(self.state.clone())
    }

    /// Binds and serves until the returned task is aborted. Bind failures
    /// retry with a growing delay, giving a restarting machine time to
    /// release the port.
    pub async fn start(&self) -> std::io::Result<tokio::task::JoinHandle<()>> {
        let addr = SocketAddr::new(self.state.config.bind_address, self.state.config.port);
        let router = self.router();

        let mut last_err = None;
        for attempt in 0..START_RETRY_COUNT {
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!(%addr, "rpc server listening");
                    let service =
                        router.into_make_service_with_connect_info::<SocketAddr>();
                    return Ok(tokio::spawn(async move {
                        if let Err(e) = axum::serve(listener, service).await {
                            warn!(error = %e, "rpc server exited");
                        }
                    }));
                }
                Err(e) => {
                    let delay = (u64::from(attempt) + 1) * START_RETRY_DELAY_STEP;
                    let delay = delay.min(START_RETRY_MAX_DELAY);
                    warn!(%addr, error = %e, delay, "couldn't bind rpc port; retrying");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| std::io::Error::other("rpc bind failed")))
    }
}

async fn handle(
    State(state): State<Arc<RpcState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let config = &state.config;

    // 1. brute-force lockout
    if config.anti_brute_force_enabled
        && state.login_attempts.load(Ordering::Relaxed) >= config.anti_brute_force_threshold
    {
        return simple(
            StatusCode::FORBIDDEN,
            "Too many unsuccessful login attempts. Please restart the daemon.",
        );
    }

    // 2. peer address whitelist
    if config.whitelist_enabled && !address_allowed(config, &remote.ip()) {
        return simple(
            StatusCode::FORBIDDEN,
            "Unauthorized IP Address. Either disable the IP address whitelist or add your address to it.",
        );
    }

    // 3. CORS preflight: echo the requested headers back
    if method == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        if let Some(requested) = headers.get("access-control-request-headers") {
            response
                .headers_mut()
                .insert("access-control-allow-headers", requested.clone());
        }
        return response;
    }

    // 4. basic auth
    if config.auth_required {
        if !check_basic_auth(config, &headers) {
            state.login_attempts.fetch_add(1, Ordering::Relaxed);
            let mut response = simple(StatusCode::UNAUTHORIZED, "Unauthorized User");
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static("Basic realm=\"Transmission\""),
            );
            return response;
        }
        state.login_attempts.store(0, Ordering::Relaxed);
    }

    // 5. location routing, relative to the configured prefix
    let path = uri.path();
    let Some(location) = path.strip_prefix(config.url_prefix.as_str()) else {
        return simple(StatusCode::NOT_FOUND, "Not Found");
    };

    if location.is_empty() || location == "web" {
        let target = format!("{}web/", config.url_prefix);
        return (
            StatusCode::MOVED_PERMANENTLY,
            [(header::LOCATION, target)],
        )
            .into_response();
    }

    if let Some(asset) = location.strip_prefix("web/") {
        return serve_web_asset(config, asset);
    }

    // 6. host whitelist: defends an unauthenticated server against DNS
    // rebinding, where a malicious name resolves to this machine
    if !config.auth_required
        && config.host_whitelist_enabled
        && !hostname_allowed(config, &headers)
    {
        return simple(
            StatusCode::MISDIRECTED_REQUEST,
            "Misdirected Request. The Host header does not look like this server.",
        );
    }

    // 7. CSRF session id
    let client_session_id = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if client_session_id != state.session_id {
        let body = format!(
            "<h1>409: Conflict.</h1>\
             <p>Your request had an invalid session-id header.</p>\
             <p>Resend your request with this updated header:</p>\
             <p><code>{}: {}</code></p>",
            SESSION_ID_HEADER, state.session_id
        );
        return with_session_id(
            &state.session_id,
            (StatusCode::CONFLICT, html(body)).into_response(),
        );
    }

    if location == "rpc" {
        if method != Method::POST {
            return simple(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        }
        return with_session_id(&state.session_id, handle_rpc(&state, &headers, &body));
    }

    simple(StatusCode::NOT_FOUND, "Not Found")
}

fn handle_rpc(state: &RpcState, headers: &HeaderMap, body: &[u8]) -> Response {
    let parsed: Json = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "Bad Request"),
    };

    let tag = parsed.get("tag").cloned();
    let method = parsed.get("method").and_then(Json::as_str).unwrap_or("");
    let empty_args = json!({});
    let arguments = parsed.get("arguments").unwrap_or(&empty_args);

    // the protocol reports failures as free text in `result`, never as an
    // http error
    let mut reply = match state.handler.dispatch(method, arguments) {
        Ok(arguments) => json!({ "result": "success", "arguments": arguments }),
        Err(errmsg) => json!({ "result": errmsg }),
    };
    if let Some(tag) = tag {
        reply["tag"] = tag;
    }

    let payload = reply.to_string().into_bytes();
    let accepts_gzip = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("gzip"));

    if accepts_gzip {
        if let Some(compressed) = gzip_if_smaller(&payload) {
            return (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "application/json; charset=UTF-8"),
                    (header::CONTENT_ENCODING, "gzip"),
                ],
                compressed,
            )
                .into_response();
        }
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json; charset=UTF-8")],
        payload,
    )
        .into_response()
}

fn serve_web_asset(config: &RpcConfig, asset: &str) -> Response {
    // reject any attempt to climb out of the web root
    if asset.split('/').any(|part| part == "..") {
        return simple(StatusCode::FORBIDDEN, "Forbidden");
    }

    let asset = if asset.is_empty() { "index.html" } else { asset };
    let path = config.web_root.join(asset);

    match std::fs::read(&path) {
        Ok(contents) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, mimetype_for(asset))],
            contents,
        )
            .into_response(),
        Err(_) => simple(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn mimetype_for(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("css") => "text/css",
        Some("gif") => "image/gif",
        Some("html") => "text/html",
        Some("ico") => "image/vnd.microsoft.icon",
        Some("js") => "application/javascript",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

fn address_allowed(config: &RpcConfig, addr: &IpAddr) -> bool {
    let text = addr.to_string();
    config.whitelist.iter().any(|pattern| wildmat(&text, pattern))
}

fn hostname_allowed(config: &RpcConfig, headers: &HeaderMap) -> bool {
    let Some(host) = headers.get(header::HOST).and_then(|v| v.to_str().ok()) else {
        return false;
    };

    // strip a port, careful not to mangle a bracketed ipv6 literal
    let host = host.trim();
    let hostname = if let Some(end) = host.strip_prefix('[').and_then(|h| h.find(']')) {
        &host[1..end + 1]
    } else {
        host.rsplit_once(':')
            .filter(|(name, port)| !name.is_empty() && port.parse::<u16>().is_ok())
            .map(|(name, _)| name)
            .unwrap_or(host)
    };

    // ip literals can't be spoofed by dns rebinding
    if hostname.trim_matches(['[', ']']).parse::<IpAddr>().is_ok() {
        return true;
    }

    let hostname = hostname.trim_end_matches('.');
    if hostname.eq_ignore_ascii_case("localhost") {
        return true;
    }

    config
        .host_whitelist
        .iter()
        .any(|pattern| wildmat(hostname, pattern))
}

fn check_basic_auth(config: &RpcConfig, headers: &HeaderMap) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = text.split_once(':') else {
        return false;
    };

    user == config.username && pass == config.password
}

/// Shell-style wildcard match: `*` spans anything, `?` one character.
pub(super) fn wildmat(text: &str, pattern: &str) -> bool {
    fn matches(t: &[u8], p: &[u8]) -> bool {
        match (t.first(), p.first()) {
            (_, None) => t.is_empty(),
            (_, Some(b'*')) => matches(t, &p[1..]) || (!t.is_empty() && matches(&t[1..], p)),
            (Some(tc), Some(pc)) => (*pc == b'?' || tc == pc) && matches(&t[1..], &p[1..]),
            (None, Some(_)) => false,
        }
    }
    matches(text.as_bytes(), pattern.as_bytes())
}

fn gzip_if_smaller(payload: &[u8]) -> Option<Vec<u8>> {
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(6));
    encoder.write_all(payload).ok()?;
    let compressed = encoder.finish().ok()?;

    (compressed.len() + DEFLATE_MIN_SAVINGS < payload.len()).then_some(compressed)
}

fn make_session_id() -> String {
    const POOL: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::rng();
    (0..SESSION_ID_LEN)
        .map(|_| POOL[rng.random_range(0..POOL.len())] as char)
        .collect()
}

fn simple(status: StatusCode, text: &str) -> Response {
    (status, html(format!("<h1>{}</h1>", text))).into_response()
}

fn html(body: String) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=UTF-8")], body)
}

fn with_session_id(session_id: &str, mut response: Response) -> Response {
    if let Ok(value) = header::HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}
