use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{
        ConnectInfo, State,
        ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;

use crate::conduit::{
    channel::WsChannel,
    config::ShareConfig,
    credential::Credential,
    session::SessionFactory,
    telemetry::SharedPrometheusHandle,
};

const DEFAULT_RESPONSE: &str = "Conduit WebSocket tunnel\n";
const SHARE_TAG: &str = "conduit-ws";

/// Everything except RFC 3986 unreserved characters.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');
/// Query rules, but IPv6 literals keep their brackets and colons.
const AUTHORITY_HOST: &AsciiSet = &QUERY_VALUE.remove(b'[').remove(b']').remove(b':');

#[derive(Clone)]
pub struct AppState {
    pub factory: SessionFactory,
    pub credential: Credential,
    pub ws_path: String,
    pub share: ShareConfig,
    pub prom: Option<SharedPrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    let ws_path = state.ws_path.clone();
    let shared = Arc::new(state);

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route(&ws_path, get(tunnel_or_info));
    if ws_path != "/" {
        app = app.route("/", get(info));
    }

    app.fallback(default_response)
        .with_state(shared)
        .layer(TraceLayer::new_for_http())
}

/// Serves until `shutdown` flips to `true`.
///
/// Upgraded sockets are detached from the HTTP connection, so live tunnels are
/// not waited on here.
pub async fn serve_with_shutdown(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);

    tracing::info!(listen_addr = %listener.local_addr()?, "server: listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    })
    .await?;

    Ok(())
}

async fn tunnel_or_info(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(st): State<Arc<AppState>>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(_) => return share_page(&st, &headers),
    };

    let factory = st.factory.clone();
    ws.on_upgrade(move |socket| async move {
        let session = factory.session(WsChannel::new(socket), peer.to_string());
        tracing::debug!(sid = %session.id(), client = %peer, "server: websocket upgraded");
        session.run().await;
    })
}

async fn info(headers: HeaderMap, State(st): State<Arc<AppState>>) -> Response {
    share_page(&st, &headers)
}

async fn default_response() -> &'static str {
    DEFAULT_RESPONSE
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AppState>>) -> Response {
    match &st.prom {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn share_page(st: &AppState, headers: &HeaderMap) -> Response {
    if !st.share.enabled {
        return DEFAULT_RESPONSE.into_response();
    }

    let host = if st.share.host.is_empty() {
        headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(hostname_of)
            .unwrap_or("localhost")
    } else {
        st.share.host.as_str()
    };

    let link = share_link(&st.credential, host, st.share.port, &st.ws_path);
    let body = format!(
        "Conduit tunnel configuration\n\
         ============================\n\
         \n\
         {link}\n\
         \n\
         protocol: vless\n\
         id:       {id}\n\
         host:     {host}\n\
         port:     {port}\n\
         security: tls\n\
         network:  ws\n\
         path:     {path}\n",
        id = st.credential,
        port = st.share.port,
        path = st.ws_path,
    );
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

/// Builds the `vless://` import link that clients understand.
pub fn share_link(credential: &Credential, host: &str, port: u16, ws_path: &str) -> String {
    format!(
        "vless://{credential}@{}:{port}?encryption=none&security=tls&type=ws&host={}&path={}#{SHARE_TAG}",
        utf8_percent_encode(host, AUTHORITY_HOST),
        utf8_percent_encode(host, QUERY_VALUE),
        utf8_percent_encode(ws_path, QUERY_VALUE),
    )
}

/// Strips the port from a `Host` header value, keeping IPv6 brackets intact.
fn hostname_of(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, _)) => name,
        None => host,
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, time::Duration};

    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    use super::*;
    use crate::conduit::{
        net::TcpDialer,
        protocol::{Address, encode_header},
        session::SessionOptions,
    };

    #[test]
    fn share_link_shape() {
        let cred = Credential::dev_placeholder();
        assert_eq!(
            share_link(&cred, "edge.example.com", 443, "/"),
            "vless://12345678-1234-1234-1234-123456789abc@edge.example.com:443\
             ?encryption=none&security=tls&type=ws&host=edge.example.com&path=%2F#conduit-ws"
        );
        assert!(share_link(&cred, "h", 8443, "/a b").contains(":8443?"));
        assert!(share_link(&cred, "h", 443, "/a b").contains("path=%2Fa%20b#"));
        assert!(share_link(&cred, "[::1]", 443, "/").contains("@[::1]:443?"));
    }

    #[test]
    fn share_link_escapes_host_in_authority_and_query() {
        let cred = Credential::dev_placeholder();
        let link = share_link(&cred, "edge.example&path=/evil#x", 443, "/");
        assert!(link.contains("@edge.example%26path%3D%2Fevil%23x:443?"), "{link}");
        assert!(link.contains("&host=edge.example%26path%3D%2Fevil%23x&path=%2F#conduit-ws"), "{link}");
        assert_eq!(link.matches("&path=").count(), 1, "{link}");
        assert_eq!(link.matches('#').count(), 1, "{link}");
    }

    #[test]
    fn host_header_port_is_stripped() {
        assert_eq!(hostname_of("example.com:8080"), "example.com");
        assert_eq!(hostname_of("example.com"), "example.com");
        assert_eq!(hostname_of("[::1]:8080"), "[::1]");
    }

    struct Harness {
        addr: SocketAddr,
        shutdown: watch::Sender<bool>,
        server: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    async fn start(ws_path: &str, share_enabled: bool) -> Harness {
        let state = AppState {
            factory: SessionFactory::new(
                Credential::dev_placeholder(),
                Arc::new(TcpDialer),
                SessionOptions::default(),
            ),
            credential: Credential::dev_placeholder(),
            ws_path: ws_path.to_string(),
            share: ShareConfig {
                enabled: share_enabled,
                host: String::new(),
                port: 443,
            },
            prom: None,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve_with_shutdown(listener, state, rx));
        Harness {
            addr,
            shutdown: tx,
            server,
        }
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut s = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: tunnel.test:8080\r\nConnection: close\r\n\r\n");
        s.write_all(req.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        s.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    async fn echo_target() -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = ln.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn plain_routes() {
        let h = start("/tunnel", false).await;

        let health = http_get(h.addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with(r#"{"ok":true}"#));

        let metrics = http_get(h.addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 404"));

        for path in ["/", "/tunnel", "/elsewhere"] {
            let body = http_get(h.addr, path).await;
            assert!(body.starts_with("HTTP/1.1 200"), "{path}: {body}");
            assert!(body.ends_with(DEFAULT_RESPONSE), "{path}: {body}");
            assert!(!body.contains("vless://"));
        }

        let _ = h.shutdown.send(true);
        h.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn share_page_uses_request_host() {
        let h = start("/", true).await;

        let body = http_get(h.addr, "/").await;
        assert!(
            body.contains("vless://12345678-1234-1234-1234-123456789abc@tunnel.test:443?"),
            "{body}"
        );
        assert!(body.contains("path=%2F#conduit-ws"));

        let _ = h.shutdown.send(true);
        h.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn websocket_tunnel_relays_to_target() {
        let target = echo_target().await;
        let h = start("/tunnel", false).await;

        let (mut ws, _) = connect_async(format!("ws://{}/tunnel", h.addr))
            .await
            .unwrap();

        let mut first = Vec::new();
        encode_header(
            &mut first,
            0,
            &Credential::dev_placeholder(),
            &Address::Ipv4(Ipv4Addr::LOCALHOST),
            target.port(),
        )
        .unwrap();
        first.extend_from_slice(b"hello ");
        ws.send(Message::binary(first)).await.unwrap();
        ws.send(Message::binary(b"world".to_vec())).await.unwrap();

        let mut echoed = Vec::new();
        while echoed.len() < b"hello world".len() {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Binary(b) = msg {
                echoed.extend_from_slice(&b);
            }
        }
        assert_eq!(echoed, b"hello world");

        ws.close(None).await.unwrap();
        let _ = h.shutdown.send(true);
        h.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn websocket_bad_credential_is_closed() {
        let h = start("/", false).await;

        let (mut ws, _) = connect_async(format!("ws://{}/", h.addr)).await.unwrap();
        let mut first = Vec::new();
        encode_header(
            &mut first,
            0,
            &Credential::generate(),
            &Address::Domain("example.com".into()),
            80,
        )
        .unwrap();
        ws.send(Message::binary(first)).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap();
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 1011);
                assert!(frame.reason.is_empty());
            }
            other => panic!("expected close frame, got {other:?}"),
        }

        let _ = h.shutdown.send(true);
        h.server.await.unwrap().unwrap();
    }
}
