use crate::exchange::Rewind;
use crate::session::new_session_id;
use crate::tunnel::TunnelContext;
use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION, HOST};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::Builder;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Proxies plain HTTP requests (anything but `CONNECT`)
pub struct ForwardHandler {
    ctx: TunnelContext,
    idle_timeout: Option<Duration>,
}

impl ForwardHandler {
    pub fn new(ctx: TunnelContext, idle_timeout: Option<Duration>) -> Self {
        Self { ctx, idle_timeout }
    }

    /// Serve the connection with hyper. The stream must replay the request
    /// head that was already read off the socket.
    pub async fn serve_connection<S>(self: Arc<Self>, stream: Rewind<S>, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let service = service_fn(move |req| {
            let handler = Arc::clone(&self);
            async move { handler.proxy(req).await }
        });

        if let Err(err) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .keep_alive(false)
            .serve_connection(TokioIo::new(stream), service)
            .await
        {
            // Only log connection errors, not normal endings
            if !err.is_incomplete_message() {
                warn!("Connection from {:?} error: {:?}", peer, err);
            }
        }
    }

    async fn proxy(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>, hyper::Error> {
        let id = new_session_id();

        if req.uri().authority().is_none() && !req.headers().contains_key(HOST) {
            warn!("HTTP #{} request missing host: {:?}", id, req.uri());
            return Ok(status_response(StatusCode::BAD_REQUEST, "HTTP request missing host"));
        }

        let target = match self.ctx.resolve_target(&head_of(&req)) {
            Ok(target) => target,
            Err(e) => {
                warn!("HTTP #{} {}", id, e);
                return Ok(status_response(StatusCode::BAD_GATEWAY, "No route to target"));
            }
        };

        if !target.cascade {
            if let Err(e) = to_origin_form(&mut req) {
                warn!("HTTP #{} {}", id, e);
                return Ok(status_response(StatusCode::BAD_REQUEST, "Bad request target"));
            }
        }
        req.headers_mut().remove("proxy-connection");
        req.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));

        debug!("HTTP #{} {} {} via {}", id, req.method(), req.uri(), target.addr);

        let io = match self.ctx.dial(&target.addr).await {
            Ok(io) => io,
            Err(e) => {
                warn!("HTTP #{} connect to {} failed: {}", id, target.addr, e);
                return Ok(status_response(StatusCode::BAD_GATEWAY, "Upstream connection failed"));
            }
        };

        let (mut sender, conn) = Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(TokioIo::new(io))
            .await?;

        // Drive the connection until the response body is fully streamed
        let conn_id = id.clone();
        let conn_handle = tokio::spawn(async move {
            if let Err(err) = conn.await {
                if !err.is_incomplete_message() {
                    debug!("HTTP #{} connection error: {:?}", conn_id, err);
                }
            }
        });

        let sent = match self.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, sender.send_request(req)).await {
                Ok(sent) => sent,
                Err(_) => {
                    conn_handle.abort();
                    warn!("HTTP #{} timeout after {:?}", id, limit);
                    return Ok(status_response(StatusCode::GATEWAY_TIMEOUT, "Request timeout"));
                }
            },
            None => sender.send_request(req).await,
        };

        match sent {
            Ok(resp) => Ok(resp.map(|b| b.boxed())),
            Err(e) => {
                conn_handle.abort();
                warn!("HTTP #{} upstream error: {}", id, e);
                Ok(status_response(StatusCode::BAD_GATEWAY, "Upstream request failed"))
            }
        }
    }
}

/// Method, target and headers of `req`, for target resolution
fn head_of(req: &Request<Incoming>) -> Request<Bytes> {
    let mut head = Request::new(Bytes::new());
    *head.method_mut() = req.method().clone();
    *head.uri_mut() = req.uri().clone();
    *head.version_mut() = req.version();
    *head.headers_mut() = req.headers().clone();
    head
}

/// Rewrite an absolute-form target to origin-form, keeping the host in `Host`
fn to_origin_form<B>(req: &mut Request<B>) -> Result<(), http::uri::InvalidUri> {
    if let Some(authority) = req.uri().authority() {
        if !req.headers().contains_key(HOST) {
            if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
                req.headers_mut().insert(HOST, host);
            }
        }
    }
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/");
    *req.uri_mut() = Uri::try_from(path)?;
    Ok(())
}

fn status_response(status: StatusCode, msg: &'static str) -> Response<ProxyBody> {
    let mut resp = Response::new(full(msg));
    *resp.status_mut() = status;
    resp
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::FixedUpstream;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Origin that records the request head and answers with a fixed body
    async fn origin(body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                if sock.read(&mut byte).await.unwrap() == 0 {
                    break;
                }
                head.push(byte[0]);
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            sock.write_all(response.as_bytes()).await.unwrap();
            sock.shutdown().await.unwrap();
            String::from_utf8(head).unwrap()
        });
        (addr, handle)
    }

    async fn exchange(handler: ForwardHandler, request: String) -> String {
        let (mut user, proxy_side) = duplex(16 * 1024);
        let serving = tokio::spawn(
            Arc::new(handler).serve_connection(Rewind::new(proxy_side, Bytes::new()), None),
        );

        user.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        user.read_to_end(&mut response).await.unwrap();
        serving.await.unwrap();
        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn forwards_get_to_origin_in_origin_form() {
        let (addr, seen) = origin("hello").await;
        let handler = ForwardHandler::new(TunnelContext::default(), Some(Duration::from_secs(5)));

        let response = exchange(
            handler,
            format!("GET http://{}/path?q=1 HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\n\r\n", addr, addr),
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
        assert!(response.ends_with("hello"));

        let head = seen.await.unwrap();
        assert!(head.starts_with("GET /path?q=1 HTTP/1.1\r\n"), "{}", head);
        assert!(!head.to_ascii_lowercase().contains("proxy-connection"));
    }

    #[tokio::test]
    async fn cascade_keeps_absolute_form() {
        let (addr, seen) = origin("via upstream").await;
        let upstream: Uri = format!("http://{}", addr).parse().unwrap();
        let ctx = TunnelContext::default().with_selector(Arc::new(FixedUpstream::new(upstream)));
        let handler = ForwardHandler::new(ctx, None);

        let response = exchange(
            handler,
            "GET http://example.invalid/x HTTP/1.1\r\nHost: example.invalid\r\n\r\n".to_string(),
        )
        .await;
        assert!(response.ends_with("via upstream"));

        let head = seen.await.unwrap();
        assert!(head.starts_with("GET http://example.invalid/x HTTP/1.1\r\n"), "{}", head);
    }

    #[tokio::test]
    async fn missing_host_is_bad_request() {
        let handler = ForwardHandler::new(TunnelContext::default(), None);
        let response = exchange(handler, "GET /relative HTTP/1.1\r\n\r\n".to_string()).await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);
    }

    #[tokio::test]
    async fn unreachable_origin_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let handler = ForwardHandler::new(TunnelContext::default(), None);
        let response = exchange(
            handler,
            format!("GET http://{}/ HTTP/1.1\r\nHost: {}\r\n\r\n", addr, addr),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", response);
    }

    #[test]
    fn origin_form_fills_in_host() {
        let mut req = Request::builder()
            .uri("http://example.com:8080")
            .body(())
            .unwrap();
        to_origin_form(&mut req).unwrap();
        assert_eq!(req.uri(), "/");
        assert_eq!(req.headers()[HOST], "example.com:8080");
    }
}
