use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST};
use http::{Method, Request, StatusCode, Version};
use httparse::Status;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Largest request head accepted from a client
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Largest CONNECT body buffered for verbatim forwarding
pub const MAX_CONNECT_BODY_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

const MAX_HEADERS: usize = 100;

/// The request exactly as it arrived on the wire (head and body)
#[derive(Debug, Clone)]
pub struct RawRequest(pub Bytes);

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("connection closed before the request head was complete")]
    Incomplete,

    #[error("request head too large")]
    HeadTooLarge,

    #[error("CONNECT body too large")]
    BodyTooLarge,

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HijackError {
    #[error("connection already hijacked")]
    AlreadyHijacked,

    #[error("response already started")]
    ResponseStarted,
}

/// A stream with bytes that were read ahead and must be seen again first
#[derive(Debug)]
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(inner: S, prefix: Bytes) -> Self {
        Self { prefix, inner }
    }

    pub fn buffered(&self) -> &[u8] {
        &self.prefix
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// One request/response exchange on a raw client connection.
///
/// The exchange owns the socket until a handler either answers through
/// [`HttpExchange::write_error`] or takes the socket over with
/// [`HttpExchange::hijack`].
#[derive(Debug)]
pub struct HttpExchange<S> {
    stream: Option<S>,
    buffered: Bytes,
    response_started: bool,
}

impl<S> HttpExchange<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, buffered: Bytes) -> Self {
        Self {
            stream: Some(stream),
            buffered,
            response_started: false,
        }
    }

    /// Take exclusive control of the raw connection.
    ///
    /// Bytes the client sent after the request are replayed by the returned
    /// stream before anything else is read from the socket.
    pub fn hijack(&mut self) -> Result<Rewind<S>, HijackError> {
        if self.response_started {
            return Err(HijackError::ResponseStarted);
        }
        let stream = self.stream.take().ok_or(HijackError::AlreadyHijacked)?;
        Ok(Rewind::new(stream, std::mem::take(&mut self.buffered)))
    }

    #[cfg(test)]
    pub fn is_hijacked(&self) -> bool {
        self.stream.is_none()
    }

    /// Answer with a plain-text error response and close the connection
    pub async fn write_error(&mut self, status: StatusCode, text: &str) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, HijackError::AlreadyHijacked))?;
        self.response_started = true;

        let body = format!("{}\n", text);
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nX-Content-Type-Options: nosniff\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;
        stream.shutdown().await
    }

    /// Give the raw connection back with every byte read so far replayed,
    /// for handlers that re-parse the request themselves
    pub fn into_replay(mut self, raw: &RawRequest) -> Option<Rewind<S>> {
        let stream = self.stream.take()?;
        let mut prefix = BytesMut::with_capacity(raw.0.len() + self.buffered.len());
        prefix.extend_from_slice(&raw.0);
        prefix.extend_from_slice(&self.buffered);
        Some(Rewind::new(stream, prefix.freeze()))
    }

    /// Read the next request off the connection.
    ///
    /// Returns `Ok(None)` when the client closed the connection without sending
    /// anything. For `CONNECT`, a `Content-Length` body is read too so the whole
    /// request can be forwarded verbatim; other bodies stay on the wire. On
    /// error the exchange is still usable for [`HttpExchange::write_error`].
    pub async fn read_request(&mut self) -> Result<Option<Request<Bytes>>, RequestError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, HijackError::AlreadyHijacked))?;

        let mut buf = BytesMut::with_capacity(READ_CHUNK.max(self.buffered.len()));
        buf.extend_from_slice(&std::mem::take(&mut self.buffered));

        let (head_end, mut request) = loop {
            if let Some(parsed) = parse_head(&buf)? {
                break parsed;
            }
            if buf.len() > MAX_HEAD_BYTES {
                return Err(RequestError::HeadTooLarge);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err(RequestError::Incomplete);
            }
            buf.extend_from_slice(&chunk[..n]);
        };
        if head_end > MAX_HEAD_BYTES {
            return Err(RequestError::HeadTooLarge);
        }

        let body_len = if request.method() == Method::CONNECT {
            content_length(&request)?
        } else {
            0
        };
        if body_len > MAX_CONNECT_BODY_BYTES {
            return Err(RequestError::BodyTooLarge);
        }
        while buf.len() < head_end + body_len {
            let mut chunk = [0u8; READ_CHUNK];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(RequestError::Incomplete);
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        let mut raw = buf.freeze();
        self.buffered = raw.split_off(head_end + body_len);
        *request.body_mut() = raw.slice(head_end..);
        request.extensions_mut().insert(RawRequest(raw));

        Ok(Some(request))
    }
}

/// Parse a request head off the front of `buf`.
///
/// `Ok(None)` means the head is not complete yet. On success the head length
/// comes back with the request, whose body is left empty.
fn parse_head(buf: &[u8]) -> Result<Option<(usize, Request<Bytes>)>, RequestError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let head_end = match parsed.parse(buf) {
        Ok(Status::Complete(len)) => len,
        Ok(Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(RequestError::HeadTooLarge),
        Err(e) => return Err(RequestError::Malformed(e.to_string())),
    };

    let method = parsed.method.unwrap_or_default();
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| RequestError::Malformed(format!("bad method {:?}", method)))?;
    let target = parsed.path.unwrap_or_default();
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut request = Request::builder()
        .method(method)
        .uri(target)
        .version(version)
        .body(Bytes::new())
        .map_err(|e| RequestError::Malformed(e.to_string()))?;
    *request.headers_mut() = header_map_from_httparse(parsed.headers)?;
    Ok(Some((head_end, request)))
}

fn header_map_from_httparse(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, RequestError> {
    let mut map = HeaderMap::with_capacity(raw.len());
    for header in raw {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| RequestError::Malformed(format!("bad header name {:?}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| RequestError::Malformed(format!("bad value for header {}", name)))?;
        map.append(name, value);
    }
    Ok(map)
}

fn content_length(req: &Request<Bytes>) -> Result<usize, RequestError> {
    match req.headers().get(CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or_else(|| RequestError::Malformed("bad Content-Length".to_string())),
        None => Ok(0),
    }
}

/// The bytes to put on the wire for `req`.
///
/// Requests read off a socket carry their original bytes and are returned
/// untouched; requests built in code are serialized from their parts.
pub fn request_bytes(req: &Request<Bytes>) -> Bytes {
    if let Some(raw) = req.extensions().get::<RawRequest>() {
        return raw.0.clone();
    }

    let mut out = BytesMut::new();
    out.extend_from_slice(format!("{} {} {:?}\r\n", req.method(), req.uri(), req.version()).as_bytes());
    if !req.headers().contains_key(HOST) {
        if let Some(authority) = req.uri().authority() {
            out.extend_from_slice(format!("Host: {}\r\n", authority).as_bytes());
        }
    }
    for (name, value) in req.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !req.body().is_empty() && !req.headers().contains_key(CONTENT_LENGTH) {
        out.extend_from_slice(format!("Content-Length: {}\r\n", req.body().len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(req.body());
    out.freeze()
}
