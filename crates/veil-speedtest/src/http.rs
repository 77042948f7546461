//! HTTP measurement client
//!
//! A small hyper client built for measuring rather than fetching: every
//! request opens a fresh connection, bodies are never buffered, and byte
//! counts are published through shared counters while the transfer runs.
//!
//! When a local proxy is configured, connections are tunnelled through it
//! with HTTP `CONNECT` before TLS is layered on top, so what gets measured
//! is the tunnel and not the direct path.

use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{CONTENT_LENGTH, HOST, USER_AGENT};
use hyper::{Method, Request, Response, Uri};
use rustls::ClientConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Largest CONNECT response head accepted
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Upload frame size
const UPLOAD_CHUNK: usize = 64 * 1024;

/// HTTP client errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Proxy refused tunnel: {0}")]
    ProxyRejected(String),

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Body read error: {0}")]
    Body(String),

    #[error("Unexpected status {0}")]
    Status(u16),
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Bound on TCP connect plus proxy handshake
    pub connect_timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Local HTTP proxy to tunnel through
    pub proxy: Option<SocketAddr>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            user_agent: format!("veil/{}", env!("CARGO_PKG_VERSION")),
            proxy: None,
        }
    }
}

/// Open a `CONNECT host:port` tunnel on an established proxy connection
///
/// Succeeds only when the proxy answers with a `200` status line.
pub async fn http_connect<S>(stream: &mut S, host: &str, port: u16) -> Result<(), HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = format!("{}:{}", host, port);
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| HttpError::ConnectionFailed(e.to_string()))?;

    let mut head = Vec::with_capacity(256);
    let mut buf = [0u8; 512];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        if head.len() > MAX_CONNECT_RESPONSE {
            return Err(HttpError::ProxyRejected("oversized response".into()));
        }
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| HttpError::ConnectionFailed(e.to_string()))?;
        if n == 0 {
            return Err(HttpError::ProxyRejected("connection closed".into()));
        }
        head.extend_from_slice(&buf[..n]);
    }

    let text = String::from_utf8_lossy(&head);
    let status_line = text.lines().next().unwrap_or_default().trim();
    if is_ok_status_line(status_line) {
        Ok(())
    } else {
        Err(HttpError::ProxyRejected(status_line.to_string()))
    }
}

/// `HTTP/1.x 200 ...`
pub fn is_ok_status_line(line: &str) -> bool {
    let mut parts = line.split_whitespace();
    matches!(
        (parts.next(), parts.next()),
        (Some(version), Some("200")) if version.starts_with("HTTP/1.")
    )
}

/// Request body that hands out a payload in frames and counts what it hands out
pub struct CountingBody {
    payload: Bytes,
    offset: usize,
    counter: Arc<AtomicU64>,
}

impl CountingBody {
    pub fn new(payload: Bytes, counter: Arc<AtomicU64>) -> Self {
        Self {
            payload,
            offset: 0,
            counter,
        }
    }
}

impl Body for CountingBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        let this = self.get_mut();
        if this.offset >= this.payload.len() {
            return Poll::Ready(None);
        }
        let end = (this.offset + UPLOAD_CHUNK).min(this.payload.len());
        let chunk = this.payload.slice(this.offset..end);
        this.offset = end;
        this.counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        Poll::Ready(Some(Ok(Frame::data(chunk))))
    }

    fn is_end_stream(&self) -> bool {
        self.offset >= self.payload.len()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact((self.payload.len() - self.offset) as u64)
    }
}

/// Measurement HTTP client
pub struct HttpClient {
    config: HttpClientConfig,
    tls: TlsConnector,
}

struct Target {
    uri: Uri,
    host: String,
    port: u16,
    https: bool,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        debug!(
            "Measurement client ready ({})",
            match config.proxy {
                Some(proxy) => format!("via proxy {}", proxy),
                None => "direct".to_string(),
            }
        );

        Self {
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    /// Direct client with default settings
    pub fn direct() -> Self {
        Self::new(HttpClientConfig::default())
    }

    /// Client tunnelling through a local HTTP proxy
    pub fn via_proxy(proxy: SocketAddr) -> Self {
        Self::new(HttpClientConfig {
            proxy: Some(proxy),
            ..Default::default()
        })
    }

    pub fn proxy(&self) -> Option<SocketAddr> {
        self.config.proxy
    }

    fn target(url: &str) -> Result<Target, HttpError> {
        let uri: Uri = url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| HttpError::InvalidUrl(e.to_string()))?;
        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(HttpError::InvalidUrl(format!("unsupported scheme in {}", url))),
        };
        let host = uri
            .host()
            .ok_or_else(|| HttpError::InvalidUrl("No host in URL".to_string()))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
        Ok(Target {
            uri,
            host,
            port,
            https,
        })
    }

    /// TCP connection to the target, tunnelled through the proxy if configured
    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, HttpError> {
        let dial = async {
            match self.config.proxy {
                Some(proxy) => {
                    let mut stream = TcpStream::connect(proxy)
                        .await
                        .map_err(|e| HttpError::ConnectionFailed(format!("proxy {}: {}", proxy, e)))?;
                    http_connect(&mut stream, host, port).await?;
                    Ok(stream)
                }
                None => TcpStream::connect((host, port))
                    .await
                    .map_err(|e| HttpError::ConnectionFailed(e.to_string())),
            }
        };

        tokio::time::timeout(self.config.connect_timeout, dial)
            .await
            .map_err(|_| HttpError::Timeout)?
    }

    /// Send one request on a fresh connection and return the response head
    pub async fn send<B>(&self, method: Method, url: &str, body: B) -> Result<Response<Incoming>, HttpError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let target = Self::target(url)?;
        let path = target
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let default_port = if target.https { 443 } else { 80 };
        let host_header = if target.port == default_port {
            target.host.clone()
        } else {
            format!("{}:{}", target.host, target.port)
        };

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, host_header)
            .header(USER_AGENT, &self.config.user_agent);
        if let Some(len) = body.size_hint().exact().filter(|len| *len > 0) {
            builder = builder.header(CONTENT_LENGTH, len);
        }
        let request = builder
            .body(body)
            .map_err(|e| HttpError::Http(e.to_string()))?;

        let stream = self.connect(&target.host, target.port).await?;

        let response = if target.https {
            let server_name = rustls::pki_types::ServerName::try_from(target.host.clone())
                .map_err(|_| HttpError::Tls("Invalid server name".to_string()))?;
            let tls_stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|e| HttpError::Tls(e.to_string()))?;
            send_on(tls_stream, request).await?
        } else {
            send_on(stream, request).await?
        };

        if !response.status().is_success() {
            return Err(HttpError::Status(response.status().as_u16()));
        }
        Ok(response)
    }

    /// Round-trip time of a `GET` up to the response head
    pub async fn ping(&self, url: &str) -> Result<Duration, HttpError> {
        let start = Instant::now();
        let response = self.send(Method::GET, url, Empty::<Bytes>::new()).await?;
        let rtt = start.elapsed();
        drop(response);
        Ok(rtt)
    }

    /// Stream a `GET` body to nowhere, adding its size to `received` as it arrives
    pub async fn download(&self, url: &str, received: &AtomicU64) -> Result<u64, HttpError> {
        let response = self.send(Method::GET, url, Empty::<Bytes>::new()).await?;
        let mut body = response.into_body();
        let mut total = 0u64;

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| HttpError::Body(e.to_string()))?;
            if let Some(data) = frame.data_ref() {
                total += data.len() as u64;
                received.fetch_add(data.len() as u64, Ordering::Relaxed);
            }
        }
        Ok(total)
    }

    /// `POST` `payload`, counting bytes into `sent` as they are written
    pub async fn upload(&self, url: &str, payload: Bytes, sent: Arc<AtomicU64>) -> Result<u64, HttpError> {
        let len = payload.len() as u64;
        let response = self
            .send(Method::POST, url, CountingBody::new(payload, sent))
            .await?;
        // Drain the (small) reply so the server sees a clean close
        let _ = response.into_body().collect().await;
        Ok(len)
    }
}

async fn send_on<S, B>(io: S, request: Request<B>) -> Result<Response<Incoming>, HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let io = hyper_util::rt::TokioIo::new(io);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| HttpError::Http(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("Connection error: {}", e);
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| HttpError::Http(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_status_line() {
        assert!(is_ok_status_line("HTTP/1.1 200 Connection established"));
        assert!(is_ok_status_line("HTTP/1.0 200 OK"));
        assert!(!is_ok_status_line("HTTP/1.1 407 Proxy Authentication Required"));
        assert!(!is_ok_status_line("HTTP/1.1 2000"));
        assert!(!is_ok_status_line(""));
    }

    #[test]
    fn test_target_parsing() {
        let t = HttpClient::target("https://speed.example.com/__down?bytes=10").unwrap();
        assert_eq!(t.host, "speed.example.com");
        assert_eq!(t.port, 443);
        assert!(t.https);

        let t = HttpClient::target("http://cp.example:8080/generate_204").unwrap();
        assert_eq!(t.port, 8080);
        assert!(!t.https);

        assert!(matches!(
            HttpClient::target("ftp://example.com/"),
            Err(HttpError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_counting_body() {
        let counter = Arc::new(AtomicU64::new(0));
        let payload = Bytes::from(vec![0u8; UPLOAD_CHUNK * 2 + 10]);
        let mut body = CountingBody::new(payload, counter.clone());
        assert_eq!(body.size_hint().exact(), Some((UPLOAD_CHUNK * 2 + 10) as u64));

        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        let mut frames = 0;
        while let Poll::Ready(Some(Ok(_))) = Pin::new(&mut body).poll_frame(&mut cx) {
            frames += 1;
        }
        assert_eq!(frames, 3);
        assert!(body.is_end_stream());
        assert_eq!(counter.load(Ordering::Relaxed), (UPLOAD_CHUNK * 2 + 10) as u64);
    }

    async fn fake_proxy(reply: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"CONNECT example.com:443 HTTP/1.1\r\n"));
            socket.write_all(reply.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_http_connect_accepts_200() {
        let proxy = fake_proxy("HTTP/1.1 200 Connection established\r\n\r\n").await;
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        http_connect(&mut stream, "example.com", 443).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_connect_rejects_other_status() {
        let proxy = fake_proxy("HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n").await;
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        let err = http_connect(&mut stream, "example.com", 443).await.unwrap_err();
        assert!(matches!(err, HttpError::ProxyRejected(line) if line.contains("502")));
    }

    #[tokio::test]
    async fn test_plain_download_counts_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            let body = vec![b'x'; 5000];
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
        });

        let client = HttpClient::direct();
        let received = AtomicU64::new(0);
        let total = client
            .download(&format!("http://{}/blob", addr), &received)
            .await
            .unwrap();
        assert_eq!(total, 5000);
        assert_eq!(received.load(Ordering::Relaxed), 5000);
    }
}
