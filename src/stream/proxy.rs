//! TLS-terminating HTTP CONNECT proxy.
//!
//! The browser is configured to use this proxy for everything. Hostnames on
//! the intercept allow-list get their TLS terminated with a minted leaf; the
//! tunneled request is replayed upstream, the response is mirrored to the
//! client byte-for-byte and simultaneously fed through the response parser,
//! and every change in the parsed state is published to the stream bus.
//! Everything else is tunneled opaquely.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use super::bus::StreamFrame;
use super::cert::CertificateManager;
use super::parser;

/// Upstream reads idle longer than this produce a synthetic
/// `internal_timeout` done frame so the consumer never hangs forever.
const UPSTREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Only responses to generate-content calls are parsed; the rest of an
/// intercepted host's traffic is mirrored without inspection. Matched
/// case-insensitively: the provider's REST method segment is camel-cased
/// (`…/models/{model}:generateContent`, `:streamGenerateContent`).
const INTERCEPT_PATH_MARKER: &str = "generatecontent";

const MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen port; 0 picks an ephemeral port (reported via the ready
    /// signal).
    pub port: u16,
    /// Exact hostnames, or `*.domain` for any proper subdomain.
    pub intercept_domains: Vec<String>,
    /// Optional HTTP proxy to chain upstream connections through.
    pub upstream_proxy: Option<String>,
    pub cert_dir: PathBuf,
    pub debug_logs: bool,
}

pub struct StreamProxy {
    config: ProxyConfig,
    certs: CertificateManager,
    publisher: mpsc::Sender<StreamFrame>,
    tls_client: Arc<rustls::ClientConfig>,
}

impl StreamProxy {
    pub fn new(config: ProxyConfig, publisher: mpsc::Sender<StreamFrame>) -> Result<Self> {
        // Pin the process-wide crypto provider before any config builder
        // runs; a second install (e.g. in tests) is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let certs = CertificateManager::open(&config.cert_dir)?;
        Ok(StreamProxy {
            config,
            certs,
            publisher,
            tls_client: build_tls_client(),
        })
    }

    /// Accept loop. Sends the bound port over `ready` once the listener is
    /// live; per-connection failures are logged and never end the loop.
    pub async fn run(self: Arc<Self>, ready: oneshot::Sender<u16>) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", self.config.port))
            .await
            .context("binding stream proxy listener")?;
        let port = listener.local_addr()?.port();
        info!("Stream proxy listening on 127.0.0.1:{port}");
        let _ = ready.send(port);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("proxy accept failed: {err}");
                    continue;
                }
            };
            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = proxy.handle_client(stream).await {
                    debug!("proxy connection from {peer} ended: {err}");
                }
            });
        }
    }

    pub fn should_intercept(&self, host: &str) -> bool {
        domain_matches(&self.config.intercept_domains, host)
    }

    async fn handle_client(self: Arc<Self>, mut client: TcpStream) -> Result<()> {
        let head = read_head(&mut client).await?;
        if head.is_empty() {
            return Ok(());
        }
        let head_text = String::from_utf8_lossy(&head).to_string();
        let request_line = head_text.lines().next().unwrap_or_default().to_string();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let target = parts.next().unwrap_or_default().to_string();

        if method.eq_ignore_ascii_case("CONNECT") {
            let (host, port) = split_host_port(&target, 443);
            if self.should_intercept(&host) {
                match self.certs.leaf_for(&host) {
                    Ok(leaf) => return self.intercept(client, &host, port, leaf).await,
                    Err(err) => {
                        // Minting failed: refuse interception, tunnel
                        // opaquely instead.
                        warn!("leaf generation for {host} failed, tunneling blind: {err}");
                    }
                }
            }
            self.blind_tunnel(client, &host, port).await
        } else {
            self.forward_plain(client, &head, &target).await
        }
    }

    /// Opaque CONNECT tunnel: no TLS termination, bytes flow both ways.
    async fn blind_tunnel(&self, mut client: TcpStream, host: &str, port: u16) -> Result<()> {
        let mut upstream = match self.open_upstream_tcp(host, port).await {
            Ok(stream) => stream,
            Err(err) => {
                let _ = client
                    .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                    .await;
                return Err(err);
            }
        };
        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
        Ok(())
    }

    /// Terminate TLS with the minted leaf, open our own TLS session to the
    /// real host, and pump with response observation.
    async fn intercept(
        &self,
        mut client: TcpStream,
        host: &str,
        port: u16,
        leaf: super::cert::LeafIdentity,
    ) -> Result<()> {
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(leaf.chain, leaf.key)
            .context("building interception server config")?;

        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;

        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        let client_tls = acceptor
            .accept(client)
            .await
            .context("TLS handshake with browser")?;

        let upstream_tcp = self.open_upstream_tcp(host, port).await?;
        let server_name = rustls_pki_types::ServerName::try_from(host.to_string())
            .context("invalid upstream server name")?;
        let connector = TlsConnector::from(Arc::clone(&self.tls_client));
        let upstream_tls = match connector.connect(server_name, upstream_tcp).await {
            Ok(stream) => stream,
            Err(err) => {
                // Report the failed handshake into the bus so an in-flight
                // request resolves instead of waiting out its timeout.
                let _ = self
                    .publisher
                    .send(StreamFrame::upstream_error(
                        502,
                        format!("upstream TLS handshake with {host} failed: {err}"),
                    ))
                    .await;
                return Err(err.into());
            }
        };

        self.pump(client_tls, upstream_tls, host).await
    }

    /// Two half-duplex flows between the terminated client side and the real
    /// upstream. The upstream→client flow feeds the parser and publishes
    /// frame changes.
    async fn pump<C, U>(&self, client: C, upstream: U, host: &str) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

        let parse_active = Arc::new(AtomicBool::new(false));
        let reset_decoder = Arc::new(AtomicBool::new(false));

        // Client → upstream. Request bytes pass through unmodified (a
        // rewrite hook would slot in here); the request line decides whether
        // the next response gets parsed.
        let active_w = Arc::clone(&parse_active);
        let reset_w = Arc::clone(&reset_decoder);
        let host_label = host.to_string();
        let debug_logs = self.config.debug_logs;
        let to_upstream = tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                let n = match client_rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if let Some(path) = request_path(&buf[..n]) {
                    let active = path_is_generate_content(&path);
                    if debug_logs {
                        debug!("[{host_label}] request {path} (parse={active})");
                    }
                    active_w.store(active, Ordering::SeqCst);
                    reset_w.store(true, Ordering::SeqCst);
                }
                if upstream_wr.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            let _ = upstream_wr.shutdown().await;
        });

        // Upstream → client, with observation.
        let publisher = self.publisher.clone();
        let active_r = Arc::clone(&parse_active);
        let reset_r = Arc::clone(&reset_decoder);
        let from_upstream = tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            let mut decoder = ResponseDecoder::new();
            loop {
                let read = tokio::time::timeout(UPSTREAM_IDLE_TIMEOUT, upstream_rd.read(&mut buf))
                    .await;
                let n = match read {
                    Ok(Ok(0)) | Ok(Err(_)) => break,
                    Ok(Ok(n)) => n,
                    Err(_) => {
                        if active_r.load(Ordering::SeqCst) && !decoder.finished() {
                            let _ = publisher.send(StreamFrame::internal_timeout()).await;
                        }
                        break;
                    }
                };
                if client_wr.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                if reset_r.swap(false, Ordering::SeqCst) {
                    decoder = ResponseDecoder::new();
                }
                if active_r.load(Ordering::SeqCst) {
                    for frame in decoder.feed(&buf[..n]) {
                        // A full bus blocks here: dropping a frame would
                        // drop tokens.
                        if publisher.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
            }
            let _ = client_wr.shutdown().await;
        });

        let _ = tokio::join!(to_upstream, from_upstream);
        Ok(())
    }

    /// Plain (non-CONNECT) request through the proxy: forward verbatim.
    async fn forward_plain(&self, mut client: TcpStream, head: &[u8], target: &str) -> Result<()> {
        let (host, port) = host_from_plain_target(head, target)
            .context("no host in plain proxy request")?;
        let mut upstream = self.open_upstream_tcp(&host, port).await?;
        upstream.write_all(head).await?;
        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
        Ok(())
    }

    /// TCP to `host:port`, optionally chained through the configured
    /// upstream HTTP proxy.
    async fn open_upstream_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        match &self.config.upstream_proxy {
            None => TcpStream::connect((host, port))
                .await
                .with_context(|| format!("connecting to {host}:{port}")),
            Some(proxy_url) => {
                let (proxy_host, proxy_port) = parse_proxy_url(proxy_url)?;
                let mut stream = TcpStream::connect((proxy_host.as_str(), proxy_port))
                    .await
                    .with_context(|| format!("connecting to upstream proxy {proxy_url}"))?;
                let connect = format!(
                    "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n"
                );
                stream.write_all(connect.as_bytes()).await?;
                let reply = read_head(&mut stream).await?;
                let line = String::from_utf8_lossy(&reply);
                let status_ok = line
                    .lines()
                    .next()
                    .map(|l| l.contains(" 200"))
                    .unwrap_or(false);
                anyhow::ensure!(status_ok, "upstream proxy refused CONNECT: {line}");
                Ok(stream)
            }
        }
    }
}

/// Per-response incremental decoder: strips the status line and headers,
/// then runs the body through the chunked/deflate/envelope parser and yields
/// a frame whenever the parsed state changes.
struct ResponseDecoder {
    raw: Vec<u8>,
    body_offset: Option<usize>,
    status: u16,
    last: StreamFrame,
    errored: bool,
    done_published: bool,
}

impl ResponseDecoder {
    fn new() -> Self {
        ResponseDecoder {
            raw: Vec::new(),
            body_offset: None,
            status: 0,
            last: StreamFrame::default(),
            errored: false,
            done_published: false,
        }
    }

    fn finished(&self) -> bool {
        self.errored || self.done_published
    }

    fn feed(&mut self, bytes: &[u8]) -> Vec<StreamFrame> {
        if self.finished() {
            return Vec::new();
        }
        self.raw.extend_from_slice(bytes);

        if self.body_offset.is_none() {
            let Some(end) = find_double_crlf(&self.raw) else {
                return Vec::new();
            };
            self.status = parse_status_line(&self.raw).unwrap_or(0);
            self.body_offset = Some(end + 4);
        }

        let body = &self.raw[self.body_offset.unwrap_or(0)..];

        if !(200..300).contains(&self.status) {
            self.errored = true;
            let message = String::from_utf8_lossy(body).trim().to_string();
            return vec![StreamFrame::upstream_error(self.status, message)];
        }

        let frame = parser::parse_response(body);
        if frame == self.last {
            return Vec::new();
        }
        self.last = frame.clone();
        if frame.done {
            self.done_published = true;
        }
        vec![frame]
    }
}

fn build_tls_client() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        let _ = roots.add(cert);
    }
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Exact match, or `*.domain` matching proper subdomains only.
pub fn domain_matches(allow: &[String], host: &str) -> bool {
    for rule in allow {
        if let Some(suffix) = rule.strip_prefix("*.") {
            if host.len() > suffix.len() + 1 && host.ends_with(suffix) {
                let boundary = host.len() - suffix.len() - 1;
                if host.as_bytes()[boundary] == b'.' {
                    return true;
                }
            }
        } else if rule == host {
            return true;
        }
    }
    false
}

async fn read_head(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") || head.len() > MAX_HEAD_BYTES {
            break;
        }
    }
    Ok(head)
}

fn split_host_port(target: &str, default_port: u16) -> (String, u16) {
    match target.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().unwrap_or(default_port),
        ),
        None => (target.to_string(), default_port),
    }
}

fn parse_proxy_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .trim()
        .trim_start_matches("http://")
        .trim_end_matches('/');
    anyhow::ensure!(!stripped.is_empty(), "empty upstream proxy url");
    let (host, port) = split_host_port(stripped, 8080);
    Ok((host, port))
}

/// Whether a request path is a generate-content call whose response should
/// be parsed.
fn path_is_generate_content(path: &str) -> bool {
    path.to_ascii_lowercase().contains(INTERCEPT_PATH_MARKER)
}

/// If the buffer begins with an HTTP request line, return its path.
fn request_path(bytes: &[u8]) -> Option<String> {
    let line_end = bytes.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&bytes[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let path = parts.next()?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    const METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];
    if !METHODS.contains(&method) {
        return None;
    }
    Some(path.to_string())
}

fn parse_status_line(bytes: &[u8]) -> Option<u16> {
    let line_end = bytes.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&bytes[..line_end]).ok()?;
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}

fn find_double_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n")
}

fn host_from_plain_target(head: &[u8], target: &str) -> Option<(String, u16)> {
    if let Some(rest) = target.strip_prefix("http://") {
        let authority = rest.split('/').next().unwrap_or_default();
        if !authority.is_empty() {
            return Some(split_host_port(authority, 80));
        }
    }
    // Fall back to the Host header.
    let text = String::from_utf8_lossy(head);
    for line in text.lines().skip(1) {
        if let Some(value) = line.strip_prefix("Host:").or_else(|| line.strip_prefix("host:")) {
            return Some(split_host_port(value.trim(), 80));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_requires_proper_subdomain() {
        let allow = vec!["example.com".to_string(), "*.test.com".to_string()];
        assert!(domain_matches(&allow, "example.com"));
        assert!(domain_matches(&allow, "sub.test.com"));
        assert!(domain_matches(&allow, "a.b.test.com"));
        assert!(!domain_matches(&allow, "test.com"));
        assert!(!domain_matches(&allow, "evil-test.com"));
        assert!(!domain_matches(&allow, "google.com"));
    }

    #[test]
    fn request_path_detection() {
        assert_eq!(
            request_path(
                b"POST /v1beta/models/gemini-pro:streamGenerateContent HTTP/1.1\r\nHost: x\r\n\r\n"
            ),
            Some("/v1beta/models/gemini-pro:streamGenerateContent".to_string())
        );
        assert_eq!(request_path(b"random tunneled bytes"), None);
        assert_eq!(request_path(b"\x16\x03\x01..."), None);
    }

    #[test]
    fn generate_content_paths_match_real_method_casing() {
        // The provider's REST method segments are camel-cased on the wire.
        assert!(path_is_generate_content(
            "/v1beta/models/gemini-pro:generateContent"
        ));
        assert!(path_is_generate_content(
            "/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse"
        ));
        assert!(path_is_generate_content("/api/GenerateContent"));
        assert!(!path_is_generate_content("/v1beta/models"));
        assert!(!path_is_generate_content("/v1beta/models/gemini-pro:countTokens"));
    }

    #[test]
    fn decoder_reports_non_2xx_as_error_frame() {
        let mut decoder = ResponseDecoder::new();
        let frames = decoder.feed(b"HTTP/1.1 429 Too Many Requests\r\n\r\nquota exhausted");
        assert_eq!(frames.len(), 1);
        let err = frames[0].error.as_ref().expect("error frame");
        assert_eq!(err.status, 429);
        assert!(err.message.contains("quota"));
        // Later bytes are ignored once errored.
        assert!(decoder.feed(b"more").is_empty());
    }

    #[test]
    fn decoder_publishes_only_on_change() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write;

        let inner = br#"[[[null, "hi"]],"model"]"#;
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(inner).unwrap();
        let compressed = enc.finish().unwrap();
        let body = parser::encode_chunked(&compressed, 1024);

        let mut decoder = ResponseDecoder::new();
        let mut head = b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\n\r\n".to_vec();
        head.extend_from_slice(&body);

        let frames = decoder.feed(&head);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].body, "hi");
        assert!(frames[0].done);
        // Feeding nothing new publishes nothing.
        assert!(decoder.feed(b"").is_empty());
    }

    #[test]
    fn proxy_url_parsing() {
        assert_eq!(
            parse_proxy_url("http://127.0.0.1:7890").unwrap(),
            ("127.0.0.1".to_string(), 7890)
        );
        assert!(parse_proxy_url("   ").is_err());
    }

    #[tokio::test]
    async fn blind_tunnel_end_to_end() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Local echo server plays the upstream.
        let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match echo.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 || sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let dir = tempfile::TempDir::new().unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let proxy = Arc::new(
            StreamProxy::new(
                ProxyConfig {
                    port: 0,
                    intercept_domains: vec![],
                    upstream_proxy: None,
                    cert_dir: dir.path().to_path_buf(),
                    debug_logs: false,
                },
                tx,
            )
            .unwrap(),
        );
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(Arc::clone(&proxy).run(ready_tx));
        let port = ready_rx.await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let connect = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", echo_addr.port());
        client.write_all(connect.as_bytes()).await.unwrap();

        let mut reply = [0u8; 64];
        let n = client.read(&mut reply).await.unwrap();
        assert!(String::from_utf8_lossy(&reply[..n]).contains("200 Connection Established"));

        client.write_all(b"tunneled payload").await.unwrap();
        let mut echoed = [0u8; 64];
        let n = client.read(&mut echoed).await.unwrap();
        assert_eq!(&echoed[..n], b"tunneled payload");
    }
}
