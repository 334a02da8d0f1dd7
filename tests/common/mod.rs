//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;
use url::Url;

use replay_proxy::cache::{generate_key, normalize_domain, CacheEntry, CacheStore};
use replay_proxy::config::{ProxyConfig, TlsConfig};
use replay_proxy::http::upstream::{ProxyRequest, UpstreamResponse};
use replay_proxy::http::AppState;
use replay_proxy::net::listener::Listener;
use replay_proxy::{HttpServer, Shutdown};

/// A raw TCP origin answering every request with the same body, counting hits.
pub struct Origin {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl Origin {
    pub async fn start(body: &'static str) -> Self {
        Self::start_with_delay(body, Duration::ZERO).await
    }

    pub async fn start_with_delay(body: &'static str, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 8192];
                    let _ = socket.read(&mut buf).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { addr, hits }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// An HTTPS origin on 127.0.0.1 with its own self-signed certificate.
pub struct TlsOrigin {
    pub addr: SocketAddr,
    pub cert_pem: String,
    hits: Arc<AtomicUsize>,
}

impl TlsOrigin {
    pub async fn start(body: &'static str) -> Self {
        let generated = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()]).unwrap();
        let cert_pem = generated.cert.pem();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der()));
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![generated.cert.der().clone()], key)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let Ok(mut tls) = acceptor.accept(socket).await else {
                        return;
                    };
                    let mut buf = [0u8; 8192];
                    let _ = tls.read(&mut buf).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = tls.write_all(response.as_bytes()).await;
                    let _ = tls.shutdown().await;
                });
            }
        });

        Self {
            addr,
            cert_pem,
            hits,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Launch options for [`TestProxy`].
#[derive(Default)]
pub struct Options {
    pub mode: &'static str,
    pub hybrid: bool,
    pub intercept_hosts: Option<Vec<String>>,
    /// PEM certificate the proxy trusts when fetching from origins.
    pub origin_ca: Option<String>,
}

/// A running proxy on an ephemeral port with throwaway cache trees.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub state: AppState,
    pub fixtures: TempDir,
    pub cache: TempDir,
    pub cert_pem: Option<String>,
    shutdown: Shutdown,
    _certs: TempDir,
}

impl TestProxy {
    pub async fn start(mode: &'static str) -> Self {
        Self::start_with(Options {
            mode,
            ..Options::default()
        })
        .await
    }

    pub async fn start_with(options: Options) -> Self {
        let fixtures = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();

        let mut config = ProxyConfig::default();
        config.cache.fixtures_dir = fixtures.path().to_path_buf();
        config.cache.cache_dir = cache.path().to_path_buf();
        config.mode.initial = if options.mode.is_empty() {
            "replay".to_string()
        } else {
            options.mode.to_string()
        };
        config.mode.hybrid_fallback = options.hybrid;
        config.timeouts.live_secs = 5;
        config.timeouts.shutdown_secs = 1;

        let certs = TempDir::new().unwrap();
        let mut cert_pem = None;
        if let Some(hosts) = options.intercept_hosts {
            let generated = rcgen::generate_simple_self_signed(hosts).unwrap();
            let cert_path = certs.path().join("proxy.crt");
            let key_path = certs.path().join("proxy.key");
            std::fs::write(&cert_path, generated.cert.pem()).unwrap();
            std::fs::write(&key_path, generated.key_pair.serialize_pem()).unwrap();
            config.tls = Some(TlsConfig {
                cert_path,
                key_path,
            });
            cert_pem = Some(generated.cert.pem());
        }
        if let Some(pem) = options.origin_ca {
            let path = certs.path().join("origin-ca.pem");
            std::fs::write(&path, pem).unwrap();
            config.upstream.ca_certs = vec![path];
        }

        let server = HttpServer::new(&config).unwrap();
        let state = server.state().clone();
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let listener = Listener::from_tcp(tcp, 64);

        let shutdown = Shutdown::new();
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            let _ = server.run(listener, rx).await;
        });

        Self {
            addr,
            state,
            fixtures,
            cache,
            cert_pem,
            shutdown,
            _certs: certs,
        }
    }

    /// Client that sends every request through the proxy.
    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::http(format!("http://{}", self.addr)).unwrap())
            .build()
            .unwrap()
    }

    /// Client for the admin surface on the proxy port.
    pub fn admin(&self) -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    pub fn admin_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Store a fixture entry for `url` in the read-only tier.
    pub async fn add_fixture(&self, url: &str, body: &'static str) -> String {
        write_entry(self.fixtures.path(), url, body).await
    }

    /// Store a recorded entry for `url`.
    pub async fn add_recording(&self, url: &str, body: &'static str) -> String {
        write_entry(self.cache.path(), url, body).await
    }

    pub fn stop(&self) {
        self.shutdown.trigger();
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Write a GET entry for `url` (no User-Agent, no Accept-Language) under `root`.
async fn write_entry(root: &Path, url: &str, body: &'static str) -> String {
    let url = Url::parse(url).unwrap();
    let headers = HeaderMap::new();
    let domain = normalize_domain(url.host_str().unwrap());
    let key = generate_key(&Method::GET, &url, &headers);

    let request = ProxyRequest {
        method: Method::GET,
        url,
        headers,
        body: Bytes::new(),
    };
    let mut response_headers = HeaderMap::new();
    response_headers.insert("content-type", "text/html".parse().unwrap());
    let response = UpstreamResponse {
        status: StatusCode::OK,
        headers: response_headers,
        body: Bytes::from_static(body.as_bytes()),
    };

    let entry = CacheEntry::capture(domain, key.clone(), &request, &response);
    CacheStore::new(root, root).store(&entry).await.unwrap();
    key
}

/// Send raw bytes to `addr` and return everything read back.
pub async fn raw_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    read_lenient(&mut stream).await
}

/// Read until EOF or error; TLS peers may close without close_notify.
pub async fn read_lenient<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Read a response head (through the blank line) byte by byte.
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed before response head");
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Header value from a raw HTTP/1.1 response, case-insensitive.
pub fn header_of<'a>(raw: &'a str, name: &str) -> Option<&'a str> {
    let head = raw.split("\r\n\r\n").next()?;
    head.lines().skip(1).find_map(|line| {
        let (k, v) = line.split_once(':')?;
        k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

/// Body of a raw HTTP/1.1 response.
pub fn body_of(raw: &str) -> &str {
    raw.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}
