//! CONNECT handling: interception with the proxy certificate, and blind tunnels.

mod common;

use std::sync::Arc;

use axum::http::{HeaderMap, Method};
use common::{body_of, header_of, read_head, read_lenient, Options, Origin, TestProxy, TlsOrigin};
use replay_proxy::cache::generate_key;
use replay_proxy::mode::Mode;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::rustls::{self, pki_types::ServerName, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use url::Url;

fn connector(cert_pem: &str) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut cert_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn open_tunnel(proxy: &TestProxy, authority: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    let connect = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await;
    assert!(
        head.starts_with("HTTP/1.1 200 Connection Established\r\n"),
        "unexpected CONNECT reply: {head}"
    );
    stream
}

#[tokio::test]
async fn intercepted_tunnel_replays_fixture() {
    let proxy = TestProxy::start_with(Options {
        mode: "replay",
        intercept_hosts: Some(vec!["example.com".to_string()]),
        ..Options::default()
    })
    .await;
    proxy
        .add_fixture("https://example.com/hello", "<h1>hello from fixtures</h1>")
        .await;

    let stream = open_tunnel(&proxy, "example.com:443").await;
    let connector = connector(proxy.cert_pem.as_deref().unwrap());
    let domain = ServerName::try_from("example.com").unwrap();
    let mut tls = connector.connect(domain, stream).await.unwrap();

    tls.write_all(b"GET /hello HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let raw = read_lenient(&mut tls).await;

    assert!(raw.starts_with("HTTP/1.1 200"), "{raw}");
    assert_eq!(header_of(&raw, "x-proxy-source"), Some("fixtures"));
    assert_eq!(header_of(&raw, "x-proxy-mode"), Some("replay"));
    assert_eq!(body_of(&raw), "<h1>hello from fixtures</h1>");
    assert_eq!(proxy.state.dispatcher.in_flight(), 0);
}

#[tokio::test]
async fn intercepted_miss_reports_https_url() {
    let proxy = TestProxy::start_with(Options {
        mode: "replay",
        intercept_hosts: Some(vec!["example.com".to_string()]),
        ..Options::default()
    })
    .await;

    let stream = open_tunnel(&proxy, "example.com:443").await;
    let connector = connector(proxy.cert_pem.as_deref().unwrap());
    let mut tls = connector
        .connect(ServerName::try_from("example.com").unwrap(), stream)
        .await
        .unwrap();

    tls.write_all(b"GET /absent HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let raw = read_lenient(&mut tls).await;

    assert!(raw.starts_with("HTTP/1.1 502"), "{raw}");
    assert_eq!(header_of(&raw, "x-proxy-cache-miss"), Some("true"));
    let body: serde_json::Value = serde_json::from_str(body_of(&raw)).unwrap();
    assert_eq!(body["url"], "https://example.com/absent");
}

#[tokio::test]
async fn without_certificate_tunnels_are_blind() {
    let origin = Origin::start("spliced").await;
    let proxy = TestProxy::start("replay").await;
    assert!(!proxy.state.interceptor.intercepts());

    let mut stream = open_tunnel(&proxy, &origin.addr.to_string()).await;
    stream
        .write_all(b"GET /raw HTTP/1.1\r\nHost: origin\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let raw = read_lenient(&mut stream).await;

    assert!(raw.starts_with("HTTP/1.1 200"), "{raw}");
    assert_eq!(body_of(&raw), "spliced");
    assert!(header_of(&raw, "x-proxy-source").is_none());
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn root_path_replays_through_tunnel() {
    let proxy = TestProxy::start_with(Options {
        mode: "replay",
        intercept_hosts: Some(vec!["example.com".to_string()]),
        ..Options::default()
    })
    .await;
    proxy.add_fixture("https://example.com/", "root").await;

    let stream = open_tunnel(&proxy, "example.com:443").await;
    let connector = connector(proxy.cert_pem.as_deref().unwrap());
    let mut tls = connector
        .connect(ServerName::try_from("example.com").unwrap(), stream)
        .await
        .unwrap();
    tls.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let raw = read_lenient(&mut tls).await;
    assert_eq!(body_of(&raw), "root");
}

#[tokio::test]
async fn intercepted_record_miss_fetches_origin_over_tls() {
    let origin = TlsOrigin::start("<p>secure</p>").await;
    let proxy = TestProxy::start_with(Options {
        mode: "record",
        intercept_hosts: Some(vec!["127.0.0.1".to_string()]),
        origin_ca: Some(origin.cert_pem.clone()),
        ..Options::default()
    })
    .await;
    let authority = origin.addr.to_string();
    let request = format!("GET /secure HTTP/1.1\r\nHost: {authority}\r\nConnection: close\r\n\r\n");

    for mode in [Mode::Record, Mode::Replay] {
        proxy.state.modes.set_global_mode(mode, "test");
        let stream = open_tunnel(&proxy, &authority).await;
        let connector = connector(proxy.cert_pem.as_deref().unwrap());
        let mut tls = connector
            .connect(ServerName::try_from("127.0.0.1").unwrap(), stream)
            .await
            .unwrap();
        tls.write_all(request.as_bytes()).await.unwrap();
        let raw = read_lenient(&mut tls).await;

        assert!(raw.starts_with("HTTP/1.1 200"), "{raw}");
        assert_eq!(header_of(&raw, "x-proxy-mode"), Some(mode.as_str()));
        assert_eq!(header_of(&raw, "x-proxy-source"), Some("cache"));
        assert_eq!(body_of(&raw), "<p>secure</p>");
    }
    assert_eq!(origin.hits(), 1);

    let url = Url::parse(&format!("https://{authority}/secure")).unwrap();
    let listed = proxy.state.store.list_domain("127-0-0-1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].cache_key, generate_key(&Method::GET, &url, &HeaderMap::new()));
}
