//! Admin control surface on the proxy port.

mod common;

use common::{Origin, TestProxy};
use replay_proxy::mode::Mode;
use serde_json::{json, Value};

#[tokio::test]
async fn health_is_plain_ok() {
    let proxy = TestProxy::start("replay").await;
    let response = proxy.admin().get(proxy.admin_url("/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn status_reports_mode_and_counts() {
    let proxy = TestProxy::start("record").await;
    proxy.add_fixture("https://example.com/a", "a").await;
    proxy.add_recording("https://news.example.org/b", "b").await;

    let status: Value = proxy
        .admin()
        .get(proxy.admin_url("/admin/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["mode"], "record");
    assert_eq!(status["hybrid_fallback"], false);
    assert_eq!(status["fixtures_count"], 1);
    assert_eq!(status["cache_count"], 1);
    assert_eq!(status["in_flight"], 0);
    assert_eq!(status["tls_interception"], false);
}

#[tokio::test]
async fn invalid_mode_is_rejected_without_change() {
    let proxy = TestProxy::start("replay").await;

    let response = proxy
        .admin()
        .post(proxy.admin_url("/admin/mode/invalid"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_mode");
    assert!(body["message"].as_str().unwrap().contains("invalid"));

    assert_eq!(proxy.state.modes.global_mode(), Mode::Replay);
    assert!(proxy.state.modes.audit().is_empty());
}

#[tokio::test]
async fn mode_changes_are_audited_with_user() {
    let proxy = TestProxy::start("replay").await;
    let admin = proxy.admin();

    let response = admin
        .post(proxy.admin_url("/admin/mode/record"))
        .header("x-proxy-user", "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["mode"], "record");
    assert_eq!(body["previous"], "replay");

    admin
        .post(proxy.admin_url("/admin/mode/live?user=bob"))
        .send()
        .await
        .unwrap();
    admin
        .post(proxy.admin_url("/admin/mode/replay"))
        .send()
        .await
        .unwrap();

    let audit: Vec<Value> = admin
        .get(proxy.admin_url("/admin/audit"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(audit.len(), 3);
    assert_eq!(audit[0]["user"], "alice");
    assert_eq!(audit[0]["previous_mode"], "replay");
    assert_eq!(audit[0]["new_mode"], "record");
    assert_eq!(audit[1]["user"], "bob");
    assert_eq!(audit[2]["user"], "anonymous");
    assert_eq!(audit[2]["new_mode"], "replay");
}

#[tokio::test]
async fn hybrid_selection_turns_on_fallback() {
    let proxy = TestProxy::start("record").await;
    let body: Value = proxy
        .admin()
        .post(proxy.admin_url("/admin/mode/hybrid"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["mode"], "replay");
    assert_eq!(body["hybrid_fallback"], true);
    assert!(proxy.state.modes.hybrid_fallback());
}

#[tokio::test]
async fn hybrid_flag_toggles() {
    let proxy = TestProxy::start("replay").await;
    let body: Value = proxy
        .admin()
        .post(proxy.admin_url("/admin/hybrid"))
        .json(&json!({ "enabled": true }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["hybrid_fallback"], true);
    assert_eq!(body["previous"], false);
    assert!(proxy.state.modes.hybrid_fallback());
}

#[tokio::test]
async fn domain_override_set_and_cleared() {
    let proxy = TestProxy::start("replay").await;
    let admin = proxy.admin();

    let set: Value = admin
        .put(proxy.admin_url("/admin/domains/www.Example.com/mode/live"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(set["domain"], "example-com");
    assert_eq!(set["mode"], "live");
    assert_eq!(proxy.state.modes.effective_mode("example-com"), Mode::Live);
    assert_eq!(proxy.state.modes.effective_mode("other-com"), Mode::Replay);

    let cleared: Value = admin
        .delete(proxy.admin_url("/admin/domains/example.com/mode"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cleared["previous"], "live");
    assert_eq!(cleared["mode"], "replay");
    assert_eq!(proxy.state.modes.audit().len(), 2);
}

#[tokio::test]
async fn domain_override_rejects_hybrid() {
    let proxy = TestProxy::start("replay").await;
    let response = proxy
        .admin()
        .put(proxy.admin_url("/admin/domains/example.com/mode/hybrid"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert!(proxy.state.modes.snapshot().domain_overrides.is_empty());
}

#[tokio::test]
async fn cache_listing_and_clearing() {
    let origin = Origin::start("recorded").await;
    let proxy = TestProxy::start("record").await;
    proxy.add_fixture("https://example.com/keep", "fixture").await;
    proxy.client().get(origin.url("/one")).send().await.unwrap();
    let admin = proxy.admin();

    let domains: Vec<String> = admin
        .get(proxy.admin_url("/admin/cache"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(domains.contains(&"127-0-0-1".to_string()));
    assert!(domains.contains(&"example-com".to_string()));

    let keys: Vec<Value> = admin
        .get(proxy.admin_url("/admin/cache/127.0.0.1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["tier"], "cache");

    let cleared: Value = admin
        .delete(proxy.admin_url("/admin/cache"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cleared["message"], "Cache cleared");

    let stats = proxy.state.store.stats().await;
    assert_eq!(stats.cache_count, 0);
    assert_eq!(stats.fixtures_count, 1, "fixtures are never cleared");
}

#[tokio::test]
async fn domain_cache_clear() {
    let proxy = TestProxy::start("replay").await;
    proxy.add_recording("https://a.example/1", "1").await;
    proxy.add_recording("https://b.example/2", "2").await;

    let cleared: Value = proxy
        .admin()
        .delete(proxy.admin_url("/admin/cache/a.example"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cleared["message"], "Cache cleared for a-example");
    assert_eq!(proxy.state.store.stats().await.cache_count, 1);
}

#[tokio::test]
async fn traversal_domains_are_rejected() {
    let proxy = TestProxy::start("replay").await;
    proxy.add_recording("https://example.com/", "kept").await;
    let admin = proxy.admin();

    for path in [
        "/admin/cache/evil%2F..%2Fetc",
        "/admin/cache/evil%5C..%5Cwindows",
    ] {
        let response = admin.delete(proxy.admin_url(path)).send().await.unwrap();
        assert_eq!(response.status(), 400, "{path}");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "invalid_domain");
    }

    let response = admin
        .put(proxy.admin_url("/admin/domains/a%2Fb/mode/live"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(proxy.state.store.stats().await.cache_count, 1);
}
