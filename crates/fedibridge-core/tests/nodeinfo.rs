//! App detection through the nodeinfo well-known endpoint.

use fedibridge_core::registrar::nodeinfo_app;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn resolves_software_name_capitalized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/nodeinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "links": [{
                "rel": "http://nodeinfo.diaspora.software/ns/schema/2.0",
                "href": format!("{}/nodeinfo/2.0", server.uri()),
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/nodeinfo/2.0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "version": "2.0",
            "software": {"name": "mastodon", "version": "4.3.0"},
        })))
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    assert_eq!(
        nodeinfo_app(&client, &server.uri()).await,
        Some("Mastodon".to_string())
    );
}

#[tokio::test]
async fn probe_failures_collapse_to_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/nodeinfo"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    assert_eq!(nodeinfo_app(&client, &server.uri()).await, None);

    // an empty link list is also a miss, not an error
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/nodeinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"links": []})))
        .mount(&server)
        .await;
    assert_eq!(nodeinfo_app(&client, &server.uri()).await, None);
}
