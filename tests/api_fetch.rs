use apilink::managers::api::ApiManager;
use apilink::services::executor::RequestExecutor;
use apilink::services::logger::Logger;
use apilink::services::registry::ConfigRegistry;
use apilink::services::secrets::StaticSecretSource;
use apilink::services::security::SecurityGuard;
use apilink::services::storage::SessionStore;
use apilink::services::validation::Validation;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn base_config(base_url: &str) -> Value {
    json!({
        "apis": [
            {
                "name": "weather",
                "base_url": base_url,
                "auth": {"type": "api_key", "location": "query", "field": "appid", "secret": "${WEATHER_KEY}"},
                "endpoints": [
                    {
                        "name": "current",
                        "path": "/weather",
                        "method": "GET",
                        "params": [
                            {"name": "q", "type": "string", "required": true, "location": "query"}
                        ]
                    }
                ]
            },
            {
                "name": "movies",
                "base_url": base_url,
                "endpoints": [
                    {
                        "name": "top",
                        "path": "/movies",
                        "method": "GET",
                        "params": [
                            {"name": "page", "type": "integer", "location": "query"}
                        ]
                    },
                    {
                        "name": "rate",
                        "path": "/movies/rate",
                        "method": "POST",
                        "params": [
                            {"name": "title", "type": "string", "required": true, "location": "body"},
                            {"name": "rating", "type": "number", "required": true, "location": "body"}
                        ]
                    }
                ]
            },
            {
                "name": "github",
                "base_url": base_url,
                "auth": {"type": "bearer", "token": "${GITHUB_TOKEN}"},
                "endpoints": [
                    {
                        "name": "get_org",
                        "path": "/orgs/{org}",
                        "method": "GET",
                        "params": [
                            {"name": "org", "type": "string", "required": true, "location": "path"}
                        ]
                    }
                ]
            }
        ],
        "defaults": {"retry": {"base_delay_ms": 5, "max_delay_ms": 20}},
        "security": {"allow_private_hosts": ["127.0.0.1"]}
    })
}

fn manager(dir: &TempDir, config: &Value, secrets: &[(&str, &str)]) -> ApiManager {
    let config_path = dir.path().join("api_config.json");
    std::fs::write(&config_path, serde_json::to_string_pretty(config).unwrap()).unwrap();
    let logger = Logger::new("test");
    let map: HashMap<String, String> = secrets
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let registry = Arc::new(
        ConfigRegistry::new(
            logger.clone(),
            config_path,
            Arc::new(StaticSecretSource::new(map)),
        )
        .expect("registry"),
    );
    let guard = Arc::new(SecurityGuard::new(logger.clone()));
    let executor = Arc::new(RequestExecutor::new(logger.clone(), guard).expect("executor"));
    let sessions =
        Arc::new(SessionStore::new(logger.clone(), dir.path().join("sessions")).expect("store"));
    ApiManager::new(logger, Validation::new(), registry, executor, sessions)
}

#[tokio::test]
async fn weather_fetch_injects_api_key_and_selects_fields() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/weather"))
        .and(query_param("q", "Beijing"))
        .and(query_param("appid", "k-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "coord": {"lon": 116.39, "lat": 39.9},
            "main": {"temp": 285.5, "humidity": 40},
            "weather": [{"id": 800, "main": "Clear"}],
            "name": "Beijing",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &base_config(&server.uri()), &[("WEATHER_KEY", "k-123")]);

    let result = manager
        .handle_action(json!({
            "action": "fetch",
            "api": "weather",
            "endpoint": "current",
            "params": {"q": "Beijing"},
            "transform": {"select": ["main.temp", "weather"]},
        }))
        .await
        .expect("fetch");

    assert_eq!(result["success"], json!(true));
    assert_eq!(result["status"], json!(200));
    assert_eq!(
        result["data"],
        json!({"main": {"temp": 285.5}, "weather": [{"id": 800, "main": "Clear"}]})
    );
}

#[tokio::test]
async fn bearer_auth_lands_in_the_authorization_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orgs/rust-lang"))
        .and(wiremock::matchers::header("Authorization", "Bearer tok-xyz"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"login": "rust-lang"})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &base_config(&server.uri()), &[("GITHUB_TOKEN", "tok-xyz")]);

    let result = manager
        .handle_action(json!({
            "action": "fetch",
            "api": "github",
            "endpoint": "get_org",
            "params": {"org": "rust-lang"},
        }))
        .await
        .expect("fetch");
    assert_eq!(result["data"]["login"], json!("rust-lang"));
}

#[tokio::test]
async fn get_retries_transient_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/movies"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/movies"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"title": "ok"}])))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &base_config(&server.uri()), &[]);

    let result = manager
        .handle_action(json!({
            "action": "fetch",
            "api": "movies",
            "endpoint": "top",
        }))
        .await
        .expect("fetch should retry into the healthy mock");
    assert_eq!(result["status"], json!(200));
    assert_eq!(result["attempts"], json!(2));
}

#[tokio::test]
async fn post_is_never_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/movies/rate"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &base_config(&server.uri()), &[]);

    let err = manager
        .handle_action(json!({
            "action": "fetch",
            "api": "movies",
            "endpoint": "rate",
            "params": {"title": "Heat", "rating": 9.1},
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code, "HTTP_STATUS");
}

#[tokio::test]
async fn non_2xx_surfaces_status_and_snippet_not_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/movies"))
        .respond_with(
            ResponseTemplate::new(404).set_body_string("{\"message\": \"nothing here\"}"),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &base_config(&server.uri()), &[]);

    let err = manager
        .handle_action(json!({
            "action": "fetch",
            "api": "movies",
            "endpoint": "top",
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code, "HTTP_STATUS");
    assert!(!err.retryable);
    let details = err.details.expect("details");
    assert_eq!(details["status"], json!(404));
    assert!(details["body"].as_str().unwrap().contains("nothing here"));
}

#[tokio::test]
async fn oversized_response_aborts_and_leaves_sessions_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/movies"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_bytes(vec![b'x'; 4096]),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = base_config(&server.uri());
    config["security"]["max_response_bytes"] = json!(256);
    let manager = manager(&dir, &config, &[]);

    manager
        .handle_action(json!({
            "action": "session_create",
            "session_id": "cap-test",
            "api": "movies",
            "endpoint": "top",
        }))
        .await
        .expect("create session");

    let err = manager
        .handle_action(json!({
            "action": "fetch",
            "api": "movies",
            "endpoint": "top",
            "session_id": "cap-test",
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code, "RESPONSE_TOO_LARGE");

    let session = manager
        .handle_action(json!({"action": "session_get", "session_id": "cap-test"}))
        .await
        .expect("session_get");
    assert_eq!(session["session"]["record_count"], json!(0));
}

#[tokio::test]
async fn fetches_with_a_session_id_accumulate_and_return_only_the_summary() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/movies"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"title": "a"}, {"title": "b"}, {"title": "c"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/movies"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"title": "d"}, {"title": "e"}
        ])))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &base_config(&server.uri()), &[]);

    manager
        .handle_action(json!({
            "action": "session_create",
            "session_id": "sweep",
            "api": "movies",
            "endpoint": "top",
            "description": "paged crawl",
        }))
        .await
        .expect("create");

    for (page, expected_total) in [(1, 3u64), (2, 5u64)] {
        let result = manager
            .handle_action(json!({
                "action": "fetch",
                "api": "movies",
                "endpoint": "top",
                "params": {"page": page},
                "session_id": "sweep",
            }))
            .await
            .expect("fetch");
        assert_eq!(result["success"], json!(true));
        // Summary instead of payload, never both.
        assert!(result.get("data").is_none());
        assert_eq!(result["session"]["record_count"], json!(expected_total));
    }

    let exported = manager
        .handle_action(json!({"action": "session_export", "session_id": "sweep"}))
        .await
        .expect("export");
    assert_eq!(exported["total"], json!(5));
    let titles: Vec<&str> = exported["records"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["title"].as_str().unwrap())
        .collect();
    assert_eq!(titles, vec!["a", "b", "c", "d", "e"]);

    manager
        .handle_action(json!({"action": "session_close", "session_id": "sweep"}))
        .await
        .expect("close");
    let err = manager
        .handle_action(json!({
            "action": "fetch",
            "api": "movies",
            "endpoint": "top",
            "params": {"page": 1},
            "session_id": "sweep",
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code, "SESSION_CLOSED");
}

#[tokio::test]
async fn loopback_targets_are_blocked_without_an_allow_list() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config("http://127.0.0.1:9");
    config["security"] = json!({});
    let manager = manager(&dir, &config, &[]);

    let err = manager
        .handle_action(json!({
            "action": "fetch",
            "api": "movies",
            "endpoint": "top",
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code, "TARGET_BLOCKED");
}

#[tokio::test]
async fn parameter_validation_happens_before_any_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &base_config(&server.uri()), &[("WEATHER_KEY", "k")]);

    let err = manager
        .handle_action(json!({
            "action": "fetch",
            "api": "weather",
            "endpoint": "current",
            "params": {"q": "Beijing", "units": "metric"},
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code, "UNKNOWN_PARAMETER");

    let err = manager
        .handle_action(json!({
            "action": "fetch",
            "api": "weather",
            "endpoint": "current",
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code, "MISSING_PARAMETER");
}

#[tokio::test]
async fn missing_secret_fails_resolution_before_any_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &base_config(&server.uri()), &[]);

    let err = manager
        .handle_action(json!({
            "action": "fetch",
            "api": "weather",
            "endpoint": "current",
            "params": {"q": "Beijing"},
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code, "MISSING_SECRET");
}

#[tokio::test]
async fn config_test_probes_the_base_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &base_config(&server.uri()), &[]);

    let result = manager
        .handle_action(json!({"action": "config_test", "api": "movies"}))
        .await
        .expect("config_test");
    assert_eq!(result["accessible"], json!(true));
    assert_eq!(result["status"], json!(200));

    let all = manager
        .handle_action(json!({"action": "config_test_all"}))
        .await
        .expect("config_test_all");
    assert_eq!(all["success"], json!(true));
    assert_eq!(all["results"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn config_and_endpoint_listing_reflect_the_loaded_registry() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &base_config("https://api.example.com"), &[]);

    let listed = manager
        .handle_action(json!({"action": "config_list"}))
        .await
        .expect("config_list");
    assert_eq!(listed["count"], json!(3));
    let names: Vec<&str> = listed["apis"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["github", "movies", "weather"]);

    let endpoints = manager
        .handle_action(json!({"action": "endpoints", "api": "movies"}))
        .await
        .expect("endpoints");
    assert_eq!(endpoints["count"], json!(2));

    let err = manager
        .handle_action(json!({"action": "bogus"}))
        .await
        .unwrap_err();
    assert_eq!(err.code, "INVALID_PARAMS");
}
