//! API regression tests.
//!
//! Drives the full router the daemon serves, backed by fake capabilities:
//! provider credentials, formation and layer setup, node scaling, app
//! lifecycle, releases and teardown.

use std::sync::{Arc, OnceLock};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use keel_api::build_router;
use keel_lifecycle::{LifecycleTimeouts, generate_ssh_keypair};
use keel_lifecycle::fake::{FakeExecutor, FakeProvisioner};
use keel_orchestrator::Orchestrator;
use keel_state::{SshKeypair, StateStore};

struct Harness {
    router: Router,
    provisioner: Arc<FakeProvisioner>,
    executor: Arc<FakeExecutor>,
}

fn harness_with(store: StateStore) -> Harness {
    let provisioner = Arc::new(FakeProvisioner::default());
    let executor = Arc::new(FakeExecutor::default());
    let orchestrator = Orchestrator::new(
        store,
        provisioner.clone(),
        executor.clone(),
        LifecycleTimeouts::default(),
    );
    Harness {
        router: build_router(Arc::new(orchestrator)),
        provisioner,
        executor,
    }
}

fn harness() -> Harness {
    harness_with(StateStore::open_in_memory().unwrap())
}

impl Harness {
    async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let (status, bytes) = self.raw(method, uri, body).await;
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn raw(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-keel-owner", "alice");
        let req = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, bytes.to_vec())
    }

    /// Provider with credentials, formation "dev" and a runtime layer.
    async fn seed(&self) {
        let (status, _) = self
            .call(
                "POST",
                "/api/v1/providers",
                Some(json!({"id": "fake", "kind": "fake", "creds": {"token": "t"}})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = self
            .call(
                "POST",
                "/api/v1/formations",
                Some(json!({"id": "dev", "domain": "example.com"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let layer = json!({
            "id": "runtime",
            "provider": "fake",
            "instance_type": "small",
            "ssh_private_key": test_keys().private_key,
            "ssh_public_key": test_keys().public_key,
        });
        let (status, body) = self
            .call("POST", "/api/v1/formations/dev/layers", Some(layer))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
    }
}

/// One generated keypair shared by every test in this binary.
fn test_keys() -> &'static SshKeypair {
    static KEYS: OnceLock<SshKeypair> = OnceLock::new();
    KEYS.get_or_init(|| generate_ssh_keypair("keel-test").unwrap())
}

#[tokio::test]
async fn requests_without_owner_are_unauthorized() {
    let h = harness();
    let req = Request::builder()
        .uri("/api/v1/formations")
        .body(Body::empty())
        .unwrap();

    let resp = h.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn list_formations_empty() {
    let h = harness();
    let (status, body) = h.call("GET", "/api/v1/formations", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"success": true, "data": []}));
}

#[tokio::test]
async fn layer_reads_never_expose_the_private_key() {
    let h = harness();
    h.seed().await;

    let (status, body) = h
        .call("GET", "/api/v1/formations/dev/layers/runtime", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].get("ssh_private_key").is_none());
    assert_eq!(body["data"]["ssh_public_key"], json!(test_keys().public_key));

    let (_, body) = h.call("GET", "/api/v1/formations/dev/layers", None).await;
    assert!(body["data"][0].get("ssh_private_key").is_none());

    let (status, _) = h
        .call(
            "POST",
            "/api/v1/formations/dev/layers",
            Some(json!({"id": "runtime", "provider": "fake", "instance_type": "small"})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn scale_formation_then_app_then_back() {
    let h = harness();
    h.seed().await;

    let (status, body) = h
        .call("POST", "/api/v1/formations/dev/scale", Some(json!({"runtime": 2})))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["layers"]["runtime"]["nodes"].as_object().unwrap().len(), 2);
    assert_eq!(h.provisioner.provision_calls(), 2);

    let (status, _) = h
        .call("POST", "/api/v1/apps", Some(json!({"id": "api", "formation": "dev"})))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = h
        .call("POST", "/api/v1/apps/api/scale", Some(json!({"web": "3"})))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["nodes"].as_array().unwrap().len(), 2);

    let (_, body) = h.call("GET", "/api/v1/apps/api/containers/web", None).await;
    let nums: Vec<u64> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["num"].as_u64().unwrap())
        .collect();
    assert_eq!(nums, vec![1, 2, 3]);

    let (status, body) = h
        .call("GET", "/api/v1/apps/api/containers/web/2", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["num"], json!(2));

    let (status, _) = h
        .call("POST", "/api/v1/apps/api/scale", Some(json!({"web": "abc"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    h.call("POST", "/api/v1/apps/api/scale", Some(json!({"web": 1})))
        .await;
    let (_, body) = h.call("GET", "/api/v1/apps/api/containers", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn scale_formation_with_unknown_layer_is_rejected() {
    let h = harness();
    h.seed().await;

    let (status, body) = h
        .call("POST", "/api/v1/formations/dev/scale", Some(json!({"db": 1})))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("layer not found: db"));
    assert_eq!(h.provisioner.provision_calls(), 0);
}

#[tokio::test]
async fn duplicate_node_fqdn_conflicts() {
    let h = harness();
    h.seed().await;
    let node = json!({"fqdn": "n1.example.com", "layer": "runtime"});

    let (status, body) = h
        .call("POST", "/api/v1/formations/dev/nodes", Some(node.clone()))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["id"], json!("dev.runtime.1"));
    assert_eq!(body["data"]["state"], json!("up"));

    let (status, _) = h
        .call("POST", "/api/v1/formations/dev/nodes", Some(node))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = h.call("GET", "/api/v1/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn node_converge_returns_plain_text() {
    let h = harness();
    h.seed().await;
    h.call(
        "POST",
        "/api/v1/formations/dev/nodes",
        Some(json!({"fqdn": "n1.example.com", "layer": "runtime"})),
    )
    .await;

    let (status, body) = h
        .raw("POST", "/api/v1/nodes/dev.runtime.1/converge", None)
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap(), "converged dev.runtime.1\n");
}

#[tokio::test]
async fn marked_down_node_hands_its_containers_over() {
    let h = harness();
    h.seed().await;
    h.call("POST", "/api/v1/formations/dev/scale", Some(json!({"runtime": 2})))
        .await;
    h.call("POST", "/api/v1/apps", Some(json!({"id": "api", "formation": "dev"})))
        .await;
    let (status, _) = h
        .call("POST", "/api/v1/apps/api/scale", Some(json!({"web": 4})))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = h
        .call("POST", "/api/v1/nodes/dev.runtime.1/down", None)
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["state"], json!("down"));

    let (_, body) = h.call("GET", "/api/v1/apps/api/containers", None).await;
    let containers = body["data"].as_array().unwrap();
    assert_eq!(containers.len(), 4);
    assert!(containers.iter().all(|c| c["node"] == json!("dev.runtime.2")));
    assert_eq!(h.provisioner.deprovision_calls(), 0);
}

#[tokio::test]
async fn layer_built_from_a_flavor() {
    let h = harness();
    h.seed().await;
    let (status, _) = h
        .call(
            "POST",
            "/api/v1/flavors",
            Some(json!({
                "id": "small",
                "provider": "fake",
                "params": {"instance_type": "m1.small", "region": "us-west-2"},
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = h
        .call(
            "POST",
            "/api/v1/formations/dev/layers",
            Some(json!({
                "id": "proxy",
                "flavor": "small",
                "proxy": true,
                "runtime": false,
                "ssh_private_key": test_keys().private_key,
                "ssh_public_key": test_keys().public_key,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["data"]["provider"], json!("fake"));
    assert_eq!(body["data"]["flavor"], json!("small"));
    assert_eq!(body["data"]["instance_type"], json!("m1.small"));
}

#[tokio::test]
async fn oversized_scale_is_rejected_before_provisioning() {
    let h = harness();
    h.seed().await;

    let (status, _) = h
        .call(
            "POST",
            "/api/v1/formations/dev/scale",
            Some(json!({"runtime": 4_000_000_000u64})),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.provisioner.provision_calls(), 0);
}

#[tokio::test]
async fn config_and_build_create_releases() {
    let h = harness();
    h.seed().await;
    h.call("POST", "/api/v1/formations/dev/scale", Some(json!({"runtime": 1})))
        .await;
    h.call("POST", "/api/v1/apps", Some(json!({"id": "api", "formation": "dev"})))
        .await;

    let (status, body) = h
        .call(
            "POST",
            "/api/v1/apps/api/config",
            Some(json!({"values": {"A": "1", "B": "2"}})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["version"], json!(2));

    let (status, body) = h
        .call(
            "POST",
            "/api/v1/apps/api/builds",
            Some(json!({"image": "registry/api:1", "sha": "abc"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let build_id = body["data"]["id"].clone();

    let (_, body) = h.call("GET", "/api/v1/apps/api/releases", None).await;
    assert_eq!(body["data"]["version"], json!(3));
    assert_eq!(body["data"]["config_version"], json!(2));
    assert_eq!(body["data"]["build"], build_id);

    let (_, body) = h.call("GET", "/api/v1/apps/api/config", None).await;
    assert_eq!(body["data"]["values"], json!({"A": "1", "B": "2"}));

    let (_, body) = h.call("POST", "/api/v1/apps/api/calculate", None).await;
    assert_eq!(body["data"]["image"], json!("registry/api:1"));
    assert_eq!(body["data"]["domain"], json!("api.example.com"));
}

#[tokio::test]
async fn logs_and_run() {
    let h = harness();
    h.seed().await;
    h.call("POST", "/api/v1/apps", Some(json!({"id": "api", "formation": "dev"})))
        .await;

    let (status, body) = h.call("GET", "/api/v1/apps/api/logs", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("No logs for api"));

    h.executor.set_logs("api", "web.1 | ok\n");
    let (status, body) = h.raw("GET", "/api/v1/apps/api/logs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap(), "web.1 | ok\n");

    let (status, _) = h
        .call("POST", "/api/v1/apps/api/run", Some(json!({"command": "ls"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    h.call("POST", "/api/v1/formations/dev/scale", Some(json!({"runtime": 1})))
        .await;
    let (status, body) = h
        .call("POST", "/api/v1/apps/api/run", Some(json!({"command": "ls"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["exit_code"], json!(0));
}

#[tokio::test]
async fn formation_teardown_removes_everything() {
    let h = harness();
    h.seed().await;
    h.call("POST", "/api/v1/formations/dev/scale", Some(json!({"runtime": 3})))
        .await;
    h.call("POST", "/api/v1/apps", Some(json!({"id": "api", "formation": "dev"})))
        .await;
    h.provisioner.fail_deprovision("dev.runtime.2");
    let before = h.executor.controller_converges();

    let (status, _) = h.call("DELETE", "/api/v1/formations/dev", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    assert_eq!(h.executor.controller_converges(), before + 1);
    let (status, _) = h.call("GET", "/api/v1/formations/dev", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = h.call("GET", "/api/v1/apps/api", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, body) = h.call("GET", "/api/v1/nodes", None).await;
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keel.redb");

    {
        let h = harness_with(StateStore::open(&path).unwrap());
        h.seed().await;
    }

    let h = harness_with(StateStore::open(&path).unwrap());
    let (status, body) = h.call("GET", "/api/v1/formations/dev", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["domain"], json!("example.com"));
}
