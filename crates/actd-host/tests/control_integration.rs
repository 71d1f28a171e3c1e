//! Control socket round trips: registration, activation, status and shutdown.

use std::path::Path;

use actd_host::control::{ControlClient, RequestEnvelope, decode_b64_cbor, encode_b64_cbor};
use actd_host::{ControlServer, Stub};
use actd_kernel::{GroupDescriptor, ObjectDescriptor};
use serde_json::json;
use tempfile::TempDir;

#[path = "helpers.rs"]
mod helpers;
use helpers::{Harness, test_config, wait_until};

async fn connect(path: &Path) -> ControlClient {
    for _ in 0..50 {
        if path.exists() {
            if let Ok(client) = ControlClient::connect(path).await {
                return client;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("control socket never came up");
}

#[tokio::test]
async fn control_channel_round_trip() {
    let sock_dir = TempDir::new().unwrap();
    let sock_path = sock_dir.path().join("control.sock");
    let mut config = test_config();
    config.admin_token = Some("secret".into());
    let h = Harness::start(config);

    let server = ControlServer::new(sock_path.clone(), h.activation.clone());
    let server_task = tokio::spawn(server.run());
    let mut client = connect(&sock_path).await;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let group_b64 = encode_b64_cbor(&GroupDescriptor::default()).unwrap();
    let result = client
        .call("register-group", json!({ "desc_b64": group_b64 }))
        .await
        .unwrap()
        .unwrap();
    let group: actd_kernel::GroupId = result["group"].as_str().unwrap().parse().unwrap();

    let object_b64 = encode_b64_cbor(&ObjectDescriptor::new(group, "Echo")).unwrap();
    let result = client
        .call("register-object", json!({ "desc_b64": object_b64 }))
        .await
        .unwrap()
        .unwrap();
    let object = result["object"].as_str().unwrap().to_string();

    let result = client
        .call("activate", json!({ "object": object }))
        .await
        .unwrap()
        .unwrap();
    let stub = Stub::from_base64(result["stub_b64"].as_str().unwrap()).unwrap();
    assert!(String::from_utf8(stub.into_bytes()).unwrap().starts_with("fake://"));

    let result = client
        .call("get-object-desc", json!({ "object": object }))
        .await
        .unwrap()
        .unwrap();
    let desc: ObjectDescriptor = decode_b64_cbor(result["desc_b64"].as_str().unwrap()).unwrap();
    assert_eq!(desc.class_name, "Echo");
    assert_eq!(desc.group, group);

    let status = client.call("status", json!({})).await.unwrap().unwrap();
    assert_eq!(status["objects"], 1);
    assert_eq!(status["groups"][0]["group"], group.to_string());
    assert_eq!(status["groups"][0]["status"], "normal");
    assert_eq!(status["groups"][0]["active"], true);

    let err = client.call("bogus", json!({})).await.unwrap().unwrap_err();
    assert_eq!(err.code, "unknown_method");

    let err = client
        .call("activate", json!({ "object": uuid_like() }))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code, "unknown_object");

    let err = client
        .call("activate", json!({ "object": "not-an-id" }))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code, "invalid_request");

    let err = client.call("shutdown", json!({})).await.unwrap().unwrap_err();
    assert_eq!(err.code, "unauthorized");
    assert!(!h.activation.is_shutting_down());

    client
        .call("shutdown", json!({ "token": "secret" }))
        .await
        .unwrap()
        .unwrap();
    assert!(h.activation.is_shutting_down());
    server_task.await.unwrap().unwrap();
    assert!(!sock_path.exists());
    wait_until("group killed", || h.spawner.launches()[0].exited()).await;
}

#[tokio::test]
async fn group_callbacks_over_the_socket() {
    let sock_dir = TempDir::new().unwrap();
    let sock_path = sock_dir.path().join("control.sock");
    let h = Harness::start(test_config());
    h.spawner.set_auto_active(false);
    let group = h.group().await;
    let object = h.object(group, false).await;

    tokio::spawn(ControlServer::new(sock_path.clone(), h.activation.clone()).run());
    let mut client = connect(&sock_path).await;

    let activator = h.activation.activator();
    let pending = tokio::spawn(async move { activator.activate(object, false).await });
    wait_until("launch", || h.spawner.launch_count() == 1).await;

    let boot = h.spawner.launches()[0].bootstrap.clone();
    assert_eq!(boot.control, test_config().control_socket.display().to_string());
    let err = client
        .call(
            "active-group",
            json!({ "group": group.to_string(), "endpoint": "fake://x", "incarnation": 9 }),
        )
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code, "group_creation_race");

    client
        .call(
            "active-group",
            json!({
                "group": group.to_string(),
                "endpoint": h.spawner.launches()[0].endpoint(),
                "incarnation": boot.incarnation,
            }),
        )
        .await
        .unwrap()
        .unwrap();
    pending.await.unwrap().unwrap();

    let pushed = Stub::new(b"pushed".to_vec());
    client
        .call(
            "active-object",
            json!({
                "group": group.to_string(),
                "object": object.to_string(),
                "stub_b64": pushed.to_base64(),
            }),
        )
        .await
        .unwrap()
        .unwrap();
    let stub = h.activation.activator().activate(object, false).await.unwrap();
    assert_eq!(stub, pushed);

    client
        .call(
            "inactive-group",
            json!({ "group": group.to_string(), "incarnation": boot.incarnation }),
        )
        .await
        .unwrap()
        .unwrap();
    assert!(!h.report(group).await.active);
}

#[tokio::test]
async fn malformed_lines_get_decode_errors() {
    let sock_dir = TempDir::new().unwrap();
    let sock_path = sock_dir.path().join("control.sock");
    let h = Harness::start(test_config());
    tokio::spawn(ControlServer::new(sock_path.clone(), h.activation.clone()).run());
    let mut client = connect(&sock_path).await;

    let mut request = RequestEnvelope::new("status", json!({}));
    request.v = 99;
    let resp = client.request(&request).await.unwrap();
    assert!(!resp.ok);
    assert_eq!(resp.id, request.id);
    assert_eq!(resp.error.unwrap().code, "invalid_request");

    let resp = client
        .request(&RequestEnvelope::new(
            "register-group",
            json!({ "desc_b64": "%%%" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.error.unwrap().code, "decode_error");
}

fn uuid_like() -> String {
    "3f1c9a7e-2b4d-4e8f-9a10-5c6d7e8f9a0b".to_string()
}
