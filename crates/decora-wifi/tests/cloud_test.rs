//! End-to-end tests against a mocked myLeviton cloud
//!
//! These drive the integration through real `DecoraSession`s, the config
//! entry manager and the service registry, the same way the bridge does.

use std::sync::Arc;

use decora_config_entries::{ConfigEntries, ConfigEntry, ConfigEntrySource, ConfigEntryState, FlowManager};
use decora_core::Context;
use decora_runtime::Hub;
use decora_wifi::{session_factory, DecoraWifi, DOMAIN};
use httpmock::prelude::*;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

struct Bridge {
    _dir: TempDir,
    hub: Hub,
    entries: Arc<ConfigEntries>,
    flows: FlowManager,
}

fn bridge(server: &MockServer) -> Bridge {
    let dir = TempDir::new().unwrap();
    let hub = Hub::new(dir.path());
    let entries = Arc::new(ConfigEntries::new(hub.clone()));
    let flows = FlowManager::new(Arc::clone(&entries));
    let integration = Arc::new(DecoraWifi::new(
        hub.clone(),
        session_factory(Some(server.base_url())),
    ));
    integration.register(&entries, &flows).unwrap();
    Bridge {
        _dir: dir,
        hub,
        entries,
        flows,
    }
}

fn kitchen(power: &str, brightness: i64) -> Value {
    json!({
        "id": 11,
        "serial": "AA01",
        "name": "Kitchen",
        "model": "DW6HD",
        "mac": "00-07-A6-18-36-7E",
        "version": "1.5.80",
        "power": power,
        "brightness": brightness,
        "canSetLevel": true,
        "minLevel": 1,
        "maxLevel": 100
    })
}

async fn mock_account(server: &MockServer) {
    server
        .mock_async(|when, then| {
            when.method(POST).path("/Person/login");
            then.status(200).json_body(json!({"id": "tok", "userId": 7}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/Person/7/residentialPermissions")
                .header("authorization", "tok");
            then.status(200).json_body(json!([{"id": 1, "residenceId": 30}]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/Residences/30/iotSwitches");
            then.status(200).json_body(json!([
                kitchen("OFF", 40),
                {"id": 12, "serial": "BB02", "name": "Porch", "model": "DW4SF",
                 "power": "ON", "brightness": 25}
            ]));
        })
        .await;
}

fn import_entry() -> ConfigEntry {
    let mut data = Map::new();
    data.insert("username".into(), json!("me@example.com"));
    data.insert("password".into(), json!("pw"));
    ConfigEntry::new(DOMAIN, "Decora WiFi (me@example.com)")
        .with_data(data)
        .with_unique_id("me@example.com")
        .with_source(ConfigEntrySource::Import)
}

#[tokio::test]
async fn test_setup_command_and_unload() {
    let server = MockServer::start_async().await;
    mock_account(&server).await;
    let put = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path("/IotSwitches/11")
                .header("authorization", "tok")
                .json_body(json!({"power": "ON", "brightness": 50}));
            then.status(200).json_body(kitchen("ON", 50));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/IotSwitches/11");
            then.status(200).json_body(kitchen("ON", 50));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/IotSwitches/12");
            then.status(200).json_body(json!({
                "id": 12, "serial": "BB02", "name": "Porch", "model": "DW4SF",
                "power": "ON", "brightness": 25
            }));
        })
        .await;
    let logout = server
        .mock_async(|when, then| {
            when.method(POST).path("/Person/logout");
            then.status(204);
        })
        .await;

    let bridge = bridge(&server);
    let entry = bridge.entries.add(import_entry()).await.unwrap();
    bridge.entries.setup(&entry.entry_id).await.unwrap();

    let light = bridge.hub.states.get("light.kitchen").unwrap();
    assert_eq!(light.state, "off");
    assert_eq!(light.attributes["brightness"], Value::Null);

    let fan = bridge.hub.states.get("fan.porch").unwrap();
    assert_eq!(fan.attributes["preset_mode"], json!("Low"));

    bridge
        .hub
        .services
        .call(
            "light",
            "turn_on",
            json!({"entity_id": "light.kitchen", "brightness": 128}),
            Context::new(),
        )
        .await
        .unwrap();
    put.assert_async().await;

    let light = bridge.hub.states.get("light.kitchen").unwrap();
    assert_eq!(light.state, "on");
    assert_eq!(light.attributes["brightness"], json!(127));

    bridge.entries.unload(&entry.entry_id).await.unwrap();
    logout.assert_async().await;
    assert!(bridge.hub.states.get("light.kitchen").is_none());
    assert_eq!(
        bridge.entries.get(&entry.entry_id).unwrap().state,
        ConfigEntryState::NotLoaded
    );
}

#[tokio::test]
async fn test_config_flow_reports_rejected_credentials() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/Person/login");
            then.status(401).json_body(json!({"error": {"message": "login failed"}}));
        })
        .await;

    let bridge = bridge(&server);
    let form = bridge.flows.start_config_flow(DOMAIN).await.unwrap();
    let names: Vec<&str> = form.data_schema.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["username", "password"]);

    let result = bridge
        .flows
        .progress(
            &form.flow_id,
            json!({"username": "me@example.com", "password": "wrong"}),
        )
        .await
        .unwrap();
    assert_eq!(result.errors.unwrap()["base"], "invalid_auth");
    assert_eq!(bridge.flows.in_progress(), vec![form.flow_id]);
}

#[tokio::test]
async fn test_unreachable_cloud_retries_setup() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/Person/login");
            then.status(503).body("maintenance");
        })
        .await;

    let bridge = bridge(&server);
    let entry = bridge.entries.add(import_entry()).await.unwrap();
    assert!(bridge.entries.setup(&entry.entry_id).await.is_err());

    let entry = bridge.entries.get(&entry.entry_id).unwrap();
    assert_eq!(entry.state, ConfigEntryState::SetupRetry);
    assert!(bridge.hub.states.all().is_empty());
}
