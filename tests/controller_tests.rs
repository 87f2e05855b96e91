use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

use hass_hvac::{
    ActiveHours, Config, Controller, CoolingParams, DefrostParams, Entity, Error, HeatingParams,
    HubOptions, HvacOptions, HvacState, SystemMode, Thresholds,
};

const TOKEN: &str = "test-token";

type CallLog = Arc<Mutex<Vec<(String, String)>>>;

fn test_config(url: &str) -> Config {
    Config {
        hass_options: HubOptions {
            ws_url: url.to_string(),
            rest_url: String::new(),
            access_token: TOKEN.to_string(),
            max_retries: 3,
            retry_delay_ms: 50,
            state_check_interval_ms: 600_000,
        },
        hvac_options: HvacOptions {
            temp_sensor: "sensor.indoor".to_string(),
            system_mode: SystemMode::Auto,
            entities: vec![
                Entity {
                    entity_id: "climate.living_room_ac".to_string(),
                    enabled: true,
                    defrost_capable: true,
                },
                Entity {
                    entity_id: "climate.attic_ac".to_string(),
                    enabled: false,
                    defrost_capable: false,
                },
            ],
            heating: HeatingParams {
                setpoint_c: 21.0,
                preset_mode: "comfort".to_string(),
                thresholds: Thresholds {
                    indoor_min: 19.7,
                    indoor_max: 22.0,
                    outdoor_min: -10.0,
                    outdoor_max: 15.0,
                },
                defrost: DefrostParams {
                    temperature_threshold_c: 0.0,
                    period_seconds: 7200,
                    duration_seconds: 300,
                },
            },
            cooling: CoolingParams {
                setpoint_c: 24.0,
                preset_mode: "eco".to_string(),
                thresholds: Thresholds {
                    indoor_min: 22.0,
                    indoor_max: 24.5,
                    outdoor_min: 10.0,
                    outdoor_max: 40.0,
                },
            },
            // Always operable so tests do not depend on the wall clock.
            active_hours: ActiveHours {
                start: 0,
                start_weekday: 0,
                end_hour: 23,
            },
        },
    }
}

async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn send(ws: &mut WebSocketStream<TcpStream>, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Option<Value> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).ok(),
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return None,
        }
    }
}

async fn accept_and_auth(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = accept_async(stream).await.unwrap();
    send(&mut ws, json!({"type": "auth_required"})).await;
    let auth = next_json(&mut ws).await.expect("client should send auth");
    assert_eq!(auth["type"], "auth");
    send(&mut ws, json!({"type": "auth_ok"})).await;
    ws
}

/// Serve one hub session: fixed sensor readings, every service call
/// recorded and acknowledged.
async fn serve_hub(listener: TcpListener, indoor: &str, outdoor: &str, calls: CallLog) {
    let mut ws = accept_and_auth(&listener).await;
    while let Some(msg) = next_json(&mut ws).await {
        let Some(id) = msg["id"].as_u64() else {
            continue;
        };
        match msg["type"].as_str() {
            Some("subscribe_events") => {
                send(&mut ws, json!({"id": id, "type": "result", "success": true, "result": null}))
                    .await;
            }
            Some("get_states") => {
                send(
                    &mut ws,
                    json!({"id": id, "type": "result", "success": true, "result": [
                        {"entity_id": "sensor.indoor", "state": indoor, "attributes": {}},
                        {"entity_id": "sensor.outdoor_temperature", "state": outdoor, "attributes": {}},
                    ]}),
                )
                .await;
            }
            Some("call_service") => {
                let service = msg["service"].as_str().unwrap_or("").to_string();
                let entity = msg["service_data"]["entity_id"]
                    .as_str()
                    .unwrap_or("")
                    .to_string();
                calls.lock().unwrap().push((service, entity));
                send(&mut ws, json!({"id": id, "type": "result", "success": true, "result": null}))
                    .await;
            }
            _ => {}
        }
    }
}

/// Trigger evaluations until the machine reaches `want` or the
/// attempts run out.
async fn drive_to_state(controller: &Controller, want: HvacState) -> HvacState {
    for _ in 0..50 {
        let status = controller.status().await;
        if status.state == want {
            return status.state;
        }
        controller.trigger_evaluation().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    controller.status().await.state
}

#[tokio::test]
async fn cold_morning_drives_heating_end_to_end() {
    let (listener, url) = listener().await;
    let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
    let server = tokio::spawn(serve_hub(listener, "19.0", "5.0", calls.clone()));

    let controller = Controller::start(test_config(&url)).await.unwrap();
    let state = drive_to_state(&controller, HvacState::Heating).await;
    assert_eq!(state, HvacState::Heating);

    {
        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                ("set_hvac_mode".to_string(), "climate.living_room_ac".to_string()),
                ("set_preset_mode".to_string(), "climate.living_room_ac".to_string()),
                ("set_temperature".to_string(), "climate.living_room_ac".to_string()),
            ],
            "exactly the enabled entity, mode then preset then setpoint"
        );
    }

    controller.shutdown().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn status_reports_the_configured_shape() {
    let (listener, url) = listener().await;
    let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
    let server = tokio::spawn(serve_hub(listener, "21.0", "12.0", calls.clone()));

    let controller = Controller::start(test_config(&url)).await.unwrap();
    let state = drive_to_state(&controller, HvacState::Idle).await;
    assert_eq!(state, HvacState::Idle);

    let status = controller.status().await;
    assert!(status.connected);
    assert_eq!(status.entity_count, 2);
    assert_eq!(status.temp_sensor, "sensor.indoor");

    controller.shutdown().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn shutdown_turns_enabled_entities_off() {
    let (listener, url) = listener().await;
    let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
    // Dead-band readings: the machine idles and stays there.
    let server = tokio::spawn(serve_hub(listener, "21.0", "20.0", calls.clone()));

    let controller = Controller::start(test_config(&url)).await.unwrap();
    let state = drive_to_state(&controller, HvacState::Idle).await;
    assert_eq!(state, HvacState::Idle);

    controller.shutdown().await.unwrap();
    server.abort();

    let calls = calls.lock().unwrap();
    assert_eq!(
        *calls,
        vec![("set_hvac_mode".to_string(), "climate.living_room_ac".to_string())],
        "one mode-off call for the enabled entity, none for the disabled one"
    );
}

#[tokio::test]
async fn indoor_sensor_event_requeries_outdoor() {
    let (listener, url) = listener().await;
    let get_states_count = Arc::new(Mutex::new(0usize));
    let counted = get_states_count.clone();

    let server = tokio::spawn(async move {
        let mut ws = accept_and_auth(&listener).await;
        // Acknowledge the subscription first.
        let subscribe = next_json(&mut ws).await.unwrap();
        let id = subscribe["id"].as_u64().unwrap();
        send(&mut ws, json!({"id": id, "type": "result", "success": true, "result": null})).await;

        // The startup refresh reads indoor and outdoor (two snapshots).
        // Once those are served, push an indoor temperature change; any
        // further get_states can only come from the event path.
        let mut event_sent = false;
        while let Some(msg) = next_json(&mut ws).await {
            let Some(id) = msg["id"].as_u64() else { continue };
            if msg["type"] == "get_states" {
                let served = {
                    let mut count = counted.lock().unwrap();
                    *count += 1;
                    *count
                };
                send(
                    &mut ws,
                    json!({"id": id, "type": "result", "success": true, "result": [
                        {"entity_id": "sensor.indoor", "state": "21.0", "attributes": {}},
                        {"entity_id": "sensor.outdoor_temperature", "state": "4.0", "attributes": {}},
                    ]}),
                )
                .await;
                if served >= 2 && !event_sent {
                    event_sent = true;
                    send(
                        &mut ws,
                        json!({"type": "event", "event": {
                            "event_type": "state_changed",
                            "data": {
                                "entity_id": "sensor.indoor",
                                "old_state": null,
                                "new_state": {"entity_id": "sensor.indoor", "state": "19.2", "attributes": {}},
                            }
                        }}),
                    )
                    .await;
                }
            } else {
                send(&mut ws, json!({"id": id, "type": "result", "success": true, "result": null}))
                    .await;
            }
        }
    });

    let controller = Controller::start(test_config(&url)).await.unwrap();

    // Startup refresh accounts for two snapshots; the third can only be
    // the outdoor re-query caused by the pushed event.
    let mut requeried = false;
    for _ in 0..50 {
        if *get_states_count.lock().unwrap() >= 3 {
            requeried = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(requeried, "state_changed on the indoor sensor triggers an outdoor re-query");

    controller.shutdown().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn auth_failure_aborts_before_any_service_call() {
    let (listener, url) = listener().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        send(&mut ws, json!({"type": "auth_required"})).await;
        let _auth = next_json(&mut ws).await;
        send(&mut ws, json!({"type": "auth_invalid", "message": "expired"})).await;
        let extra = tokio::time::timeout(Duration::from_millis(500), next_json(&mut ws)).await;
        assert!(matches!(extra, Ok(None) | Err(_)), "no traffic after auth_invalid");
    });

    let err = Controller::start(test_config(&url)).await.unwrap_err();
    assert!(
        matches!(err, Error::AuthInvalid(_)),
        "expected AuthInvalid, got {err:?}"
    );
    server.await.unwrap();
}

#[tokio::test]
async fn invalid_config_is_rejected_before_connecting() {
    let mut config = test_config("ws://127.0.0.1:1");
    config.hvac_options.active_hours.end_hour = 24;
    let err = Controller::start(config).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
