// End-to-end tests for `Controller` and `Supervisor` against a scripted
// mock controller speaking the line protocol.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use poolside_core::{
    Controller, ControllerConfig, CoreError, Params, Supervisor, SupervisorConfig,
    SupervisorEvent,
};

// ── Mock controller ─────────────────────────────────────────────────

struct Reply {
    delay: Duration,
    messages: Vec<Value>,
}

type Responder = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

#[derive(Debug, Clone)]
enum Push {
    Json(Value),
    Close,
}

struct MockController {
    port: u16,
    received: Arc<Mutex<Vec<Value>>>,
    push: broadcast::Sender<Push>,
}

impl MockController {
    async fn start<F>(responder: F) -> Self
    where
        F: Fn(&Value) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let (push, _) = broadcast::channel(16);
        let responder: Responder = Arc::new(responder);

        let (task_received, task_push) = (received.clone(), push.clone());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(
                    socket,
                    responder.clone(),
                    task_received.clone(),
                    task_push.subscribe(),
                ));
            }
        });

        Self {
            port,
            received,
            push,
        }
    }

    fn config(&self) -> ControllerConfig {
        let mut config = ControllerConfig::new("127.0.0.1").with_port(self.port);
        config.connection.response_timeout = Duration::from_secs(5);
        config
    }

    fn push(&self, push: Push) {
        let _ = self.push.send(push);
    }

    fn requests(&self, command: &str) -> Vec<Value> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r["command"] == json!(command))
            .cloned()
            .collect()
    }
}

async fn serve(
    socket: TcpStream,
    responder: Responder,
    received: Arc<Mutex<Vec<Value>>>,
    mut pushes: broadcast::Receiver<Push>,
) {
    let (read, mut write) = socket.into_split();
    let (request_tx, mut request_rx) = mpsc::unbounded_channel::<Value>();

    tokio::spawn(async move {
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(request) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            received.lock().unwrap().push(request.clone());
            if request_tx.send(request).is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            request = request_rx.recv() => {
                let Some(request) = request else { break };
                let reply = responder(&request);
                tokio::time::sleep(reply.delay).await;
                for message in reply.messages {
                    if write_line(&mut write, &message).await.is_err() {
                        return;
                    }
                }
            }
            push = pushes.recv() => match push {
                Ok(Push::Json(value)) => {
                    if write_line(&mut write, &value).await.is_err() {
                        return;
                    }
                }
                Ok(Push::Close) | Err(_) => break,
            }
        }
    }
}

async fn write_line(write: &mut OwnedWriteHalf, value: &Value) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(value).unwrap();
    line.extend_from_slice(b"\r\n");
    write.write_all(&line).await
}

// ── Helpers ─────────────────────────────────────────────────────────

fn params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => panic!("not an object"),
    }
}

fn reply(request: &Value, code: &str, extra: Value) -> Value {
    let mut body = json!({
        "messageID": request["messageID"],
        "command": request["command"],
        "response": code,
    });
    if let (Some(body), Value::Object(extra)) = (body.as_object_mut(), extra) {
        body.extend(extra);
    }
    body
}

fn quick(messages: Vec<Value>) -> Reply {
    Reply {
        delay: Duration::from_millis(2),
        messages,
    }
}

fn equipment() -> Value {
    json!([
        {"objnam": "INCR", "params": {"OBJTYP": "SYSTEM", "SUBTYP": "SUBTYP", "SNAME": "Backyard", "PARENT": "PARENT"}},
        {"objnam": "B1101", "params": {"OBJTYP": "BODY", "SUBTYP": "POOL", "SNAME": "Pool", "PARENT": "INCR"}},
        {"objnam": "C0001", "params": {"OBJTYP": "CIRCUIT", "SUBTYP": "LIGHT", "SNAME": "Pool Light", "PARENT": "B1101"}},
        {"objnam": "P0001", "params": {"OBJTYP": "PANEL", "SNAME": "Panel"}},
        {"objnam": "X0001", "params": {"OBJTYP": "OBJTYP", "SUBTYP": "SUBTYP"}}
    ])
}

/// Answers subscriptions with a value for STATUS and LOTMP and the
/// "unset" echo for everything else.
fn subscription_answer(request: &Value) -> Value {
    let objects: Vec<Value> = request["objectList"]
        .as_array()
        .into_iter()
        .flatten()
        .map(|query| {
            let values: Params = query["keys"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .map(|key| {
                    let value = match key {
                        "STATUS" => json!("OFF"),
                        "LOTMP" => json!("78"),
                        other => json!(other),
                    };
                    (key.to_owned(), value)
                })
                .collect();
            json!({"objnam": query["objnam"], "params": values})
        })
        .collect();
    json!({"objectList": objects})
}

/// A well-behaved controller.
fn pool_controller(request: &Value) -> Reply {
    let command = request["command"].as_str().unwrap_or_default();
    match command {
        "GetParamList" if request["condition"] == json!("OBJTYP=SYSTEM") => {
            let system = json!({"objectList": [{
                "objnam": "INCR",
                "params": {"PROPNAME": "Backyard", "VER": "1.064", "MODE": "ENGLISH", "SNAME": "Backyard"}
            }]});
            quick(vec![reply(request, "200", system)])
        }
        "GetParamList" => quick(vec![reply(
            request,
            "200",
            json!({"objectList": equipment()}),
        )]),
        "RequestParamList" => quick(vec![reply(request, "200", subscription_answer(request))]),
        "GetQuery" => Reply {
            delay: Duration::from_millis(300),
            messages: vec![reply(request, "200", json!({"answer": []}))],
        },
        _ => quick(vec![reply(request, "200", json!({}))]),
    }
}

async fn started_controller(mock: &MockController) -> Controller {
    let controller = Controller::new(mock.config());
    controller.start().await.unwrap();
    controller
}

// ── Startup ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_start_enumerates_and_subscribes() {
    let mock = MockController::start(pool_controller).await;
    let controller = started_controller(&mock).await;

    let model = controller.model().await;
    assert_eq!(model.len(), 3, "untracked and untyped entries are skipped");
    assert!(model.get("P0001").is_none());
    assert!(model.get("X0001").is_none());

    let light = model.get("C0001").unwrap();
    assert_eq!(light.subtype(), Some("LIGHT"));
    assert_eq!(light.status(), Some("OFF"));
    assert_eq!(light.parent(), Some("B1101"));
    assert_eq!(
        model.get("B1101").unwrap().attribute("LOTMP"),
        Some(&json!("78"))
    );
    // Unset values echoed by the controller never reach the model.
    assert!(model.get("INCR").unwrap().subtype().is_none());
    assert!(model.get("INCR").unwrap().attribute("PARENT").is_none());
    drop(model);

    let info = controller.system_info().unwrap();
    assert_eq!(info.sw_version, "1.064");
    assert_eq!(
        info.unique_id,
        Uuid::new_v5(&Uuid::NAMESPACE_DNS, b"Backyard")
    );

    let subscriptions = mock.requests("RequestParamList");
    assert!(!subscriptions.is_empty());
    for request in &subscriptions {
        let keys: usize = request["objectList"]
            .as_array()
            .unwrap()
            .iter()
            .map(|q| q["keys"].as_array().unwrap().len())
            .sum();
        assert!(keys <= 50, "subscription with {keys} attributes");
    }

    let metrics = controller.metrics();
    assert_eq!(metrics.successful_connects, 1);
    assert_eq!(metrics.requests_failed, 0);
}

#[tokio::test]
async fn test_start_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let controller = Controller::new(ControllerConfig::new("127.0.0.1").with_port(port));
    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, CoreError::ConnectionFailed { .. }), "got {err:?}");
    assert!(!controller.is_connected());
}

#[tokio::test]
async fn test_enumeration_failure_disconnects() {
    let mock = MockController::start(|request| {
        if request["command"] == json!("GetParamList") && request["condition"] == json!("") {
            quick(vec![reply(request, "500", json!({}))])
        } else {
            pool_controller(request)
        }
    })
    .await;
    let controller = Controller::new(mock.config());

    let err = controller.start().await.unwrap_err();
    assert_eq!(err.response_code(), Some("500"));
    assert!(!controller.is_connected());
    assert!(mock.requests("RequestParamList").is_empty());
}

// ── Notifications ───────────────────────────────────────────────────

#[tokio::test]
async fn test_notification_updates_model() {
    let mock = MockController::start(pool_controller).await;
    let controller = started_controller(&mock).await;
    let mut updates = controller.updates();

    mock.push(Push::Json(json!({
        "command": "NotifyList",
        "objectList": [{"objnam": "C0001", "params": {"STATUS": "ON"}}]
    })));

    let update = tokio::time::timeout(Duration::from_secs(2), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.get("C0001"), Some(&params(json!({"STATUS": "ON"}))));
    assert_eq!(
        controller.object("C0001").await.unwrap().status(),
        Some("ON")
    );
}

// ── Writes ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_writes_batched_behind_read() {
    let mock = MockController::start(pool_controller).await;
    let controller = started_controller(&mock).await;

    let read = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.get_configuration().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let light = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .set_params("C0001", params(json!({"STATUS": "ON"})))
                .await
        })
    };
    let pool = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .set_params("B1101", params(json!({"LOTMP": "82"})))
                .await
        })
    };

    assert!(read.await.unwrap().is_ok());
    assert!(light.await.unwrap().is_ok());
    assert!(pool.await.unwrap().is_ok());

    let writes = mock.requests("SETPARAMLIST");
    assert_eq!(writes.len(), 1, "expected one combined write, got {writes:?}");
    assert_eq!(
        writes[0]["objectList"],
        json!([
            {"objnam": "C0001", "params": {"STATUS": "ON"}},
            {"objnam": "B1101", "params": {"LOTMP": "82"}}
        ])
    );
}

#[tokio::test]
async fn test_direct_write_is_not_merged() {
    let mock = MockController::start(pool_controller).await;
    let controller = started_controller(&mock).await;

    controller
        .request_changes("C0001", params(json!({"STATUS": "ON"})))
        .await
        .unwrap();
    controller
        .request_changes("B1101", params(json!({"LOTMP": "82"})))
        .await
        .unwrap();

    assert_eq!(mock.requests("SETPARAMLIST").len(), 2);
}

// ── Supervision ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_supervisor_reconnects_and_keeps_model() {
    let mock = MockController::start(pool_controller).await;
    let controller = Arc::new(Controller::new(mock.config()));
    // Any uptime counts as stable, so the drop gets an immediate retry.
    let config = SupervisorConfig {
        stable_after: Duration::ZERO,
        ..SupervisorConfig::default()
    };
    let supervisor = Supervisor::new(controller.clone(), config);
    let mut events = supervisor.events();

    supervisor.start().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), SupervisorEvent::Started);

    mock.push(Push::Close);
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, SupervisorEvent::Reconnected);

    assert!(controller.is_connected());
    assert_eq!(controller.model().await.len(), 3);
    let metrics = controller.metrics();
    assert_eq!(metrics.successful_connects, 2);
    assert_eq!(metrics.reconnect_attempts, 1);

    supervisor.stop().await;
    assert!(!controller.is_connected());
}
