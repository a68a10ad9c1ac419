//! Dispatcher contract: for every `tools/call` with request id R, exactly
//! one response with id R comes back, across success, validation failure,
//! unknown tools, and concurrent load.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use attune_core::tools::dispatch::{DispatchConfig, ToolDispatcher};
use attune_core::tools::{ParamSpec, ParamType, ToolDescriptor, ToolHandler, ToolRegistryBuilder};

struct CreateEventTool;

#[async_trait]
impl ToolHandler for CreateEventTool {
    async fn call(&self, arguments: Map<String, Value>) -> anyhow::Result<Value> {
        // A little work, so concurrent calls overlap.
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(json!({
            "event_id": "evt-1",
            "title": arguments.get("title"),
        }))
    }
}

fn dispatcher() -> ToolDispatcher {
    let registry = ToolRegistryBuilder::new()
        .register(
            ToolDescriptor {
                name: "self.calendar.create_event".into(),
                description: "Create a calendar event".into(),
                parameters: vec![
                    ParamSpec::new("title", ParamType::String, true),
                    ParamSpec::new("start_time", ParamType::String, true),
                ],
            },
            Arc::new(CreateEventTool),
        )
        .unwrap()
        .build();
    ToolDispatcher::new(registry, DispatchConfig::default(), CancellationToken::new())
}

#[tokio::test]
async fn calendar_call_round_trips_within_deadline() {
    let dispatcher = dispatcher();
    let payload = json!({
        "jsonrpc": "2.0",
        "method": "tools/call",
        "id": 7,
        "params": {
            "name": "self.calendar.create_event",
            "arguments": {"title": "Sync", "start_time": "2025-01-01T10:00:00"}
        }
    });

    let response = tokio::time::timeout(Duration::from_secs(20), dispatcher.dispatch(payload))
        .await
        .expect("dispatch must answer within the call deadline")
        .expect("a request with an id gets a response");

    assert_eq!(response.id, json!(7));
    assert!(response.error.is_none());
    assert_eq!(response.result.unwrap()["title"], "Sync");
}

#[tokio::test]
async fn malformed_argument_yields_invalid_params_for_same_id() {
    let dispatcher = dispatcher();
    let payload = json!({
        "jsonrpc": "2.0",
        "method": "tools/call",
        "id": 7,
        "params": {
            "name": "self.calendar.create_event",
            "arguments": {"title": "Sync", "start_time": 42}
        }
    });

    let response = dispatcher.dispatch(payload).await.unwrap();
    assert_eq!(response.id, json!(7));
    assert_eq!(response.error.unwrap().code, -32602);
}

#[tokio::test]
async fn every_concurrent_request_gets_exactly_one_response() {
    let dispatcher = Arc::new(dispatcher());

    let mut handles = Vec::new();
    for id in 0..24u64 {
        let d = Arc::clone(&dispatcher);
        // Mix outcomes: valid, invalid-params, unknown tool.
        let payload = match id % 3 {
            0 => json!({
                "jsonrpc": "2.0", "method": "tools/call", "id": id,
                "params": {
                    "name": "self.calendar.create_event",
                    "arguments": {"title": format!("t{id}"), "start_time": "2025-01-01T10:00:00"}
                }
            }),
            1 => json!({
                "jsonrpc": "2.0", "method": "tools/call", "id": id,
                "params": {
                    "name": "self.calendar.create_event",
                    "arguments": {"title": 13, "start_time": "x"}
                }
            }),
            _ => json!({
                "jsonrpc": "2.0", "method": "tools/call", "id": id,
                "params": {"name": "self.missing", "arguments": {}}
            }),
        };
        handles.push(tokio::spawn(async move { d.dispatch(payload).await }));
    }

    let mut by_id: HashMap<u64, usize> = HashMap::new();
    for handle in handles {
        let response = handle.await.unwrap().expect("id'd request gets a response");
        let id = response.id.as_u64().expect("numeric id");
        *by_id.entry(id).or_default() += 1;

        match id % 3 {
            0 => assert!(response.error.is_none(), "id {id} should succeed"),
            1 => assert_eq!(response.error.unwrap().code, -32602),
            _ => assert_eq!(response.error.unwrap().code, -32601),
        }
    }

    assert_eq!(by_id.len(), 24);
    assert!(by_id.values().all(|&count| count == 1));
}
