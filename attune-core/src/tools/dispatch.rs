//! JSON-RPC 2.0 tool dispatcher.
//!
//! Routes `tools/list` and `tools/call` against the frozen registry. Calls
//! run concurrently up to a bound (semaphore, default 8); each call carries
//! a deadline (default 20 s) and observes the shared cancellation token.
//! Handler failures are redacted to a generic message; internal error text
//! never crosses the wire.
//!
//! Exactly-once responses: `dispatch` returns exactly one `RpcResponse` per
//! request id; notifications (no id) return `None`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::jsonrpc::{
    RpcRequest, RpcResponse, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, SERVER_ERROR,
};
use super::{validate_arguments, ToolRegistry};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum concurrently executing calls; further calls queue.
    pub max_concurrent: usize,
    /// Per-call deadline.
    pub call_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            call_timeout: Duration::from_secs(20),
        }
    }
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    semaphore: Arc<Semaphore>,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, config: DispatchConfig, cancel: CancellationToken) -> Self {
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            call_timeout: config.call_timeout,
            cancel,
        }
    }

    /// Handle one inbound JSON-RPC payload.
    ///
    /// Returns `None` for notifications; otherwise exactly one response,
    /// success or error, for the request's id.
    pub async fn dispatch(&self, payload: Value) -> Option<RpcResponse> {
        let request: RpcRequest = match serde_json::from_value(payload) {
            Ok(req) => req,
            Err(e) => {
                warn!("malformed JSON-RPC request: {e}");
                return Some(RpcResponse::error(
                    Value::Null,
                    INVALID_REQUEST,
                    "Invalid Request",
                ));
            }
        };

        let Some(id) = request.id.clone() else {
            debug!(method = request.method.as_str(), "dropping notification");
            return None;
        };

        let response = match request.method.as_str() {
            "tools/list" => self.handle_list(id, request.params),
            "tools/call" => self.handle_call(id, request.params).await,
            other => {
                debug!(method = other, "unknown method");
                RpcResponse::error(id, METHOD_NOT_FOUND, "Method not found")
            }
        };
        Some(response)
    }

    fn handle_list(&self, id: Value, params: Option<Value>) -> RpcResponse {
        let cursor = params
            .as_ref()
            .and_then(|p| p.get("cursor"))
            .and_then(|c| c.as_str())
            .map(str::to_string);
        let page_size = params
            .as_ref()
            .and_then(|p| p.get("page_size"))
            .and_then(|s| s.as_u64())
            .unwrap_or(super::MAX_PAGE_SIZE as u64) as usize;

        let (tools, next_cursor) = self.registry.page(cursor.as_deref(), page_size);
        let mut result = json!({ "tools": tools });
        if let Some(next) = next_cursor {
            result["nextCursor"] = json!(next);
        }
        RpcResponse::success(id, result)
    }

    async fn handle_call(&self, id: Value, params: Option<Value>) -> RpcResponse {
        let params = params.unwrap_or(Value::Null);
        let name = match params.get("name").and_then(|n| n.as_str()) {
            Some(name) => name.to_string(),
            None => {
                return RpcResponse::error(id, INVALID_PARAMS, "Invalid params: missing tool name")
            }
        };
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

        let Some(tool) = self.registry.get(&name) else {
            return RpcResponse::error(id, METHOD_NOT_FOUND, "Method not found");
        };

        let args = match validate_arguments(&tool.descriptor, &arguments) {
            Ok(args) => args,
            Err(detail) => {
                debug!(tool = name.as_str(), detail = detail.as_str(), "invalid params");
                return RpcResponse::error(id, INVALID_PARAMS, format!("Invalid params: {detail}"));
            }
        };

        // Bound concurrency; waiting here is what queues excess calls.
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return RpcResponse::error(id, SERVER_ERROR, "Server error"),
        };

        let handler = Arc::clone(&tool.handler);
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => {
                return RpcResponse::error(id, SERVER_ERROR, "Server error: cancelled");
            }
            result = tokio::time::timeout(self.call_timeout, handler.call(args)) => result,
        };
        drop(permit);

        match outcome {
            Ok(Ok(result)) => RpcResponse::success(id, result),
            Ok(Err(e)) => {
                // Redacted: log the real error, return a generic message.
                warn!(tool = name.as_str(), error = %e, "tool handler failed");
                RpcResponse::error(id, SERVER_ERROR, "Server error")
            }
            Err(_) => {
                warn!(tool = name.as_str(), "tool call deadline expired");
                RpcResponse::error(id, SERVER_ERROR, "Timeout")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ParamSpec, ParamType, ToolDescriptor, ToolHandler, ToolRegistryBuilder};
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CalendarTool;

    #[async_trait]
    impl ToolHandler for CalendarTool {
        async fn call(&self, arguments: Map<String, Value>) -> anyhow::Result<Value> {
            Ok(json!({ "created": arguments.get("title") }))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl ToolHandler for SlowTool {
        async fn call(&self, _arguments: Map<String, Value>) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(Value::Null)
        }
    }

    struct FailingTool;

    #[async_trait]
    impl ToolHandler for FailingTool {
        async fn call(&self, _arguments: Map<String, Value>) -> anyhow::Result<Value> {
            anyhow::bail!("database password is hunter2")
        }
    }

    struct CountingTool {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolHandler for CountingTool {
        async fn call(&self, _arguments: Map<String, Value>) -> anyhow::Result<Value> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    fn calendar_descriptor() -> ToolDescriptor {
        ToolDescriptor {
            name: "self.calendar.create_event".into(),
            description: "Create a calendar event".into(),
            parameters: vec![
                ParamSpec::new("title", ParamType::String, true),
                ParamSpec::new("start_time", ParamType::String, true),
            ],
        }
    }

    fn dispatcher_with(
        descriptor: ToolDescriptor,
        handler: Arc<dyn ToolHandler>,
        config: DispatchConfig,
    ) -> ToolDispatcher {
        let registry = ToolRegistryBuilder::new()
            .register(descriptor, handler)
            .unwrap()
            .build();
        ToolDispatcher::new(registry, config, CancellationToken::new())
    }

    fn call_payload(id: u64, name: &str, arguments: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "id": id,
            "params": { "name": name, "arguments": arguments }
        })
    }

    #[tokio::test]
    async fn tool_call_returns_exactly_one_result() {
        let dispatcher = dispatcher_with(
            calendar_descriptor(),
            Arc::new(CalendarTool),
            DispatchConfig::default(),
        );

        let payload = call_payload(
            7,
            "self.calendar.create_event",
            json!({"title": "Sync", "start_time": "2025-01-01T10:00:00"}),
        );
        let resp = dispatcher.dispatch(payload).await.unwrap();
        assert_eq!(resp.id, json!(7));
        assert!(resp.error.is_none());
        assert_eq!(resp.result.unwrap()["created"], "Sync");
    }

    #[tokio::test]
    async fn wrong_argument_type_yields_invalid_params() {
        let dispatcher = dispatcher_with(
            calendar_descriptor(),
            Arc::new(CalendarTool),
            DispatchConfig::default(),
        );

        let payload = call_payload(
            7,
            "self.calendar.create_event",
            json!({"title": "Sync", "start_time": 42}),
        );
        let resp = dispatcher.dispatch(payload).await.unwrap();
        assert_eq!(resp.id, json!(7));
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn unknown_tool_yields_method_not_found() {
        let dispatcher = dispatcher_with(
            calendar_descriptor(),
            Arc::new(CalendarTool),
            DispatchConfig::default(),
        );

        let payload = call_payload(1, "self.nonexistent", json!({}));
        let resp = dispatcher.dispatch(payload).await.unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn handler_error_is_redacted() {
        let dispatcher = dispatcher_with(
            ToolDescriptor {
                name: "failing".into(),
                description: String::new(),
                parameters: vec![],
            },
            Arc::new(FailingTool),
            DispatchConfig::default(),
        );

        let resp = dispatcher
            .dispatch(call_payload(2, "failing", json!({})))
            .await
            .unwrap();
        let error = resp.error.unwrap();
        assert_eq!(error.code, SERVER_ERROR);
        assert!(!error.message.contains("hunter2"), "leaked: {}", error.message);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_returns_timeout() {
        let dispatcher = dispatcher_with(
            ToolDescriptor {
                name: "slow".into(),
                description: String::new(),
                parameters: vec![],
            },
            Arc::new(SlowTool),
            DispatchConfig {
                call_timeout: Duration::from_secs(20),
                ..DispatchConfig::default()
            },
        );

        let resp = dispatcher
            .dispatch(call_payload(3, "slow", json!({})))
            .await
            .unwrap();
        let error = resp.error.unwrap();
        assert_eq!(error.code, SERVER_ERROR);
        assert_eq!(error.message, "Timeout");
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(dispatcher_with(
            ToolDescriptor {
                name: "counting".into(),
                description: String::new(),
                parameters: vec![],
            },
            Arc::new(CountingTool {
                active: Arc::clone(&active),
                peak: Arc::clone(&peak),
            }),
            DispatchConfig {
                max_concurrent: 2,
                ..DispatchConfig::default()
            },
        ));

        let mut handles = Vec::new();
        for i in 0..6 {
            let d = Arc::clone(&dispatcher);
            handles.push(tokio::spawn(async move {
                d.dispatch(call_payload(i, "counting", json!({}))).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().unwrap().error.is_none());
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn tools_list_paginates() {
        let mut builder = ToolRegistryBuilder::new();
        for i in 0..40 {
            builder = builder
                .register(
                    ToolDescriptor {
                        name: format!("tool.{i:02}"),
                        description: String::new(),
                        parameters: vec![],
                    },
                    Arc::new(CalendarTool),
                )
                .unwrap();
        }
        let dispatcher =
            ToolDispatcher::new(builder.build(), DispatchConfig::default(), CancellationToken::new());

        let resp = dispatcher
            .dispatch(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["tools"].as_array().unwrap().len(), 32);
        let cursor = result["nextCursor"].as_str().unwrap().to_string();

        let resp2 = dispatcher
            .dispatch(json!({
                "jsonrpc": "2.0", "id": 2, "method": "tools/list",
                "params": { "cursor": cursor }
            }))
            .await
            .unwrap();
        let result2 = resp2.result.unwrap();
        assert_eq!(result2["tools"].as_array().unwrap().len(), 8);
        assert!(result2.get("nextCursor").is_none());
    }

    #[tokio::test]
    async fn notification_gets_no_response() {
        let dispatcher = dispatcher_with(
            calendar_descriptor(),
            Arc::new(CalendarTool),
            DispatchConfig::default(),
        );
        let resp = dispatcher
            .dispatch(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_call() {
        let registry = ToolRegistryBuilder::new()
            .register(
                ToolDescriptor {
                    name: "slow".into(),
                    description: String::new(),
                    parameters: vec![],
                },
                Arc::new(SlowTool),
            )
            .unwrap()
            .build();
        let cancel = CancellationToken::new();
        let dispatcher = ToolDispatcher::new(registry, DispatchConfig::default(), cancel.clone());

        let task = tokio::spawn(async move {
            dispatcher.dispatch(call_payload(9, "slow", json!({}))).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let resp = task.await.unwrap().unwrap();
        assert_eq!(resp.id, json!(9));
        assert_eq!(resp.error.unwrap().code, SERVER_ERROR);
    }
}
