//! Tool registry with typed parameter schemas.
//!
//! Tools are registered once at startup through the builder and the table is
//! frozen afterwards; dispatch reads it concurrently without locking.
//! Argument validation (type, required, numeric range) happens before a
//! handler ever runs, so handlers can assume well-typed input.

pub mod dispatch;
pub mod jsonrpc;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AttuneError, Result};

pub use dispatch::{DispatchConfig, ToolDispatcher};

/// Accepted parameter value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
}

/// One declared parameter of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub required: bool,
    /// Inclusive numeric bounds, meaningful for Integer/Number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ParamSpec {
    pub fn new(name: &str, param_type: ParamType, required: bool) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            required,
            min: None,
            max: None,
            description: String::new(),
        }
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// Serializable descriptor returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParamSpec>,
}

/// A cancellable tool implementation.
///
/// Handlers run under the dispatcher's deadline and cancellation signal;
/// long operations should be composed of awaits so cancellation can land.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Map<String, Value>) -> anyhow::Result<Value>;
}

pub(crate) struct Tool {
    pub descriptor: ToolDescriptor,
    pub handler: Arc<dyn ToolHandler>,
}

/// Write-once tool table. Built at startup, immutable afterwards.
pub struct ToolRegistry {
    tools: BTreeMap<String, Tool>,
}

pub struct ToolRegistryBuilder {
    tools: BTreeMap<String, Tool>,
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool. Names are globally unique.
    ///
    /// # Errors
    /// `AttuneError::Tool` on a duplicate name.
    pub fn register(
        mut self,
        descriptor: ToolDescriptor,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<Self> {
        if self.tools.contains_key(&descriptor.name) {
            return Err(AttuneError::Tool(format!(
                "duplicate tool name: {}",
                descriptor.name
            )));
        }
        self.tools.insert(
            descriptor.name.clone(),
            Tool {
                descriptor,
                handler,
            },
        );
        Ok(self)
    }

    pub fn build(self) -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry { tools: self.tools })
    }
}

impl Default for ToolRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Maximum page size for `tools/list`.
pub const MAX_PAGE_SIZE: usize = 32;

impl ToolRegistry {
    pub(crate) fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// One page of descriptors starting at `cursor` (an opaque offset).
    ///
    /// Returns the page and the cursor for the next one, if more remain.
    pub fn page(&self, cursor: Option<&str>, page_size: usize) -> (Vec<ToolDescriptor>, Option<String>) {
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);

        let page: Vec<ToolDescriptor> = self
            .tools
            .values()
            .skip(offset)
            .take(page_size)
            .map(|t| t.descriptor.clone())
            .collect();

        let next = if offset + page.len() < self.tools.len() {
            Some((offset + page.len()).to_string())
        } else {
            None
        };
        (page, next)
    }
}

/// Validate call arguments against a descriptor.
///
/// Checks required presence, value type, and numeric bounds. Unknown
/// argument names are rejected so typos surface as errors instead of being
/// silently ignored.
pub fn validate_arguments(
    descriptor: &ToolDescriptor,
    arguments: &Value,
) -> std::result::Result<Map<String, Value>, String> {
    let args = match arguments {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => return Err(format!("arguments must be an object, got {other}")),
    };

    for spec in &descriptor.parameters {
        match args.get(&spec.name) {
            None => {
                if spec.required {
                    return Err(format!("missing required parameter '{}'", spec.name));
                }
            }
            Some(value) => {
                let ok = match spec.param_type {
                    ParamType::String => value.is_string(),
                    ParamType::Boolean => value.is_boolean(),
                    ParamType::Integer => value.is_i64() || value.is_u64(),
                    ParamType::Number => value.is_number(),
                };
                if !ok {
                    return Err(format!(
                        "parameter '{}' has wrong type, expected {:?}",
                        spec.name, spec.param_type
                    ));
                }
                if matches!(spec.param_type, ParamType::Integer | ParamType::Number) {
                    if let Some(n) = value.as_f64() {
                        if let Some(min) = spec.min {
                            if n < min {
                                return Err(format!(
                                    "parameter '{}' below minimum {min}",
                                    spec.name
                                ));
                            }
                        }
                        if let Some(max) = spec.max {
                            if n > max {
                                return Err(format!(
                                    "parameter '{}' above maximum {max}",
                                    spec.name
                                ));
                            }
                        }
                    }
                }
            }
        }
    }

    for name in args.keys() {
        if !descriptor.parameters.iter().any(|p| &p.name == name) {
            return Err(format!("unknown parameter '{name}'"));
        }
    }

    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        async fn call(&self, arguments: Map<String, Value>) -> anyhow::Result<Value> {
            Ok(Value::Object(arguments))
        }
    }

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: "test tool".into(),
            parameters: vec![
                ParamSpec::new("title", ParamType::String, true),
                ParamSpec::new("count", ParamType::Integer, false).with_range(1.0, 10.0),
            ],
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = ToolRegistryBuilder::new()
            .register(descriptor("a"), Arc::new(EchoTool))
            .unwrap()
            .register(descriptor("a"), Arc::new(EchoTool));
        assert!(result.is_err());
    }

    #[test]
    fn pagination_walks_all_tools() {
        let mut builder = ToolRegistryBuilder::new();
        for i in 0..70 {
            builder = builder
                .register(descriptor(&format!("tool.{i:03}")), Arc::new(EchoTool))
                .unwrap();
        }
        let registry = builder.build();

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let (page, next) = registry.page(cursor.as_deref(), 32);
            assert!(page.len() <= MAX_PAGE_SIZE);
            seen.extend(page.into_iter().map(|d| d.name));
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        assert_eq!(seen.len(), 70);
    }

    #[test]
    fn page_size_is_capped() {
        let registry = ToolRegistryBuilder::new()
            .register(descriptor("a"), Arc::new(EchoTool))
            .unwrap()
            .build();
        let (page, _) = registry.page(None, 1_000);
        assert!(page.len() <= MAX_PAGE_SIZE);
    }

    #[test]
    fn missing_required_parameter_fails_validation() {
        let err = validate_arguments(&descriptor("t"), &json!({})).unwrap_err();
        assert!(err.contains("title"));
    }

    #[test]
    fn wrong_type_fails_validation() {
        let err = validate_arguments(&descriptor("t"), &json!({"title": 42})).unwrap_err();
        assert!(err.contains("wrong type"));
    }

    #[test]
    fn out_of_range_fails_validation() {
        let err =
            validate_arguments(&descriptor("t"), &json!({"title": "x", "count": 99})).unwrap_err();
        assert!(err.contains("maximum"));
    }

    #[test]
    fn unknown_parameter_fails_validation() {
        let err =
            validate_arguments(&descriptor("t"), &json!({"title": "x", "bogus": 1})).unwrap_err();
        assert!(err.contains("unknown"));
    }

    #[test]
    fn valid_arguments_pass() {
        let args =
            validate_arguments(&descriptor("t"), &json!({"title": "x", "count": 5})).unwrap();
        assert_eq!(args.get("count"), Some(&json!(5)));
    }
}
