// Capability abstractions
//
// A capability is a named callable the host agent runtime can invoke: a
// JSON input schema, a description, and an async handler returning text.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConduitError, Result};

/// Input schema for a capability (JSON Schema object form)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityParameters {
    /// Type (always "object")
    #[serde(rename = "type")]
    pub param_type: String,
    /// Property definitions
    pub properties: BTreeMap<String, PropertySchema>,
    /// Required property names
    pub required: Vec<String>,
}

impl CapabilityParameters {
    pub fn new() -> Self {
        Self { param_type: "object".to_string(), properties: BTreeMap::new(), required: Vec::new() }
    }

    /// Add a property to the schema
    #[must_use]
    pub fn add_property(
        mut self,
        name: impl Into<String>,
        property_type: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        let name = name.into();
        self.properties.insert(name.clone(), PropertySchema::new(property_type, description));
        if required {
            self.required.push(name);
        }
        self
    }

    /// Add a property with a full schema (enums, array items)
    #[must_use]
    pub fn add_schema(mut self, name: impl Into<String>, schema: PropertySchema, required: bool) -> Self {
        let name = name.into();
        self.properties.insert(name.clone(), schema);
        if required {
            self.required.push(name);
        }
        self
    }

    /// Renders the schema as JSON
    pub fn to_schema(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Default for CapabilityParameters {
    fn default() -> Self {
        Self::new()
    }
}

/// Property schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub property_type: String,
    pub description: String,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
}

impl PropertySchema {
    pub fn new(property_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            property_type: property_type.into(),
            description: description.into(),
            allowed: None,
            items: None,
        }
    }

    #[must_use]
    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.allowed = Some(values.iter().map(|v| (*v).to_string()).collect());
        self
    }

    #[must_use]
    pub fn items(mut self, items: PropertySchema) -> Self {
        self.items = Some(Box::new(items));
        self
    }
}

/// Arguments passed to a capability handler
#[derive(Debug, Clone)]
pub struct CapabilityArguments {
    /// Parsed arguments as JSON value
    pub args: Value,
}

impl CapabilityArguments {
    pub fn new(args: Value) -> Self {
        Self { args }
    }

    /// Get argument as string
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.args.get(key)?.as_str().map(str::to_string)
    }

    /// Required string argument
    pub fn require_string(&self, key: &str) -> Result<String> {
        self.get_string(key)
            .ok_or_else(|| ConduitError::InvalidInput(format!("'{}' must be a string", key)))
    }

    /// Optional string array argument; `null` counts as absent
    pub fn get_string_array(&self, key: &str) -> Result<Option<Vec<String>>> {
        match self.args.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        ConduitError::InvalidInput(format!("'{}' must contain only strings", key))
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(_) => Err(ConduitError::InvalidInput(format!("'{}' must be an array", key))),
        }
    }
}

/// Handler for capability execution
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Execute the capability and return its textual output
    async fn execute(&self, args: &CapabilityArguments) -> Result<String>;
}

/// A named, schema-described callable exposed to the agent
#[derive(Clone)]
pub struct Capability {
    /// Name the agent calls the capability by; unique per provisioning call
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object
    pub input_schema: Value,
    pub handler: Arc<dyn CapabilityHandler>,
}

impl Capability {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Self {
        Self { name: name.into(), description: description.into(), input_schema, handler }
    }

    /// Execute this capability with raw JSON arguments
    pub async fn execute(&self, args: Value) -> Result<String> {
        self.handler.execute(&CapabilityArguments::new(args)).await
    }
}

// Arc<dyn CapabilityHandler> has no Debug
impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .field("handler", &"<handler>")
            .finish()
    }
}
