//! Capabilities: the actions the planner may choose between.
//!
//! A [`CapabilityProvider`] lists what it offers and invokes it by name.
//! At session start the loop takes one [`CapabilityRegistry`] snapshot from
//! the provider; the snapshot never changes afterwards.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{DispatchError, RegistryError};

/// Nested `$ref` chains deeper than this are treated as opaque objects.
const MAX_SCHEMA_DEPTH: usize = 4;

/// The declared type of a capability parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Integer,
    Number,
    String,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    /// Map a JSON-Schema type name. Unknown or missing types read as string.
    pub fn from_schema_name(name: &str) -> Self {
        match name {
            "integer" => ParamType::Integer,
            "number" => ParamType::Number,
            "boolean" => ParamType::Boolean,
            "array" => ParamType::Array,
            "object" => ParamType::Object,
            _ => ParamType::String,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::String => "string",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

/// An integral float as `i64`, or `None` when it has a fraction or lies
/// outside the `i64` range. A plain `as` cast would saturate instead.
pub fn integral_f64_to_i64(f: f64) -> Option<i64> {
    const LOWER: f64 = -9_223_372_036_854_775_808.0;
    const UPPER: f64 = 9_223_372_036_854_775_808.0;
    (f.fract() == 0.0 && (LOWER..UPPER).contains(&f)).then_some(f as i64)
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared parameter of a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,

    #[serde(rename = "type")]
    pub param_type: ParamType,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Nested fields when this parameter wraps a model (`$ref` into `$defs`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<ParamSpec>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            default: None,
            description: None,
            fields: Vec::new(),
        }
    }

    /// Mark the parameter optional with the given default.
    pub fn with_default(mut self, default: Value) -> Self {
        self.required = false;
        self.default = Some(default);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether this parameter wraps a nested model.
    pub fn is_wrapper(&self) -> bool {
        !self.fields.is_empty()
    }

    fn shape(&self) -> String {
        if self.is_wrapper() {
            let inner: Vec<String> = self.fields.iter().map(ParamSpec::shape).collect();
            format!("{}: {{{}}}", self.name, inner.join(", "))
        } else if self.required {
            format!("{}: {}", self.name, self.param_type)
        } else {
            format!("{}?: {}", self.name, self.param_type)
        }
    }
}

/// An action the planner can request, with its ordered parameter list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Parameters in declaration order.
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
}

impl CapabilityDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ParamSpec>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Build a descriptor from a JSON-Schema `inputSchema` object.
    ///
    /// Property order is preserved. Properties that reference a nested model
    /// become wrapper parameters whose fields are parsed recursively.
    pub fn from_json_schema(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: &Value,
    ) -> Self {
        let defs = schema.get("$defs").or_else(|| schema.get("definitions"));
        Self {
            name: name.into(),
            description: description.into(),
            parameters: parse_properties(schema, defs, 0),
        }
    }

    /// Look up a declared parameter by name.
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Render as `name(a: integer, b?: string)`.
    pub fn signature(&self) -> String {
        let params: Vec<String> = self.parameters.iter().map(ParamSpec::shape).collect();
        format!("{}({})", self.name, params.join(", "))
    }
}

fn parse_properties(schema: &Value, defs: Option<&Value>, depth: usize) -> Vec<ParamSpec> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    properties
        .iter()
        .map(|(name, prop)| parse_param(name, prop, required.contains(&name.as_str()), defs, depth))
        .collect()
}

fn parse_param(
    name: &str,
    prop: &Value,
    required: bool,
    defs: Option<&Value>,
    depth: usize,
) -> ParamSpec {
    let resolved = resolve_ref(prop, defs);
    let fields = if depth < MAX_SCHEMA_DEPTH {
        parse_properties(resolved, defs, depth + 1)
    } else {
        Vec::new()
    };
    let param_type = if fields.is_empty() {
        schema_type(resolved)
    } else {
        ParamType::Object
    };
    let default = prop.get("default").or_else(|| resolved.get("default")).cloned();
    let description = prop
        .get("description")
        .or_else(|| resolved.get("description"))
        .and_then(Value::as_str)
        .map(String::from);

    ParamSpec {
        name: name.to_string(),
        param_type,
        required: required && default.is_none(),
        default,
        description,
        fields,
    }
}

fn resolve_ref<'a>(prop: &'a Value, defs: Option<&'a Value>) -> &'a Value {
    let reference = prop.get("$ref").and_then(Value::as_str).or_else(|| {
        prop.get("allOf")
            .and_then(Value::as_array)
            .and_then(|all| all.first())
            .and_then(|first| first.get("$ref"))
            .and_then(Value::as_str)
    });
    match (reference, defs) {
        (Some(reference), Some(defs)) => reference
            .rsplit('/')
            .next()
            .and_then(|key| defs.get(key))
            .unwrap_or(prop),
        _ => prop,
    }
}

fn schema_type(schema: &Value) -> ParamType {
    match schema.get("type") {
        Some(Value::String(name)) => ParamType::from_schema_name(name),
        Some(Value::Array(names)) => names
            .iter()
            .filter_map(Value::as_str)
            .find(|n| *n != "null")
            .map(ParamType::from_schema_name)
            .unwrap_or(ParamType::String),
        _ => schema
            .get("anyOf")
            .or_else(|| schema.get("oneOf"))
            .and_then(Value::as_array)
            .and_then(|variants| {
                variants.iter().find(|v| {
                    v.get("type").and_then(Value::as_str).is_some_and(|t| t != "null")
                })
            })
            .map(schema_type)
            .unwrap_or(ParamType::String),
    }
}

/// Normalized output of one capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ToolOutput {
    Text(String),
    List(Vec<String>),
    Structured(Map<String, Value>),
}

impl fmt::Display for ToolOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolOutput::Text(text) => f.write_str(text),
            ToolOutput::List(items) if items.len() == 1 => f.write_str(&items[0]),
            ToolOutput::List(items) => write!(f, "[{}]", items.join(", ")),
            ToolOutput::Structured(map) => write!(f, "{}", Value::Object(map.clone())),
        }
    }
}

/// The outcome of a dispatched action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub tool_name: String,

    /// Arguments after coercion.
    pub arguments: Map<String, Value>,

    pub result: ToolOutput,

    /// The untouched response, kept for diagnostics.
    #[serde(default)]
    pub raw_response: Value,
}

/// Something that can list and invoke capabilities.
///
/// Implementations: stdio RPC servers (pooled), the in-process built-in set,
/// scripted stubs in tests.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// A human-readable name for logs (e.g., "math-server").
    fn name(&self) -> &str;

    async fn list_capabilities(&self) -> std::result::Result<Vec<CapabilityDescriptor>, DispatchError>;

    /// Invoke a capability and return its raw response.
    async fn invoke(
        &self,
        name: &str,
        args: Map<String, Value>,
    ) -> std::result::Result<Value, DispatchError>;
}

/// An immutable snapshot of capabilities, indexed by name.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: Vec<CapabilityDescriptor>,
    index: HashMap<String, usize>,
}

impl CapabilityRegistry {
    /// Build a snapshot, rejecting duplicate names.
    pub fn from_descriptors(
        descriptors: Vec<CapabilityDescriptor>,
    ) -> std::result::Result<Self, RegistryError> {
        let mut index = HashMap::with_capacity(descriptors.len());
        for (position, descriptor) in descriptors.iter().enumerate() {
            if index.insert(descriptor.name.clone(), position).is_some() {
                return Err(RegistryError::DuplicateName(descriptor.name.clone()));
            }
        }
        Ok(Self {
            capabilities: descriptors,
            index,
        })
    }

    /// Fetch a snapshot from a provider. Any failure leaves no registry.
    pub async fn fetch(
        provider: &dyn CapabilityProvider,
    ) -> std::result::Result<Self, RegistryError> {
        let descriptors =
            provider
                .list_capabilities()
                .await
                .map_err(|e| RegistryError::FetchFailed {
                    provider: provider.name().to_string(),
                    reason: e.to_string(),
                })?;
        let registry = Self::from_descriptors(descriptors)?;
        info!(
            provider = provider.name(),
            count = registry.len(),
            "Capability registry fetched"
        );
        debug!(names = ?registry.names(), "Available capabilities");
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityDescriptor> {
        self.index.get(name).map(|&i| &self.capabilities[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Capability names in listing order.
    pub fn names(&self) -> Vec<&str> {
        self.capabilities.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CapabilityDescriptor> {
        self.capabilities.iter()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// One line per capability: `- signature: description`.
    pub fn catalogue(&self) -> String {
        self.capabilities
            .iter()
            .map(|c| {
                if c.description.is_empty() {
                    format!("- {}", c.signature())
                } else {
                    format!("- {}: {}", c.signature(), c.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integral_floats_convert_only_in_range() {
        assert_eq!(integral_f64_to_i64(42.0), Some(42));
        assert_eq!(integral_f64_to_i64(-9_223_372_036_854_775_808.0), Some(i64::MIN));
        assert_eq!(integral_f64_to_i64(2.5), None);
        assert_eq!(integral_f64_to_i64(1e20), None);
        assert_eq!(integral_f64_to_i64(9_223_372_036_854_775_808.0), None);
        assert_eq!(integral_f64_to_i64(f64::NAN), None);
        assert_eq!(integral_f64_to_i64(f64::INFINITY), None);
    }

    struct StaticProvider {
        descriptors: Vec<CapabilityDescriptor>,
        fail: bool,
    }

    #[async_trait]
    impl CapabilityProvider for StaticProvider {
        fn name(&self) -> &str {
            "static"
        }

        async fn list_capabilities(
            &self,
        ) -> std::result::Result<Vec<CapabilityDescriptor>, DispatchError> {
            if self.fail {
                return Err(DispatchError::Transport("server exited".into()));
            }
            Ok(self.descriptors.clone())
        }

        async fn invoke(
            &self,
            name: &str,
            _args: Map<String, Value>,
        ) -> std::result::Result<Value, DispatchError> {
            Err(DispatchError::NotFound(name.into()))
        }
    }

    fn add_descriptor() -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "add",
            "Add two numbers",
            vec![
                ParamSpec::new("a", ParamType::Integer),
                ParamSpec::new("b", ParamType::Integer),
            ],
        )
    }

    #[test]
    fn schema_preserves_declaration_order() {
        let schema = json!({
            "type": "object",
            "properties": {
                "zeta": { "type": "integer" },
                "alpha": { "type": "string" },
                "mid": { "type": "number", "default": 1.5 }
            },
            "required": ["zeta", "alpha"]
        });
        let d = CapabilityDescriptor::from_json_schema("t", "", &schema);
        let names: Vec<&str> = d.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(d.parameters[0].param_type, ParamType::Integer);
        assert!(d.parameters[1].required);
        assert!(!d.parameters[2].required);
        assert_eq!(d.parameters[2].default, Some(json!(1.5)));
    }

    #[test]
    fn schema_resolves_wrapper_models() {
        let schema = json!({
            "$defs": {
                "AddInput": {
                    "type": "object",
                    "properties": {
                        "a": { "type": "integer" },
                        "b": { "type": "integer" }
                    },
                    "required": ["a", "b"]
                }
            },
            "properties": {
                "input": { "$ref": "#/$defs/AddInput" }
            },
            "required": ["input"]
        });
        let d = CapabilityDescriptor::from_json_schema("add", "", &schema);
        assert_eq!(d.parameters.len(), 1);
        let wrapper = &d.parameters[0];
        assert!(wrapper.is_wrapper());
        assert_eq!(wrapper.param_type, ParamType::Object);
        assert_eq!(wrapper.fields.len(), 2);
        assert_eq!(d.signature(), "add(input: {a: integer, b: integer})");
    }

    #[test]
    fn schema_reads_nullable_and_any_of_types() {
        let schema = json!({
            "properties": {
                "n": { "type": ["null", "integer"] },
                "flag": { "anyOf": [{ "type": "null" }, { "type": "boolean" }] },
                "free": {}
            }
        });
        let d = CapabilityDescriptor::from_json_schema("t", "", &schema);
        assert_eq!(d.parameters[0].param_type, ParamType::Integer);
        assert_eq!(d.parameters[1].param_type, ParamType::Boolean);
        assert_eq!(d.parameters[2].param_type, ParamType::String);
    }

    #[test]
    fn empty_schema_has_no_parameters() {
        let d = CapabilityDescriptor::from_json_schema("ping", "", &json!({}));
        assert!(d.parameters.is_empty());
        assert_eq!(d.signature(), "ping()");
    }

    #[test]
    fn registry_rejects_duplicates() {
        let err = CapabilityRegistry::from_descriptors(vec![add_descriptor(), add_descriptor()])
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(ref n) if n == "add"));
    }

    #[test]
    fn registry_lookup_and_catalogue() {
        let registry = CapabilityRegistry::from_descriptors(vec![
            add_descriptor(),
            CapabilityDescriptor::new("sqrt", "", vec![ParamSpec::new("a", ParamType::Number)]),
        ])
        .unwrap();
        assert!(registry.contains("add"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["add", "sqrt"]);
        let catalogue = registry.catalogue();
        assert!(catalogue.contains("- add(a: integer, b: integer): Add two numbers"));
        assert!(catalogue.contains("- sqrt(a: number)"));
    }

    #[tokio::test]
    async fn fetch_failure_is_fatal() {
        let provider = StaticProvider {
            descriptors: vec![],
            fail: true,
        };
        let err = CapabilityRegistry::fetch(&provider).await.unwrap_err();
        assert!(matches!(err, RegistryError::FetchFailed { .. }));
    }

    #[tokio::test]
    async fn fetch_builds_snapshot() {
        let provider = StaticProvider {
            descriptors: vec![add_descriptor()],
            fail: false,
        };
        let registry = CapabilityRegistry::fetch(&provider).await.unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn tool_output_display() {
        assert_eq!(ToolOutput::Text("hi".into()).to_string(), "hi");
        assert_eq!(ToolOutput::List(vec!["5".into()]).to_string(), "5");
        assert_eq!(
            ToolOutput::List(vec!["1".into(), "2".into()]).to_string(),
            "[1, 2]"
        );
        let mut map = Map::new();
        map.insert("sum".into(), json!(5));
        assert_eq!(ToolOutput::Structured(map).to_string(), r#"{"sum":5}"#);
    }
}
