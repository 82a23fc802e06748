//! Object definitions: parsing under budgets, validation and stamping.

use serde_json::{Map, Value as Json};
use ufleet_core::meta::validate_name;
use ufleet_core::{Error, Kind, Result, APP_LABEL, PROVENANCE_ANNOTATION, PROVENANCE_VALUE};

/// Budgets applied before a definition is accepted.
#[derive(Debug, Clone, Copy)]
pub struct DefinitionLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for DefinitionLimits {
    fn default() -> Self {
        Self { max_bytes: 1_000_000, max_nodes: 100_000 }
    }
}

impl DefinitionLimits {
    pub fn from_config(c: &ufleet_core::config::Config) -> Self {
        Self { max_bytes: c.max_definition_bytes, ..Self::default() }
    }
}

/// A validated definition for one object of a known kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub kind: Kind,
    pub name: String,
    pub body: Json,
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse a YAML or JSON definition and check it declares an object of `expected`.
pub fn parse_definition(raw: &str, expected: Kind, limits: &DefinitionLimits) -> Result<Definition> {
    if raw.len() > limits.max_bytes {
        return Err(Error::invalid(format!("definition too large (>{} bytes)", limits.max_bytes)));
    }
    // YAML is a superset of JSON
    let val: serde_yaml::Value = serde_yaml::from_str(raw).map_err(|e| Error::invalid(format!("parsing definition: {}", e)))?;
    let body = serde_json::to_value(val).map_err(|e| Error::invalid(format!("converting definition: {}", e)))?;
    if !body.is_object() {
        return Err(Error::invalid("definition must be a mapping"));
    }
    if json_node_budget_exceeded(&body, limits.max_nodes) {
        return Err(Error::invalid(format!("definition too complex (>{} nodes)", limits.max_nodes)));
    }
    let api_version = body.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| Error::invalid("definition missing apiVersion"))?;
    let kind_s = body.get("kind").and_then(|v| v.as_str()).ok_or_else(|| Error::invalid("definition missing kind"))?;
    let kind: Kind = kind_s.parse()?;
    if kind != expected {
        return Err(Error::invalid(format!("kind mismatch: definition is {}, expected {}", kind, expected)));
    }
    let want = expected.api().api_version();
    if api_version != want {
        return Err(Error::invalid(format!("apiVersion {} does not serve {} (want {})", api_version, expected, want)));
    }
    let name = body
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::invalid("definition missing metadata.name"))?
        .to_string();
    validate_name(&name)?;
    Ok(Definition { kind, name, body })
}

/// Drop server-populated fields.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

fn sub_map<'a>(meta: &'a mut Map<String, Json>, key: &str) -> Option<&'a mut Map<String, Json>> {
    let entry = meta.entry(key.to_string()).or_insert_with(|| Json::Object(Map::new()));
    if !entry.is_object() {
        *entry = Json::Object(Map::new());
    }
    entry.as_object_mut()
}

impl Definition {
    /// The object as written to the cluster: namespace forced, provenance
    /// stamped, application label set when `app` is non-empty.
    pub fn prepare(&self, namespace: &str, app: &str) -> Json {
        let mut body = strip_noisy(self.body.clone());
        if let Some(meta) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("namespace".into(), Json::String(namespace.to_string()));
            if let Some(ann) = sub_map(meta, "annotations") {
                ann.insert(PROVENANCE_ANNOTATION.into(), Json::String(PROVENANCE_VALUE.into()));
            }
            if !app.is_empty() {
                if let Some(labels) = sub_map(meta, "labels") {
                    labels.insert(APP_LABEL.into(), Json::String(app.to_string()));
                }
            }
        }
        body
    }
}
