use std::collections::HashMap;

use serde_json::{Value, json};

use crate::error::{GatewayError, GatewayResult};
use crate::mcp::prompts::{Prompt, default_prompts};
use crate::mcp::resources;

/// Internal dispatch target for a registered tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Echo,
    CreateSession,
    DestroySession,
    SchemaVersion,
    SchemaModels,
    SchemaFields,
    DomainValidate,
    SearchRead,
    Read,
    Create,
    Write,
    Unlink,
    NameSearch,
    Picklists,
    NextSteps,
    ActionCall,
    LegacyExecuteKw,
    LegacyCallMethod,
    LegacySearchRead,
    LegacyRead,
    LegacyCreate,
    LegacyWrite,
    LegacyUnlink,
}

#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub kind: ToolKind,
}

/// Declarative catalog of tools, resource templates and prompts.
/// Registered once at startup and immutable afterwards; schemas are
/// structurally validated at registration.
pub struct Registry {
    tools: Vec<ToolDef>,
    by_name: HashMap<String, usize>,
    prompts: Vec<Prompt>,
}

impl Registry {
    pub fn builtin() -> GatewayResult<Self> {
        let tools = builtin_tools();

        let mut by_name = HashMap::new();
        for (idx, tool) in tools.iter().enumerate() {
            validate_registered_schema(&tool.input_schema).map_err(|e| {
                GatewayError::Config(format!("tool '{}' has an invalid inputSchema: {e}", tool.name))
            })?;
            if by_name.insert(tool.name.clone(), idx).is_some() {
                return Err(GatewayError::Config(format!(
                    "duplicate tool name: {}",
                    tool.name
                )));
            }
        }

        Ok(Self {
            tools,
            by_name,
            prompts: default_prompts(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&ToolDef> {
        self.by_name.get(name).map(|&idx| &self.tools[idx])
    }

    pub fn list_tools(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.input_schema
                })
            })
            .collect()
    }

    pub fn list_resource_templates(&self) -> Vec<Value> {
        resources::templates()
    }

    pub fn list_prompts(&self) -> &[Prompt] {
        &self.prompts
    }

    pub fn get_prompt(&self, name: &str) -> Option<&Prompt> {
        self.prompts.iter().find(|p| p.name == name)
    }
}

/// Structural check applied to every schema at registration: object root,
/// no combinators the clients choke on, and every required field declared
/// under `properties`.
pub fn validate_registered_schema(schema: &Value) -> Result<(), String> {
    fn walk(v: &Value) -> Result<(), String> {
        match v {
            Value::Object(map) => {
                for (k, vv) in map {
                    if matches!(k.as_str(), "anyOf" | "oneOf" | "allOf" | "$ref" | "definitions") {
                        return Err(format!("schema contains forbidden key '{k}'"));
                    }
                    if k == "type" && vv.is_array() {
                        return Err("schema contains a type array".to_string());
                    }
                    walk(vv)?;
                }
                Ok(())
            }
            Value::Array(arr) => arr.iter().try_for_each(walk),
            _ => Ok(()),
        }
    }

    let root = schema
        .as_object()
        .ok_or_else(|| "schema must be an object".to_string())?;
    if root.get("type").and_then(|t| t.as_str()) != Some("object") {
        return Err("schema root must have type 'object'".to_string());
    }

    let properties = root
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();
    if let Some(required) = root.get("required").and_then(|r| r.as_array()) {
        for req in required {
            let name = req
                .as_str()
                .ok_or_else(|| "required entries must be strings".to_string())?;
            if !properties.contains_key(name) {
                return Err(format!("required field '{name}' is not declared in properties"));
            }
        }
    }

    walk(schema)
}

/// Validate canonical arguments against a tool schema. Returns every
/// violation, not just the first.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    check_value(schema, arguments, "arguments", &mut errors);
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn check_value(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(schema_obj) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema_obj.get("type").and_then(|t| t.as_str()) {
        let matches = match expected {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            _ => true,
        };
        if !matches {
            errors.push(format!("{path}: expected {expected}"));
            return;
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(|e| e.as_array())
        && !allowed.contains(value)
    {
        errors.push(format!("{path}: value not in enum"));
    }

    if let Some(min) = schema_obj.get("minimum").and_then(|m| m.as_f64())
        && let Some(n) = value.as_f64()
        && n < min
    {
        errors.push(format!("{path}: below minimum {min}"));
    }

    if let Some(max) = schema_obj.get("maximum").and_then(|m| m.as_f64())
        && let Some(n) = value.as_f64()
        && n > max
    {
        errors.push(format!("{path}: above maximum {max}"));
    }

    if let (Some(props), Some(obj)) = (
        schema_obj.get("properties").and_then(|p| p.as_object()),
        value.as_object(),
    ) {
        if let Some(required) = schema_obj.get("required").and_then(|r| r.as_array()) {
            for req in required.iter().filter_map(|r| r.as_str()) {
                if !obj.contains_key(req) {
                    errors.push(format!("{path}: missing required field '{req}'"));
                }
            }
        }
        for (key, sub_schema) in props {
            if let Some(sub_value) = obj.get(key) {
                if sub_value.is_null() {
                    continue;
                }
                check_value(sub_schema, sub_value, &format!("{path}.{key}"), errors);
            }
        }
    }

    if let (Some(items), Some(arr)) = (schema_obj.get("items"), value.as_array()) {
        for (i, item) in arr.iter().enumerate() {
            check_value(items, item, &format!("{path}[{i}]"), errors);
        }
    }
}

fn obj_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

fn builtin_tools() -> Vec<ToolDef> {
    let model_prop = json!({"type": "string", "description": "Odoo model name, e.g. res.partner"});
    let session_prop = json!({"type": "string", "description": "Optional session id from create_session"});
    let operation_prop =
        json!({"type": "string", "description": "Idempotency token: replays return the first result"});
    let ids_prop = json!({"type": "array", "items": {"type": "integer"}, "description": "Record ids"});
    let domain_prop = json!({
        "description": "Search domain: raw prefix array, {and/or/not} object form, or a JSON string of either"
    });

    let mut tools = vec![
        ToolDef {
            name: "echo".to_string(),
            description: "Echo a message back, useful for connectivity checks".to_string(),
            input_schema: obj_schema(json!({"message": {"type": "string"}}), &["message"]),
            kind: ToolKind::Echo,
        },
        ToolDef {
            name: "create_session".to_string(),
            description: "Authenticate against Odoo and obtain a session id".to_string(),
            input_schema: obj_schema(
                json!({
                    "username": {"type": "string"},
                    "api_key": {"type": "string"}
                }),
                &["username", "api_key"],
            ),
            kind: ToolKind::CreateSession,
        },
        ToolDef {
            name: "destroy_session".to_string(),
            description: "Invalidate a session id".to_string(),
            input_schema: obj_schema(json!({"session_id": {"type": "string"}}), &["session_id"]),
            kind: ToolKind::DestroySession,
        },
        ToolDef {
            name: "odoo.schema.version".to_string(),
            description: "Opaque fingerprint of the Odoo data dictionary, bumped on schema changes"
                .to_string(),
            input_schema: obj_schema(json!({"session_id": session_prop.clone()}), &[]),
            kind: ToolKind::SchemaVersion,
        },
        ToolDef {
            name: "odoo.schema.models".to_string(),
            description: "List model names, optionally restricted to models with access rules"
                .to_string(),
            input_schema: obj_schema(
                json!({
                    "with_access": {"type": "boolean"},
                    "session_id": session_prop.clone()
                }),
                &[],
            ),
            kind: ToolKind::SchemaModels,
        },
        ToolDef {
            name: "odoo.schema.fields".to_string(),
            description: "Field definitions for a model".to_string(),
            input_schema: obj_schema(
                json!({"model": model_prop.clone(), "session_id": session_prop.clone()}),
                &["model"],
            ),
            kind: ToolKind::SchemaFields,
        },
        ToolDef {
            name: "odoo.domain.validate".to_string(),
            description: "Validate and compile a domain expression without executing it".to_string(),
            input_schema: obj_schema(
                json!({
                    "model": model_prop.clone(),
                    "domain_json": domain_prop.clone(),
                    "session_id": session_prop.clone()
                }),
                &["model"],
            ),
            kind: ToolKind::DomainValidate,
        },
        ToolDef {
            name: "odoo.search_read".to_string(),
            description: "Search records and read fields in one call".to_string(),
            input_schema: obj_schema(
                json!({
                    "model": model_prop.clone(),
                    "domain_json": domain_prop.clone(),
                    "fields": {"type": "array", "items": {"type": "string"}},
                    "limit": {"type": "integer", "minimum": 1, "maximum": 200},
                    "offset": {"type": "integer", "minimum": 0},
                    "order": {"type": "string"},
                    "session_id": session_prop.clone()
                }),
                &["model"],
            ),
            kind: ToolKind::SearchRead,
        },
        ToolDef {
            name: "odoo.read".to_string(),
            description: "Read fields from records by id".to_string(),
            input_schema: obj_schema(
                json!({
                    "model": model_prop.clone(),
                    "record_ids": ids_prop.clone(),
                    "fields": {"type": "array", "items": {"type": "string"}},
                    "session_id": session_prop.clone()
                }),
                &["model", "record_ids"],
            ),
            kind: ToolKind::Read,
        },
        ToolDef {
            name: "odoo.create".to_string(),
            description: "Create one record".to_string(),
            input_schema: obj_schema(
                json!({
                    "model": model_prop.clone(),
                    "values": {"type": "object"},
                    "operation_id": operation_prop.clone(),
                    "session_id": session_prop.clone()
                }),
                &["model", "values"],
            ),
            kind: ToolKind::Create,
        },
        ToolDef {
            name: "odoo.write".to_string(),
            description: "Update records by id".to_string(),
            input_schema: obj_schema(
                json!({
                    "model": model_prop.clone(),
                    "record_ids": ids_prop.clone(),
                    "values": {"type": "object"},
                    "operation_id": operation_prop.clone(),
                    "session_id": session_prop.clone()
                }),
                &["model", "record_ids", "values"],
            ),
            kind: ToolKind::Write,
        },
        ToolDef {
            name: "odoo.unlink".to_string(),
            description: "Delete records by id".to_string(),
            input_schema: obj_schema(
                json!({
                    "model": model_prop.clone(),
                    "record_ids": ids_prop.clone(),
                    "operation_id": operation_prop.clone(),
                    "session_id": session_prop.clone()
                }),
                &["model", "record_ids"],
            ),
            kind: ToolKind::Unlink,
        },
        ToolDef {
            name: "odoo.name_search".to_string(),
            description: "Autocomplete-style search on display names".to_string(),
            input_schema: obj_schema(
                json!({
                    "model": model_prop.clone(),
                    "name": {"type": "string"},
                    "operator": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1},
                    "session_id": session_prop.clone()
                }),
                &["model", "name"],
            ),
            kind: ToolKind::NameSearch,
        },
        ToolDef {
            name: "odoo.picklists".to_string(),
            description: "Possible values for a selection or many2one field".to_string(),
            input_schema: obj_schema(
                json!({
                    "model": model_prop.clone(),
                    "field": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1},
                    "session_id": session_prop.clone()
                }),
                &["model", "field"],
            ),
            kind: ToolKind::Picklists,
        },
        ToolDef {
            name: "odoo.actions.next_steps".to_string(),
            description: "Current state of a record and the workflow actions available from it"
                .to_string(),
            input_schema: obj_schema(
                json!({
                    "model": model_prop.clone(),
                    "record_id": {"type": "integer"},
                    "session_id": session_prop.clone()
                }),
                &["model", "record_id"],
            ),
            kind: ToolKind::NextSteps,
        },
        ToolDef {
            name: "odoo.actions.call".to_string(),
            description: "Invoke a workflow action method on a record".to_string(),
            input_schema: obj_schema(
                json!({
                    "model": model_prop.clone(),
                    "record_id": {"type": "integer"},
                    "method": {"type": "string"},
                    "parameters": {"type": "object"},
                    "operation_id": operation_prop.clone(),
                    "session_id": session_prop.clone()
                }),
                &["model", "record_id", "method"],
            ),
            kind: ToolKind::ActionCall,
        },
    ];

    // Legacy passthrough tools: argument shapes are reconciled by the
    // normalizer, so their schemas stay permissive.
    let legacy = [
        (
            "odoo_execute_kw",
            "Low-level execute_kw passthrough with positional args and kwargs",
            ToolKind::LegacyExecuteKw,
            vec!["model", "method"],
        ),
        (
            "odoo_call_method",
            "Call an arbitrary model method on specific records",
            ToolKind::LegacyCallMethod,
            vec!["model", "method"],
        ),
        (
            "odoo_search_read",
            "Legacy search_read with positional args",
            ToolKind::LegacySearchRead,
            vec!["model"],
        ),
        ("odoo_read", "Legacy read with positional args", ToolKind::LegacyRead, vec!["model"]),
        ("odoo_create", "Legacy create", ToolKind::LegacyCreate, vec!["model"]),
        ("odoo_write", "Legacy write", ToolKind::LegacyWrite, vec!["model"]),
        ("odoo_unlink", "Legacy unlink", ToolKind::LegacyUnlink, vec!["model"]),
    ];

    for (name, description, kind, required) in legacy {
        tools.push(ToolDef {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: obj_schema(
                json!({
                    "model": model_prop.clone(),
                    "method": {"type": "string"},
                    "args": {"type": "array"},
                    "kwargs": {"type": "object"},
                    "values": {"type": "object"},
                    "record_ids": ids_prop.clone(),
                    "parameters": {"type": "object"},
                    "operation_id": operation_prop.clone(),
                    "session_id": session_prop.clone()
                }),
                &required,
            ),
            kind,
        });
    }

    tools
}
