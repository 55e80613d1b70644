use serde_json::{Map, Value, json};

use crate::domain::{self, DomainContext};
use crate::error::{GatewayError, GatewayResult, ValidationKind};

/// Aggregates accepted in `read_group` field specs (`"amount_total:sum"`).
pub const VALID_AGGREGATES: &[&str] = &[
    "sum",
    "avg",
    "min",
    "max",
    "count",
    "count_distinct",
    "array_agg",
    "bool_and",
    "bool_or",
];

/// Date granularities accepted in `read_group` groupby specs
/// (`"create_date:month"`); not valid as field aggregates.
pub const VALID_GRANULARITIES: &[&str] = &["day", "week", "month", "quarter", "year"];

/// A canonical `execute_kw` invocation after normalization.
#[derive(Debug, Clone)]
pub struct ExtractedCall {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub warnings: Vec<String>,
}

/// Rewrite any accepted tool-call envelope into the canonical
/// `{"arguments": {…}}` form.
///
/// Tolerated legacy shapes: arguments spread at the params top level, and
/// `args`/`kwargs` channels inside arguments (those are reconciled later,
/// per method, by `extract_call`).
pub fn canonical_arguments(params: &Value) -> (Map<String, Value>, Vec<String>) {
    let mut warnings = Vec::new();

    let Some(obj) = params.as_object() else {
        return (Map::new(), warnings);
    };

    if let Some(Value::Object(arguments)) = obj.get("arguments") {
        return (arguments.clone(), warnings);
    }

    // Legacy: arguments at the top level of params.
    let mut arguments = Map::new();
    for (k, v) in obj {
        if k == "name" || k == "arguments" {
            continue;
        }
        arguments.insert(k.clone(), v.clone());
    }
    if !arguments.is_empty() {
        warnings.push("arguments supplied at params top level; normalized".to_string());
    }
    (arguments, warnings)
}

fn positional(arguments: &Map<String, Value>) -> Vec<Value> {
    arguments
        .get("args")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

fn named(arguments: &Map<String, Value>) -> Map<String, Value> {
    arguments
        .get("kwargs")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default()
}

/// Coerce an id value: a single integer or a list of integers.
pub fn coerce_ids(value: &Value) -> GatewayResult<Vec<i64>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(|i| vec![i])
            .ok_or_else(|| GatewayError::InvalidParams("record id must be an integer".to_string())),
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_i64().ok_or_else(|| {
                    GatewayError::InvalidParams(format!("record id must be an integer, got {v}"))
                })
            })
            .collect(),
        other => Err(GatewayError::InvalidParams(format!(
            "record ids must be an integer or a list of integers, got {other}"
        ))),
    }
}

/// Check `read_group` field specs for invalid aggregation functions.
fn validate_aggregates(fields: &[Value]) -> GatewayResult<()> {
    for field in fields {
        let Some(spec) = field.as_str() else { continue };
        if let Some((_, agg)) = spec.split_once(':')
            && !VALID_AGGREGATES.contains(&agg)
        {
            return Err(GatewayError::validation(
                ValidationKind::Aggregation,
                format!(
                    "invalid aggregation function '{agg}' in field spec '{spec}' (allowed: {})",
                    VALID_AGGREGATES.join(", ")
                ),
            ));
        }
    }
    Ok(())
}

fn validate_groupby(groupby: &[Value]) -> GatewayResult<()> {
    for spec in groupby {
        let Some(spec) = spec.as_str() else { continue };
        if let Some((_, granularity)) = spec.split_once(':')
            && !VALID_GRANULARITIES.contains(&granularity)
        {
            return Err(GatewayError::validation(
                ValidationKind::Aggregation,
                format!("invalid date granularity '{granularity}' in groupby spec '{spec}'"),
            ));
        }
    }
    Ok(())
}

/// Apply the method-specific extraction rules that reconcile the
/// overlapping positional/named channels of the Odoo ORM entry points into
/// one canonical call.
pub fn extract_call(
    method: &str,
    arguments: &Map<String, Value>,
    ctx: &DomainContext,
    max_payload_size: usize,
) -> GatewayResult<ExtractedCall> {
    match method {
        "create" => extract_create(arguments),
        "read" => extract_read(arguments),
        "search" | "search_read" | "search_count" => {
            extract_search(method, arguments, ctx, max_payload_size)
        }
        "read_group" => extract_read_group(arguments, ctx, max_payload_size),
        "write" => extract_write(arguments),
        "unlink" => extract_unlink(arguments),
        _ => extract_generic(arguments),
    }
}

/// Values come from the first matching channel: `arguments.values`,
/// `args[0]` when it is an object, `kwargs.values`, or the whole kwargs
/// object. The call site always receives `[values]` positional and no
/// named arguments, so Odoo never sees a stray `values` key.
fn extract_create(arguments: &Map<String, Value>) -> GatewayResult<ExtractedCall> {
    let pos = positional(arguments);
    let kw = named(arguments);

    let values = if let Some(v @ Value::Object(_)) = arguments.get("values") {
        v.clone()
    } else if let Some(v @ Value::Object(_)) = pos.first() {
        v.clone()
    } else if let Some(v @ Value::Object(_)) = kw.get("values") {
        v.clone()
    } else if !kw.is_empty() {
        Value::Object(kw)
    } else {
        return Err(GatewayError::InvalidParams(
            "create requires 'values'".to_string(),
        ));
    };

    Ok(ExtractedCall {
        args: vec![values],
        kwargs: Map::new(),
        warnings: Vec::new(),
    })
}

/// `read` takes ids and fields positionally; `fields` must not leak into
/// the named channel or Odoo faults on a duplicate argument.
fn extract_read(arguments: &Map<String, Value>) -> GatewayResult<ExtractedCall> {
    let pos = positional(arguments);
    let kw = named(arguments);

    let ids_value = arguments
        .get("record_ids")
        .or_else(|| pos.first())
        .ok_or_else(|| GatewayError::InvalidParams("read requires record ids".to_string()))?;
    let ids = coerce_ids(ids_value)?;

    let fields = arguments
        .get("fields")
        .or_else(|| pos.get(1))
        .or_else(|| kw.get("fields"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_else(|| vec![json!("id"), json!("name")]);

    let mut kwargs = Map::new();
    if let Some(context) = kw.get("context").filter(|v| v.is_object()) {
        kwargs.insert("context".to_string(), context.clone());
    }

    Ok(ExtractedCall {
        args: vec![json!(ids), Value::Array(fields)],
        kwargs,
        warnings: Vec::new(),
    })
}

/// Domain comes first; the remaining positionals map onto
/// `fields, offset, limit, order` per Odoo arity, and the named channel
/// passes through under the same keys.
fn extract_search(
    method: &str,
    arguments: &Map<String, Value>,
    ctx: &DomainContext,
    max_payload_size: usize,
) -> GatewayResult<ExtractedCall> {
    let pos = positional(arguments);
    let kw = named(arguments);

    let domain_input = arguments
        .get("domain")
        .or_else(|| arguments.get("domain_json"))
        .or_else(|| pos.first())
        .or_else(|| kw.get("domain"))
        .cloned()
        .unwrap_or(Value::Null);

    let compiled = domain::compile(&domain_input, ctx, max_payload_size)?;

    let passthrough_keys: &[&str] = match method {
        "search_count" => &["context"],
        "search" => &["offset", "limit", "order", "context"],
        _ => &["fields", "offset", "limit", "order", "context"],
    };

    let mut kwargs = Map::new();
    for key in passthrough_keys {
        if let Some(v) = kw.get(*key).filter(|v| !v.is_null()) {
            kwargs.insert(key.to_string(), v.clone());
        }
    }

    // Positional channel fills whatever the named channel left out.
    let positional_keys: &[&str] = match method {
        "search_count" => &[],
        "search" => &["offset", "limit", "order"],
        _ => &["fields", "offset", "limit", "order"],
    };
    for (idx, key) in positional_keys.iter().enumerate() {
        if let Some(v) = pos.get(idx + 1).filter(|v| !v.is_null())
            && !kwargs.contains_key(*key)
        {
            kwargs.insert(key.to_string(), v.clone());
        }
    }

    for key in ["fields", "limit", "offset", "order"] {
        if let Some(v) = arguments.get(key).filter(|v| !v.is_null())
            && !kwargs.contains_key(key)
            && passthrough_keys.contains(&key)
        {
            kwargs.insert(key.to_string(), v.clone());
        }
    }

    Ok(ExtractedCall {
        args: vec![Value::Array(compiled.clauses)],
        kwargs,
        warnings: compiled.warnings,
    })
}

/// `read_group` accepts either separate `(domain, fields, groupby)`
/// positionals or one object positional carrying those keys; both collapse
/// into separate positionals with the named channel filtered to the
/// paging keys.
fn extract_read_group(
    arguments: &Map<String, Value>,
    ctx: &DomainContext,
    max_payload_size: usize,
) -> GatewayResult<ExtractedCall> {
    let pos = positional(arguments);
    let kw = named(arguments);

    let (domain_input, fields, groupby, packed_kwargs) = match pos.first() {
        Some(Value::Object(packed))
            if packed.contains_key("domain")
                || packed.contains_key("fields")
                || packed.contains_key("groupby") =>
        {
            (
                packed.get("domain").cloned().unwrap_or(Value::Null),
                packed.get("fields").and_then(|v| v.as_array()).cloned(),
                packed.get("groupby").cloned(),
                packed.get("kwargs").and_then(|v| v.as_object()).cloned(),
            )
        }
        _ => (
            arguments
                .get("domain")
                .or_else(|| arguments.get("domain_json"))
                .or_else(|| pos.first())
                .cloned()
                .unwrap_or(Value::Null),
            arguments
                .get("fields")
                .or_else(|| pos.get(1))
                .and_then(|v| v.as_array())
                .cloned(),
            arguments.get("groupby").or_else(|| pos.get(2)).cloned(),
            None,
        ),
    };

    let fields = fields.unwrap_or_default();
    validate_aggregates(&fields)?;

    // A bare string groupby is accepted and wrapped.
    let groupby = match groupby {
        Some(Value::String(s)) => vec![json!(s)],
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    validate_groupby(&groupby)?;

    let compiled = domain::compile(&domain_input, ctx, max_payload_size)?;

    let mut kwargs = Map::new();
    let mut source = kw;
    if let Some(packed) = packed_kwargs {
        source = packed;
    }
    for key in ["limit", "offset", "orderby", "lazy"] {
        if let Some(v) = source.get(key).filter(|v| !v.is_null()) {
            kwargs.insert(key.to_string(), v.clone());
        }
    }

    Ok(ExtractedCall {
        args: vec![
            Value::Array(compiled.clauses),
            Value::Array(fields),
            Value::Array(groupby),
        ],
        kwargs,
        warnings: compiled.warnings,
    })
}

fn extract_write(arguments: &Map<String, Value>) -> GatewayResult<ExtractedCall> {
    let pos = positional(arguments);

    let ids_value = arguments
        .get("record_ids")
        .or_else(|| pos.first())
        .ok_or_else(|| GatewayError::InvalidParams("write requires record ids".to_string()))?;
    let ids = coerce_ids(ids_value)?;

    let values = arguments
        .get("values")
        .or_else(|| pos.get(1))
        .filter(|v| v.is_object())
        .cloned()
        .ok_or_else(|| GatewayError::InvalidParams("write requires 'values'".to_string()))?;

    Ok(ExtractedCall {
        args: vec![json!(ids), values],
        kwargs: Map::new(),
        warnings: Vec::new(),
    })
}

fn extract_unlink(arguments: &Map<String, Value>) -> GatewayResult<ExtractedCall> {
    let pos = positional(arguments);

    let ids_value = arguments
        .get("record_ids")
        .or_else(|| pos.first())
        .ok_or_else(|| GatewayError::InvalidParams("unlink requires record ids".to_string()))?;
    let ids = coerce_ids(ids_value)?;

    Ok(ExtractedCall {
        args: vec![json!(ids)],
        kwargs: Map::new(),
        warnings: Vec::new(),
    })
}

/// Action and arbitrary methods: `(ids,)` positional when ids are present,
/// plus the named channel and an optional parameters object.
fn extract_generic(arguments: &Map<String, Value>) -> GatewayResult<ExtractedCall> {
    let pos = positional(arguments);
    let mut kwargs = named(arguments);

    let mut args = Vec::new();
    if let Some(ids_value) = arguments
        .get("record_ids")
        .or_else(|| arguments.get("record_id"))
    {
        let ids = coerce_ids(ids_value)?;
        args.push(json!(ids));
    } else {
        args = pos;
    }

    if let Some(Value::Object(parameters)) = arguments.get("parameters") {
        for (k, v) in parameters {
            kwargs.insert(k.clone(), v.clone());
        }
    }
    if let Some(context) = arguments.get("context").filter(|v| v.is_object()) {
        kwargs.insert("context".to_string(), context.clone());
    }

    Ok(ExtractedCall {
        args,
        kwargs,
        warnings: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ctx() -> DomainContext {
        DomainContext {
            uid: 2,
            company_ids: vec![1],
            today: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        }
    }

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn extract(method: &str, v: Value) -> ExtractedCall {
        extract_call(method, &args(v), &ctx(), 1024 * 1024).unwrap()
    }

    #[test]
    fn test_canonical_envelope_passthrough() {
        let params = json!({"name": "odoo.create", "arguments": {"model": "res.partner"}});
        let (arguments, warnings) = canonical_arguments(&params);
        assert_eq!(arguments["model"], "res.partner");
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_top_level_legacy_envelope_normalized() {
        let params = json!({"name": "odoo.create", "model": "res.partner", "values": {"name": "X"}});
        let (arguments, warnings) = canonical_arguments(&params);
        assert_eq!(arguments["model"], "res.partner");
        assert!(!warnings.is_empty());
    }

    #[test]
    fn test_create_from_arguments_values() {
        let call = extract("create", json!({"values": {"name": "Mario"}}));
        assert_eq!(call.args, vec![json!({"name": "Mario"})]);
        assert!(call.kwargs.is_empty());
    }

    #[test]
    fn test_create_from_positional_object() {
        let call = extract("create", json!({"args": [{"name": "Mario"}]}));
        assert_eq!(call.args, vec![json!({"name": "Mario"})]);
    }

    #[test]
    fn test_create_from_kwargs_values() {
        // The legacy envelope of scenario 2: kwargs.values must unwrap so
        // Odoo never receives a 'values' key in the record payload.
        let call = extract("create", json!({"kwargs": {"values": {"name": "X"}}}));
        assert_eq!(call.args, vec![json!({"name": "X"})]);
        assert!(call.kwargs.is_empty());
    }

    #[test]
    fn test_create_from_bare_kwargs() {
        let call = extract("create", json!({"kwargs": {"name": "X", "email": "x@y.z"}}));
        assert_eq!(call.args, vec![json!({"name": "X", "email": "x@y.z"})]);
    }

    #[test]
    fn test_create_missing_values_is_invalid_params() {
        let err = extract_call("create", &args(json!({})), &ctx(), 1024).unwrap_err();
        assert_eq!(err.code(), -32602);
    }

    #[test]
    fn test_read_positional_ids_and_fields() {
        let call = extract("read", json!({"args": [[1, 2], ["name", "email"]]}));
        assert_eq!(call.args[0], json!([1, 2]));
        assert_eq!(call.args[1], json!(["name", "email"]));
        assert!(call.kwargs.is_empty());
    }

    #[test]
    fn test_read_default_fields() {
        let call = extract("read", json!({"record_ids": [5]}));
        assert_eq!(call.args[1], json!(["id", "name"]));
    }

    #[test]
    fn test_read_fields_never_in_kwargs() {
        let call = extract(
            "read",
            json!({"args": [[1]], "kwargs": {"fields": ["name"], "context": {"lang": "it_IT"}}}),
        );
        assert_eq!(call.args[1], json!(["name"]));
        assert!(!call.kwargs.contains_key("fields"));
        assert_eq!(call.kwargs["context"], json!({"lang": "it_IT"}));
    }

    #[test]
    fn test_read_single_id_coerced() {
        let call = extract("read", json!({"record_ids": 7}));
        assert_eq!(call.args[0], json!([7]));
    }

    #[test]
    fn test_search_read_positionals_map_to_kwargs() {
        let call = extract(
            "search_read",
            json!({"args": [[["active", "=", true]], ["name"], 0, 10, "name asc"]}),
        );
        assert_eq!(call.args[0], json!([["active", "=", true]]));
        assert_eq!(call.kwargs["fields"], json!(["name"]));
        assert_eq!(call.kwargs["offset"], json!(0));
        assert_eq!(call.kwargs["limit"], json!(10));
        assert_eq!(call.kwargs["order"], json!("name asc"));
    }

    #[test]
    fn test_search_count_boolean_domain_coerced() {
        let call = extract("search_count", json!({"args": [true]}));
        assert_eq!(call.args[0], json!([]));
        assert!(!call.warnings.is_empty());
    }

    #[test]
    fn test_search_named_channel_wins_over_positional() {
        let call = extract(
            "search_read",
            json!({"args": [[], ["a"]], "kwargs": {"fields": ["b"]}}),
        );
        assert_eq!(call.kwargs["fields"], json!(["b"]));
    }

    #[test]
    fn test_read_group_separate_positionals() {
        let call = extract(
            "read_group",
            json!({"args": [[], ["amount_total:sum"], ["partner_id"]]}),
        );
        assert_eq!(call.args.len(), 3);
        assert_eq!(call.args[1], json!(["amount_total:sum"]));
        assert_eq!(call.args[2], json!(["partner_id"]));
    }

    #[test]
    fn test_read_group_single_object_positional() {
        let call = extract(
            "read_group",
            json!({"args": [{
                "domain": [],
                "fields": ["amount_total:sum"],
                "groupby": "partner_id",
                "kwargs": {"limit": 5, "lazy": true}
            }]}),
        );
        assert_eq!(call.args[1], json!(["amount_total:sum"]));
        assert_eq!(call.args[2], json!(["partner_id"]));
        assert_eq!(call.kwargs["limit"], json!(5));
        assert_eq!(call.kwargs["lazy"], json!(true));
        assert!(!call.kwargs.contains_key("orderby") || call.kwargs["orderby"].is_null());
    }

    #[test]
    fn test_read_group_invalid_aggregate_rejected() {
        let err = extract_call(
            "read_group",
            &args(json!({"args": [{
                "domain": [],
                "fields": ["amount_total:month"],
                "groupby": ["partner_id"]
            }]})),
            &ctx(),
            1024 * 1024,
        )
        .unwrap_err();
        assert_eq!(err.code(), -32007);
        assert!(err.to_string().contains("aggregation"));
    }

    #[test]
    fn test_read_group_groupby_granularity_allowed() {
        let call = extract(
            "read_group",
            json!({"args": [[], ["amount_total:sum"], ["create_date:month"]]}),
        );
        assert_eq!(call.args[2], json!(["create_date:month"]));
    }

    #[test]
    fn test_write_positionals() {
        let call = extract("write", json!({"args": [[3, 4], {"active": false}]}));
        assert_eq!(call.args[0], json!([3, 4]));
        assert_eq!(call.args[1], json!({"active": false}));
        assert!(call.kwargs.is_empty());
    }

    #[test]
    fn test_unlink_single_positional() {
        let call = extract("unlink", json!({"record_ids": [9]}));
        assert_eq!(call.args, vec![json!([9])]);
    }

    #[test]
    fn test_action_method_ids_and_parameters() {
        let call = extract(
            "action_confirm",
            json!({"record_id": 12, "parameters": {"force": true}}),
        );
        assert_eq!(call.args, vec![json!([12])]);
        assert_eq!(call.kwargs["force"], json!(true));
    }

    #[test]
    fn test_coerce_ids_rejects_strings() {
        assert!(coerce_ids(&json!(["a"])).is_err());
        assert!(coerce_ids(&json!("7")).is_err());
    }
}
