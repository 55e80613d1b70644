use serde_json::{Map, Value, json};
use tracing::warn;

use crate::cache::is_cacheable;
use crate::domain;
use crate::error::{GatewayError, GatewayResult, ValidationKind};
use crate::mcp::actions;
use crate::mcp::dispatcher::{ClientContext, Dispatcher, Invocation};
use crate::mcp::normalize::{coerce_ids, extract_call};
use crate::mcp::registry::ToolKind;

pub(crate) async fn dispatch_tool(
    d: &Dispatcher,
    kind: ToolKind,
    args: &Map<String, Value>,
    session_uid: Option<i64>,
    _client: &ClientContext,
) -> GatewayResult<Value> {
    match kind {
        ToolKind::Echo => {
            let message = req_str(args, "message")?;
            Ok(json!({ "message": message }))
        }
        ToolKind::CreateSession => {
            let username = req_str(args, "username")?;
            let api_key = req_str(args, "api_key")?;
            let (session_id, uid) = d.authenticator.create_session(&username, &api_key).await?;
            Ok(json!({ "session_id": session_id, "uid": uid }))
        }
        ToolKind::DestroySession => {
            let session_id = req_str(args, "session_id")?;
            d.sessions.destroy(&session_id);
            Ok(json!({ "ok": true }))
        }
        other => {
            let inv = d.invocation(session_uid).await?;
            dispatch_backend(d, other, args, &inv).await
        }
    }
}

async fn dispatch_backend(
    d: &Dispatcher,
    kind: ToolKind,
    args: &Map<String, Value>,
    inv: &Invocation,
) -> GatewayResult<Value> {
    match kind {
        ToolKind::SchemaVersion => {
            let version = d.schema.version().await?;
            Ok(json!({ "version": version }))
        }
        ToolKind::SchemaModels => {
            let with_access = opt_bool(args, "with_access").unwrap_or(true);
            let models = d.schema.models(with_access).await?;
            Ok(json!({ "models": models }))
        }
        ToolKind::SchemaFields => {
            let model = req_str(args, "model")?;
            let fields = d.schema.field_defs(&model).await?;
            Ok(json!({ "fields": fields }))
        }
        ToolKind::DomainValidate => {
            let _model = req_str(args, "model")?;
            let domain_input = args.get("domain_json").cloned().unwrap_or(Value::Null);
            let report = domain::validate(&domain_input, &inv.domain_ctx, d.config.max_payload_size);
            let mut hints = report.warnings.clone();
            hints.extend(report.hints.clone());
            Ok(json!({
                "ok": report.ok,
                "compiled": report.compiled,
                "errors": report.errors,
                "hints": hints,
            }))
        }
        ToolKind::SearchRead => tool_search_read(d, args, inv).await,
        ToolKind::Read => tool_read(d, args, inv).await,
        ToolKind::Create => tool_create(d, args, inv).await,
        ToolKind::Write => tool_write(d, args, inv).await,
        ToolKind::Unlink => tool_unlink(d, args, inv).await,
        ToolKind::NameSearch => tool_name_search(d, args, inv).await,
        ToolKind::Picklists => tool_picklists(d, args, inv).await,
        ToolKind::NextSteps => {
            let model = req_str(args, "model")?;
            let record_id = req_i64(args, "record_id")?;
            actions::next_steps(d, &model, record_id, inv).await
        }
        ToolKind::ActionCall => tool_action_call(d, args, inv).await,
        ToolKind::LegacyExecuteKw | ToolKind::LegacyCallMethod => {
            tool_legacy_execute(d, kind, args, inv).await
        }
        ToolKind::LegacySearchRead => tool_legacy(d, "search_read", args, inv).await,
        ToolKind::LegacyRead => tool_legacy(d, "read", args, inv).await,
        ToolKind::LegacyCreate => tool_legacy(d, "create", args, inv).await,
        ToolKind::LegacyWrite => tool_legacy(d, "write", args, inv).await,
        ToolKind::LegacyUnlink => tool_legacy(d, "unlink", args, inv).await,
        ToolKind::Echo | ToolKind::CreateSession | ToolKind::DestroySession => {
            Err(GatewayError::Internal("tool dispatched twice".to_string()))
        }
    }
}

async fn tool_search_read(
    d: &Dispatcher,
    args: &Map<String, Value>,
    inv: &Invocation,
) -> GatewayResult<Value> {
    let model = req_str(args, "model")?;

    let domain_input = args
        .get("domain_json")
        .or_else(|| args.get("domain"))
        .cloned()
        .unwrap_or(Value::Null);
    let compiled = domain::compile(&domain_input, &inv.domain_ctx, d.config.max_payload_size)?;
    for warning in &compiled.warnings {
        warn!(model = %model, warning = %warning, "domain coerced");
    }

    let mut clauses = compiled.clauses;
    if d.implicit.enabled() {
        let field_names = d.model_field_names(&model).await;
        clauses = d.implicit.apply(&model, &field_names, clauses, &inv.domain_ctx);
    }

    let mut fields = opt_vec_string(args, "fields")
        .unwrap_or_else(|| vec!["id".to_string(), "name".to_string()]);
    fields.truncate(d.config.max_fields_limit);

    let limit = opt_i64(args, "limit")
        .unwrap_or(50)
        .clamp(1, d.config.max_records_limit);
    let offset = opt_i64(args, "offset").unwrap_or(0).max(0);

    let mut kwargs = json!({
        "fields": fields,
        "limit": limit,
        "offset": offset,
    });
    if let Some(order) = opt_str(args, "order") {
        kwargs["order"] = json!(order);
    }

    let records = d
        .execute_read(inv, &model, "search_read", json!([clauses]), kwargs)
        .await?;
    let count = records.as_array().map(|a| a.len()).unwrap_or(0);

    Ok(json!({ "records": records, "count": count, "domain": clauses }))
}

async fn tool_read(
    d: &Dispatcher,
    args: &Map<String, Value>,
    inv: &Invocation,
) -> GatewayResult<Value> {
    let model = req_str(args, "model")?;
    let ids = req_ids(args, "record_ids")?;

    let mut fields = opt_vec_string(args, "fields")
        .unwrap_or_else(|| vec!["id".to_string(), "name".to_string()]);
    fields.truncate(d.config.max_fields_limit);

    let records = d
        .execute_read(inv, &model, "read", json!([ids, fields]), json!({}))
        .await?;
    Ok(json!({ "records": records }))
}

async fn tool_create(
    d: &Dispatcher,
    args: &Map<String, Value>,
    inv: &Invocation,
) -> GatewayResult<Value> {
    let model = req_str(args, "model")?;
    let values = args
        .get("values")
        .filter(|v| v.is_object())
        .cloned()
        .ok_or_else(|| GatewayError::InvalidParams("create requires 'values'".to_string()))?;
    let operation_id = opt_str(args, "operation_id");

    if let Some(prior) = d.idempotent_replay(operation_id.as_deref()) {
        return Ok(prior);
    }

    let created = d
        .execute_write(inv, &model, "create", json!([values]), json!({}))
        .await?;
    let id = created_id(&created)?;

    d.publish_record_update(&model, &[id]);

    let result = json!({ "id": id });
    d.idempotent_record(operation_id.as_deref(), &result);
    Ok(result)
}

async fn tool_write(
    d: &Dispatcher,
    args: &Map<String, Value>,
    inv: &Invocation,
) -> GatewayResult<Value> {
    let model = req_str(args, "model")?;
    let ids = req_ids(args, "record_ids")?;
    let values = args
        .get("values")
        .filter(|v| v.is_object())
        .cloned()
        .ok_or_else(|| GatewayError::InvalidParams("write requires 'values'".to_string()))?;
    let operation_id = opt_str(args, "operation_id");

    if let Some(prior) = d.idempotent_replay(operation_id.as_deref()) {
        return Ok(prior);
    }

    d.execute_write(inv, &model, "write", json!([ids, values]), json!({}))
        .await?;

    d.publish_record_update(&model, &ids);

    let result = json!({ "updated": ids.len() });
    d.idempotent_record(operation_id.as_deref(), &result);
    Ok(result)
}

async fn tool_unlink(
    d: &Dispatcher,
    args: &Map<String, Value>,
    inv: &Invocation,
) -> GatewayResult<Value> {
    let model = req_str(args, "model")?;
    let ids = req_ids(args, "record_ids")?;
    let operation_id = opt_str(args, "operation_id");

    if let Some(prior) = d.idempotent_replay(operation_id.as_deref()) {
        return Ok(prior);
    }

    d.execute_write(inv, &model, "unlink", json!([ids]), json!({}))
        .await?;

    d.publish_record_update(&model, &ids);

    let result = json!({ "deleted": ids.len() });
    d.idempotent_record(operation_id.as_deref(), &result);
    Ok(result)
}

async fn tool_name_search(
    d: &Dispatcher,
    args: &Map<String, Value>,
    inv: &Invocation,
) -> GatewayResult<Value> {
    let model = req_str(args, "model")?;
    let name = req_str(args, "name")?;
    let operator = opt_str(args, "operator").unwrap_or_else(|| "ilike".to_string());
    let limit = opt_i64(args, "limit").unwrap_or(10).max(1);

    let results = d
        .execute_read(
            inv,
            &model,
            "name_search",
            json!([name]),
            json!({ "operator": operator, "limit": limit }),
        )
        .await?;
    Ok(json!({ "results": results }))
}

async fn tool_picklists(
    d: &Dispatcher,
    args: &Map<String, Value>,
    inv: &Invocation,
) -> GatewayResult<Value> {
    let model = req_str(args, "model")?;
    let field = req_str(args, "field")?;
    let limit = opt_i64(args, "limit").unwrap_or(100).max(1);

    let def = d.schema.field_def(&model, &field).await?;

    if let Some(selection) = def.selection {
        let values: Vec<Value> = selection
            .into_iter()
            .take(limit as usize)
            .map(|(key, label)| json!({ "id": key, "label": label }))
            .collect();
        return Ok(json!({ "values": values }));
    }

    if let Some(relation) = def.relation {
        let results = d
            .execute_read(
                inv,
                &relation,
                "name_search",
                json!([""]),
                json!({ "limit": limit }),
            )
            .await?;
        let values: Vec<Value> = results
            .as_array()
            .map(|pairs| {
                pairs
                    .iter()
                    .filter_map(|pair| {
                        let items = pair.as_array()?;
                        Some(json!({ "id": items.first()?, "label": items.get(1)? }))
                    })
                    .collect()
            })
            .unwrap_or_default();
        return Ok(json!({ "values": values }));
    }

    Err(GatewayError::validation(
        ValidationKind::Field,
        format!("field '{field}' on '{model}' is neither a selection nor a relation"),
    ))
}

async fn tool_action_call(
    d: &Dispatcher,
    args: &Map<String, Value>,
    inv: &Invocation,
) -> GatewayResult<Value> {
    let model = req_str(args, "model")?;
    let record_id = req_i64(args, "record_id")?;
    let method = req_str(args, "method")?;
    let parameters = args.get("parameters").and_then(|v| v.as_object()).cloned();
    let operation_id = opt_str(args, "operation_id");

    if let Some(prior) = d.idempotent_replay(operation_id.as_deref()) {
        return Ok(prior);
    }

    let result = actions::call_action(d, &model, record_id, &method, parameters.as_ref(), inv).await?;
    d.idempotent_record(operation_id.as_deref(), &result);
    Ok(result)
}

/// Legacy `odoo_execute_kw` / `odoo_call_method`: the normalizer
/// reconciles the positional/named channels, then reads route through the
/// cache and writes invalidate + notify.
async fn tool_legacy_execute(
    d: &Dispatcher,
    kind: ToolKind,
    args: &Map<String, Value>,
    inv: &Invocation,
) -> GatewayResult<Value> {
    let model = req_str(args, "model")?;
    let method = req_str(args, "method")?;

    if kind == ToolKind::LegacyCallMethod && !actions::method_allowed(&method) {
        return Err(GatewayError::MethodNotFoundOnModel {
            model,
            method,
        });
    }

    let call = extract_call(&method, args, &inv.domain_ctx, d.config.max_payload_size)?;
    for warning in &call.warnings {
        warn!(model = %model, method = %method, warning = %warning, "legacy call normalized");
    }

    execute_extracted(d, &model, &method, call.args, call.kwargs, inv).await
}

/// Legacy fixed-method tools (`odoo_search_read`, `odoo_create`, ...).
async fn tool_legacy(
    d: &Dispatcher,
    method: &str,
    args: &Map<String, Value>,
    inv: &Invocation,
) -> GatewayResult<Value> {
    let model = req_str(args, "model")?;
    let operation_id = opt_str(args, "operation_id");

    if let Some(prior) = d.idempotent_replay(operation_id.as_deref()) {
        return Ok(prior);
    }

    let call = extract_call(method, args, &inv.domain_ctx, d.config.max_payload_size)?;
    for warning in &call.warnings {
        warn!(model = %model, method = %method, warning = %warning, "legacy call normalized");
    }

    let result = execute_extracted(d, &model, method, call.args, call.kwargs, inv).await?;
    if !is_cacheable(method) {
        d.idempotent_record(operation_id.as_deref(), &result);
    }
    Ok(result)
}

async fn execute_extracted(
    d: &Dispatcher,
    model: &str,
    method: &str,
    call_args: Vec<Value>,
    call_kwargs: Map<String, Value>,
    inv: &Invocation,
) -> GatewayResult<Value> {
    let args_value = Value::Array(call_args.clone());
    let kwargs_value = Value::Object(call_kwargs);

    if is_cacheable(method) {
        let raw = d
            .execute_read(inv, model, method, args_value, kwargs_value)
            .await?;
        return Ok(legacy_result(method, raw));
    }

    let raw = d
        .execute_write(inv, model, method, args_value, kwargs_value)
        .await?;

    // Derive affected ids for subscribers: writes carry them in the first
    // positional, create learns its id from the result.
    match method {
        "create" => {
            let id = created_id(&raw)?;
            d.publish_record_update(model, &[id]);
            return Ok(json!({ "id": id }));
        }
        _ => {
            if let Some(ids_value) = call_args.first()
                && let Ok(ids) = coerce_ids(ids_value)
            {
                d.publish_record_update(model, &ids);
                if method == "write" {
                    return Ok(json!({ "updated": ids.len() }));
                }
                if method == "unlink" {
                    return Ok(json!({ "deleted": ids.len() }));
                }
            }
        }
    }

    Ok(json!({ "result": raw }))
}

fn legacy_result(method: &str, raw: Value) -> Value {
    match method {
        "search_read" | "read" => {
            let count = raw.as_array().map(|a| a.len()).unwrap_or(0);
            if method == "search_read" {
                json!({ "records": raw, "count": count })
            } else {
                json!({ "records": raw })
            }
        }
        "search_count" => json!({ "count": raw }),
        "search" => json!({ "ids": raw }),
        _ => json!({ "result": raw }),
    }
}

fn created_id(raw: &Value) -> GatewayResult<i64> {
    if let Some(id) = raw.as_i64() {
        return Ok(id);
    }
    if let Some(id) = raw.as_array().and_then(|a| a.first()).and_then(|v| v.as_i64()) {
        return Ok(id);
    }
    Err(GatewayError::Protocol(format!(
        "create did not return a record id: {raw}"
    )))
}

fn req_str(args: &Map<String, Value>, key: &str) -> GatewayResult<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| GatewayError::InvalidParams(format!("missing required argument '{key}'")))
}

fn req_i64(args: &Map<String, Value>, key: &str) -> GatewayResult<i64> {
    args.get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| GatewayError::InvalidParams(format!("argument '{key}' must be an integer")))
}

fn req_ids(args: &Map<String, Value>, key: &str) -> GatewayResult<Vec<i64>> {
    let value = args
        .get(key)
        .ok_or_else(|| GatewayError::InvalidParams(format!("missing required argument '{key}'")))?;
    coerce_ids(value)
}

fn opt_str(args: &Map<String, Value>, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn opt_i64(args: &Map<String, Value>, key: &str) -> Option<i64> {
    args.get(key).and_then(|v| v.as_i64())
}

fn opt_bool(args: &Map<String, Value>, key: &str) -> Option<bool> {
    args.get(key).and_then(|v| v.as_bool())
}

fn opt_vec_string(args: &Map<String, Value>, key: &str) -> Option<Vec<String>> {
    let arr = args.get(key)?.as_array()?;
    Some(
        arr.iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect(),
    )
}
