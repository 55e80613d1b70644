use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value, json};

use crate::error::{GatewayError, GatewayResult};
use crate::mcp::dispatcher::{Dispatcher, Invocation};

/// Action methods callable without carrying a workflow prefix.
const ALLOWED_BARE_METHODS: &[&str] = &["toggle_active", "message_post"];

static METHOD_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("method name regex"));

/// A workflow transition known for a model/state pair.
#[derive(Debug, Clone)]
struct Transition {
    method: &'static str,
    label: &'static str,
    from_states: &'static [&'static str],
}

/// Built-in transition table for the workflow-heavy core models; models
/// not listed fall back to generic state heuristics.
static TRANSITIONS: &[(&str, &[Transition])] = &[
    (
        "sale.order",
        &[
            Transition {
                method: "action_confirm",
                label: "Confirm quotation",
                from_states: &["draft", "sent"],
            },
            Transition {
                method: "action_quotation_send",
                label: "Send quotation by email",
                from_states: &["draft"],
            },
            Transition {
                method: "action_cancel",
                label: "Cancel order",
                from_states: &["draft", "sent", "sale"],
            },
            Transition {
                method: "action_draft",
                label: "Reset to draft",
                from_states: &["cancel"],
            },
        ],
    ),
    (
        "account.move",
        &[
            Transition {
                method: "action_post",
                label: "Post entry",
                from_states: &["draft"],
            },
            Transition {
                method: "button_cancel",
                label: "Cancel entry",
                from_states: &["draft"],
            },
            Transition {
                method: "button_draft",
                label: "Reset to draft",
                from_states: &["posted", "cancel"],
            },
        ],
    ),
    (
        "purchase.order",
        &[
            Transition {
                method: "button_confirm",
                label: "Confirm order",
                from_states: &["draft", "sent"],
            },
            Transition {
                method: "button_cancel",
                label: "Cancel order",
                from_states: &["draft", "sent", "purchase"],
            },
            Transition {
                method: "button_draft",
                label: "Reset to draft",
                from_states: &["cancel"],
            },
        ],
    ),
];

fn registered_transitions(model: &str) -> &'static [Transition] {
    TRANSITIONS
        .iter()
        .find(|(m, _)| *m == model)
        .map(|(_, t)| *t)
        .unwrap_or(&[])
}

/// Gateway-side pre-flight: the method must look like a workflow entry
/// point before anything goes on the wire.
pub fn method_allowed(method: &str) -> bool {
    if !METHOD_NAME.is_match(method) {
        return false;
    }
    method.starts_with("action_")
        || method.starts_with("button_")
        || ALLOWED_BARE_METHODS.contains(&method)
}

/// `odoo.actions.next_steps`: read the record's state and report which
/// workflow actions apply now.
pub(crate) async fn next_steps(
    d: &Dispatcher,
    model: &str,
    record_id: i64,
    inv: &Invocation,
) -> GatewayResult<Value> {
    let records = d
        .execute_read(
            inv,
            model,
            "read",
            json!([[record_id], ["state", "name"]]),
            json!({}),
        )
        .await?;

    let record = records
        .as_array()
        .and_then(|a| a.first())
        .ok_or_else(|| {
            GatewayError::RecordNotFound(format!("{model}({record_id}) does not exist"))
        })?;

    let current_state = record
        .get("state")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let registered = registered_transitions(model);
    let available: Vec<Value> = registered
        .iter()
        .map(|t| {
            json!({
                "method": t.method,
                "label": t.label,
                "from_states": t.from_states,
            })
        })
        .collect();

    let suggested: Vec<Value> = registered
        .iter()
        .filter(|t| t.from_states.contains(&current_state.as_str()))
        .map(|t| json!({"method": t.method, "label": t.label}))
        .collect();

    let mut hints = Vec::new();
    if registered.is_empty() {
        hints.push(format!(
            "no workflow registry for {model}; try methods prefixed with action_ or button_"
        ));
    } else if suggested.is_empty() {
        hints.push(format!("no registered transition leaves state '{current_state}'"));
    }
    hints.push("invoke a transition with odoo.actions.call".to_string());

    Ok(json!({
        "current_state": current_state,
        "available_actions": available,
        "suggested_actions": suggested,
        "hints": hints,
    }))
}

/// `odoo.actions.call`: guarded invocation of a workflow method on one
/// record.
pub(crate) async fn call_action(
    d: &Dispatcher,
    model: &str,
    record_id: i64,
    method: &str,
    parameters: Option<&Map<String, Value>>,
    inv: &Invocation,
) -> GatewayResult<Value> {
    if !method_allowed(method) {
        return Err(GatewayError::MethodNotFoundOnModel {
            model: model.to_string(),
            method: method.to_string(),
        });
    }

    let kwargs = match parameters {
        Some(map) => Value::Object(map.clone()),
        None => json!({}),
    };

    let result = d
        .execute_write(inv, model, method, json!([[record_id]]), kwargs)
        .await?;

    d.publish_record_update(model, &[record_id]);

    let mut out = json!({ "result": result });
    if result.is_object() {
        // Many buttons return an ir.actions descriptor for the UI.
        out["data"] = result.clone();
        out["result"] = json!(true);
    }
    Ok(out)
}
