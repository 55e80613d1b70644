//! End-to-end dispatcher scenarios against a mock Odoo backend.

mod common;

use common::{MockOdoo, call_tool, dispatcher, test_client, test_config};
use serde_json::json;

#[tokio::test]
async fn create_partner_then_read_it_back() {
    let odoo = MockOdoo::start().await;
    odoo.mock_authenticate(2).await;
    odoo.mock_execute("res.partner", "create", json!(7)).await;
    odoo.mock_execute(
        "res.partner",
        "read",
        json!([{"id": 7, "name": "Mario Rossi", "email": "mario@example.com"}]),
    )
    .await;

    let d = dispatcher(test_config(&odoo.uri()));
    let client = test_client(&d);

    let resp = call_tool(
        &d,
        &client,
        "odoo.create",
        json!({"model": "res.partner", "values": {"name": "Mario Rossi", "email": "mario@example.com"}}),
    )
    .await;
    assert_eq!(resp["jsonrpc"], "2.0");
    assert_eq!(resp["id"], 1);
    assert_eq!(resp["result"]["id"], 7);

    let resp = call_tool(
        &d,
        &client,
        "odoo.read",
        json!({"model": "res.partner", "record_ids": [7], "fields": ["name", "email"]}),
    )
    .await;
    assert_eq!(resp["result"]["records"][0]["name"], "Mario Rossi");
}

#[tokio::test]
async fn legacy_kwargs_values_envelope_is_unwrapped() {
    let odoo = MockOdoo::start().await;
    odoo.mock_authenticate(2).await;
    odoo.mock_execute("res.partner", "create", json!(11)).await;

    let d = dispatcher(test_config(&odoo.uri()));
    let client = test_client(&d);

    let resp = call_tool(
        &d,
        &client,
        "odoo_create",
        json!({"model": "res.partner", "kwargs": {"values": {"name": "X"}}}),
    )
    .await;
    assert_eq!(resp["result"]["id"], 11);

    // Odoo must receive the record payload directly, never a wrapping
    // 'values' key.
    let bodies = odoo.execute_kw_requests("res.partner", "create").await;
    assert_eq!(bodies.len(), 1);
    let positional = &bodies[0]["params"]["args"][5];
    assert_eq!(positional, &json!([{"name": "X"}]));
}

#[tokio::test]
async fn read_group_invalid_aggregate_is_rejected_before_odoo() {
    let odoo = MockOdoo::start().await;
    odoo.mock_authenticate(2).await;

    let d = dispatcher(test_config(&odoo.uri()));
    let client = test_client(&d);

    let resp = call_tool(
        &d,
        &client,
        "odoo_execute_kw",
        json!({
            "model": "sale.order",
            "method": "read_group",
            "args": [{"domain": [], "fields": ["amount_total:month"], "groupby": ["partner_id"]}]
        }),
    )
    .await;

    assert_eq!(resp["error"]["code"], -32007);
    assert_eq!(resp["error"]["data"]["kind"], "validation");
    assert!(
        resp["error"]["message"]
            .as_str()
            .unwrap()
            .contains("aggregation")
    );
    assert!(
        odoo.execute_kw_requests("sale.order", "read_group")
            .await
            .is_empty()
    );
}

#[tokio::test]
async fn boolean_domain_is_coerced_to_empty_list() {
    let odoo = MockOdoo::start().await;
    odoo.mock_authenticate(2).await;
    odoo.mock_execute("res.partner", "search_count", json!(42)).await;

    let d = dispatcher(test_config(&odoo.uri()));
    let client = test_client(&d);

    let resp = call_tool(
        &d,
        &client,
        "odoo_execute_kw",
        json!({"model": "res.partner", "method": "search_count", "args": [true]}),
    )
    .await;
    assert_eq!(resp["result"]["count"], 42);

    let bodies = odoo.execute_kw_requests("res.partner", "search_count").await;
    assert_eq!(bodies[0]["params"]["args"][5], json!([[]]));
}

#[tokio::test]
async fn rate_limit_rejects_61st_burst_request() {
    let odoo = MockOdoo::start().await;
    let mut config = test_config(&odoo.uri());
    config.requests_per_minute = 60;
    config.rate_limit_max_wait_seconds = 0.0;

    let d = dispatcher(config);
    let client = test_client(&d);

    for i in 0..60 {
        let resp = call_tool(&d, &client, "echo", json!({"message": "hi"})).await;
        assert!(resp.get("error").is_none(), "request {i} unexpectedly limited");
    }

    let resp = call_tool(&d, &client, "echo", json!({"message": "hi"})).await;
    assert_eq!(resp["error"]["code"], -32010);
    assert!(resp["error"]["data"]["details"]["retry_after"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn schema_invalid_arguments_answer_32602() {
    let odoo = MockOdoo::start().await;
    let d = dispatcher(test_config(&odoo.uri()));
    let client = test_client(&d);

    // odoo.create without 'values'
    let resp = call_tool(&d, &client, "odoo.create", json!({"model": "res.partner"})).await;
    assert_eq!(resp["error"]["code"], -32602);

    // record_ids of the wrong type
    let resp = call_tool(
        &d,
        &client,
        "odoo.read",
        json!({"model": "res.partner", "record_ids": "7"}),
    )
    .await;
    assert_eq!(resp["error"]["code"], -32602);
}

#[tokio::test]
async fn unknown_tool_answers_tool_error() {
    let odoo = MockOdoo::start().await;
    let d = dispatcher(test_config(&odoo.uri()));
    let client = test_client(&d);

    let resp = call_tool(&d, &client, "no.such.tool", json!({})).await;
    assert_eq!(resp["error"]["code"], -32012);
}

#[tokio::test]
async fn write_then_read_returns_post_write_state() {
    let odoo = MockOdoo::start().await;
    odoo.mock_authenticate(2).await;
    odoo.mock_execute(
        "res.partner",
        "read",
        json!([{"id": 7, "name": "Before"}]),
    )
    .await;

    let mut config = test_config(&odoo.uri());
    config.cache_ttl = 3600;
    let d = dispatcher(config);
    let client = test_client(&d);

    let resp = call_tool(
        &d,
        &client,
        "odoo.read",
        json!({"model": "res.partner", "record_ids": [7], "fields": ["name"]}),
    )
    .await;
    assert_eq!(resp["result"]["records"][0]["name"], "Before");

    // The write invalidates the cached read...
    odoo.mock_execute("res.partner", "write", json!(true)).await;
    let resp = call_tool(
        &d,
        &client,
        "odoo.write",
        json!({"model": "res.partner", "record_ids": [7], "values": {"name": "After"}}),
    )
    .await;
    assert_eq!(resp["result"]["updated"], 1);

    // ...so the follow-up read reaches Odoo again and sees the new state.
    odoo.server.reset().await;
    odoo.mock_authenticate(2).await;
    odoo.mock_execute("res.partner", "read", json!([{"id": 7, "name": "After"}]))
        .await;

    let resp = call_tool(
        &d,
        &client,
        "odoo.read",
        json!({"model": "res.partner", "record_ids": [7], "fields": ["name"]}),
    )
    .await;
    assert_eq!(resp["result"]["records"][0]["name"], "After");
}

#[tokio::test]
async fn cached_read_skips_second_odoo_roundtrip() {
    let odoo = MockOdoo::start().await;
    odoo.mock_authenticate(2).await;
    odoo.mock_execute("res.partner", "read", json!([{"id": 7, "name": "Mario"}]))
        .await;

    let mut config = test_config(&odoo.uri());
    config.cache_ttl = 3600;
    let d = dispatcher(config);
    let client = test_client(&d);

    for _ in 0..3 {
        let resp = call_tool(
            &d,
            &client,
            "odoo.read",
            json!({"model": "res.partner", "record_ids": [7], "fields": ["name"]}),
        )
        .await;
        assert_eq!(resp["result"]["records"][0]["name"], "Mario");
    }

    assert_eq!(odoo.execute_kw_requests("res.partner", "read").await.len(), 1);
}

#[tokio::test]
async fn idempotent_create_replays_first_result() {
    let odoo = MockOdoo::start().await;
    odoo.mock_authenticate(2).await;
    odoo.mock_execute("res.partner", "create", json!(31)).await;

    let d = dispatcher(test_config(&odoo.uri()));
    let client = test_client(&d);

    let args = json!({
        "model": "res.partner",
        "values": {"name": "Once"},
        "operation_id": "op-123"
    });
    let first = call_tool(&d, &client, "odoo.create", args.clone()).await;
    let second = call_tool(&d, &client, "odoo.create", args).await;

    assert_eq!(first["result"]["id"], 31);
    assert_eq!(second["result"]["id"], 31);
    assert_eq!(odoo.execute_kw_requests("res.partner", "create").await.len(), 1);
}

#[tokio::test]
async fn pii_masking_rewrites_reads_for_session_callers() {
    let odoo = MockOdoo::start().await;
    // The gateway's own user and the session user resolve to different
    // uids, so the session caller is unprivileged.
    odoo.mock_authenticate_user("admin", 2).await;
    odoo.mock_authenticate_user("mario", 9).await;
    odoo.mock_execute(
        "res.partner",
        "read",
        json!([{"id": 7, "name": "Mario", "email": "mario@example.com", "phone": "+39055123456"}]),
    )
    .await;

    let mut config = test_config(&odoo.uri());
    config.pii_masking = true;
    let d = dispatcher(config);
    let client = test_client(&d);

    let resp = call_tool(
        &d,
        &client,
        "create_session",
        json!({"username": "mario", "api_key": "k3y"}),
    )
    .await;
    let session_id = resp["result"]["session_id"].as_str().unwrap().to_string();

    let resp = call_tool(
        &d,
        &client,
        "odoo.read",
        json!({
            "model": "res.partner",
            "record_ids": [7],
            "fields": ["name", "email", "phone"],
            "session_id": session_id
        }),
    )
    .await;
    let record = &resp["result"]["records"][0];
    assert_eq!(record["email"], "m***@example.com");
    assert_eq!(record["phone"], "***3456");
    assert_eq!(record["name"], "Mario");
}

#[tokio::test]
async fn privileged_global_caller_reads_unmasked() {
    let odoo = MockOdoo::start().await;
    odoo.mock_authenticate(2).await;
    odoo.mock_execute(
        "res.partner",
        "read",
        json!([{"id": 7, "name": "Mario", "email": "mario@example.com"}]),
    )
    .await;

    let mut config = test_config(&odoo.uri());
    config.pii_masking = true;
    let d = dispatcher(config);
    let client = test_client(&d);

    // No session id: the call runs as the gateway's global user.
    let resp = call_tool(
        &d,
        &client,
        "odoo.read",
        json!({"model": "res.partner", "record_ids": [7], "fields": ["name", "email"]}),
    )
    .await;
    assert_eq!(resp["result"]["records"][0]["email"], "mario@example.com");
}

#[tokio::test]
async fn pii_masking_covers_action_results_for_session_callers() {
    let odoo = MockOdoo::start().await;
    odoo.mock_authenticate_user("admin", 2).await;
    odoo.mock_authenticate_user("mario", 9).await;
    // Action methods can return record-shaped data.
    odoo.mock_execute(
        "sale.order",
        "action_quotation_send",
        json!({"partner": "Mario", "email": "mario@example.com"}),
    )
    .await;

    let mut config = test_config(&odoo.uri());
    config.pii_masking = true;
    let d = dispatcher(config);
    let client = test_client(&d);

    let resp = call_tool(
        &d,
        &client,
        "create_session",
        json!({"username": "mario", "api_key": "k3y"}),
    )
    .await;
    let session_id = resp["result"]["session_id"].as_str().unwrap().to_string();

    let resp = call_tool(
        &d,
        &client,
        "odoo.actions.call",
        json!({
            "model": "sale.order",
            "record_id": 5,
            "method": "action_quotation_send",
            "session_id": session_id
        }),
    )
    .await;
    assert_eq!(resp["result"]["data"]["email"], "m***@example.com");
    assert_eq!(resp["result"]["data"]["partner"], "Mario");
}

#[tokio::test]
async fn implicit_company_domain_injected_on_search() {
    let odoo = MockOdoo::start().await;
    odoo.mock_authenticate(2).await;
    odoo.mock_execute(
        "res.users",
        "read",
        json!([{"id": 2, "company_ids": [1, 3]}]),
    )
    .await;
    odoo.mock_execute(
        "sale.order",
        "fields_get",
        json!({
            "id": {"type": "integer"},
            "name": {"type": "char"},
            "company_id": {"type": "many2one", "relation": "res.company"}
        }),
    )
    .await;
    odoo.mock_execute("sale.order", "search_read", json!([])).await;

    let mut config = test_config(&odoo.uri());
    config.implicit_domains = true;
    let d = dispatcher(config);
    let client = test_client(&d);

    let resp = call_tool(
        &d,
        &client,
        "odoo.search_read",
        json!({"model": "sale.order", "domain_json": {"and": [["state", "=", "sale"]]}}),
    )
    .await;

    let effective = resp["result"]["domain"].as_array().unwrap();
    assert_eq!(effective[0], json!(["company_id", "in", [1, 3]]));

    let bodies = odoo.execute_kw_requests("sale.order", "search_read").await;
    let sent_domain = &bodies[0]["params"]["args"][5][0];
    assert_eq!(sent_domain[0], json!(["company_id", "in", [1, 3]]));
}

#[tokio::test]
async fn domain_validate_reports_errors_without_execution() {
    let odoo = MockOdoo::start().await;
    odoo.mock_authenticate(2).await;

    let d = dispatcher(test_config(&odoo.uri()));
    let client = test_client(&d);

    let resp = call_tool(
        &d,
        &client,
        "odoo.domain.validate",
        json!({"model": "res.partner", "domain_json": [["name", "~=", "x"]]}),
    )
    .await;
    let result = &resp["result"];
    assert_eq!(result["ok"], false);
    assert!(!result["errors"].as_array().unwrap().is_empty());

    let resp = call_tool(
        &d,
        &client,
        "odoo.domain.validate",
        json!({"model": "res.partner", "domain_json": {"or": [["a", "=", 1], ["b", "=", 2]]}}),
    )
    .await;
    let result = &resp["result"];
    assert_eq!(result["ok"], true);
    assert_eq!(
        result["compiled"],
        json!(["|", ["a", "=", 1], ["b", "=", 2]])
    );
}

#[tokio::test]
async fn action_call_preflight_rejects_unknown_methods() {
    let odoo = MockOdoo::start().await;
    odoo.mock_authenticate(2).await;

    let d = dispatcher(test_config(&odoo.uri()));
    let client = test_client(&d);

    let resp = call_tool(
        &d,
        &client,
        "odoo.actions.call",
        json!({"model": "sale.order", "record_id": 5, "method": "unlink"}),
    )
    .await;
    assert_eq!(resp["error"]["code"], -32009);
}

#[tokio::test]
async fn next_steps_reports_state_transitions() {
    let odoo = MockOdoo::start().await;
    odoo.mock_authenticate(2).await;
    odoo.mock_execute(
        "sale.order",
        "read",
        json!([{"id": 5, "state": "draft", "name": "SO005"}]),
    )
    .await;

    let d = dispatcher(test_config(&odoo.uri()));
    let client = test_client(&d);

    let resp = call_tool(
        &d,
        &client,
        "odoo.actions.next_steps",
        json!({"model": "sale.order", "record_id": 5}),
    )
    .await;
    let result = &resp["result"];
    assert_eq!(result["current_state"], "draft");
    let suggested: Vec<&str> = result["suggested_actions"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|a| a["method"].as_str())
        .collect();
    assert!(suggested.contains(&"action_confirm"));
    assert!(!suggested.contains(&"action_draft"));
}

#[tokio::test]
async fn picklists_serves_selection_values() {
    let odoo = MockOdoo::start().await;
    odoo.mock_authenticate(2).await;
    odoo.mock_execute(
        "sale.order",
        "fields_get",
        json!({
            "state": {
                "type": "selection",
                "selection": [["draft", "Quotation"], ["sale", "Sales Order"]]
            }
        }),
    )
    .await;

    let d = dispatcher(test_config(&odoo.uri()));
    let client = test_client(&d);

    let resp = call_tool(
        &d,
        &client,
        "odoo.picklists",
        json!({"model": "sale.order", "field": "state"}),
    )
    .await;
    let values = resp["result"]["values"].as_array().unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0], json!({"id": "draft", "label": "Quotation"}));
}
