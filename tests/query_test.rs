mod common;

use common::*;
use serde_json::{json, Value};
use std::collections::HashSet;

/// One single-span trace per (id, offset, input), started `offset` ms after `t`.
async fn seed(server: &TestServer, t: i64, rows: &[(&str, i64, &str)], metadata: Value) {
    for (id, offset, input) in rows {
        server
            .collect_ok(json!({
                "spans": [span(&format!("{id}-s"), id, t + offset, input, "answer")],
                "metadata": metadata.clone()
            }))
            .await;
    }
}

fn flat_ids(groups: &Value) -> Vec<String> {
    trace_ids(groups).into_iter().flatten().collect()
}

#[tokio::test]
async fn test_bearer_token_required() {
    let server = spawn_server(Embedder::None).await;

    let resp = server
        .client
        .post(server.api("/traces/search"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = server
        .post_api("tl_tk_bogus", "/traces/search", json!({}))
        .await;
    assert_eq!(resp.status(), 401);

    let resp = server
        .client
        .post(server.api("/traces/search"))
        .header("Authorization", format!("Basic {}", server.admin_token))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_token_scoped_to_its_project() {
    let server = spawn_server(Embedder::None).await;
    let other = tracelens::project::create_project(&server.pool, "other", true)
        .await
        .unwrap();

    let resp = server
        .client
        .post(format!(
            "{}/api/projects/{}/traces/search",
            server.base, other.id
        ))
        .bearer_auth(&server.admin_token)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = server
        .client
        .get(format!(
            "{}/api/projects/{}/customers-and-labels",
            server.base, other.id
        ))
        .bearer_auth(&server.viewer_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn test_default_search_newest_first_with_paging() {
    let server = spawn_server(Embedder::None).await;
    let t = now_ms() - 600_000;
    seed(
        &server,
        t,
        &[("a", 0, "q"), ("b", 10, "q"), ("c", 20, "q"), ("d", 30, "q"), ("e", 40, "q")],
        json!({}),
    )
    .await;

    let all = server.search(json!({})).await;
    assert_eq!(all["totalHits"], 5);
    assert_eq!(flat_ids(&all), vec!["e", "d", "c", "b", "a"]);

    let page = server.search(json!({"pageSize": 2, "pageOffset": 2})).await;
    assert_eq!(page["totalHits"], 5);
    assert_eq!(flat_ids(&page), vec!["c", "b"]);

    let past_end = server.search(json!({"pageSize": 2, "pageOffset": 10})).await;
    assert_eq!(past_end["totalHits"], 5);
    assert!(flat_ids(&past_end).is_empty());

    // same through the sorted candidate path
    let past_end = server
        .search(json!({"sortBy": "started_at", "pageSize": 2, "pageOffset": 10}))
        .await;
    assert_eq!(past_end["totalHits"], 5);
    assert!(flat_ids(&past_end).is_empty());
}

#[tokio::test]
async fn test_date_range_bounds_are_inclusive() {
    let server = spawn_server(Embedder::None).await;
    let t = now_ms() - 600_000;
    seed(&server, t, &[("a", 0, "q"), ("b", 100, "q"), ("c", 200, "q")], json!({})).await;

    let groups = server
        .search(json!({"startDate": t + 100, "endDate": t + 200}))
        .await;
    assert_eq!(groups["totalHits"], 2);
    assert_eq!(flat_ids(&groups), vec!["c", "b"]);

    // outside the default window
    let old = now_ms() - 90 * 86_400_000;
    seed(&server, old, &[("ancient", 0, "q")], json!({})).await;
    let groups = server.search(json!({})).await;
    assert!(!flat_ids(&groups).contains(&"ancient".to_string()));
}

#[tokio::test]
async fn test_invalid_search_requests_rejected() {
    let server = spawn_server(Embedder::None).await;
    let now = now_ms();

    for body in [
        json!({"sortBy": "metrics.nonsense"}),
        json!({"sortBy": "trace_checks."}),
        json!({"pageSize": 0}),
        json!({"pageSize": 100_000}),
        json!({"startDate": now, "endDate": now - 1}),
    ] {
        let resp = server
            .post_api(&server.admin_token, "/traces/search", body.clone())
            .await;
        assert_eq!(resp.status(), 400, "expected 400 for {body}");
    }
}

#[tokio::test]
async fn test_structured_filters() {
    let server = spawn_server(Embedder::None).await;
    let t = now_ms() - 600_000;
    seed(
        &server,
        t,
        &[("a1", 0, "q"), ("a2", 10, "q")],
        json!({"user_id": "alice", "customer_id": "acme", "labels": ["vip", "beta"]}),
    )
    .await;
    seed(
        &server,
        t,
        &[("b1", 20, "q")],
        json!({"user_id": "bob", "customer_id": "globex", "labels": ["beta"]}),
    )
    .await;
    seed(&server, t, &[("n1", 30, "q")], json!({})).await;

    let groups = server.search(json!({"filters": {"user_id": "alice"}})).await;
    assert_eq!(groups["totalHits"], 2);
    assert_eq!(flat_ids(&groups), vec!["a2", "a1"]);

    let groups = server
        .search(json!({"filters": {"customer_ids": ["globex", "initech"]}}))
        .await;
    assert_eq!(flat_ids(&groups), vec!["b1"]);

    let groups = server.search(json!({"filters": {"labels": ["beta"]}})).await;
    assert_eq!(groups["totalHits"], 3);

    let groups = server
        .search(json!({"filters": {"labels": ["vip"], "user_id": "bob"}}))
        .await;
    assert_eq!(groups["totalHits"], 0);
    assert!(groups["groups"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_sort_by_cost_and_direction() {
    let server = spawn_server(Embedder::None).await;
    let t = now_ms() - 600_000;

    // longer text, more estimated tokens, higher cost
    for (id, offset, text) in [
        ("cheap", 0, "hi"),
        ("pricey", 10, "a considerably longer prompt that costs more to run"),
        ("mid", 20, "medium sized prompt"),
    ] {
        server
            .collect_ok(json!({"spans": [llm_span(&format!("{id}-s"), id, t + offset, text, text)]}))
            .await;
    }

    let groups = server
        .search(json!({"sortBy": "metrics.total_cost", "sortDirection": "desc"}))
        .await;
    assert_eq!(flat_ids(&groups), vec!["pricey", "mid", "cheap"]);

    let groups = server
        .search(json!({"sortBy": "metrics.total_cost", "sortDirection": "asc"}))
        .await;
    assert_eq!(flat_ids(&groups), vec!["cheap", "mid", "pricey"]);

    let groups = server
        .search(json!({"sortBy": "random", "pageSize": 3}))
        .await;
    let ids: HashSet<String> = flat_ids(&groups).into_iter().collect();
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn test_cost_hidden_without_cost_scope() {
    let server = spawn_server(Embedder::None).await;
    let t = now_ms() - 600_000;
    server
        .collect_ok(json!({"spans": [llm_span("l", "t1", t, "hello world", "hi there")]}))
        .await;

    let admin: Value = server
        .get_api(&server.admin_token, "/traces/t1")
        .await
        .json()
        .await
        .unwrap();
    assert!(admin["metrics"]["total_cost"].as_f64().unwrap() > 0.0);

    let resp = server
        .post_api(&server.viewer_token, "/traces/search", json!({}))
        .await;
    assert_eq!(resp.status(), 200);
    let groups: Value = resp.json().await.unwrap();
    let trace = &groups["groups"][0][0];
    assert!(trace["metrics"].get("total_cost").is_none());
    assert_eq!(trace["metrics"]["prompt_tokens"], 3);

    let resp = server
        .post_api(&server.viewer_token, "/traces/spans", json!({"traceIds": ["t1"]}))
        .await;
    let traces: Value = resp.json().await.unwrap();
    assert!(traces[0]["metrics"].get("total_cost").is_none());
    assert!(traces[0]["spans"][0]["metrics"].get("cost").is_none());
}

fn assert_no_cost(value: &Value, context: &str) {
    match value {
        Value::Object(map) => {
            for (key, item) in map {
                assert!(
                    key != "cost" && key != "total_cost",
                    "{context}: found {key} in {value}"
                );
                assert_no_cost(item, context);
            }
        }
        Value::Array(items) => items.iter().for_each(|item| assert_no_cost(item, context)),
        _ => {}
    }
}

#[tokio::test]
async fn test_cost_hidden_for_every_query_shape() {
    let server = spawn_server(Embedder::WordHash).await;
    let t = now_ms() - 600_000;

    let mut blocked_llm = llm_span("l1", "blocked", t, "refund please", "");
    blocked_llm["outputs"] = json!([]);
    server
        .collect_ok(json!({
            "spans": [blocked_llm, guardrail_span("g1", "blocked", t + 300, "pii-check", false)],
            "metadata": {"user_id": "u1", "thread_id": "th"}
        }))
        .await;
    server
        .collect_ok(json!({
            "spans": [llm_span("l2", "answered", t + 1_000, "refund status", "on its way")],
            "metadata": {"user_id": "u1", "thread_id": "th"}
        }))
        .await;

    let admin: Value = server
        .get_api(&server.admin_token, "/traces/blocked")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(admin["lastGuardrail"]["cost"]["amount"], 0.002);
    assert!(admin["metrics"]["total_cost"].as_f64().unwrap() > 0.002);

    for body in [
        json!({}),
        json!({"sortBy": "metrics.total_cost", "sortDirection": "asc"}),
        json!({"groupBy": "user_id"}),
        json!({"filters": {"user_id": "u1"}}),
        json!({"query": "refund"}),
        json!({
            "query": "refund",
            "sortBy": "metrics.total_cost",
            "groupBy": "user_id",
            "filters": {"thread_id": "th"}
        }),
    ] {
        let resp = server
            .post_api(&server.viewer_token, "/traces/search", body.clone())
            .await;
        assert_eq!(resp.status(), 200);
        let groups: Value = resp.json().await.unwrap();
        assert_eq!(groups["totalHits"], 2, "search {body}");
        let blocked = groups["groups"]
            .as_array()
            .unwrap()
            .iter()
            .flat_map(|g| g.as_array().unwrap())
            .find(|t| t["trace_id"] == "blocked")
            .unwrap();
        assert_eq!(blocked["lastGuardrail"]["passed"], false);
        assert_no_cost(&groups, &format!("search {body}"));
    }

    let trace: Value = server
        .get_api(&server.viewer_token, "/traces/blocked")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(trace["lastGuardrail"]["name"], "pii-check");
    assert_no_cost(&trace, "get trace");

    let thread: Value = server
        .get_api(&server.viewer_token, "/threads/th")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(thread.as_array().unwrap().len(), 2);
    assert_no_cost(&thread, "thread");

    let with_spans: Value = server
        .post_api(
            &server.viewer_token,
            "/traces/spans",
            json!({"traceIds": ["blocked", "answered"]}),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(with_spans.as_array().unwrap().len(), 2);
    assert_no_cost(&with_spans, "traces with spans");
}

#[tokio::test]
async fn test_group_by_user_id() {
    let server = spawn_server(Embedder::None).await;
    let t = now_ms() - 600_000;
    seed(&server, t, &[("u1-a", 0, "q"), ("u1-b", 20, "q")], json!({"user_id": "u1"})).await;
    seed(&server, t, &[("u2-a", 10, "q")], json!({"user_id": "u2"})).await;
    seed(&server, t, &[("anon", 30, "q")], json!({})).await;

    let groups = server.search(json!({"groupBy": "user_id"})).await;
    assert_eq!(groups["totalHits"], 4);
    assert_eq!(
        trace_ids(&groups),
        vec![vec!["anon"], vec!["u1-b", "u1-a"], vec!["u2-a"]]
    );
}

#[tokio::test]
async fn test_group_by_input_similarity() {
    let server = spawn_server(Embedder::WordHash).await;
    let t = now_ms() - 600_000;
    seed(
        &server,
        t,
        &[
            ("reset-1", 0, "how do I reset my password"),
            ("billing", 10, "question about my invoice total"),
            ("reset-2", 20, "how do I reset my password"),
        ],
        json!({}),
    )
    .await;

    let groups = server.search(json!({"groupBy": "input"})).await;
    assert_eq!(groups["totalHits"], 3);
    let groups = trace_ids(&groups);
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0], vec!["reset-2", "reset-1"]);
    assert_eq!(groups[1], vec!["billing"]);
}

#[tokio::test]
async fn test_free_text_query_ranks_lexical_matches_first() {
    let server = spawn_server(Embedder::WordHash).await;
    let t = now_ms() - 600_000;
    seed(
        &server,
        t,
        &[
            ("refund-a", 0, "how do I request a refund"),
            ("refund-b", 10, "refund refund please"),
            ("shipping", 20, "shipping times to canada"),
        ],
        json!({}),
    )
    .await;

    let groups = server.search(json!({"query": "refund"})).await;
    let ids = flat_ids(&groups);
    let top: HashSet<&str> = ids.iter().take(2).map(String::as_str).collect();
    assert_eq!(top, HashSet::from(["refund-a", "refund-b"]));
    assert_eq!(groups["totalHits"].as_u64().unwrap() as usize, ids.len());

    // an explicit sort reorders the matches
    let groups = server
        .search(json!({"query": "refund", "sortBy": "started_at", "sortDirection": "asc"}))
        .await;
    let ids = flat_ids(&groups);
    assert_eq!(ids[0], "refund-a");
    assert!(ids.iter().position(|id| id == "refund-a") < ids.iter().position(|id| id == "refund-b"));

    // filters still apply to retrieved hits
    let groups = server
        .search(json!({"query": "refund", "startDate": t + 5, "endDate": t + 15}))
        .await;
    assert_eq!(flat_ids(&groups), vec!["refund-b"]);
    assert_eq!(groups["totalHits"], 1);
}

#[tokio::test]
async fn test_free_text_query_needs_embeddings() {
    let server = spawn_server(Embedder::None).await;
    let resp = server
        .post_api(&server.admin_token, "/traces/search", json!({"query": "refund"}))
        .await;
    assert_eq!(resp.status(), 500);

    let server = spawn_server(Embedder::Unavailable).await;
    let resp = server
        .post_api(&server.admin_token, "/traces/search", json!({"query": "refund"}))
        .await;
    assert_eq!(resp.status(), 500);

    // blank query is no query
    let resp = server
        .post_api(&server.admin_token, "/traces/search", json!({"query": "   "}))
        .await;
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_last_guardrail_explains_empty_output() {
    let server = spawn_server(Embedder::None).await;
    tracelens::project::add_guardrail(&server.pool, &server.project.id, "pii-check", "PII Check")
        .await
        .unwrap();
    let t = now_ms() - 600_000;

    server
        .collect_ok(json!({
            "spans": [
                {
                    "span_id": "ask",
                    "trace_id": "blocked",
                    "type": "span",
                    "input": {"type": "text", "value": "tell me a secret"},
                    "timestamps": {"started_at": t, "finished_at": t + 100}
                },
                guardrail_span("g1", "blocked", t + 200, "toxicity", true),
                guardrail_span("g2", "blocked", t + 210, "pii-check", false),
            ]
        }))
        .await;
    server
        .collect_ok(json!({
            "spans": [
                span("ok-s", "answered", t + 300, "hi", "hello"),
                guardrail_span("g3", "answered", t + 400, "pii-check", false),
            ]
        }))
        .await;

    let trace: Value = server
        .get_api(&server.admin_token, "/traces/blocked")
        .await
        .json()
        .await
        .unwrap();
    assert!(trace.get("output").is_none());
    assert_eq!(trace["lastGuardrail"]["passed"], false);
    assert_eq!(trace["lastGuardrail"]["name"], "PII Check");

    let groups = server.search(json!({})).await;
    let answered = &groups["groups"][0][0];
    assert_eq!(answered["trace_id"], "answered");
    assert!(answered.get("lastGuardrail").is_none());
    assert_eq!(groups["groups"][1][0]["lastGuardrail"]["name"], "PII Check");
}

#[tokio::test]
async fn test_get_trace_not_found() {
    let server = spawn_server(Embedder::None).await;
    let resp = server.get_api(&server.admin_token, "/traces/missing").await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_traces_with_spans_in_tree_order() {
    let server = spawn_server(Embedder::None).await;
    let t = now_ms() - 600_000;

    let mut late_child = span("c2", "t1", t + 20, "b", "b");
    late_child["parent_id"] = json!("root");
    let mut early_child = span("c1", "t1", t + 10, "a", "a");
    early_child["parent_id"] = json!("root");
    let mut grandchild = span("g", "t1", t + 11, "a", "a");
    grandchild["parent_id"] = json!("c1");

    server
        .collect_ok(json!({
            "spans": [late_child, grandchild, span("root", "t1", t, "q", "a"), early_child]
        }))
        .await;

    let resp = server
        .post_api(
            &server.admin_token,
            "/traces/spans",
            json!({"traceIds": ["t1", "unknown"]}),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let traces: Value = resp.json().await.unwrap();
    assert_eq!(traces.as_array().unwrap().len(), 1);
    let order: Vec<&str> = traces[0]["spans"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["span_id"].as_str().unwrap())
        .collect();
    assert_eq!(order, vec!["root", "c1", "g", "c2"]);
}

#[tokio::test]
async fn test_thread_oldest_first() {
    let server = spawn_server(Embedder::None).await;
    let t = now_ms() - 600_000;
    seed(
        &server,
        t,
        &[("turn-3", 20, "q"), ("turn-1", 0, "q"), ("turn-2", 10, "q")],
        json!({"thread_id": "th-1"}),
    )
    .await;
    seed(&server, t, &[("elsewhere", 5, "q")], json!({"thread_id": "th-2"})).await;

    let resp = server.get_api(&server.viewer_token, "/threads/th-1").await;
    assert_eq!(resp.status(), 200);
    let traces: Value = resp.json().await.unwrap();
    let ids: Vec<&str> = traces
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["trace_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["turn-1", "turn-2", "turn-3"]);
}

#[tokio::test]
async fn test_trace_checks_filter_and_sort() {
    let server = spawn_server(Embedder::None).await;
    let t = now_ms() - 600_000;
    seed(&server, t, &[("low", 0, "q"), ("high", 10, "q"), ("unchecked", 20, "q")], json!({})).await;

    server
        .exec(
            "INSERT INTO trace_checks
                 (project_id, trace_id, check_id, check_type, check_name, status, passed, score, inserted_at)
             VALUES (?1, 'low', 'relevance', 'llm_judge', 'Relevance', 'done', 0, 0.2, 1),
                    (?1, 'high', 'relevance', 'llm_judge', 'Relevance', 'done', 1, 0.9, 1)",
            vec![server.project.id.clone()],
        )
        .await;

    let resp = server
        .post_api(
            &server.admin_token,
            "/traces/checks",
            json!({"traceIds": ["low", "high", "unchecked"]}),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let checks: Value = resp.json().await.unwrap();
    assert_eq!(checks["high"][0]["check_name"], "Relevance");
    assert_eq!(checks["low"][0]["passed"], false);
    assert!(checks.get("unchecked").is_none());

    let groups = server
        .search(json!({"filters": {"check_ids": ["relevance"]}}))
        .await;
    assert_eq!(groups["totalHits"], 2);

    let groups = server
        .search(json!({"sortBy": "trace_checks.relevance", "sortDirection": "desc"}))
        .await;
    let ids = flat_ids(&groups);
    assert_eq!(&ids[..2], &["high", "low"]);
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn test_topic_counts() {
    let server = spawn_server(Embedder::None).await;
    let t = now_ms() - 600_000;
    seed(
        &server,
        t,
        &[("b1", 0, "q"), ("b2", 10, "q")],
        json!({"topic_id": "billing", "subtopic_id": "refunds"}),
    )
    .await;
    seed(
        &server,
        t,
        &[("s1", 20, "q")],
        json!({"topic_id": "shipping", "user_id": "u9"}),
    )
    .await;
    server
        .exec(
            "INSERT INTO topics (project_id, id, name) VALUES (?1, 'billing', 'Billing')",
            vec![server.project.id.clone()],
        )
        .await;

    let resp = server
        .post_api(&server.admin_token, "/topics/counts", json!({}))
        .await;
    assert_eq!(resp.status(), 200);
    let counts: Value = resp.json().await.unwrap();
    assert_eq!(
        counts["topicCounts"],
        json!([
            {"id": "billing", "name": "Billing", "count": 2},
            {"id": "shipping", "count": 1}
        ])
    );
    assert_eq!(
        counts["subtopicCounts"],
        json!([{"id": "refunds", "count": 2}])
    );

    let resp = server
        .post_api(
            &server.admin_token,
            "/topics/counts",
            json!({"filters": {"user_id": "u9"}}),
        )
        .await;
    let counts: Value = resp.json().await.unwrap();
    assert_eq!(counts["topicCounts"], json!([{"id": "shipping", "count": 1}]));
}

#[tokio::test]
async fn test_topic_filter_matches_subtopics() {
    let server = spawn_server(Embedder::None).await;
    let t = now_ms() - 600_000;
    seed(&server, t, &[("top", 0, "q")], json!({"topic_id": "refunds"})).await;
    seed(
        &server,
        t,
        &[("sub", 10, "q")],
        json!({"topic_id": "billing", "subtopic_id": "refunds"}),
    )
    .await;
    seed(&server, t, &[("neither", 20, "q")], json!({"topic_id": "billing"})).await;

    let groups = server.search(json!({"filters": {"topics": ["refunds"]}})).await;
    assert_eq!(flat_ids(&groups), vec!["sub", "top"]);
}

#[tokio::test]
async fn test_customers_and_labels() {
    let server = spawn_server(Embedder::None).await;
    let t = now_ms() - 600_000;
    seed(&server, t, &[("a", 0, "q")], json!({"customer_id": "zeta", "labels": ["beta", "vip"]})).await;
    seed(&server, t, &[("b", 10, "q")], json!({"customer_id": "acme", "labels": ["beta"]})).await;
    seed(&server, t, &[("c", 20, "q")], json!({})).await;

    let resp = server
        .get_api(&server.viewer_token, "/customers-and-labels")
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["customers"], json!(["acme", "zeta"]));
    assert_eq!(body["labels"], json!(["beta", "vip"]));
}

#[tokio::test]
async fn test_health() {
    let server = spawn_server(Embedder::None).await;
    let resp = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["db_ok"], true);
}
