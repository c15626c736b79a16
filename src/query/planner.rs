use crate::auth::permission::{check, redact_span_fields, redact_trace_fields, Capability, PermissionAuthority};
use crate::config::QueryConfig;
use crate::embeddings::EmbeddingsProvider;
use crate::error::{AppError, AppResult};
use crate::pipeline::trace_builder::span_tree_order;
use crate::query::filters::{DateRange, FilterRequest, ResolvedSearch, TraceSearchRequest};
use crate::query::guardrails::last_failed_guardrail;
use crate::query::grouping::group_traces;
use crate::storage::pivot::PivotQuery;
use crate::storage::search::{lexical_hits, reciprocal_rank_fusion, vector_hits, RankedList};
use crate::storage::{self, traces};
use crate::types::{
    CustomersAndLabels, TopicCounts, Trace, TraceCheck, TraceGroups, TraceWithSpans,
};
use deadpool_sqlite::Pool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Longest conversation returned by a thread lookup.
pub const MAX_THREAD_TRACES: usize = 1000;

pub struct QueryState {
    pub config: QueryConfig,
    pub pool: Pool,
    pub embeddings: Option<Arc<dyn EmbeddingsProvider>>,
}

async fn embed_query(state: &QueryState, query: &str) -> AppResult<Vec<f32>> {
    let provider = state.embeddings.as_ref().ok_or_else(|| {
        AppError::Dependency("search by query requires an embeddings provider".to_string())
    })?;
    let embeddings = provider
        .embed(query)
        .await
        .map_err(|e| AppError::Dependency(format!("failed to embed query: {e}")))?;
    Ok(embeddings.embeddings)
}

/// Grouped, paginated trace search for one project.
pub async fn get_all_for_project(
    state: &QueryState,
    caller: &dyn PermissionAuthority,
    project_id: &str,
    request: TraceSearchRequest,
) -> AppResult<TraceGroups> {
    check(caller, project_id, Capability::MessagesView).require()?;

    let now = chrono::Utc::now().timestamp_millis();
    let search = ResolvedSearch::from_request(request, &state.config, now)?;

    let query_vector = match search.query {
        Some(ref q) => Some(embed_query(state, q).await?),
        None => None,
    };

    let (mut page, total) = if search.needs_pivot() {
        fetch_pivoted(state, project_id, &search, query_vector).await?
    } else {
        let project = project_id.to_string();
        let range = search.range;
        let (offset, size) = (search.offset, search.size);
        storage::interact(&state.pool, move |conn| {
            traces::page_traces(conn, &project, &range, offset, size)
        })
        .await?
    };

    attach_last_guardrails(&state.pool, project_id, &mut page).await?;

    if !check(caller, project_id, Capability::CostView).is_granted() {
        page.iter_mut().for_each(redact_trace_fields);
    }

    let mut groups = group_traces(search.group_by, page);
    for trace in groups.iter_mut().flatten() {
        trace.strip_embeddings();
    }

    tracing::debug!(
        project_id = %project_id,
        groups = groups.len(),
        total_hits = total,
        "trace search"
    );
    Ok(TraceGroups {
        groups,
        total_hits: total,
    })
}

/// Candidate resolution followed by either an ordered fetch or hybrid retrieval.
async fn fetch_pivoted(
    state: &QueryState,
    project_id: &str,
    search: &ResolvedSearch,
    query_vector: Option<Vec<f32>>,
) -> AppResult<(Vec<Trace>, usize)> {
    let config = state.config.clone();
    let project = project_id.to_string();
    let search = search.clone();

    storage::interact(&state.pool, move |conn| {
        let has_query = search.query.is_some();
        let (candidates, total) = PivotQuery {
            project_id: &project,
            range: &search.range,
            filters: &search.filters,
            sort: search.sort.as_ref(),
            offset: if has_query { 0 } else { search.offset },
            limit: if has_query {
                config.max_candidates
            } else {
                search.size
            },
        }
        .resolve(conn)?;

        if candidates.is_empty() {
            return Ok((Vec::new(), if has_query { 0 } else { total }));
        }

        let Some(query) = search.query.as_deref() else {
            let page = traces::load_traces(conn, &project, &candidates)?;
            return Ok((page, total));
        };

        let lexical = lexical_hits(conn, &project, &candidates, query, config.rrf_window)?;
        let vector = match query_vector {
            Some(ref v) => vector_hits(conn, &project, &candidates, v, config.knn_k)?,
            None => Vec::new(),
        };
        let fused = reciprocal_rank_fusion(
            &[
                RankedList {
                    ids: &lexical,
                    weight: config.lexical_weight,
                },
                RankedList {
                    ids: &vector,
                    weight: 1.0,
                },
            ],
            config.rrf_rank_constant,
            config.rrf_window,
        );
        let mut ranked: Vec<String> = fused.into_iter().map(|(id, _)| id).collect();

        // an explicit sort outranks relevance
        if search.sort.is_some() {
            let position: HashMap<&str, usize> = candidates
                .iter()
                .enumerate()
                .map(|(i, id)| (id.as_str(), i))
                .collect();
            ranked.sort_by_key(|id| position.get(id.as_str()).copied().unwrap_or(usize::MAX));
        }

        let hits = traces::load_traces(conn, &project, &ranked)?;
        let filtered = post_filter(hits, &project, &search.range, &candidates);
        let total = filtered.len();
        let page = filtered
            .into_iter()
            .skip(search.offset)
            .take(search.size)
            .collect();
        Ok((page, total))
    })
    .await
}

/// Reapply scope, date range and candidate membership to retrieved traces.
fn post_filter(
    hits: Vec<Trace>,
    project_id: &str,
    range: &DateRange,
    candidates: &[String],
) -> Vec<Trace> {
    let allowed: HashSet<&str> = candidates.iter().map(String::as_str).collect();
    hits.into_iter()
        .filter(|t| {
            t.project_id == project_id
                && range.contains(t.timestamps.started_at)
                && allowed.contains(t.trace_id.as_str())
        })
        .collect()
}

/// Explain empty outputs with the last failed guardrail, fetching spans in one call.
async fn attach_last_guardrails(
    pool: &Pool,
    project_id: &str,
    page: &mut [Trace],
) -> AppResult<()> {
    let empty: Vec<String> = page
        .iter()
        .filter(|t| t.has_empty_output())
        .map(|t| t.trace_id.clone())
        .collect();
    if empty.is_empty() {
        return Ok(());
    }

    let project = project_id.to_string();
    let (spans, names) = storage::interact(pool, move |conn| {
        let spans = traces::load_spans(conn, &project, &empty)?;
        let names = traces::guardrail_names(conn, &project)?;
        Ok((spans, names))
    })
    .await?;

    for trace in page.iter_mut().filter(|t| t.has_empty_output()) {
        if let Some(trace_spans) = spans.get(&trace.trace_id) {
            trace.last_guardrail = last_failed_guardrail(trace_spans, &names);
        }
    }
    Ok(())
}

fn finish(trace: &mut Trace, show_cost: bool) {
    trace.strip_embeddings();
    if !show_cost {
        redact_trace_fields(trace);
    }
}

pub async fn get_trace(
    state: &QueryState,
    caller: &dyn PermissionAuthority,
    project_id: &str,
    trace_id: &str,
) -> AppResult<Trace> {
    check(caller, project_id, Capability::MessagesView).require()?;

    let (project, id) = (project_id.to_string(), trace_id.to_string());
    let trace = storage::interact(&state.pool, move |conn| traces::get_trace(conn, &project, &id))
        .await?
        .ok_or_else(|| AppError::NotFound(format!("trace {trace_id} not found")))?;

    let mut page = vec![trace];
    attach_last_guardrails(&state.pool, project_id, &mut page).await?;
    let show_cost = check(caller, project_id, Capability::CostView).is_granted();
    let mut trace = page.remove(0);
    finish(&mut trace, show_cost);
    Ok(trace)
}

fn check_id_list(trace_ids: &[String], config: &QueryConfig) -> AppResult<()> {
    if trace_ids.len() > config.max_page_size {
        return Err(AppError::Validation(format!(
            "traceIds exceeds {} entries",
            config.max_page_size
        )));
    }
    Ok(())
}

/// Traces with their spans in tree order. Unknown ids are omitted.
pub async fn get_traces_with_spans(
    state: &QueryState,
    caller: &dyn PermissionAuthority,
    project_id: &str,
    trace_ids: Vec<String>,
) -> AppResult<Vec<TraceWithSpans>> {
    check(caller, project_id, Capability::MessagesView).require()?;
    check_id_list(&trace_ids, &state.config)?;
    let show_cost = check(caller, project_id, Capability::CostView).is_granted();

    let project = project_id.to_string();
    let (found, mut spans) = storage::interact(&state.pool, move |conn| {
        let found = traces::load_traces(conn, &project, &trace_ids)?;
        let spans = traces::load_spans(conn, &project, &trace_ids)?;
        Ok((found, spans))
    })
    .await?;

    Ok(found
        .into_iter()
        .map(|mut trace| {
            finish(&mut trace, show_cost);
            let trace_spans = spans.remove(&trace.trace_id).unwrap_or_default();
            let mut ordered: Vec<_> = span_tree_order(&trace_spans).into_iter().cloned().collect();
            if !show_cost {
                ordered.iter_mut().for_each(redact_span_fields);
            }
            TraceWithSpans {
                trace,
                spans: ordered,
            }
        })
        .collect())
}

pub async fn get_trace_checks(
    state: &QueryState,
    caller: &dyn PermissionAuthority,
    project_id: &str,
    trace_ids: Vec<String>,
) -> AppResult<HashMap<String, Vec<TraceCheck>>> {
    check(caller, project_id, Capability::MessagesView).require()?;
    check_id_list(&trace_ids, &state.config)?;

    let project = project_id.to_string();
    storage::interact(&state.pool, move |conn| {
        traces::trace_checks(conn, &project, &trace_ids)
    })
    .await
}

/// Every trace of a conversation thread, oldest first.
pub async fn get_thread(
    state: &QueryState,
    caller: &dyn PermissionAuthority,
    project_id: &str,
    thread_id: &str,
) -> AppResult<Vec<Trace>> {
    check(caller, project_id, Capability::MessagesView).require()?;
    let show_cost = check(caller, project_id, Capability::CostView).is_granted();

    let (project, thread) = (project_id.to_string(), thread_id.to_string());
    let mut thread_traces = storage::interact(&state.pool, move |conn| {
        traces::traces_by_thread(conn, &project, &thread, MAX_THREAD_TRACES)
    })
    .await?;

    attach_last_guardrails(&state.pool, project_id, &mut thread_traces).await?;
    for trace in thread_traces.iter_mut() {
        finish(trace, show_cost);
    }
    Ok(thread_traces)
}

pub async fn get_topic_counts(
    state: &QueryState,
    caller: &dyn PermissionAuthority,
    project_id: &str,
    request: FilterRequest,
) -> AppResult<TopicCounts> {
    check(caller, project_id, Capability::MessagesView).require()?;

    let now = chrono::Utc::now().timestamp_millis();
    let range = DateRange::resolve(
        request.start_date,
        request.end_date,
        state.config.default_date_range_days,
        now,
    )?;
    let project = project_id.to_string();
    let filters = request.filters;
    storage::interact(&state.pool, move |conn| {
        traces::topic_counts(conn, &project, &range, &filters)
    })
    .await
}

pub async fn get_customers_and_labels(
    state: &QueryState,
    caller: &dyn PermissionAuthority,
    project_id: &str,
) -> AppResult<CustomersAndLabels> {
    check(caller, project_id, Capability::MessagesView).require()?;

    let project = project_id.to_string();
    storage::interact(&state.pool, move |conn| {
        traces::customers_and_labels(conn, &project)
    })
    .await
}
