use crate::pipeline::metrics::{compute_trace_metrics, output_text};
use crate::types::{Span, SpanType, Trace, TraceMetadata, TraceText, TraceTimestamps};
use std::collections::{HashMap, HashSet};

/// Span trees deeper than this are flattened when walked.
pub const MAX_SPAN_DEPTH: usize = 256;

/// Spans whose parent is absent from the set (or unset).
fn top_level<'a>(spans: &'a [Span]) -> Vec<&'a Span> {
    let ids: HashSet<&str> = spans.iter().map(|s| s.span_id.as_str()).collect();
    let roots: Vec<&Span> = spans
        .iter()
        .filter(|s| {
            s.parent_id
                .as_deref()
                .map(|p| !ids.contains(p))
                .unwrap_or(true)
        })
        .collect();
    if roots.is_empty() {
        // every span sits on a parent cycle
        spans.iter().collect()
    } else {
        roots
    }
}

fn first_input(spans: &[Span]) -> Option<String> {
    let mut roots = top_level(spans);
    roots.sort_by(|a, b| {
        a.timestamps
            .started_at
            .cmp(&b.timestamps.started_at)
            .then_with(|| a.span_id.cmp(&b.span_id))
    });
    roots
        .into_iter()
        .filter_map(|s| s.input.as_ref().map(|i| i.to_text()))
        .find(|t| !t.is_empty())
}

fn last_output(spans: &[Span]) -> Option<String> {
    let mut roots = top_level(spans);
    roots.sort_by(|a, b| {
        a.timestamps
            .finished_at
            .cmp(&b.timestamps.finished_at)
            .then_with(|| a.span_id.cmp(&b.span_id))
    });
    roots
        .into_iter()
        .rev()
        .filter(|s| s.span_type != SpanType::Guardrail)
        .find_map(output_text)
}

/// Derive the trace document for `spans`, the complete stored span set of one trace.
///
/// `existing` is the previously stored trace, if any; its `inserted_at`,
/// metadata and topic assignment survive re-ingestion. Fields present in
/// `metadata` overwrite stored ones.
pub fn build_trace(
    project_id: &str,
    trace_id: &str,
    spans: &[Span],
    existing: Option<&Trace>,
    metadata: &TraceMetadata,
    now: i64,
) -> Trace {
    let mut merged_metadata = existing.map(|t| t.metadata.clone()).unwrap_or_default();
    merged_metadata.merge(metadata);

    let started_at = spans
        .iter()
        .map(|s| s.timestamps.started_at)
        .min()
        .or_else(|| existing.map(|t| t.timestamps.started_at))
        .unwrap_or(now);

    let error = {
        let mut by_start: Vec<&Span> = spans.iter().filter(|s| s.error.is_some()).collect();
        by_start.sort_by_key(|s| s.timestamps.started_at);
        by_start.first().and_then(|s| s.error.clone())
    };

    Trace {
        trace_id: trace_id.to_string(),
        project_id: project_id.to_string(),
        metadata: merged_metadata,
        input: TraceText {
            value: first_input(spans).unwrap_or_default(),
            embeddings: None,
        },
        output: last_output(spans).map(|value| TraceText {
            value,
            embeddings: None,
        }),
        metrics: compute_trace_metrics(spans),
        error,
        timestamps: TraceTimestamps {
            started_at,
            inserted_at: existing.map(|t| t.timestamps.inserted_at).unwrap_or(now),
        },
        last_guardrail: None,
    }
}

/// Depth-first order of a span forest. Parent cycles and trees deeper than
/// `MAX_SPAN_DEPTH` do not loop or recurse; unreached spans follow in start order.
pub fn span_tree_order(spans: &[Span]) -> Vec<&Span> {
    let mut children: HashMap<&str, Vec<&Span>> = HashMap::new();
    for span in spans {
        if let Some(parent) = span.parent_id.as_deref() {
            children.entry(parent).or_default().push(span);
        }
    }
    for list in children.values_mut() {
        list.sort_by_key(|s| s.timestamps.started_at);
    }

    let mut roots: Vec<&Span> = {
        let ids: HashSet<&str> = spans.iter().map(|s| s.span_id.as_str()).collect();
        spans
            .iter()
            .filter(|s| {
                s.parent_id
                    .as_deref()
                    .map(|p| !ids.contains(p))
                    .unwrap_or(true)
            })
            .collect()
    };
    roots.sort_by_key(|s| s.timestamps.started_at);

    let mut visited: HashSet<&str> = HashSet::with_capacity(spans.len());
    let mut ordered = Vec::with_capacity(spans.len());
    let mut stack: Vec<(&Span, usize)> = roots.into_iter().rev().map(|s| (s, 0)).collect();

    while let Some((span, depth)) = stack.pop() {
        if !visited.insert(span.span_id.as_str()) {
            continue;
        }
        ordered.push(span);
        if depth >= MAX_SPAN_DEPTH {
            continue;
        }
        if let Some(kids) = children.get(span.span_id.as_str()) {
            stack.extend(kids.iter().rev().map(|k| (*k, depth + 1)));
        }
    }

    if ordered.len() < spans.len() {
        let mut rest: Vec<&Span> = spans
            .iter()
            .filter(|s| !visited.contains(s.span_id.as_str()))
            .collect();
        rest.sort_by_key(|s| s.timestamps.started_at);
        ordered.extend(rest);
    }
    ordered
}
