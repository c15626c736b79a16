use crate::config::IngestConfig;
use crate::embeddings::EmbeddingsProvider;
use crate::error::{AppResult, LoggedJson};
use crate::ingest::auth::ProjectAuth;
use crate::ingest::validate::parse_batch;
use crate::pipeline::metrics::{apply_guardrail_costs, estimate_missing_tokens};
use crate::pipeline::pii::{self, PiiDetector};
use crate::pipeline::trace_builder::build_trace;
use crate::pricing::TokenEstimator;
use crate::storage::{self, traces, writer};
use crate::types::{Embeddings, Span, Trace, TraceMetadata};
use axum::extract::State;
use axum::{Extension, Json};
use deadpool_sqlite::Pool;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub struct IngestState {
    pub config: IngestConfig,
    pub pool: Pool,
    pub estimator: Arc<dyn TokenEstimator>,
    pub detector: Arc<dyn PiiDetector>,
    pub embeddings: Option<Arc<dyn EmbeddingsProvider>>,
}

#[derive(Debug, Deserialize)]
pub struct CollectorRequest {
    #[serde(default)]
    pub spans: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub metadata: TraceMetadata,
}

#[derive(Debug, Serialize)]
pub struct CollectorResponse {
    pub message: String,
    pub spans: usize,
    pub traces: usize,
}

/// POST /collector
pub async fn collect(
    State(state): State<Arc<IngestState>>,
    Extension(project): Extension<ProjectAuth>,
    LoggedJson(request): LoggedJson<CollectorRequest>,
) -> AppResult<Json<CollectorResponse>> {
    let (spans, traces) = ingest(&state, &project, request).await?;
    Ok(Json(CollectorResponse {
        message: "Trace received successfully.".to_string(),
        spans,
        traces,
    }))
}

/// Validate, enrich and persist one collector batch. Returns (spans, traces) written.
pub async fn ingest(
    state: &IngestState,
    project: &ProjectAuth,
    request: CollectorRequest,
) -> AppResult<(usize, usize)> {
    let mut spans = parse_batch(request.spans, &state.config)?;
    for span in spans.iter_mut() {
        span.project_id = project.project_id.clone();
    }

    estimate_missing_tokens(&mut spans, state.estimator.as_ref());
    apply_guardrail_costs(&mut spans);

    // batch spans per trace, in first-seen trace order
    let mut trace_ids: Vec<String> = Vec::new();
    let mut by_trace: HashMap<String, Vec<Span>> = HashMap::new();
    for span in spans {
        if !by_trace.contains_key(&span.trace_id) {
            trace_ids.push(span.trace_id.clone());
        }
        by_trace.entry(span.trace_id.clone()).or_default().push(span);
    }

    let project_id = project.project_id.clone();
    let ids = trace_ids.clone();
    let (mut stored_spans, stored_traces) = storage::interact(&state.pool, move |conn| {
        let spans = traces::load_spans(conn, &project_id, &ids)?;
        let traces = traces::load_trace_map(conn, &project_id, &ids)?;
        Ok((spans, traces))
    })
    .await?;

    let now = chrono::Utc::now().timestamp_millis();
    let mut to_write_spans: Vec<Span> = Vec::new();
    let mut to_write_traces: Vec<Trace> = Vec::with_capacity(trace_ids.len());

    for trace_id in &trace_ids {
        let mut batch = by_trace.remove(trace_id).unwrap_or_default();

        let mut merged: Vec<Span> = stored_spans.remove(trace_id).unwrap_or_default();
        for span in &batch {
            match merged.iter_mut().find(|s| s.span_id == span.span_id) {
                Some(existing) => *existing = span.clone(),
                None => merged.push(span.clone()),
            }
        }

        let mut trace = build_trace(
            &project.project_id,
            trace_id,
            &merged,
            stored_traces.get(trace_id),
            &request.metadata,
            now,
        );
        pii::redact(
            state.detector.as_ref(),
            &mut trace,
            &mut batch,
            project.pii_redaction,
        );

        to_write_spans.extend(batch);
        to_write_traces.push(trace);
    }

    if let Some(ref provider) = state.embeddings {
        attach_embeddings(provider.as_ref(), &mut to_write_traces).await;
    }

    let span_count = to_write_spans.len();
    let trace_count = to_write_traces.len();
    writer::write_batch(&state.pool, to_write_spans, to_write_traces).await?;

    tracing::info!(
        project_id = %project.project_id,
        spans = span_count,
        traces = trace_count,
        "spans ingested"
    );
    Ok((span_count, trace_count))
}

/// Embed trace input and output text in one provider call. Failures leave traces without vectors.
async fn attach_embeddings(provider: &dyn EmbeddingsProvider, traces: &mut [Trace]) {
    // (trace index, is_output)
    let mut slots: Vec<(usize, bool)> = Vec::new();
    let mut texts: Vec<String> = Vec::new();
    for (i, trace) in traces.iter().enumerate() {
        if !trace.input.value.trim().is_empty() {
            slots.push((i, false));
            texts.push(trace.input.value.clone());
        }
        if let Some(ref output) = trace.output {
            if !output.value.trim().is_empty() {
                slots.push((i, true));
                texts.push(output.value.clone());
            }
        }
    }
    if texts.is_empty() {
        return;
    }

    let vectors = match provider.embed_batch(&texts).await {
        Ok(vectors) => vectors,
        Err(e) => {
            tracing::warn!(error = %e, texts = texts.len(), "embedding failed, storing traces without vectors");
            return;
        }
    };

    for ((index, is_output), vector) in slots.into_iter().zip(vectors) {
        let embeddings = Some(Embeddings {
            model: provider.model().to_string(),
            embeddings: vector,
        });
        let trace = &mut traces[index];
        if is_output {
            if let Some(output) = trace.output.as_mut() {
                output.embeddings = embeddings;
            }
        } else {
            trace.input.embeddings = embeddings;
        }
    }
}
