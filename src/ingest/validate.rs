use crate::config::IngestConfig;
use crate::error::{AppError, AppResult};
use crate::types::{Span, SpanType};
use std::collections::HashMap;

fn check_id(field: &str, value: &str, max_len: usize) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field} is required"));
    }
    if value.chars().count() > max_len {
        return Err(format!("{field} exceeds {max_len} characters"));
    }
    Ok(())
}

/// Schema rules a span must satisfy beyond its JSON shape.
pub fn validate_span(span: &Span, config: &IngestConfig) -> Result<(), String> {
    check_id("span_id", &span.span_id, config.max_id_len)?;
    check_id("trace_id", &span.trace_id, config.max_id_len)?;
    if let Some(ref parent) = span.parent_id {
        check_id("parent_id", parent, config.max_id_len)?;
    }

    let ts = &span.timestamps;
    if ts.finished_at < ts.started_at {
        return Err("timestamps.finished_at is before timestamps.started_at".to_string());
    }
    if let Some(first_token) = ts.first_token_at {
        if first_token < ts.started_at || first_token > ts.finished_at {
            return Err("timestamps.first_token_at is outside the span".to_string());
        }
    }

    if span.span_type == SpanType::Llm && span.model.as_deref().map_or(true, str::is_empty) {
        return Err("model is required for llm spans".to_string());
    }

    let metrics = &span.metrics;
    if metrics.prompt_tokens.is_some_and(|t| t < 0)
        || metrics.completion_tokens.is_some_and(|t| t < 0)
    {
        return Err("token counts must be non-negative".to_string());
    }
    if metrics.cost.is_some_and(|c| c < 0.0 || !c.is_finite()) {
        return Err("cost must be a non-negative number".to_string());
    }
    Ok(())
}

/// Parse and validate a collector batch. Any invalid span rejects the whole batch.
///
/// A span id repeated within the batch keeps its last occurrence.
pub fn parse_batch(
    raw: Option<Vec<serde_json::Value>>,
    config: &IngestConfig,
) -> AppResult<Vec<Span>> {
    let raw = raw.ok_or_else(|| AppError::Validation("spans is required".to_string()))?;
    if raw.is_empty() {
        return Err(AppError::Validation("spans must not be empty".to_string()));
    }
    if raw.len() > config.max_batch_size {
        return Err(AppError::Validation(format!(
            "batch exceeds max size of {}",
            config.max_batch_size
        )));
    }

    let mut spans: Vec<Span> = Vec::with_capacity(raw.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for (i, value) in raw.into_iter().enumerate() {
        let span: Span = serde_json::from_value(value)
            .map_err(|e| AppError::Validation(format!("span {i}: {e}")))?;
        validate_span(&span, config).map_err(|e| AppError::Validation(format!("span {i}: {e}")))?;

        match positions.get(&span.span_id) {
            Some(&at) => spans[at] = span,
            None => {
                positions.insert(span.span_id.clone(), spans.len());
                spans.push(span);
            }
        }
    }
    Ok(spans)
}
