//! Builders shared by unit tests.

use crate::types::{
    Span, SpanMetrics, SpanTimestamps, SpanType, Trace, TraceMetadata, TraceMetrics, TraceText,
    TraceTimestamps,
};

pub fn span(id: &str, trace_id: &str, started_at: i64) -> Span {
    Span {
        span_id: id.to_string(),
        trace_id: trace_id.to_string(),
        project_id: "p1".to_string(),
        parent_id: None,
        span_type: SpanType::Span,
        name: None,
        vendor: None,
        model: None,
        input: None,
        outputs: Vec::new(),
        error: None,
        params: None,
        metrics: SpanMetrics::default(),
        timestamps: SpanTimestamps {
            started_at,
            first_token_at: None,
            finished_at: started_at + 10,
        },
    }
}

pub fn trace(id: &str, started_at: i64) -> Trace {
    Trace {
        trace_id: id.to_string(),
        project_id: "p1".to_string(),
        metadata: TraceMetadata::default(),
        input: TraceText {
            value: format!("input of {id}"),
            embeddings: None,
        },
        output: Some(TraceText {
            value: format!("output of {id}"),
            embeddings: None,
        }),
        metrics: TraceMetrics::default(),
        error: None,
        timestamps: TraceTimestamps {
            started_at,
            inserted_at: started_at,
        },
        last_guardrail: None,
    }
}
