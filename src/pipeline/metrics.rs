use crate::pricing::TokenEstimator;
use crate::types::{Span, SpanType, TraceMetrics, TypedValue};
use std::ops::AddAssign;

/// Running sum that stays `None` until something is added, so "nothing
/// reported" stays distinct from zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OptionalSum<T>(Option<T>);

impl<T: Copy + AddAssign> OptionalSum<T> {
    pub fn add(&mut self, value: Option<T>) {
        if let Some(v) = value {
            match self.0.as_mut() {
                Some(total) => *total += v,
                None => self.0 = Some(v),
            }
        }
    }

    pub fn get(self) -> Option<T> {
        self.0
    }
}

/// Derive trace-level timing, token and cost aggregates from a span set.
pub fn compute_trace_metrics(spans: &[Span]) -> TraceMetrics {
    let earliest_start = spans.iter().map(|s| s.timestamps.started_at).min();
    let latest_first_token = spans
        .iter()
        .filter_map(|s| s.timestamps.first_token_at)
        .max();
    let latest_finish = spans.iter().map(|s| s.timestamps.finished_at).max();

    let mut prompt_tokens = OptionalSum::default();
    let mut completion_tokens = OptionalSum::default();
    let mut total_cost = OptionalSum::default();
    let mut tokens_estimated = false;

    for span in spans {
        prompt_tokens.add(span.metrics.prompt_tokens);
        completion_tokens.add(span.metrics.completion_tokens);
        total_cost.add(span.metrics.cost);
        tokens_estimated |= span.metrics.tokens_estimated.unwrap_or(false);
    }

    TraceMetrics {
        first_token_ms: earliest_start
            .zip(latest_first_token)
            .map(|(start, first)| first - start),
        total_time_ms: earliest_start
            .zip(latest_finish)
            .map(|(start, finish)| finish - start),
        prompt_tokens: prompt_tokens.get(),
        completion_tokens: completion_tokens.get(),
        total_cost: total_cost.get(),
        tokens_estimated,
    }
}

/// Fill in token counts the SDK did not report on `llm` spans, then price them.
pub fn estimate_missing_tokens(spans: &mut [Span], estimator: &dyn TokenEstimator) {
    for span in spans.iter_mut().filter(|s| s.span_type == SpanType::Llm) {
        let model = span.model.clone().unwrap_or_default();

        if span.metrics.prompt_tokens.is_none() {
            if let Some(input) = span.input.as_ref() {
                span.metrics.prompt_tokens = Some(estimator.count_tokens(&model, &input.to_text()));
                span.metrics.tokens_estimated = Some(true);
            }
        }

        if span.metrics.completion_tokens.is_none() && !span.outputs.is_empty() {
            let count = span
                .outputs
                .iter()
                .map(|output| estimator.count_tokens(&model, &output.to_text()))
                .sum();
            span.metrics.completion_tokens = Some(count);
            span.metrics.tokens_estimated = Some(true);
        }

        span.metrics.cost = estimator.estimate_cost(
            &model,
            span.metrics.prompt_tokens.unwrap_or(0),
            span.metrics.completion_tokens.unwrap_or(0),
        );
    }
}

/// Copy guardrail-reported USD costs onto their spans. Other currencies are
/// logged and left alone.
pub fn apply_guardrail_costs(spans: &mut [Span]) {
    for span in spans.iter_mut() {
        for output in &span.outputs {
            let Some(cost) = output
                .as_guardrail_result()
                .and_then(|result| result.cost.as_ref())
            else {
                continue;
            };

            if cost.currency.eq_ignore_ascii_case("USD") {
                span.metrics.cost = Some(cost.amount);
            } else {
                tracing::warn!(
                    span_id = %span.span_id,
                    trace_id = %span.trace_id,
                    currency = %cost.currency,
                    amount = cost.amount,
                    "guardrail cost in unsupported currency ignored"
                );
            }
        }
    }
}

/// Plain text of a span's outputs, skipping guardrail results.
pub fn output_text(span: &Span) -> Option<String> {
    let texts: Vec<String> = span
        .outputs
        .iter()
        .filter(|o| !matches!(o, TypedValue::GuardrailResult(_)))
        .map(|o| o.to_text())
        .filter(|t| !t.is_empty())
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}
