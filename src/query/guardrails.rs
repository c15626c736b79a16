use crate::types::{LastGuardrail, Span, SpanType};
use std::collections::HashMap;

/// The failed guardrail that explains an empty trace output, if any.
///
/// Spans are ordered by start time and scanned from the end: the trailing run
/// of non-guardrail spans is skipped, then the first failed result inside the
/// guardrail run that precedes it wins. The scan stops at the next
/// non-guardrail span.
pub fn last_failed_guardrail(
    spans: &[Span],
    names: &HashMap<String, String>,
) -> Option<LastGuardrail> {
    let mut ordered: Vec<&Span> = spans.iter().collect();
    ordered.sort_by(|a, b| {
        a.timestamps
            .started_at
            .cmp(&b.timestamps.started_at)
            .then_with(|| a.span_id.cmp(&b.span_id))
    });

    let run = ordered
        .into_iter()
        .rev()
        .skip_while(|s| s.span_type != SpanType::Guardrail)
        .take_while(|s| s.span_type == SpanType::Guardrail);

    for span in run {
        let failed = span
            .outputs
            .iter()
            .filter_map(|o| o.as_guardrail_result())
            .find(|r| !r.passed);
        if let Some(result) = failed {
            let name = span
                .name
                .as_ref()
                .map(|slug| names.get(slug).cloned().unwrap_or_else(|| slug.clone()));
            return Some(LastGuardrail {
                result: result.clone(),
                name,
            });
        }
    }
    None
}
