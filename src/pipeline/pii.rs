use crate::types::{Span, Trace, TypedValue};
use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;

pub const REDACTION_MARKER: &str = "[REDACTED]";

pub const KNOWN_DETECTORS: &[&str] = &["credit_card", "email"];

// Runs of ASCII digit groups joined by single spaces or dashes. Card numbers
// are searched for inside each run, aligned to group boundaries.
static DIGIT_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[0-9]+(?:[ -][0-9]+)*\b").unwrap());

static DIGIT_GROUP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9]+").unwrap());

const CARD_DIGITS: std::ops::RangeInclusive<usize> = 13..=19;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}\b").unwrap()
});

/// Finds byte ranges of sensitive content in a string.
pub trait PiiDetector: Send + Sync {
    fn find(&self, text: &str) -> Vec<Range<usize>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pattern {
    CreditCard,
    Email,
}

/// Regex-based detector for card numbers (Luhn-checked) and e-mail addresses.
#[derive(Debug, Clone)]
pub struct PatternDetector {
    patterns: Vec<Pattern>,
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self {
            patterns: vec![Pattern::CreditCard, Pattern::Email],
        }
    }
}

impl PatternDetector {
    /// Build from detector names; unknown names are skipped (config validation rejects them).
    pub fn from_names(names: &[String]) -> Self {
        let patterns = names
            .iter()
            .filter_map(|name| match name.as_str() {
                "credit_card" => Some(Pattern::CreditCard),
                "email" => Some(Pattern::Email),
                _ => None,
            })
            .collect();
        Self { patterns }
    }
}

impl PiiDetector for PatternDetector {
    fn find(&self, text: &str) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        for pattern in &self.patterns {
            match pattern {
                Pattern::CreditCard => ranges.extend(card_ranges(text)),
                Pattern::Email => ranges.extend(EMAIL_RE.find_iter(text).map(|m| m.range())),
            }
        }
        ranges
    }
}

/// Luhn-valid card numbers inside digit runs.
///
/// Each candidate spans whole groups of one run, so a CVV after the number or
/// a quantity before it does not hide the card. From each starting group the
/// longest valid candidate wins and scanning resumes after it.
fn card_ranges(text: &str) -> Vec<Range<usize>> {
    let mut found = Vec::new();
    for run in DIGIT_RUN_RE.find_iter(text) {
        let groups: Vec<Range<usize>> = DIGIT_GROUP_RE
            .find_iter(run.as_str())
            .map(|g| run.start() + g.start()..run.start() + g.end())
            .collect();

        let mut first = 0;
        while first < groups.len() {
            let mut digits = 0;
            let mut best = None;
            for (last, group) in groups.iter().enumerate().skip(first) {
                digits += group.len();
                if digits > *CARD_DIGITS.end() {
                    break;
                }
                let candidate = groups[first].start..group.end;
                if CARD_DIGITS.contains(&digits) && luhn_valid(&text[candidate.clone()]) {
                    best = Some((last, candidate));
                }
            }
            match best {
                Some((last, candidate)) => {
                    found.push(candidate);
                    first = last + 1;
                }
                None => first += 1,
            }
        }
    }
    found
}

fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !CARD_DIGITS.contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// Replace every detected range with the marker. Returns true if anything changed.
pub fn redact_text(detector: &dyn PiiDetector, text: &mut String) -> bool {
    let mut ranges = detector.find(text);
    if ranges.is_empty() {
        return false;
    }

    ranges.sort_by_key(|r| r.start);
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }

    for range in merged.into_iter().rev() {
        text.replace_range(range, REDACTION_MARKER);
    }
    true
}

fn redact_json(detector: &dyn PiiDetector, value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            redact_text(detector, s);
        }
        serde_json::Value::Array(items) => {
            for item in items {
                redact_json(detector, item);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                redact_json(detector, item);
            }
        }
        _ => {}
    }
}

pub fn redact_typed_value(detector: &dyn PiiDetector, value: &mut TypedValue) {
    match value {
        TypedValue::Text(s) | TypedValue::Raw(s) => {
            redact_text(detector, s);
        }
        TypedValue::Json(v) => redact_json(detector, v),
        TypedValue::ChatMessages(messages) => {
            for content in messages.iter_mut().filter_map(|m| m.content.as_mut()) {
                redact_text(detector, content);
            }
        }
        TypedValue::GuardrailResult(result) => {
            if let Some(details) = result.details.as_mut() {
                redact_text(detector, details);
            }
        }
    }
}

pub fn redact_span(detector: &dyn PiiDetector, span: &mut Span) {
    if let Some(input) = span.input.as_mut() {
        redact_typed_value(detector, input);
    }
    for output in span.outputs.iter_mut() {
        redact_typed_value(detector, output);
    }
}

pub fn redact_trace(detector: &dyn PiiDetector, trace: &mut Trace) {
    redact_text(detector, &mut trace.input.value);
    if let Some(output) = trace.output.as_mut() {
        redact_text(detector, &mut output.value);
    }
}

/// Scrub a trace and its spans in place when redaction is enabled for the project.
pub fn redact(detector: &dyn PiiDetector, trace: &mut Trace, spans: &mut [Span], enabled: bool) {
    if !enabled {
        return;
    }
    redact_trace(detector, trace);
    for span in spans.iter_mut() {
        redact_span(detector, span);
    }
}
