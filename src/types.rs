use serde::{Deserialize, Serialize};

// ── Typed values ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Money {
    pub amount: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardrailResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Money>,
}

/// A `{type, value}` payload attached to span inputs and outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TypedValue {
    Text(String),
    Raw(String),
    Json(serde_json::Value),
    ChatMessages(Vec<ChatMessage>),
    GuardrailResult(GuardrailResult),
}

impl TypedValue {
    /// Flatten to plain text for search, token counting and trace input/output.
    pub fn to_text(&self) -> String {
        match self {
            TypedValue::Text(s) | TypedValue::Raw(s) => s.clone(),
            TypedValue::Json(v) => match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            TypedValue::ChatMessages(messages) => messages
                .iter()
                .filter_map(|m| m.content.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
            TypedValue::GuardrailResult(result) => {
                serde_json::to_string(result).unwrap_or_default()
            }
        }
    }

    pub fn as_guardrail_result(&self) -> Option<&GuardrailResult> {
        match self {
            TypedValue::GuardrailResult(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorCapture {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stacktrace: Vec<String>,
}

// ── Spans ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpanType {
    Llm,
    Agent,
    Chain,
    Tool,
    Span,
    Rag,
    Guardrail,
}

impl SpanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanType::Llm => "llm",
            SpanType::Agent => "agent",
            SpanType::Chain => "chain",
            SpanType::Tool => "tool",
            SpanType::Span => "span",
            SpanType::Rag => "rag",
            SpanType::Guardrail => "guardrail",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpanMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_estimated: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanTimestamps {
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_token_at: Option<i64>,
    pub finished_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Span {
    #[serde(alias = "id")]
    pub span_id: String,
    pub trace_id: String,
    /// Always overwritten with the authenticated project at ingestion.
    #[serde(default)]
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(rename = "type")]
    pub span_type: SpanType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<TypedValue>,
    #[serde(default)]
    pub outputs: Vec<TypedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCapture>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub metrics: SpanMetrics,
    pub timestamps: SpanTimestamps,
}

// ── Traces ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Embeddings {
    pub model: String,
    pub embeddings: Vec<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TraceText {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<Embeddings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TraceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtopic_id: Option<String>,
}

impl TraceMetadata {
    /// Overlay the fields present in `other`, keeping existing values otherwise.
    pub fn merge(&mut self, other: &TraceMetadata) {
        if other.user_id.is_some() {
            self.user_id = other.user_id.clone();
        }
        if other.thread_id.is_some() {
            self.thread_id = other.thread_id.clone();
        }
        if other.customer_id.is_some() {
            self.customer_id = other.customer_id.clone();
        }
        if !other.labels.is_empty() {
            self.labels = other.labels.clone();
        }
        if other.topic_id.is_some() {
            self.topic_id = other.topic_id.clone();
        }
        if other.subtopic_id.is_some() {
            self.subtopic_id = other.subtopic_id.clone();
        }
    }
}

/// Derived from the span set. Absent fields mean no span reported them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TraceMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_token_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_time_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
    #[serde(default)]
    pub tokens_estimated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceTimestamps {
    pub started_at: i64,
    pub inserted_at: i64,
}

/// A failed guardrail surfaced on a trace whose output is empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastGuardrail {
    #[serde(flatten)]
    pub result: GuardrailResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trace {
    pub trace_id: String,
    pub project_id: String,
    #[serde(default)]
    pub metadata: TraceMetadata,
    #[serde(default)]
    pub input: TraceText,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<TraceText>,
    #[serde(default)]
    pub metrics: TraceMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCapture>,
    pub timestamps: TraceTimestamps,
    #[serde(
        rename = "lastGuardrail",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_guardrail: Option<LastGuardrail>,
}

impl Trace {
    pub fn has_empty_output(&self) -> bool {
        self.output
            .as_ref()
            .map(|o| o.value.trim().is_empty())
            .unwrap_or(true)
    }

    pub fn input_embeddings(&self) -> Option<&[f32]> {
        self.input.embeddings.as_ref().map(|e| e.embeddings.as_slice())
    }

    pub fn output_embeddings(&self) -> Option<&[f32]> {
        self.output
            .as_ref()
            .and_then(|o| o.embeddings.as_ref())
            .map(|e| e.embeddings.as_slice())
    }

    pub fn strip_embeddings(&mut self) {
        self.input.embeddings = None;
        if let Some(output) = self.output.as_mut() {
            output.embeddings = None;
        }
    }
}

// ── Evaluation checks ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceCheck {
    pub trace_id: String,
    pub check_id: String,
    pub check_type: String,
    pub check_name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub inserted_at: i64,
}

// ── Query envelopes ──

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceGroups {
    pub groups: Vec<Vec<Trace>>,
    pub total_hits: usize,
}

#[derive(Debug, Serialize)]
pub struct TraceWithSpans {
    #[serde(flatten)]
    pub trace: Trace,
    pub spans: Vec<Span>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TopicCount {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub count: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicCounts {
    pub topic_counts: Vec<TopicCount>,
    pub subtopic_counts: Vec<TopicCount>,
}

#[derive(Debug, Serialize)]
pub struct CustomersAndLabels {
    pub customers: Vec<String>,
    pub labels: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub db_ok: bool,
}
