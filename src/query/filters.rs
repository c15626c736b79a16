use crate::config::QueryConfig;
use crate::error::{AppError, AppResult};
use crate::query::grouping::GroupBy;
use serde::Deserialize;

/// Structured trace filters. Empty lists and unset fields do not filter.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TraceFilters {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub customer_ids: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Matches either topic or subtopic.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Traces that have a result for any of these evaluation checks.
    #[serde(default)]
    pub check_ids: Vec<String>,
}

impl TraceFilters {
    pub fn is_active(&self) -> bool {
        self.user_id.is_some()
            || self.thread_id.is_some()
            || !self.customer_ids.is_empty()
            || !self.labels.is_empty()
            || !self.topics.is_empty()
            || !self.check_ids.is_empty()
    }
}

/// Inclusive range over `timestamps.started_at`, epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: i64,
    pub end: i64,
}

impl DateRange {
    pub fn resolve(
        start: Option<i64>,
        end: Option<i64>,
        default_days: i64,
        now: i64,
    ) -> AppResult<Self> {
        let end = end.unwrap_or(now);
        let start = start.unwrap_or(end - default_days * 86_400_000);
        if start > end {
            return Err(AppError::Validation(
                "startDate must not be after endDate".to_string(),
            ));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts <= self.end
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    StartedAt,
    TotalCost,
    TotalTimeMs,
    FirstTokenMs,
    PromptTokens,
    CompletionTokens,
}

impl SortField {
    pub fn column(&self) -> &'static str {
        match self {
            SortField::StartedAt => "t.started_at",
            SortField::TotalCost => "t.total_cost",
            SortField::TotalTimeMs => "t.total_time_ms",
            SortField::FirstTokenMs => "t.first_token_ms",
            SortField::PromptTokens => "t.prompt_tokens",
            SortField::CompletionTokens => "t.completion_tokens",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SortKey {
    Field(SortField),
    /// Uniform random order, for unbiased sampling.
    Random,
    /// Score of one evaluation check, selected by check id.
    CheckScore(String),
}

impl SortKey {
    pub fn parse(raw: &str) -> AppResult<Self> {
        if raw == "random" || raw.starts_with("random.") {
            return Ok(SortKey::Random);
        }
        if let Some(check_id) = raw.strip_prefix("trace_checks.") {
            if check_id.is_empty() {
                return Err(AppError::Validation(
                    "sortBy trace_checks.<check_id> requires a check id".to_string(),
                ));
            }
            return Ok(SortKey::CheckScore(check_id.to_string()));
        }
        let field = match raw {
            "timestamps.started_at" | "started_at" => SortField::StartedAt,
            "metrics.total_cost" => SortField::TotalCost,
            "metrics.total_time_ms" => SortField::TotalTimeMs,
            "metrics.first_token_ms" => SortField::FirstTokenMs,
            "metrics.prompt_tokens" => SortField::PromptTokens,
            "metrics.completion_tokens" => SortField::CompletionTokens,
            other => {
                return Err(AppError::Validation(format!(
                    "invalid sortBy: {other}. Valid values: timestamps.started_at, \
                     metrics.total_cost, metrics.total_time_ms, metrics.first_token_ms, \
                     metrics.prompt_tokens, metrics.completion_tokens, random, \
                     trace_checks.<check_id>"
                )))
            }
        };
        Ok(SortKey::Field(field))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    pub key: SortKey,
    pub direction: SortDirection,
}

impl Default for SortSpec {
    fn default() -> Self {
        Self {
            key: SortKey::Field(SortField::StartedAt),
            direction: SortDirection::Desc,
        }
    }
}

/// Body of the trace search procedure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSearchRequest {
    #[serde(default)]
    pub start_date: Option<i64>,
    #[serde(default)]
    pub end_date: Option<i64>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub filters: TraceFilters,
    #[serde(default)]
    pub group_by: GroupBy,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_direction: Option<SortDirection>,
    #[serde(default)]
    pub page_offset: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

/// Body of the filter-only procedures (topic counts).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterRequest {
    #[serde(default)]
    pub start_date: Option<i64>,
    #[serde(default)]
    pub end_date: Option<i64>,
    #[serde(default)]
    pub filters: TraceFilters,
}

/// A search request with defaults applied and inputs checked.
#[derive(Debug, Clone)]
pub struct ResolvedSearch {
    pub range: DateRange,
    pub query: Option<String>,
    pub filters: TraceFilters,
    pub group_by: GroupBy,
    pub sort: Option<SortSpec>,
    pub offset: usize,
    pub size: usize,
}

impl ResolvedSearch {
    pub fn from_request(
        request: TraceSearchRequest,
        config: &QueryConfig,
        now: i64,
    ) -> AppResult<Self> {
        let range = DateRange::resolve(
            request.start_date,
            request.end_date,
            config.default_date_range_days,
            now,
        )?;

        let size = request.page_size.unwrap_or(config.default_page_size);
        if size == 0 || size > config.max_page_size {
            return Err(AppError::Validation(format!(
                "pageSize must be between 1 and {}",
                config.max_page_size
            )));
        }

        let sort = match request.sort_by.as_deref() {
            Some(raw) => Some(SortSpec {
                key: SortKey::parse(raw)?,
                direction: request.sort_direction.unwrap_or_default(),
            }),
            None => None,
        };

        let query = request
            .query
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty());

        Ok(Self {
            range,
            query,
            filters: request.filters,
            group_by: request.group_by,
            sort,
            offset: request.page_offset.unwrap_or(0),
            size,
        })
    }

    /// Whether candidate ids must come from the acceleration structure.
    pub fn needs_pivot(&self) -> bool {
        self.filters.is_active() || self.sort.is_some() || self.query.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_key_parsing() {
        assert_eq!(
            SortKey::parse("metrics.total_cost").unwrap(),
            SortKey::Field(SortField::TotalCost)
        );
        assert_eq!(SortKey::parse("random").unwrap(), SortKey::Random);
        assert_eq!(SortKey::parse("random.seed42").unwrap(), SortKey::Random);
        assert_eq!(
            SortKey::parse("trace_checks.toxicity").unwrap(),
            SortKey::CheckScore("toxicity".into())
        );
        assert!(SortKey::parse("trace_checks.").is_err());
        assert!(SortKey::parse("metadata.user_id; DROP TABLE traces").is_err());
    }

    #[test]
    fn test_date_range_defaults_and_validation() {
        let range = DateRange::resolve(None, None, 30, 100 * 86_400_000).unwrap();
        assert_eq!(range.end, 100 * 86_400_000);
        assert_eq!(range.start, 70 * 86_400_000);
        assert!(range.contains(range.start) && range.contains(range.end));
        assert!(DateRange::resolve(Some(10), Some(5), 30, 0).is_err());
    }

    #[test]
    fn test_resolved_search_defaults() {
        let config = QueryConfig::default();
        let search =
            ResolvedSearch::from_request(TraceSearchRequest::default(), &config, 1_000).unwrap();
        assert_eq!(search.size, 25);
        assert_eq!(search.offset, 0);
        assert!(!search.needs_pivot());
    }

    #[test]
    fn test_blank_query_ignored_and_filters_activate_pivot() {
        let config = QueryConfig::default();
        let request = TraceSearchRequest {
            query: Some("   ".into()),
            filters: TraceFilters {
                labels: vec!["prod".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        let search = ResolvedSearch::from_request(request, &config, 1_000).unwrap();
        assert!(search.query.is_none());
        assert!(search.needs_pivot());
    }

    #[test]
    fn test_page_size_rejected_when_out_of_bounds() {
        let config = QueryConfig::default();
        let request = TraceSearchRequest {
            page_size: Some(0),
            ..Default::default()
        };
        assert!(ResolvedSearch::from_request(request, &config, 0).is_err());
    }

    #[test]
    fn test_request_wire_names() {
        let request: TraceSearchRequest = serde_json::from_value(serde_json::json!({
            "startDate": 1,
            "endDate": 2,
            "groupBy": "user_id",
            "sortBy": "metrics.total_cost",
            "sortDirection": "asc",
            "pageOffset": 10,
            "pageSize": 5,
            "filters": {"customer_ids": ["c1"]}
        }))
        .unwrap();
        assert_eq!(request.group_by, GroupBy::UserId);
        assert_eq!(request.sort_direction, Some(SortDirection::Asc));
        assert_eq!(request.filters.customer_ids, vec!["c1".to_string()]);
    }
}
