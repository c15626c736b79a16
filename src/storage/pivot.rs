use crate::query::filters::{DateRange, SortKey, SortSpec, TraceFilters};
use crate::storage::json_list;
use rusqlite::types::ToSql;
use rusqlite::Connection;

/// A `WHERE` fragment over `traces t` and its positional bindings.
pub struct SqlFilter {
    pub clause: String,
    pub params: Vec<Box<dyn ToSql>>,
}

impl SqlFilter {
    pub fn param_refs(&self) -> Vec<&dyn ToSql> {
        self.params.iter().map(|p| p.as_ref()).collect()
    }
}

/// Project scope, the inclusive date range and every active filter.
pub fn filter_clause(project_id: &str, range: &DateRange, filters: &TraceFilters) -> SqlFilter {
    let mut conditions = vec![
        "t.project_id = ?".to_string(),
        "t.started_at >= ?".to_string(),
        "t.started_at <= ?".to_string(),
    ];
    let mut params: Vec<Box<dyn ToSql>> = vec![
        Box::new(project_id.to_string()),
        Box::new(range.start),
        Box::new(range.end),
    ];

    if let Some(ref user_id) = filters.user_id {
        conditions.push("t.user_id = ?".to_string());
        params.push(Box::new(user_id.clone()));
    }
    if let Some(ref thread_id) = filters.thread_id {
        conditions.push("t.thread_id = ?".to_string());
        params.push(Box::new(thread_id.clone()));
    }
    if !filters.customer_ids.is_empty() {
        conditions.push("t.customer_id IN (SELECT value FROM json_each(?))".to_string());
        params.push(Box::new(json_list(&filters.customer_ids)));
    }
    if !filters.labels.is_empty() {
        conditions.push(
            "EXISTS (SELECT 1 FROM json_each(t.labels) l \
             WHERE l.value IN (SELECT value FROM json_each(?)))"
                .to_string(),
        );
        params.push(Box::new(json_list(&filters.labels)));
    }
    if !filters.topics.is_empty() {
        conditions.push(
            "(t.topic_id IN (SELECT value FROM json_each(?)) \
             OR t.subtopic_id IN (SELECT value FROM json_each(?)))"
                .to_string(),
        );
        let topics = json_list(&filters.topics);
        params.push(Box::new(topics.clone()));
        params.push(Box::new(topics));
    }
    if !filters.check_ids.is_empty() {
        conditions.push(
            "EXISTS (SELECT 1 FROM trace_checks c \
             WHERE c.project_id = t.project_id AND c.trace_id = t.trace_id \
             AND c.check_id IN (SELECT value FROM json_each(?)))"
                .to_string(),
        );
        params.push(Box::new(json_list(&filters.check_ids)));
    }

    SqlFilter {
        clause: conditions.join(" AND "),
        params,
    }
}

/// `ORDER BY` body for a sort spec. Ties fall back to newest first.
fn order_clause(sort: &SortSpec, params: &mut Vec<Box<dyn ToSql>>) -> String {
    let dir = sort.direction.as_sql();
    match &sort.key {
        SortKey::Random => "random()".to_string(),
        SortKey::Field(field) => format!(
            "{} {dir} NULLS LAST, t.started_at DESC, t.trace_id",
            field.column()
        ),
        SortKey::CheckScore(check_id) => {
            params.push(Box::new(check_id.clone()));
            format!(
                "(SELECT c.score FROM trace_checks c \
                 WHERE c.project_id = t.project_id AND c.trace_id = t.trace_id \
                 AND c.check_id = ?) {dir} NULLS LAST, t.started_at DESC, t.trace_id"
            )
        }
    }
}

/// Candidate-id resolution over the flattened trace columns.
pub struct PivotQuery<'a> {
    pub project_id: &'a str,
    pub range: &'a DateRange,
    pub filters: &'a TraceFilters,
    pub sort: Option<&'a SortSpec>,
    pub offset: usize,
    pub limit: usize,
}

impl PivotQuery<'_> {
    /// Matching trace ids in sort order, plus the total match count before paging.
    pub fn resolve(&self, conn: &Connection) -> rusqlite::Result<(Vec<String>, usize)> {
        let filter = filter_clause(self.project_id, self.range, self.filters);

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM traces t WHERE {}", filter.clause),
            filter.param_refs().as_slice(),
            |row| row.get(0),
        )?;
        if total == 0 || self.limit == 0 {
            return Ok((Vec::new(), total as usize));
        }

        let mut params = filter.params;
        let sort = self.sort.cloned().unwrap_or_default();
        let order = order_clause(&sort, &mut params);
        params.push(Box::new(self.limit as i64));
        params.push(Box::new(self.offset as i64));

        let sql = format!(
            "SELECT t.trace_id FROM traces t WHERE {} ORDER BY {order} LIMIT ? OFFSET ?",
            filter.clause
        );
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(refs.as_slice(), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok((ids, total as usize))
    }
}
