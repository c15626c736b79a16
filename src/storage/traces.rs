use crate::query::filters::{DateRange, TraceFilters};
use crate::storage::json_list;
use crate::storage::pivot::filter_clause;
use crate::types::{CustomersAndLabels, Span, TopicCount, TopicCounts, Trace, TraceCheck};
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use std::collections::HashMap;

fn decode<T: DeserializeOwned>(column: usize, document: &str) -> rusqlite::Result<T> {
    serde_json::from_str(document)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

/// Stored spans of `trace_ids`, keyed by trace and ordered by start time.
pub fn load_spans(
    conn: &Connection,
    project_id: &str,
    trace_ids: &[String],
) -> rusqlite::Result<HashMap<String, Vec<Span>>> {
    let mut out: HashMap<String, Vec<Span>> = HashMap::new();
    if trace_ids.is_empty() {
        return Ok(out);
    }
    let mut stmt = conn.prepare_cached(
        "SELECT trace_id, document FROM spans
         WHERE project_id = ?1 AND trace_id IN (SELECT value FROM json_each(?2))
         ORDER BY trace_id, started_at, span_id",
    )?;
    let rows = stmt.query_map(params![project_id, json_list(trace_ids)], |row| {
        let trace_id: String = row.get(0)?;
        let document: String = row.get(1)?;
        Ok((trace_id, document))
    })?;
    for row in rows {
        let (trace_id, document) = row?;
        out.entry(trace_id).or_default().push(decode(1, &document)?);
    }
    Ok(out)
}

/// Stored trace documents of `trace_ids`, keyed by id.
pub fn load_trace_map(
    conn: &Connection,
    project_id: &str,
    trace_ids: &[String],
) -> rusqlite::Result<HashMap<String, Trace>> {
    let mut out = HashMap::new();
    if trace_ids.is_empty() {
        return Ok(out);
    }
    let mut stmt = conn.prepare_cached(
        "SELECT trace_id, document FROM traces
         WHERE project_id = ?1 AND trace_id IN (SELECT value FROM json_each(?2))",
    )?;
    let rows = stmt.query_map(params![project_id, json_list(trace_ids)], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (trace_id, document) = row?;
        out.insert(trace_id, decode(1, &document)?);
    }
    Ok(out)
}

/// Traces in the order of `trace_ids`. Unknown ids are skipped.
pub fn load_traces(
    conn: &Connection,
    project_id: &str,
    trace_ids: &[String],
) -> rusqlite::Result<Vec<Trace>> {
    let mut by_id = load_trace_map(conn, project_id, trace_ids)?;
    Ok(trace_ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

pub fn get_trace(
    conn: &Connection,
    project_id: &str,
    trace_id: &str,
) -> rusqlite::Result<Option<Trace>> {
    let mut stmt = conn.prepare_cached(
        "SELECT document FROM traces WHERE project_id = ?1 AND trace_id = ?2",
    )?;
    let mut rows = stmt.query(params![project_id, trace_id])?;
    match rows.next()? {
        Some(row) => {
            let document: String = row.get(0)?;
            Ok(Some(decode(0, &document)?))
        }
        None => Ok(None),
    }
}

/// Newest-first page of the project's traces in range, plus the total count.
pub fn page_traces(
    conn: &Connection,
    project_id: &str,
    range: &DateRange,
    offset: usize,
    size: usize,
) -> rusqlite::Result<(Vec<Trace>, usize)> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM traces
         WHERE project_id = ?1 AND started_at >= ?2 AND started_at <= ?3",
        params![project_id, range.start, range.end],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare_cached(
        "SELECT document FROM traces
         WHERE project_id = ?1 AND started_at >= ?2 AND started_at <= ?3
         ORDER BY started_at DESC, trace_id
         LIMIT ?4 OFFSET ?5",
    )?;
    let traces = stmt
        .query_map(
            params![project_id, range.start, range.end, size as i64, offset as i64],
            |row| row.get::<_, String>(0),
        )?
        .map(|doc| doc.and_then(|d| decode(0, &d)))
        .collect::<rusqlite::Result<Vec<Trace>>>()?;

    Ok((traces, total as usize))
}

/// All traces of one conversation thread, oldest first.
pub fn traces_by_thread(
    conn: &Connection,
    project_id: &str,
    thread_id: &str,
    limit: usize,
) -> rusqlite::Result<Vec<Trace>> {
    let mut stmt = conn.prepare_cached(
        "SELECT document FROM traces
         WHERE project_id = ?1 AND thread_id = ?2
         ORDER BY started_at ASC, trace_id
         LIMIT ?3",
    )?;
    let traces = stmt
        .query_map(params![project_id, thread_id, limit as i64], |row| {
            row.get::<_, String>(0)
        })?
        .map(|doc| doc.and_then(|d| decode(0, &d)))
        .collect::<rusqlite::Result<Vec<Trace>>>()?;
    Ok(traces)
}

/// Configured guardrail display names, keyed by slug.
pub fn guardrail_names(
    conn: &Connection,
    project_id: &str,
) -> rusqlite::Result<HashMap<String, String>> {
    let mut stmt =
        conn.prepare_cached("SELECT slug, name FROM guardrails WHERE project_id = ?1")?;
    let rows = stmt.query_map(params![project_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    rows.collect()
}

/// Evaluation results of `trace_ids`, keyed by trace.
pub fn trace_checks(
    conn: &Connection,
    project_id: &str,
    trace_ids: &[String],
) -> rusqlite::Result<HashMap<String, Vec<TraceCheck>>> {
    let mut out: HashMap<String, Vec<TraceCheck>> = HashMap::new();
    if trace_ids.is_empty() {
        return Ok(out);
    }
    let mut stmt = conn.prepare_cached(
        "SELECT trace_id, check_id, check_type, check_name, status, passed, score,
                details, inserted_at
         FROM trace_checks
         WHERE project_id = ?1 AND trace_id IN (SELECT value FROM json_each(?2))
         ORDER BY trace_id, inserted_at, check_id",
    )?;
    let rows = stmt.query_map(params![project_id, json_list(trace_ids)], |row| {
        Ok(TraceCheck {
            trace_id: row.get(0)?,
            check_id: row.get(1)?,
            check_type: row.get(2)?,
            check_name: row.get(3)?,
            status: row.get(4)?,
            passed: row.get(5)?,
            score: row.get(6)?,
            details: row.get(7)?,
            inserted_at: row.get(8)?,
        })
    })?;
    for row in rows {
        let check = row?;
        out.entry(check.trace_id.clone()).or_default().push(check);
    }
    Ok(out)
}

fn count_by_column(
    conn: &Connection,
    column: &str,
    project_id: &str,
    range: &DateRange,
    filters: &TraceFilters,
) -> rusqlite::Result<Vec<TopicCount>> {
    let filter = filter_clause(project_id, range, filters);
    let sql = format!(
        "SELECT t.{column}, tp.name, COUNT(*) AS n
         FROM traces t
         LEFT JOIN topics tp ON tp.project_id = t.project_id AND tp.id = t.{column}
         WHERE {} AND t.{column} IS NOT NULL
         GROUP BY t.{column}, tp.name
         ORDER BY n DESC, t.{column}",
        filter.clause
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(filter.param_refs().as_slice(), |row| {
        Ok(TopicCount {
            id: row.get(0)?,
            name: row.get(1)?,
            count: row.get(2)?,
        })
    })?;
    rows.collect()
}

/// Per-topic and per-subtopic trace counts under the given filters.
pub fn topic_counts(
    conn: &Connection,
    project_id: &str,
    range: &DateRange,
    filters: &TraceFilters,
) -> rusqlite::Result<TopicCounts> {
    Ok(TopicCounts {
        topic_counts: count_by_column(conn, "topic_id", project_id, range, filters)?,
        subtopic_counts: count_by_column(conn, "subtopic_id", project_id, range, filters)?,
    })
}

/// Distinct customer ids and labels seen in the project, sorted.
pub fn customers_and_labels(
    conn: &Connection,
    project_id: &str,
) -> rusqlite::Result<CustomersAndLabels> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT customer_id FROM traces
         WHERE project_id = ?1 AND customer_id IS NOT NULL
         ORDER BY customer_id",
    )?;
    let customers = stmt
        .query_map(params![project_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT l.value FROM traces t, json_each(t.labels) l
         WHERE t.project_id = ?1
         ORDER BY l.value",
    )?;
    let labels = stmt
        .query_map(params![project_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(CustomersAndLabels { customers, labels })
}
