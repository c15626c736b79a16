use crate::error::{AppError, AppResult};
use crate::storage::embedding_to_blob;
use crate::types::{Span, Trace};
use deadpool_sqlite::Pool;
use rusqlite::params;

/// Upsert spans, their traces and the lexical index rows in a single transaction.
///
/// Nothing is committed on failure; the error names how many spans were lost.
pub async fn write_batch(pool: &Pool, spans: Vec<Span>, traces: Vec<Trace>) -> AppResult<()> {
    if spans.is_empty() && traces.is_empty() {
        return Ok(());
    }
    let span_count = spans.len();

    let conn = pool
        .get()
        .await
        .map_err(|e| AppError::Dependency(format!("failed to store {span_count} spans: {e}")))?;

    let result = conn.interact(move |conn| write_rows(conn, &spans, &traces)).await;

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(AppError::Dependency(format!(
            "failed to store {span_count} spans: {e}"
        ))),
        Err(e) => Err(AppError::Dependency(format!(
            "failed to store {span_count} spans: {e}"
        ))),
    }
}

/// Synchronous body of [`write_batch`].
pub fn write_rows(
    conn: &mut rusqlite::Connection,
    spans: &[Span],
    traces: &[Trace],
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;

    {
        let mut upsert_span = tx.prepare_cached(
            "INSERT OR REPLACE INTO spans (
                project_id, span_id, trace_id, span_type, started_at, document
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;

        let mut upsert_trace = tx.prepare_cached(
            "INSERT OR REPLACE INTO traces (
                project_id, trace_id, user_id, thread_id, customer_id, labels,
                topic_id, subtopic_id, has_output, input_embedding,
                first_token_ms, total_time_ms, prompt_tokens, completion_tokens,
                total_cost, started_at, inserted_at, document
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
        )?;

        let mut delete_fts = tx.prepare_cached(
            "DELETE FROM traces_fts WHERE project_id = ?1 AND trace_id = ?2",
        )?;
        let mut insert_fts = tx.prepare_cached(
            "INSERT INTO traces_fts (project_id, trace_id, input_value, output_value)
             VALUES (?1, ?2, ?3, ?4)",
        )?;

        for span in spans {
            let document = serde_json::to_string(span)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            upsert_span.execute(params![
                span.project_id,
                span.span_id,
                span.trace_id,
                span.span_type.as_str(),
                span.timestamps.started_at,
                document,
            ])?;
        }

        for trace in traces {
            let document = serde_json::to_string(trace)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            let labels = serde_json::to_string(&trace.metadata.labels)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            let input_embedding = trace.input_embeddings().map(embedding_to_blob);
            let output_value = trace
                .output
                .as_ref()
                .map(|o| o.value.as_str())
                .unwrap_or("");

            upsert_trace.execute(params![
                trace.project_id,
                trace.trace_id,
                trace.metadata.user_id,
                trace.metadata.thread_id,
                trace.metadata.customer_id,
                labels,
                trace.metadata.topic_id,
                trace.metadata.subtopic_id,
                !trace.has_empty_output(),
                input_embedding,
                trace.metrics.first_token_ms,
                trace.metrics.total_time_ms,
                trace.metrics.prompt_tokens,
                trace.metrics.completion_tokens,
                trace.metrics.total_cost,
                trace.timestamps.started_at,
                trace.timestamps.inserted_at,
                document,
            ])?;

            delete_fts.execute(params![trace.project_id, trace.trace_id])?;
            insert_fts.execute(params![
                trace.project_id,
                trace.trace_id,
                trace.input.value,
                output_value,
            ])?;
        }
    }

    tx.commit()?;
    Ok(())
}
