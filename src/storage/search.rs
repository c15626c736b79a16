use crate::embeddings::cosine_similarity;
use crate::storage::{blob_to_embedding, json_list};
use rusqlite::{params, Connection};
use std::collections::HashMap;

/// FTS5 expression matching any word of `query`. `None` when nothing is searchable.
pub fn match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{}\"", w.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// BM25-ranked lexical hits over trace input and output, restricted to `candidates`.
pub fn lexical_hits(
    conn: &Connection,
    project_id: &str,
    candidates: &[String],
    query: &str,
    limit: usize,
) -> rusqlite::Result<Vec<String>> {
    let Some(expression) = match_expression(query) else {
        return Ok(Vec::new());
    };
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare_cached(
        "SELECT trace_id FROM traces_fts
         WHERE traces_fts MATCH ?1
           AND project_id = ?2
           AND trace_id IN (SELECT value FROM json_each(?3))
         ORDER BY bm25(traces_fts)
         LIMIT ?4",
    )?;
    let ids = stmt
        .query_map(
            params![expression, project_id, json_list(candidates), limit as i64],
            |row| row.get::<_, String>(0),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

/// Exact k-nearest neighbours by input embedding, restricted to `candidates`.
pub fn vector_hits(
    conn: &Connection,
    project_id: &str,
    candidates: &[String],
    query_vector: &[f32],
    k: usize,
) -> rusqlite::Result<Vec<String>> {
    if candidates.is_empty() || query_vector.is_empty() || k == 0 {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare_cached(
        "SELECT trace_id, input_embedding FROM traces
         WHERE project_id = ?1
           AND input_embedding IS NOT NULL
           AND trace_id IN (SELECT value FROM json_each(?2))",
    )?;
    let mut scored = stmt
        .query_map(params![project_id, json_list(candidates)], |row| {
            let trace_id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((trace_id, blob))
        })?
        .map(|row| {
            row.map(|(trace_id, blob)| {
                let score = cosine_similarity(query_vector, &blob_to_embedding(&blob));
                (trace_id, score)
            })
        })
        .collect::<rusqlite::Result<Vec<(String, f64)>>>()?;

    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored.truncate(k);
    Ok(scored.into_iter().map(|(id, _)| id).collect())
}

/// One ranked retriever result and its weight in the fusion.
pub struct RankedList<'a> {
    pub ids: &'a [String],
    pub weight: f64,
}

/// Weighted reciprocal rank fusion: `score(d) = Σ weight / (rank_constant + rank)`.
///
/// Each list contributes at most `window` entries. Ties keep first-seen order.
pub fn reciprocal_rank_fusion(
    lists: &[RankedList<'_>],
    rank_constant: f64,
    window: usize,
) -> Vec<(String, f64)> {
    let mut scores: HashMap<&str, (f64, usize)> = HashMap::new();
    let mut seen = 0usize;
    for list in lists {
        for (index, id) in list.ids.iter().take(window).enumerate() {
            let contribution = list.weight / (rank_constant + (index + 1) as f64);
            let entry = scores.entry(id.as_str()).or_insert_with(|| {
                seen += 1;
                (0.0, seen)
            });
            entry.0 += contribution;
        }
    }
    let mut fused: Vec<(String, f64, usize)> = scores
        .into_iter()
        .map(|(id, (score, order))| (id.to_string(), score, order))
        .collect();
    fused.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.2.cmp(&b.2)));
    fused.into_iter().map(|(id, score, _)| (id, score)).collect()
}
