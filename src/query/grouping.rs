use crate::embeddings::cosine_similarity;
use crate::types::Trace;
use serde::Deserialize;

pub const INPUT_SIMILARITY_THRESHOLD: f64 = 0.85;
pub const OUTPUT_SIMILARITY_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    #[default]
    None,
    Input,
    Output,
    UserId,
    ThreadId,
}

impl GroupBy {
    /// Whether `trace` carries the feature this key compares.
    fn has_feature(&self, trace: &Trace) -> bool {
        match self {
            GroupBy::None => false,
            GroupBy::Input => trace.input_embeddings().is_some(),
            GroupBy::Output => trace.output_embeddings().is_some(),
            GroupBy::UserId => trace.metadata.user_id.is_some(),
            GroupBy::ThreadId => trace.metadata.thread_id.is_some(),
        }
    }

    /// Match rule between two traces that both carry the feature.
    fn matches(&self, trace: &Trace, member: &Trace) -> bool {
        match self {
            GroupBy::None => false,
            GroupBy::Input => match (trace.input_embeddings(), member.input_embeddings()) {
                (Some(a), Some(b)) => cosine_similarity(a, b) > INPUT_SIMILARITY_THRESHOLD,
                _ => false,
            },
            GroupBy::Output => match (trace.output_embeddings(), member.output_embeddings()) {
                (Some(a), Some(b)) => cosine_similarity(a, b) > OUTPUT_SIMILARITY_THRESHOLD,
                _ => false,
            },
            GroupBy::UserId => trace.metadata.user_id == member.metadata.user_id,
            GroupBy::ThreadId => trace.metadata.thread_id == member.metadata.thread_id,
        }
    }
}

/// Greedy, order-preserving clustering of one result page.
///
/// Each trace joins the first existing group containing a matching member,
/// scanning groups in creation order and members in insertion order.
/// Traces lacking the key's feature form singleton groups.
pub fn group_traces(key: GroupBy, traces: Vec<Trace>) -> Vec<Vec<Trace>> {
    let mut groups: Vec<Vec<Trace>> = Vec::new();

    for trace in traces {
        if !key.has_feature(&trace) {
            groups.push(vec![trace]);
            continue;
        }

        let target = groups.iter().position(|group| {
            group
                .iter()
                .filter(|member| key.has_feature(member))
                .any(|member| key.matches(&trace, member))
        });

        match target {
            Some(index) => groups[index].push(trace),
            None => groups.push(vec![trace]),
        }
    }

    groups
}
