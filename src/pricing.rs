use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;

/// Token counting and cost estimation keyed by model name.
pub trait TokenEstimator: Send + Sync {
    fn count_tokens(&self, model: &str, text: &str) -> i64;

    /// Cost in USD, or `None` when the model has no known price.
    fn estimate_cost(&self, model: &str, prompt_tokens: i64, completion_tokens: i64)
        -> Option<f64>;
}

/// Per-token pricing entry for a model.
#[derive(Debug, Clone)]
pub struct ModelPrice {
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
    pub provider: Option<String>,
}

/// Deserialization type for LiteLLM's pricing JSON entries.
#[derive(Debug, Deserialize)]
struct LiteLlmEntry {
    input_cost_per_token: Option<f64>,
    output_cost_per_token: Option<f64>,
    litellm_provider: Option<String>,
}

const PROVIDER_PREFIXES: &[&str] = &[
    "openai/",
    "anthropic/",
    "gemini/",
    "azure/",
    "mistral/",
    "groq/",
];

/// In-memory pricing table with bundled defaults and runtime refresh.
pub struct PricingTable {
    prices: RwLock<HashMap<String, ModelPrice>>,
    chars_per_token: f64,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PricingTable {
    pub fn new() -> Self {
        let bundled = include_bytes!("../data/model_prices.json");
        let prices = Self::parse_litellm_json(bundled);
        tracing::info!(models = prices.len(), "loaded bundled model pricing");
        Self {
            prices: RwLock::new(prices),
            chars_per_token: 4.0,
        }
    }

    fn parse_litellm_json(data: &[u8]) -> HashMap<String, ModelPrice> {
        let raw: HashMap<String, serde_json::Value> = match serde_json::from_slice(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse pricing JSON");
                return HashMap::new();
            }
        };

        let mut prices = HashMap::with_capacity(raw.len());
        for (model, value) in raw {
            let Ok(entry) = serde_json::from_value::<LiteLlmEntry>(value) else {
                continue;
            };
            // "sample_spec" and friends carry no prices
            if let (Some(input), Some(output)) =
                (entry.input_cost_per_token, entry.output_cost_per_token)
            {
                prices.insert(
                    model,
                    ModelPrice {
                        input_cost_per_token: input,
                        output_cost_per_token: output,
                        provider: entry.litellm_provider,
                    },
                );
            }
        }
        prices
    }

    /// Replace prices from freshly fetched LiteLLM JSON. Empty results are ignored.
    pub fn refresh(&self, data: &[u8]) {
        let new_prices = Self::parse_litellm_json(data);
        if new_prices.is_empty() {
            tracing::warn!("refresh returned empty pricing data, keeping existing");
            return;
        }
        tracing::info!(models = new_prices.len(), "refreshed model pricing");
        *self.prices.write().unwrap_or_else(|e| e.into_inner()) = new_prices;
    }

    /// Look up pricing for a model:
    /// 1. Exact match
    /// 2. Provider-prefixed: "{provider}/{model}"
    /// 3. Date suffix stripped: "gpt-4o-2024-08-06" -> "gpt-4o"
    pub fn lookup(&self, model: &str) -> Option<ModelPrice> {
        let prices = self.prices.read().unwrap_or_else(|e| e.into_inner());

        let find = |name: &str| -> Option<ModelPrice> {
            if let Some(price) = prices.get(name) {
                return Some(price.clone());
            }
            PROVIDER_PREFIXES
                .iter()
                .find_map(|prefix| prices.get(&format!("{prefix}{name}")).cloned())
        };

        find(model).or_else(|| strip_date_suffix(model).and_then(find))
    }

    pub fn model_count(&self) -> usize {
        self.prices.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl TokenEstimator for PricingTable {
    fn count_tokens(&self, _model: &str, text: &str) -> i64 {
        if text.is_empty() {
            return 0;
        }
        ((text.chars().count() as f64) / self.chars_per_token).ceil() as i64
    }

    fn estimate_cost(
        &self,
        model: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
    ) -> Option<f64> {
        let price = self.lookup(model)?;
        Some(
            (prompt_tokens as f64) * price.input_cost_per_token
                + (completion_tokens as f64) * price.output_cost_per_token,
        )
    }
}

/// Strip a trailing "-YYYY-MM-DD" from a model name.
fn strip_date_suffix(model: &str) -> Option<&str> {
    let bytes = model.as_bytes();
    if bytes.len() < 11 {
        return None;
    }
    let start = bytes.len() - 11;
    let digits = |range: std::ops::Range<usize>| bytes[range].iter().all(|b| b.is_ascii_digit());
    if bytes[start] == b'-'
        && bytes[start + 5] == b'-'
        && bytes[start + 8] == b'-'
        && digits(start + 1..start + 5)
        && digits(start + 6..start + 8)
        && digits(start + 9..start + 11)
    {
        Some(&model[..start])
    } else {
        None
    }
}

/// Background task: periodically refresh pricing from the configured URL.
pub async fn pricing_refresh_loop(
    pricing: std::sync::Arc<PricingTable>,
    interval_secs: u64,
    url: String,
) {
    if interval_secs == 0 || url.is_empty() {
        return;
    }
    let client = reqwest::Client::new();
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    // First tick fires immediately; bundled data is already loaded
    interval.tick().await;

    loop {
        interval.tick().await;
        tracing::info!(url = %url, "refreshing model pricing");
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(bytes) => pricing.refresh(&bytes),
                Err(e) => tracing::warn!(error = %e, "failed to read pricing response body"),
            },
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "pricing refresh got non-200 response")
            }
            Err(e) => tracing::warn!(error = %e, "pricing refresh request failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_date_suffix() {
        assert_eq!(strip_date_suffix("gpt-4o-2024-08-06"), Some("gpt-4o"));
        assert_eq!(strip_date_suffix("claude-3-5-sonnet-20241022"), None);
        assert_eq!(strip_date_suffix("gpt-4o"), None);
        assert_eq!(strip_date_suffix(""), None);
    }

    #[test]
    fn test_lookup_strategies() {
        let table = PricingTable::new();
        assert!(table.lookup("gpt-4o").is_some());
        assert!(table.lookup("gpt-4o-2024-08-06").is_some());
        // bundled under "gemini/gemini-1.5-pro"
        assert!(table.lookup("gemini-1.5-pro").is_some());
        assert!(table.lookup("totally-fake-model-xyz").is_none());
    }

    #[test]
    fn test_estimate_cost() {
        let table = PricingTable::new();
        // gpt-4o: $2.50/M input, $10.00/M output
        let cost = table.estimate_cost("gpt-4o", 1000, 100).unwrap();
        assert!((cost - 0.0035).abs() < 1e-12);
        assert_eq!(table.estimate_cost("gpt-4o", 0, 0), Some(0.0));
        assert_eq!(table.estimate_cost("nope", 10, 10), None);
    }

    #[test]
    fn test_count_tokens_rounds_up() {
        let table = PricingTable::new();
        assert_eq!(table.count_tokens("gpt-4o", ""), 0);
        assert_eq!(table.count_tokens("gpt-4o", "abc"), 1);
        assert_eq!(table.count_tokens("gpt-4o", "abcdefghi"), 3);
    }

    #[test]
    fn test_refresh_keeps_existing_on_garbage() {
        let table = PricingTable::new();
        let before = table.model_count();
        table.refresh(b"not json");
        assert_eq!(table.model_count(), before);

        table.refresh(
            br#"{"my-model": {"input_cost_per_token": 1e-6, "output_cost_per_token": 2e-6}}"#,
        );
        assert_eq!(table.model_count(), 1);
        assert!(table.lookup("gpt-4o").is_none());
        assert!(table.lookup("my-model").is_some());
    }
}
