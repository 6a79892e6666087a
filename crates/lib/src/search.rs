//! Web-search augmentation: query the search proxy and fold the results into the prompt.
//!
//! The proxy's response is treated as an opaque JSON blob; it is pretty-printed into the
//! prompt template in place of `{{results}}`.

use crate::llm::ChatError;
use chrono::Utc;

/// Default template used to build the augmented prompt.
pub const DEFAULT_SEARCH_TEMPLATE: &str = "Using the provided web search results, write a comprehensive reply to the given query. \
Make sure to cite results using [[number](URL)] notation after the reference. \
If the provided search results refer to multiple subjects with the same name, write separate answers for each subject.\n\n\
Web search json results:\n{{results}}\n\n\
Current date: {{date}}\n\n\
Query: {{query}}";

/// Client for `GET /api/web-search?query=<text>`.
#[derive(Clone)]
pub struct SearchClient {
    base_url: String,
    client: reqwest::Client,
}

impl SearchClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Run a search. Error envelopes from the proxy are returned as-is; only transport and
    /// HTTP failures are errors.
    pub async fn search(&self, query: &str) -> Result<serde_json::Value, ChatError> {
        let url = format!("{}/api/web-search", self.base_url);
        let res = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ChatError::Stream {
                status: status.as_u16(),
                body,
            });
        }
        let text = res.text().await?;
        serde_json::from_str(&text).map_err(|e| ChatError::Parse(e.to_string()))
    }
}

/// Fill the template with the query, the results blob, and today's date.
pub fn augment_prompt(template: &str, query: &str, results: &serde_json::Value) -> String {
    let results = serde_json::to_string_pretty(results).unwrap_or_else(|_| results.to_string());
    template
        .replace("{{results}}", &results)
        .replace("{{date}}", &Utc::now().format("%Y-%m-%d").to_string())
        .replace("{{query}}", query)
}
