//! Selected-file hydration.
//!
//! Decides whether the files a user attached are inlined into the prompt or
//! left for the `reason` tool to retrieve. The decision uses a character
//! heuristic, `ceil(chars / 4)` estimated tokens, against a fixed threshold.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{AgentError, Result};
use crate::types::{AgentRequest, SelectedFile};

/// Default inline threshold in estimated tokens.
pub const DEFAULT_TOKEN_THRESHOLD: usize = 150_000;

const S3_SCHEME: &str = "s3://";

/// Estimated token count of `text`: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

// ─────────────────────────────────────────────────────────────────────────────
// Object Store
// ─────────────────────────────────────────────────────────────────────────────

/// Raw file access for `s3://` references.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the bytes behind `url`.
    async fn get(&self, url: &str) -> Result<Vec<u8>>;
}

/// Object store reached over HTTP, e.g. an S3-compatible gateway.
///
/// `s3://bucket/key` is fetched from `{base_url}/bucket/key`.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::object_store(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn object_url(&self, url: &str) -> Result<String> {
        let path = url
            .strip_prefix(S3_SCHEME)
            .ok_or_else(|| AgentError::object_store(format!("not an s3 url: {}", url)))?;
        Ok(format!("{}/{}", self.base_url, path))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let target = self.object_url(url)?;
        let response = self
            .client
            .get(&target)
            .send()
            .await
            .map_err(|e| AgentError::object_store(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::object_store(format!(
                "GET {} returned {}",
                target, status
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AgentError::object_store(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// In-process object store for tests and offline replay.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(url, bytes);
        self
    }

    pub fn insert(&self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.objects.write().insert(url.into(), bytes.into());
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .get(url)
            .cloned()
            .ok_or_else(|| AgentError::object_store(format!("no such object: {}", url)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hydration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HydrationConfig {
    pub token_threshold: usize,
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            token_threshold: DEFAULT_TOKEN_THRESHOLD,
        }
    }
}

/// Outcome of hydrating a request's selected files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hydration {
    /// Block appended to the system prompt; `None` without selected files.
    pub prompt_block: Option<String>,
    /// Whether the model should retrieve file content through `reason`.
    pub should_use_reason: bool,
    pub estimated_tokens: usize,
}

/// Estimated tokens over the latest user input, the history and every file.
pub fn estimate_request_tokens(request: &AgentRequest) -> usize {
    let input = estimate_tokens(&request.last_user_text());
    let history: usize = request
        .history
        .iter()
        .map(|message| estimate_tokens(&message.text()))
        .sum();
    let files: usize = request
        .selected_files
        .iter()
        .map(|file| estimate_tokens(&file.content))
        .sum();
    input + history + files
}

/// Decide how the selected files reach the model.
pub async fn hydrate(
    request: &AgentRequest,
    store: &dyn ObjectStore,
    config: HydrationConfig,
) -> Hydration {
    let estimated_tokens = estimate_request_tokens(request);
    tracing::debug!(
        estimated_tokens,
        threshold = config.token_threshold,
        files = request.selected_files.len(),
        "Estimated prompt size"
    );

    if request.selected_files.is_empty() {
        return Hydration {
            prompt_block: None,
            should_use_reason: true,
            estimated_tokens,
        };
    }

    if estimated_tokens < config.token_threshold {
        let mut listing = Vec::with_capacity(request.selected_files.len());
        for file in &request.selected_files {
            let content = fetch_content(file, store).await;
            listing.push(format!(
                "- {} (URL: {})\nContent:\n{}",
                file.title, file.url, content
            ));
        }
        let block = format!(
            "ATTENTION: The user has attached the following files. Analyze these files directly \
and provide a comprehensive answer based on their content. You do NOT need to use the 'reason' \
tool since all relevant information is already provided in the attached files:\n\n{}\n\n\
The attached files' content is already provided above. DO NOT search for these files again - \
analyze their content directly.",
            listing.join("\n\n")
        );
        return Hydration {
            prompt_block: Some(block),
            should_use_reason: false,
            estimated_tokens,
        };
    }

    let listing: Vec<String> = request
        .selected_files
        .iter()
        .map(|file| format!("- {} (URL: {})", file.title, file.url))
        .collect();
    let titles: Vec<&str> = request
        .selected_files
        .iter()
        .map(|file| file.title.as_str())
        .collect();
    let block = format!(
        "ATTENTION: The user has attached the following files. Use the 'reason' tool to search \
for relevant information from these and other documents in the knowledge base:\n\n{}\n\n\
When searching for the attached files, call the reason tool with direction_guidance set to: \
\"The user has attached these files: {}. Search for these specific files by filename first, \
then answer the user's query based on their content.\"",
        listing.join("\n"),
        titles.join(", ")
    );

    Hydration {
        prompt_block: Some(block),
        should_use_reason: true,
        estimated_tokens,
    }
}

async fn fetch_content(file: &SelectedFile, store: &dyn ObjectStore) -> String {
    if !file.url.starts_with(S3_SCHEME) {
        return file.content.clone();
    }
    match store.get(&file.url).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!(url = %file.url, error = %e, "File fetch failed, keeping excerpt");
            file.content.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(title: &str, url: &str, content: &str) -> SelectedFile {
        SelectedFile {
            title: title.to_string(),
            url: url.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        // characters, not bytes
        assert_eq!(estimate_tokens("ééééé"), 2);
    }

    #[tokio::test]
    async fn test_no_files_no_block() {
        let request = AgentRequest::new("sharepoint-agent-v2", "hello");
        let hydration = hydrate(&request, &InMemoryObjectStore::new(), HydrationConfig::default()).await;
        assert!(hydration.prompt_block.is_none());
        assert!(hydration.should_use_reason);
    }

    #[tokio::test]
    async fn test_small_files_inlined_from_store() {
        let store = InMemoryObjectStore::new().with_object("s3://docs/a.txt", "full body of a");
        let request = AgentRequest::new("sharepoint-agent-v2", "summarize").with_selected_files(vec![
            file("a.txt", "s3://docs/a.txt", "excerpt a"),
            file("b.txt", "https://example.com/b.txt", "excerpt b"),
        ]);

        let hydration = hydrate(&request, &store, HydrationConfig::default()).await;
        let block = hydration.prompt_block.unwrap();
        assert!(!hydration.should_use_reason);
        assert!(block.starts_with("ATTENTION: The user has attached the following files. Analyze"));
        assert!(block.contains("- a.txt (URL: s3://docs/a.txt)\nContent:\nfull body of a"));
        assert!(block.contains("Content:\nexcerpt b"));
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_excerpt() {
        let request = AgentRequest::new("sharepoint-agent-v2", "q")
            .with_selected_files(vec![file("gone.txt", "s3://docs/gone.txt", "cached excerpt")]);
        let hydration = hydrate(&request, &InMemoryObjectStore::new(), HydrationConfig::default()).await;
        assert!(hydration.prompt_block.unwrap().contains("cached excerpt"));
    }

    #[tokio::test]
    async fn test_large_files_left_to_reason_tool() {
        let big = "x".repeat(600_004);
        let request = AgentRequest::new("sharepoint-agent-v2", "q")
            .with_selected_files(vec![file("big.csv", "s3://docs/big.csv", &big)]);

        let hydration = hydrate(&request, &InMemoryObjectStore::new(), HydrationConfig::default()).await;
        assert!(hydration.estimated_tokens > DEFAULT_TOKEN_THRESHOLD);
        assert!(hydration.should_use_reason);

        let block = hydration.prompt_block.unwrap();
        assert!(block.contains("Use the 'reason' tool"));
        assert!(block.contains("- big.csv (URL: s3://docs/big.csv)"));
        assert!(!block.contains(&big[..100]));
    }

    #[tokio::test]
    async fn test_threshold_is_exclusive() {
        let request = AgentRequest::new("sharepoint-agent-v2", "")
            .with_selected_files(vec![file("f", "https://x/f", "abcdefgh")]);
        let config = HydrationConfig { token_threshold: 2 };
        assert_eq!(estimate_request_tokens(&request), 2);
        let hydration = hydrate(&request, &InMemoryObjectStore::new(), config).await;
        assert!(hydration.should_use_reason);
    }

    #[test]
    fn test_http_store_maps_s3_urls() {
        let store = HttpObjectStore::new("http://localhost:9000/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            store.object_url("s3://bucket/path/file.txt").unwrap(),
            "http://localhost:9000/bucket/path/file.txt"
        );
        assert!(store.object_url("https://example.com/file").is_err());
    }
}
