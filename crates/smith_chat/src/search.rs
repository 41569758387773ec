//! Optional web augmentation: asset search and reference page fetching.
//!
//! Both collaborators are optional. When absent or failing, a turn proceeds
//! without the extra context.

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChatError, ChatResult};

/// One web search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub snippet: String,
}

impl SearchHit {
    /// Render the hit as a prompt line.
    pub fn render(&self) -> String {
        if self.snippet.is_empty() {
            format!("- {} <{}>", self.title, self.url)
        } else {
            format!("- {} <{}>: {}", self.title, self.url, self.snippet)
        }
    }
}

/// Web search boundary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebSearch: Send + Sync {
    /// Ordered results for `query`.
    async fn search(&self, query: &str) -> ChatResult<Vec<SearchHit>>;
}

/// Fetches external pages referenced by clone requests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Raw HTML of the page at `url`.
    async fn fetch(&self, url: &str) -> ChatResult<String>;
}

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const SEARCH_MODEL: &str = "gemini-2.0-flash";

/// Search through Gemini's `google_search` grounding tool.
#[derive(Clone)]
pub struct GeminiSearch {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiSearch {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: SEARCH_MODEL.to_string(),
        }
    }

    /// Overrides the Gemini model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Build from `GOOGLE_API_KEY`, if set.
    pub fn from_env() -> Option<Self> {
        std::env::var("GOOGLE_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(Self::new)
    }
}

#[derive(Serialize)]
struct SearchRequest {
    contents: Vec<SearchContent>,
    tools: Vec<SearchTool>,
}

#[derive(Serialize)]
struct SearchContent {
    role: String,
    parts: Vec<SearchPart>,
}

#[derive(Serialize)]
struct SearchPart {
    text: String,
}

#[derive(Serialize, Default)]
struct SearchTool {
    google_search: GoogleSearchConfig,
}

#[derive(Serialize, Default)]
struct GoogleSearchConfig {}

#[async_trait]
impl WebSearch for GeminiSearch {
    async fn search(&self, query: &str) -> ChatResult<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/{}:generateContent", GEMINI_BASE_URL, self.model);
        let request = SearchRequest {
            contents: vec![SearchContent {
                role: "user".to_string(),
                parts: vec![SearchPart {
                    text: query.to_string(),
                }],
            }],
            tools: vec![SearchTool::default()],
        };

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChatError::Retrieval(format!("Search request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Retrieval(format!("Search API error {}: {}", status, body)));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ChatError::Retrieval(format!("Failed to parse search response: {}", e)))?;

        Ok(extract_hits(&payload))
    }
}

/// Pull de-duplicated grounding references out of a `generateContent` response.
fn extract_hits(root: &Value) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    let mut hits = Vec::new();

    let Some(candidates) = root.get("candidates").and_then(|c| c.as_array()) else {
        return hits;
    };

    for candidate in candidates {
        let Some(chunks) = candidate
            .get("groundingMetadata")
            .and_then(|m| m.get("groundingChunks"))
            .and_then(|c| c.as_array())
        else {
            continue;
        };

        for chunk in chunks {
            let Some(web) = chunk.get("web").or_else(|| chunk.get("retrievedContext")) else {
                continue;
            };
            let Some(url) = web.get("uri").or_else(|| web.get("url")).and_then(|v| v.as_str()) else {
                continue;
            };
            if !seen.insert(url.to_string()) {
                continue;
            }

            let title = web
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or(url)
                .to_string();
            let snippet = web
                .get("snippet")
                .or_else(|| web.get("text"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            hits.push(SearchHit {
                url: url.to_string(),
                title,
                snippet,
            });
        }
    }

    hits
}

/// Plain HTTP page fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpFetcher {
    pub const DEFAULT_MAX_BYTES: usize = 512 * 1024;

    pub fn new(timeout: Duration) -> ChatResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sitesmith/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ChatError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            max_bytes: Self::DEFAULT_MAX_BYTES,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> ChatResult<String> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ChatError::Retrieval(format!("Failed to fetch {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::Retrieval(format!("Fetching {} returned {}", url, status)));
        }

        // Stop reading once the cap is reached.
        let mut body = Vec::new();
        while body.len() < self.max_bytes {
            let chunk = response
                .chunk()
                .await
                .map_err(|e| ChatError::Retrieval(format!("Failed to read {}: {}", url, e)))?;
            match chunk {
                Some(bytes) => body.extend_from_slice(&bytes),
                None => break,
            }
        }
        Ok(decode_capped(body, self.max_bytes))
    }
}

/// Decode at most `max` bytes of a page body, dropping a character cut in
/// half at the end.
fn decode_capped(mut bytes: Vec<u8>, max: usize) -> String {
    bytes.truncate(max);
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            let utf8 = e.utf8_error();
            let mut bytes = e.into_bytes();
            if utf8.error_len().is_none() {
                bytes.truncate(utf8.valid_up_to());
            }
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }
}

/// Structural summary of an HTML page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageOutline {
    pub title: Option<String>,
    /// Headings as `h1: text`, in document order
    pub headings: Vec<String>,
    pub nav_links: Vec<String>,
    pub section_count: usize,
    pub image_count: usize,
}

impl PageOutline {
    /// Render the outline as a prompt block.
    pub fn render(&self, url: &str) -> String {
        let mut out = format!("Reference page {}\n", url);
        if let Some(title) = &self.title {
            out.push_str(&format!("Title: {}\n", title));
        }
        if !self.headings.is_empty() {
            out.push_str("Headings:\n");
            for heading in &self.headings {
                out.push_str(&format!("- {}\n", heading));
            }
        }
        if !self.nav_links.is_empty() {
            out.push_str(&format!("Navigation: {}\n", self.nav_links.join(" | ")));
        }
        out.push_str(&format!(
            "Sections: {}, images: {}\n",
            self.section_count, self.image_count
        ));
        out
    }
}

const MAX_HEADINGS: usize = 20;
const MAX_NAV_LINKS: usize = 15;

static TITLE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").ok());
static HEADING_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<h([1-3])[^>]*>(.*?)</h[1-3]>").ok());
static NAV_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?is)<nav\b[^>]*>(.*?)</nav>").ok());
static LINK_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?is)<a\b[^>]*>(.*?)</a>").ok());
static SECTION_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?i)<section\b").ok());
static IMG_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?i)<img\b").ok());
static TAG_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").ok());

/// Derive a [`PageOutline`] from raw HTML.
pub fn outline_html(html: &str) -> PageOutline {
    let mut outline = PageOutline::default();

    if let Some(re) = TITLE_RE.as_ref() {
        outline.title = re
            .captures(html)
            .map(|c| clean_text(&c[1]))
            .filter(|t| !t.is_empty());
    }

    if let Some(re) = HEADING_RE.as_ref() {
        outline.headings = re
            .captures_iter(html)
            .filter_map(|c| {
                let text = clean_text(&c[2]);
                (!text.is_empty()).then(|| format!("h{}: {}", &c[1], text))
            })
            .take(MAX_HEADINGS)
            .collect();
    }

    if let (Some(nav), Some(link)) = (NAV_RE.as_ref(), LINK_RE.as_ref()) {
        outline.nav_links = nav
            .captures_iter(html)
            .flat_map(|n| {
                link.captures_iter(&n[1])
                    .map(|a| clean_text(&a[1]))
                    .collect::<Vec<_>>()
            })
            .filter(|t| !t.is_empty())
            .take(MAX_NAV_LINKS)
            .collect();
    }

    if let Some(re) = SECTION_RE.as_ref() {
        outline.section_count = re.find_iter(html).count();
    }
    if let Some(re) = IMG_RE.as_ref() {
        outline.image_count = re.find_iter(html).count();
    }

    outline
}

/// Strip tags and collapse whitespace.
fn clean_text(fragment: &str) -> String {
    let without_tags = match TAG_RE.as_ref() {
        Some(re) => re.replace_all(fragment, " ").into_owned(),
        None => fragment.to_string(),
    };
    without_tags.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PAGE: &str = r#"<!doctype html>
<html><head><title> Acme
 Studio </title></head>
<body>
<nav class="top"><a href="/">Home</a> <a href="/work"><span>Work</span></a><a href="/contact">Contact</a></nav>
<section><h1 class="hero">We build <em>things</em></h1><img src="a.png"></section>
<section><h2>Services</h2><h4>ignored</h4><img src="b.png"><IMG src="c.png"></section>
</body></html>"#;

    #[test]
    fn test_outline_html() {
        let outline = outline_html(PAGE);
        assert_eq!(outline.title.as_deref(), Some("Acme Studio"));
        assert_eq!(outline.headings, vec!["h1: We build things", "h2: Services"]);
        assert_eq!(outline.nav_links, vec!["Home", "Work", "Contact"]);
        assert_eq!(outline.section_count, 2);
        assert_eq!(outline.image_count, 3);

        let rendered = outline.render("https://acme.example");
        assert!(rendered.starts_with("Reference page https://acme.example\n"));
        assert!(rendered.contains("Navigation: Home | Work | Contact"));
    }

    #[test]
    fn test_outline_of_empty_page() {
        let outline = outline_html("");
        assert_eq!(outline, PageOutline::default());
    }

    #[test]
    fn test_decode_capped_stops_at_limit() {
        assert_eq!(decode_capped(b"<html>body</html>".to_vec(), 6), "<html>");
        assert_eq!(decode_capped(b"short".to_vec(), 64), "short");
        // Cut inside the two-byte "é".
        assert_eq!(decode_capped("café au lait".as_bytes().to_vec(), 4), "caf");
        assert_eq!(decode_capped(vec![0xff, b'o', b'k'], 3), "\u{fffd}ok");
    }

    #[test]
    fn test_extract_hits_dedupes() {
        let payload = json!({
            "candidates": [{
                "content": {"parts": [{"text": "answer"}]},
                "groundingMetadata": {
                    "groundingChunks": [
                        {"web": {"uri": "https://img.example/1", "title": "Coffee photos"}},
                        {"web": {"uri": "https://img.example/1", "title": "dup"}},
                        {"web": {"uri": "https://img.example/2"}},
                        {"other": {}}
                    ]
                }
            }]
        });
        let hits = extract_hits(&payload);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Coffee photos");
        assert_eq!(hits[1].title, "https://img.example/2");
        assert!(extract_hits(&json!({})).is_empty());
    }

    #[tokio::test]
    async fn test_mock_search_is_usable_as_trait_object() {
        let mut mock = MockWebSearch::new();
        mock.expect_search().returning(|q| {
            Ok(vec![SearchHit {
                url: "https://img.example/x".into(),
                title: q.to_string(),
                snippet: String::new(),
            }])
        });
        let search: Box<dyn WebSearch> = Box::new(mock);
        let hits = search.search("logo").await.unwrap();
        assert_eq!(hits[0].render(), "- logo <https://img.example/x>");
    }
}
