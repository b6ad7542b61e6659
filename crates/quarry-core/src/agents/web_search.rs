use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use quarry_index::extractor::html_to_text;

use crate::error::AgentError;

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<a[^>]*class="[^"]*result__a[^"]*"[^>]*>(.*?)</a>"#).unwrap()
});
static SNIPPET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<(a|div|td)[^>]*class="[^"]*result__snippet[^"]*"[^>]*>(.*?)</(?:a|div|td)>"#)
        .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub title: String,
    pub snippet: String,
}

impl SearchResult {
    /// `title - snippet`, or whichever part is present.
    #[must_use]
    pub fn line(&self) -> String {
        match (self.title.is_empty(), self.snippet.is_empty()) {
            (false, false) => format!("{} - {}", self.title, self.snippet),
            (false, true) => self.title.clone(),
            _ => self.snippet.clone(),
        }
    }
}

/// Searches DuckDuckGo's HTML endpoint and returns the top results as text.
#[derive(Debug, Clone)]
pub struct WebSearchAgent {
    client: reqwest::Client,
    endpoint: String,
    max_results: usize,
}

impl WebSearchAgent {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, max_results: usize, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .unwrap_or_default();

        Self {
            client,
            endpoint: endpoint.into(),
            max_results: max_results.max(1),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the request fails, the endpoint answers with a non-success
    /// status, or no result could be parsed from the page.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchResult>, AgentError> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("q", query)
            .append_pair("b", "")
            .append_pair("kl", "us-en")
            .finish();

        let resp = self
            .client
            .post(&self.endpoint)
            .header("User-Agent", "Mozilla/5.0 (X11; Linux x86_64)")
            .header("Accept", "text/html,application/xhtml+xml")
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(AgentError::Other(format!("search returned HTTP {}", resp.status())));
        }

        let bytes = resp.bytes().await?;
        if bytes.len() > MAX_BODY_BYTES {
            return Err(AgentError::Other(format!(
                "search response too large: {} bytes",
                bytes.len()
            )));
        }

        let html = String::from_utf8_lossy(&bytes);
        let results = parse_results(&html, self.max_results);
        if results.is_empty() {
            return Err(AgentError::Other("no search results".into()));
        }
        Ok(results)
    }

    /// Run a search and render the results one per line.
    ///
    /// # Errors
    ///
    /// See [`Self::search`].
    pub async fn run(&self, query: &str) -> Result<String, AgentError> {
        let results = self.search(query).await?;
        tracing::debug!(results = results.len(), "web search finished");
        Ok(results
            .iter()
            .map(|r| format!("Web search result: {}", r.line()))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// Pull `(title, snippet)` pairs out of a DuckDuckGo HTML results page.
#[must_use]
pub fn parse_results(html: &str, limit: usize) -> Vec<SearchResult> {
    let titles: Vec<_> = TITLE_RE.captures_iter(html).collect();
    let snippets: Vec<(usize, String)> = SNIPPET_RE
        .captures_iter(html)
        .filter_map(|c| Some((c.get(0)?.start(), clean(c.get(2)?.as_str()))))
        .collect();

    let mut results = Vec::new();
    for (i, caps) in titles.iter().enumerate() {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let title = clean(inner.as_str());
        if title.is_empty() {
            continue;
        }
        let next_title = titles
            .get(i + 1)
            .and_then(|c| c.get(0))
            .map_or(html.len(), |m| m.start());
        let snippet = snippets
            .iter()
            .find(|(pos, _)| *pos > whole.end() && *pos < next_title)
            .map(|(_, s)| s.clone())
            .unwrap_or_default();

        results.push(SearchResult { title, snippet });
        if results.len() >= limit {
            break;
        }
    }
    results
}

fn clean(fragment: &str) -> String {
    html_to_text(fragment)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const PAGE: &str = r#"
<div class="result results_links results_links_deep web-result">
  <h2 class="result__title">
    <a rel="nofollow" class="result__a" href="https://tokio.rs/">Tokio - An asynchronous <b>Rust</b> runtime</a>
  </h2>
  <a class="result__snippet" href="https://tokio.rs/">Tokio is an event-driven, non-blocking I/O platform &amp; more.</a>
</div>
<div class="result results_links web-result">
  <h2 class="result__title">
    <a rel="nofollow" class="result__a" href="https://docs.rs/tokio">tokio - Rust</a>
  </h2>
</div>
<div class="result results_links web-result">
  <h2 class="result__title">
    <a rel="nofollow" class="result__a" href="https://github.com/tokio-rs/tokio">tokio-rs/tokio</a>
  </h2>
  <a class="result__snippet" href="https://github.com/tokio-rs/tokio">A runtime for writing reliable applications.</a>
</div>
"#;

    #[test]
    fn parses_titles_and_snippets() {
        let results = parse_results(PAGE, 10);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].title, "Tokio - An asynchronous Rust runtime");
        assert_eq!(
            results[0].snippet,
            "Tokio is an event-driven, non-blocking I/O platform & more."
        );
        assert!(results[1].snippet.is_empty());
        assert_eq!(results[2].snippet, "A runtime for writing reliable applications.");
    }

    #[test]
    fn limit_bounds_results() {
        assert_eq!(parse_results(PAGE, 2).len(), 2);
    }

    #[test]
    fn line_format() {
        let r = SearchResult {
            title: "T".into(),
            snippet: "S".into(),
        };
        assert_eq!(r.line(), "T - S");
        let only_title = SearchResult {
            title: "T".into(),
            snippet: String::new(),
        };
        assert_eq!(only_title.line(), "T");
    }

    #[tokio::test]
    async fn search_posts_form_and_formats_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/html/"))
            .and(body_string_contains("q=tokio+runtime"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .mount(&server)
            .await;

        let agent = WebSearchAgent::new(
            format!("{}/html/", server.uri()),
            2,
            Duration::from_secs(5),
        );
        let out = agent.run("tokio runtime").await.unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Web search result: Tokio - An asynchronous Rust runtime - "));
        assert_eq!(lines[1], "Web search result: tokio - Rust");
    }

    #[tokio::test]
    async fn error_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let agent = WebSearchAgent::new(server.uri(), 5, Duration::from_secs(5));
        let err = agent.search("anything").await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn empty_page_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let agent = WebSearchAgent::new(server.uri(), 5, Duration::from_secs(5));
        assert!(agent.search("nothing").await.is_err());
    }
}
