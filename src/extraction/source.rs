use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

const DEALS_PATH: &str = "/crm/v3/objects/deals";
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// One raw record as returned by the CRM objects API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub archived: bool,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<String>,
    #[serde(rename = "updatedAt", default)]
    pub updated_at: Option<String>,
}

/// One fetched page plus the cursor for the next one (absent on the last
/// page).
#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<RawRecord>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("api error: status {status}: {message}")]
    Api { status: u16, message: String },
}

/// The upstream page source as the extraction loop sees it: one fallible
/// call per page. Rate-limit handling lives behind this boundary, not in
/// the loop.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn fetch_page(
        &self,
        access_token: &str,
        cursor: Option<&str>,
        page_size: i64,
        properties: Option<&[String]>,
    ) -> Result<Page, SourceError>;
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    results: Vec<RawRecord>,
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    next: Option<PagingNext>,
}

#[derive(Debug, Deserialize)]
struct PagingNext {
    after: Option<String>,
}

/// CRM v3 API client.
pub struct CrmClient {
    client: Client,
    base_url: String,
}

impl CrmClient {
    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for CrmClient {
    async fn fetch_page(
        &self,
        access_token: &str,
        cursor: Option<&str>,
        page_size: i64,
        properties: Option<&[String]>,
    ) -> Result<Page, SourceError> {
        let url = format!("{}{}", self.base_url, DEALS_PATH);
        // The API caps page size at 100.
        let limit = page_size.clamp(1, 100).to_string();

        let mut attempts = 0;
        loop {
            let mut request = self
                .client
                .get(&url)
                .bearer_auth(access_token)
                .query(&[("limit", limit.as_str())]);
            if let Some(after) = cursor {
                request = request.query(&[("after", after)]);
            }
            if let Some(props) = properties {
                request = request.query(&[("properties", props.join(",").as_str())]);
            }

            let response = request.send().await?;
            let status = response.status();

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                attempts += 1;
                if attempts >= MAX_RATE_LIMIT_RETRIES {
                    return Err(SourceError::RateLimited { attempts });
                }
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(1);
                warn!(
                    "Rate limited by upstream, retrying in {}s (attempt {})",
                    retry_after, attempts
                );
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                continue;
            }

            if !status.is_success() {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                return Err(SourceError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            let body = response.json::<ListResponse>().await?;
            let next_cursor = body.paging.and_then(|p| p.next).and_then(|n| n.after);
            debug!(
                "Fetched page: records={}, has_next={}",
                body.results.len(),
                next_cursor.is_some()
            );
            return Ok(Page {
                records: body.results,
                next_cursor,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn page_body(ids: &[&str], next: Option<&str>) -> serde_json::Value {
        let results: Vec<_> = ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "id": id,
                    "properties": {"dealname": format!("deal {}", id)},
                    "archived": false,
                })
            })
            .collect();
        match next {
            Some(after) => serde_json::json!({
                "results": results,
                "paging": {"next": {"after": after}},
            }),
            None => serde_json::json!({ "results": results }),
        }
    }

    #[tokio::test]
    async fn fetches_page_and_next_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DEALS_PATH))
            .and(query_param("limit", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(&["1", "2"], Some("cur-2"))))
            .mount(&server)
            .await;

        let client = CrmClient::new(server.uri());
        let page = client
            .fetch_page("token", None, 100, None)
            .await
            .unwrap();

        assert_eq!(page.records.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("cur-2"));
        assert_eq!(page.records[0].id, "1");
    }

    #[tokio::test]
    async fn last_page_has_no_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DEALS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(&["9"], None)))
            .mount(&server)
            .await;

        let client = CrmClient::new(server.uri());
        let page = client.fetch_page("token", Some("cur-8"), 50, None).await.unwrap();

        assert_eq!(page.records.len(), 1);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn retries_rate_limit_with_retry_after() {
        let server = MockServer::start().await;
        // First call is throttled, second succeeds.
        Mock::given(method("GET"))
            .and(path(DEALS_PATH))
            .respond_with(
                ResponseTemplate::new(429).insert_header("retry-after", "0"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(DEALS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(&["1"], None)))
            .mount(&server)
            .await;

        let client = CrmClient::new(server.uri());
        let page = client.fetch_page("token", None, 100, None).await.unwrap();

        assert_eq!(page.records.len(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_repeated_rate_limits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DEALS_PATH))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .mount(&server)
            .await;

        let client = CrmClient::new(server.uri());
        let err = client.fetch_page("token", None, 100, None).await.unwrap_err();

        assert!(matches!(err, SourceError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn surfaces_api_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DEALS_PATH))
            .respond_with(ResponseTemplate::new(401).set_body_string("expired token"))
            .mount(&server)
            .await;

        let client = CrmClient::new(server.uri());
        let err = client.fetch_page("token", None, 100, None).await.unwrap_err();

        match err {
            SourceError::Api { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "expired token");
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }
}
