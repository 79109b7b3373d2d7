use crate::activity::RawActivity;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    #[error("upstream returned HTTP {0}")]
    Status(StatusCode),

    #[error("upstream response unparseable: {0}")]
    Unparseable(#[source] serde_json::Error),

    #[error("upstream rejected request: {0}")]
    Rejected(String),
}

impl UpstreamError {
    // reqwest errors carry the request URL, and ours holds the API key.
    fn unreachable(err: reqwest::Error) -> Self {
        UpstreamError::Unreachable(err.without_url())
    }
}

/// A Tautulli instance and the key to talk to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    base_url: String,
    api_key: String,
}

impl Endpoint {
    pub fn new(raw_url: &str, api_key: &str) -> Self {
        Self {
            base_url: normalize_base_url(raw_url),
            api_key: api_key.trim().to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    fn api_url(&self) -> String {
        format!("{}/api/v2", self.base_url)
    }
}

/// Bare hosts get `https://`; trailing slashes are dropped so `/api/v2` can be appended.
pub fn normalize_base_url(raw: &str) -> String {
    let t = raw.trim().trim_end_matches('/');
    let lower = t.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        t.to_string()
    } else {
        format!("https://{t}")
    }
}

#[derive(Debug, Default, Deserialize)]
struct ActivityEnvelope {
    #[serde(default)]
    response: ActivityResponse,
}

#[derive(Debug, Default, Deserialize)]
struct ActivityResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<RawActivity>,
}

pub fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .connect_timeout(UPSTREAM_TIMEOUT)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
}

pub async fn fetch_activity(
    client: &reqwest::Client,
    endpoint: &Endpoint,
) -> Result<RawActivity, UpstreamError> {
    let resp = client
        .get(endpoint.api_url())
        .query(&[("apikey", endpoint.api_key()), ("cmd", "get_activity")])
        .send()
        .await
        .map_err(UpstreamError::unreachable)?;

    let status = resp.status();
    if !status.is_success() {
        return Err(UpstreamError::Status(status));
    }

    let body = resp.bytes().await.map_err(UpstreamError::unreachable)?;
    let envelope: ActivityEnvelope =
        serde_json::from_slice(&body).map_err(UpstreamError::Unparseable)?;

    let response = envelope.response;
    if response.result.as_deref() == Some("error") {
        let message = response
            .message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "no message".to_string());
        return Err(UpstreamError::Rejected(message));
    }
    Ok(response.data.unwrap_or_default())
}

/// Starts the poster fetch. Whatever status Tautulli answers with is left for
/// the caller to pass through; only transport failures are errors.
pub async fn fetch_image(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    img: &str,
) -> Result<reqwest::Response, UpstreamError> {
    client
        .get(endpoint.api_url())
        .query(&[
            ("apikey", endpoint.api_key()),
            ("cmd", "pms_image_proxy"),
            ("img", img),
        ])
        .send()
        .await
        .map_err(UpstreamError::unreachable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn activity_query() -> Matcher {
        Matcher::AllOf(vec![
            Matcher::UrlEncoded("apikey".into(), "secret".into()),
            Matcher::UrlEncoded("cmd".into(), "get_activity".into()),
        ])
    }

    /// Base URL of a local port nothing listens on.
    fn refused_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}")
    }

    #[test]
    fn normalize_base_url_defaults_to_https() {
        assert_eq!(normalize_base_url("tautulli.lan:8181"), "https://tautulli.lan:8181");
        assert_eq!(normalize_base_url(" http://10.0.0.2:8181/ "), "http://10.0.0.2:8181");
        assert_eq!(normalize_base_url("HTTPS://Host"), "HTTPS://Host");
        assert_eq!(normalize_base_url("https://host/tautulli//"), "https://host/tautulli");
    }

    #[tokio::test]
    async fn fetch_activity_decodes_envelope() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v2")
            .match_query(activity_query())
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "response": {
                        "result": "success",
                        "message": null,
                        "data": {
                            "stream_count": "2",
                            "sessions": [
                                { "user": "a", "title": "One", "media_type": "movie" },
                                { "user": "b", "title": "Two", "media_type": "episode" }
                            ]
                        }
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = build_client().unwrap();
        let raw = fetch_activity(&client, &Endpoint::new(&server.url(), "secret"))
            .await
            .unwrap();
        assert_eq!(raw.stream_count, serde_json::json!("2"));
        assert_eq!(raw.sessions.len(), 2);
        assert_eq!(raw.sessions[1].media_type, "episode");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn fetch_activity_malformed_body_is_unparseable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v2")
            .match_query(activity_query())
            .with_body("<html>login</html>")
            .create_async()
            .await;

        let client = build_client().unwrap();
        let err = fetch_activity(&client, &Endpoint::new(&server.url(), "secret"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Unparseable(_)), "{err}");
    }

    #[tokio::test]
    async fn fetch_activity_error_result_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v2")
            .match_query(activity_query())
            .with_body(r#"{"response":{"result":"error","message":"Invalid apikey","data":{}}}"#)
            .create_async()
            .await;

        let client = build_client().unwrap();
        let err = fetch_activity(&client, &Endpoint::new(&server.url(), "secret"))
            .await
            .unwrap_err();
        match err {
            UpstreamError::Rejected(msg) => assert_eq!(msg, "Invalid apikey"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn fetch_activity_http_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v2")
            .match_query(activity_query())
            .with_status(502)
            .create_async()
            .await;

        let client = build_client().unwrap();
        let err = fetch_activity(&client, &Endpoint::new(&server.url(), "secret"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Status(s) if s == StatusCode::BAD_GATEWAY));
    }

    #[tokio::test]
    async fn fetch_activity_connection_refused_hides_api_key() {
        let client = build_client().unwrap();
        let err = fetch_activity(&client, &Endpoint::new(&refused_url(), "secret"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Unreachable(_)));
        assert!(!err.to_string().contains("secret"));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_activity_gives_up_on_silent_upstream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let client = build_client().unwrap();
        let started = tokio::time::Instant::now();
        let err = fetch_activity(&client, &Endpoint::new(&base, "secret"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Unreachable(_)), "{err}");
        assert!(started.elapsed() >= UPSTREAM_TIMEOUT);
    }

    #[tokio::test]
    async fn fetch_image_sends_encoded_ref() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v2")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("apikey".into(), "secret".into()),
                Matcher::UrlEncoded("cmd".into(), "pms_image_proxy".into()),
                Matcher::UrlEncoded("img".into(), "/library/metadata/9/thumb 1".into()),
            ]))
            .with_status(404)
            .create_async()
            .await;

        let client = build_client().unwrap();
        let resp = fetch_image(
            &client,
            &Endpoint::new(&server.url(), "secret"),
            "/library/metadata/9/thumb 1",
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        mock.assert_async().await;
    }
}
