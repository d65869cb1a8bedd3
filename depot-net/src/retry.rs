// depot-net/src/retry.rs
//
// Generic "make one JSON RPC call, retry on transient failure" primitive
// shared by every repository endpoint.

use depot_common::config::Config;
use depot_common::error::{DepotError, Result};
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

/// How one HTTP response should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Status < 300: decode the JSON body.
    Success,
    /// 3xx/4xx other than 408: terminal, surface the response body.
    Fatal,
    /// 408 or >= 500 (or a transport error): retry.
    Transient,
}

/// Classifies an HTTP status into exactly one of the three outcomes.
pub fn classify(status: StatusCode) -> Outcome {
    if status.as_u16() < 300 {
        Outcome::Success
    } else if status == StatusCode::REQUEST_TIMEOUT || status.as_u16() >= 500 {
        Outcome::Transient
    } else {
        Outcome::Fatal
    }
}

/// Issues one JSON RPC call with the configured retry budget.
///
/// Transport errors and 5xx responses are retried with a fixed delay;
/// exhausting the budget yields `BackendInaccessible`. 3xx/4xx responses
/// are terminal and carry the server-provided body.
pub(crate) async fn call_json<B, T>(
    client: &Client,
    method: Method,
    url: Url,
    token: Option<&str>,
    body: Option<&B>,
    config: &Config,
) -> Result<T>
where
    B: Serialize,
    T: DeserializeOwned,
{
    for attempt in 1..=config.rpc_attempts {
        debug!("{} {} (attempt {})", method, url, attempt);
        let mut req = client.request(method.clone(), url.clone());
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                match classify(status) {
                    Outcome::Success => {
                        let text = resp.text().await?;
                        return serde_json::from_str(&text)
                            .map_err(|e| DepotError::Api(format!("Bad response body: {e}")));
                    }
                    Outcome::Fatal => {
                        let body_text = resp.text().await.unwrap_or_default();
                        return Err(DepotError::Api(format!("{status}: {body_text}")));
                    }
                    Outcome::Transient => {
                        warn!("{} {} replied {}, retrying", method, url, status);
                    }
                }
            }
            Err(e) => {
                warn!("{} {} failed ({}), retrying", method, url, e);
            }
        }

        if attempt < config.rpc_attempts {
            tokio::time::sleep(config.rpc_retry_delay).await;
        }
    }
    Err(DepotError::BackendInaccessible(config.rpc_attempts))
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Reply {
        value: String,
    }

    fn fast_config() -> Config {
        Config {
            rpc_attempts: 3,
            rpc_retry_delay: std::time::Duration::ZERO,
            ..Config::defaults()
        }
    }

    fn url_of(server: &MockServer, path: &str) -> Url {
        Url::parse(&server.url(path)).unwrap()
    }

    #[test]
    fn classification() {
        assert_eq!(classify(StatusCode::OK), Outcome::Success);
        assert_eq!(classify(StatusCode::NO_CONTENT), Outcome::Success);
        assert_eq!(classify(StatusCode::MOVED_PERMANENTLY), Outcome::Fatal);
        assert_eq!(classify(StatusCode::FORBIDDEN), Outcome::Fatal);
        assert_eq!(classify(StatusCode::NOT_FOUND), Outcome::Fatal);
        assert_eq!(classify(StatusCode::REQUEST_TIMEOUT), Outcome::Transient);
        assert_eq!(classify(StatusCode::INTERNAL_SERVER_ERROR), Outcome::Transient);
        assert_eq!(classify(StatusCode::SERVICE_UNAVAILABLE), Outcome::Transient);
    }

    #[tokio::test]
    async fn success_decodes_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/method");
                then.status(200).body(r#"{"value":"123"}"#);
            })
            .await;

        let reply: Reply = call_json::<(), _>(
            &Client::new(),
            Method::POST,
            url_of(&server, "/api/method"),
            None,
            None,
            &fast_config(),
        )
        .await
        .unwrap();
        assert_eq!(reply.value, "123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/method");
                then.status(403).body("denied");
            })
            .await;

        let err = call_json::<(), Reply>(
            &Client::new(),
            Method::POST,
            url_of(&server, "/api/method"),
            None,
            None,
            &fast_config(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DepotError::Api(_)), "{err}");
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn transient_errors_exhaust_the_budget() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/method");
                then.status(500);
            })
            .await;

        let err = call_json::<(), Reply>(
            &Client::new(),
            Method::POST,
            url_of(&server, "/api/method"),
            None,
            None,
            &fast_config(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DepotError::BackendInaccessible(3)), "{err}");
        assert_eq!(mock.hits_async().await, 3);
    }

    #[tokio::test]
    async fn request_timeout_is_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/method");
                then.status(408);
            })
            .await;

        let err = call_json::<(), Reply>(
            &Client::new(),
            Method::POST,
            url_of(&server, "/api/method"),
            None,
            None,
            &fast_config(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DepotError::BackendInaccessible(3)), "{err}");
        assert_eq!(mock.hits_async().await, 3);
    }

    #[tokio::test]
    async fn bearer_token_is_attached() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/method")
                    .header("authorization", "Bearer secret");
                then.status(200).body(r#"{"value":"ok"}"#);
            })
            .await;

        let reply: Reply = call_json::<(), _>(
            &Client::new(),
            Method::POST,
            url_of(&server, "/api/method"),
            Some("secret"),
            None,
            &fast_config(),
        )
        .await
        .unwrap();
        assert_eq!(reply.value, "ok");
        mock.assert_async().await;
    }
}
