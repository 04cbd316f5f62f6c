use crate::config::TraccarConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use fleet_sync::{RestClient, TransportError};
use reqwest::header::SET_COOKIE;
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::{debug, info};

const SESSION_COOKIE: &str = "JSESSIONID";

/// HTTP client for the Traccar REST API.
///
/// REST calls use Basic auth. [`TraccarClient::login`] opens a cookie
/// session for the WebSocket endpoint, which does not accept Basic auth.
pub struct TraccarClient {
    http_client: Client,
    base_url: String,
    email: String,
    password: String,
}

impl TraccarClient {
    pub fn new(config: &TraccarConfig) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent("fleet-sync/0.1")
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            email: config.email.clone(),
            password: config.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Open a session and return the `JSESSIONID=...` cookie pair
    pub async fn login(&self) -> Result<String, TransportError> {
        let url = format!("{}/api/session", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .form(&[("email", self.email.as_str()), ("password", self.password.as_str())])
            .send()
            .await
            .map_err(map_request_error)?;

        let response = check_response_status(response).await?;

        let cookie = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(';').next())
            .find(|pair| pair.trim_start().starts_with(SESSION_COOKIE))
            .map(|pair| pair.trim().to_string())
            .ok_or_else(|| {
                TransportError::Unauthorized("session response carried no session cookie".into())
            })?;

        info!(email = %self.email, "Traccar session opened");
        Ok(cookie)
    }

    /// WebSocket URL of the push endpoint
    pub fn socket_url(&self) -> Result<String, TransportError> {
        socket_url(&self.base_url)
    }
}

#[async_trait]
impl RestClient for TraccarClient {
    async fn get(&self, path: &str, params: &[(String, String)]) -> Result<Value, TransportError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, params = params.len(), "GET");

        let response = self
            .http_client
            .get(&url)
            .query(params)
            .basic_auth(&self.email, Some(&self.password))
            .send()
            .await
            .map_err(map_request_error)?;

        let response = check_response_status(response).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| TransportError::Io(format!("invalid response body: {}", e)))
    }
}

/// Turn `http(s)://host[/prefix]` into `ws(s)://host[/prefix]/api/socket`
pub fn socket_url(base_url: &str) -> Result<String, TransportError> {
    let base = base_url.trim_end_matches('/');
    let rest = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        return Err(TransportError::InvalidEndpoint(format!(
            "unsupported scheme in {}",
            base_url
        )));
    };
    Ok(format!("{}/api/socket", rest))
}

fn map_request_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_builder() {
        TransportError::InvalidEndpoint(e.to_string())
    } else {
        TransportError::Io(e.to_string())
    }
}

/// Map non-2xx responses to transport errors.
///
/// - 401/403 → unauthorized (fatal)
/// - 408/429/5xx → transient
/// - Other 4xx → fatal request error
async fn check_response_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        body.chars().take(200).collect()
    };
    Err(TransportError::from_status(status.as_u16(), message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_sync::{Device, DeviceStatus, ErrorKind};
    use mockito::{Matcher, Server};

    fn client(url: String) -> TraccarClient {
        TraccarClient::new(&TraccarConfig {
            base_url: url,
            email: "ops@example.com".to_string(),
            password: "secret".to_string(),
            ..TraccarConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_login_returns_session_cookie() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/session")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("email".into(), "ops@example.com".into()),
                Matcher::UrlEncoded("password".into(), "secret".into()),
            ]))
            .with_status(200)
            .with_header("set-cookie", "JSESSIONID=node0abc123.node0; Path=/")
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": 1, "name": "ops"}"#)
            .create_async()
            .await;

        let cookie = client(server.url()).login().await.unwrap();
        assert_eq!(cookie, "JSESSIONID=node0abc123.node0");
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/session")
            .with_status(401)
            .create_async()
            .await;

        let err = client(server.url()).login().await.unwrap_err();
        assert!(matches!(err, TransportError::Unauthorized(_)));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn test_login_without_cookie_fails() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/session")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let err = client(server.url()).login().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_get_positions_with_params() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/positions")
            .match_query(Matcher::Regex("deviceId=1&deviceId=2".into()))
            .match_header("authorization", Matcher::Regex("^Basic ".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"deviceId": 1, "latitude": 47.1}]"#)
            .create_async()
            .await;

        let params = vec![
            ("deviceId".to_string(), "1".to_string()),
            ("deviceId".to_string(), "2".to_string()),
        ];
        let body = client(server.url()).get("/api/positions", &params).await.unwrap();

        mock.assert_async().await;
        assert_eq!(body[0]["deviceId"], 1);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let mut server = Server::new_async().await;
        let _unavailable = server
            .mock("GET", "/api/positions")
            .with_status(503)
            .create_async()
            .await;
        let _missing = server
            .mock("GET", "/api/missing")
            .with_status(404)
            .with_body("not found")
            .create_async()
            .await;
        let _forbidden = server
            .mock("GET", "/api/devices")
            .with_status(403)
            .create_async()
            .await;

        let client = client(server.url());

        let err = client.get("/api/positions", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);

        let err = client.get("/api/missing", &[]).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Http {
                status: 404,
                message: "not found".to_string()
            }
        );
        assert_eq!(err.kind(), ErrorKind::Fatal);

        let err = client.get("/api/devices", &[]).await.unwrap_err();
        assert!(matches!(err, TransportError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_invalid_body_is_transient() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/positions")
            .with_status(200)
            .with_body("<html>proxy error</html>")
            .create_async()
            .await;

        let err = client(server.url()).get("/api/positions", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_device_list_decodes() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/devices")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[
                    {"id": 7, "name": "Truck 7", "uniqueId": "356938035643809", "status": "online"}
                ]"#,
            )
            .create_async()
            .await;

        let body = client(server.url()).get("/api/devices", &[]).await.unwrap();
        let devices: Vec<Device> = serde_json::from_value(body).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, 7);
        assert_eq!(devices[0].status, DeviceStatus::Online);
    }

    #[test]
    fn test_socket_url() {
        assert_eq!(
            socket_url("http://localhost:8082").unwrap(),
            "ws://localhost:8082/api/socket"
        );
        assert_eq!(
            socket_url("https://gps.example.com/traccar/").unwrap(),
            "wss://gps.example.com/traccar/api/socket"
        );
        assert!(matches!(
            socket_url("gps.example.com"),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }
}
