//! `reqwest` implementation of [`RemoteApi`]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::api::{clamp_changes_limit, clamp_events_limit, ApiError, ApiResult, RemoteApi};
use super::wire::{
    BatchCreateEventsRequest, BatchCreateEventsResponse, ChangeFeedResponse, CreateEventRequest,
    CreateGeofenceRequest, EventDto, EventTypeDto, GeofenceDto, LatestCursorResponse,
    UpdateEventRequest, UpdateEventTypeRequest, UpdateGeofenceRequest,
};
use crate::error::{Error, Result};
use crate::models::{EventId, EventTypeId};
use crate::util::{compact_text, is_http_url, normalize_text_option};

const API_PREFIX: &str = "/api/v1";
/// The backend replays the stored response for a key it has already seen
const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// HTTP client for the Trendy backend
#[derive(Clone)]
pub struct HttpRemoteApi {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemoteApi {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteApi")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl HttpRemoteApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let token = normalize_text_option(Some(token.into()))
            .ok_or_else(|| Error::Config("API token must not be empty".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::Config(error.to_string()))?;

        Ok(Self {
            base_url,
            token,
            client,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{API_PREFIX}{path}", self.base_url))
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
    }

    async fn send(&self, builder: RequestBuilder) -> ApiResult<Response> {
        let response = builder
            .send()
            .await
            .map_err(|error| ApiError::Network(error.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let header_retry = retry_after(&response);
        let body = response.text().await.unwrap_or_default();
        let rejection = parse_api_error(status, &body);
        tracing::debug!(
            status = status.as_u16(),
            reason = %rejection.message,
            request_id = rejection.request_id.as_deref(),
            "Request rejected"
        );
        Err(ApiError::from_status(
            status.as_u16(),
            rejection.message,
            header_retry.or(rejection.retry_after),
        ))
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ApiResult<T> {
        self.send(builder)
            .await?
            .json::<T>()
            .await
            .map_err(|error| ApiError::Decode(error.to_string()))
    }

    /// Send a write carrying its idempotency key
    async fn json_with_body<B, T>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        idempotency_key: &str,
    ) -> ApiResult<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        self.json(
            self.request(method, path)
                .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
                .json(body),
        )
        .await
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn create_event(
        &self,
        request: &CreateEventRequest,
        idempotency_key: &str,
    ) -> ApiResult<EventDto> {
        self.json_with_body(Method::POST, "/events", request, idempotency_key)
            .await
    }

    async fn batch_create_events(
        &self,
        requests: &[CreateEventRequest],
        idempotency_key: &str,
    ) -> ApiResult<BatchCreateEventsResponse> {
        let body = BatchCreateEventsRequest {
            events: requests.to_vec(),
        };
        self.json_with_body(Method::POST, "/events/batch", &body, idempotency_key)
            .await
    }

    async fn update_event(
        &self,
        id: &EventId,
        request: &UpdateEventRequest,
        idempotency_key: &str,
    ) -> ApiResult<EventDto> {
        self.json_with_body(Method::PUT, &format!("/events/{id}"), request, idempotency_key)
            .await
    }

    async fn delete_event(&self, id: &EventId) -> ApiResult<()> {
        self.send(self.request(Method::DELETE, &format!("/events/{id}")))
            .await
            .map(|_| ())
    }

    async fn list_events(&self, limit: usize, offset: usize) -> ApiResult<Vec<EventDto>> {
        let limit = clamp_events_limit(limit);
        self.json(
            self.request(Method::GET, "/events")
                .query(&[("limit", limit.to_string()), ("offset", offset.to_string())]),
        )
        .await
    }

    async fn create_event_type(
        &self,
        request: &EventTypeDto,
        idempotency_key: &str,
    ) -> ApiResult<EventTypeDto> {
        self.json_with_body(Method::POST, "/event-types", request, idempotency_key)
            .await
    }

    async fn update_event_type(
        &self,
        id: &EventTypeId,
        request: &UpdateEventTypeRequest,
        idempotency_key: &str,
    ) -> ApiResult<EventTypeDto> {
        self.json_with_body(
            Method::PUT,
            &format!("/event-types/{id}"),
            request,
            idempotency_key,
        )
        .await
    }

    async fn delete_event_type(&self, id: &EventTypeId) -> ApiResult<()> {
        self.send(self.request(Method::DELETE, &format!("/event-types/{id}")))
            .await
            .map(|_| ())
    }

    async fn list_event_types(&self) -> ApiResult<Vec<EventTypeDto>> {
        self.json(self.request(Method::GET, "/event-types")).await
    }

    async fn create_geofence(
        &self,
        request: &CreateGeofenceRequest,
        idempotency_key: &str,
    ) -> ApiResult<GeofenceDto> {
        self.json_with_body(Method::POST, "/geofences", request, idempotency_key)
            .await
    }

    async fn update_geofence(
        &self,
        server_id: &str,
        request: &UpdateGeofenceRequest,
        idempotency_key: &str,
    ) -> ApiResult<GeofenceDto> {
        self.json_with_body(
            Method::PUT,
            &format!("/geofences/{server_id}"),
            request,
            idempotency_key,
        )
        .await
    }

    async fn delete_geofence(&self, server_id: &str) -> ApiResult<()> {
        self.send(self.request(Method::DELETE, &format!("/geofences/{server_id}")))
            .await
            .map(|_| ())
    }

    async fn list_geofences(&self) -> ApiResult<Vec<GeofenceDto>> {
        self.json(self.request(Method::GET, "/geofences")).await
    }

    async fn changes(&self, since: i64, limit: usize) -> ApiResult<ChangeFeedResponse> {
        let limit = clamp_changes_limit(limit);
        self.json(
            self.request(Method::GET, "/changes")
                .query(&[("since", since.to_string()), ("limit", limit.to_string())]),
        )
        .await
    }

    async fn latest_cursor(&self) -> ApiResult<i64> {
        let response: LatestCursorResponse = self
            .json(self.request(Method::GET, "/changes/latest-cursor"))
            .await?;
        Ok(response.cursor)
    }
}

/// Error body: problem details (`application/problem+json`) or the older
/// `{error, message}` shape
#[derive(Debug, Deserialize)]
struct ErrorBody {
    title: Option<String>,
    detail: Option<String>,
    user_message: Option<String>,
    message: Option<String>,
    error: Option<String>,
    /// Seconds; the header wins when both are present
    retry_after: Option<u64>,
    request_id: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
struct Rejection {
    message: String,
    retry_after: Option<Duration>,
    request_id: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> Rejection {
    let code = status.as_u16();
    if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
        let retry_after = payload.retry_after.map(Duration::from_secs);
        let message = payload
            .detail
            .or(payload.user_message)
            .or(payload.message)
            .or(payload.error)
            .or(payload.title)
            .map_or_else(
                || format!("HTTP {code}"),
                |message| format!("{} ({code})", compact_text(&message)),
            );
        return Rejection {
            message,
            retry_after,
            request_id: payload.request_id,
        };
    }

    let trimmed = compact_text(body);
    let message = if trimmed.is_empty() {
        format!("HTTP {code}")
    } else {
        format!("{trimmed} ({code})")
    };
    Rejection {
        message,
        retry_after: None,
        request_id: None,
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn normalize_base_url(raw: String) -> Result<String> {
    let base_url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::Config("API base URL must not be empty".to_string()))?;
    if is_http_url(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(Error::Config(
            "API base URL must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    use super::*;

    #[test]
    fn normalize_base_url_rejects_invalid_values() {
        assert!(normalize_base_url(String::new()).is_err());
        assert!(normalize_base_url("api.trendy.app".to_string()).is_err());
        assert_eq!(
            normalize_base_url(" https://api.trendy.app/ ".to_string()).unwrap(),
            "https://api.trendy.app"
        );
    }

    #[test]
    fn parse_api_error_reads_legacy_and_problem_bodies() {
        assert_eq!(
            parse_api_error(StatusCode::BAD_REQUEST, r#"{"error":"invalid radius"}"#).message,
            "invalid radius (400)"
        );
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, "  ").message, "HTTP 502");

        let problem = r#"{
            "type": "https://api.trendy.app/problems/validation",
            "title": "Validation Failed",
            "status": 422,
            "detail": "radius must be between 50 and 10000",
            "request_id": "req-42",
            "errors": [{"field": "radius", "message": "out of range", "code": "range"}]
        }"#;
        assert_eq!(
            parse_api_error(StatusCode::UNPROCESSABLE_ENTITY, problem),
            Rejection {
                message: "radius must be between 50 and 10000 (422)".to_string(),
                retry_after: None,
                request_id: Some("req-42".to_string()),
            }
        );

        let limited = r#"{"title":"Too Many Requests","status":429,"retry_after":30}"#;
        let rejection = parse_api_error(StatusCode::TOO_MANY_REQUESTS, limited);
        assert_eq!(rejection.message, "Too Many Requests (429)");
        assert_eq!(rejection.retry_after, Some(Duration::from_secs(30)));
    }

    #[test]
    fn debug_redacts_token() {
        let api = HttpRemoteApi::new("https://api.trendy.app", "secret", Duration::from_secs(5))
            .unwrap();
        let debug = format!("{api:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    /// Serve one request, answering with `status_line` and `body`; the join
    /// handle yields the request head as received
    async fn spawn_one_shot_server(status_line: &str, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len(),
        );

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let head = read_request(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            head
        });
        (format!("http://{address}"), handle)
    }

    /// Read the head and the full body so the client never sees a reset
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 4096];
        loop {
            let read = socket.read(&mut chunk).await.unwrap();
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
            let Some(end) = buffer.windows(4).position(|window| window == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buffer[..end]).to_string();
            let length = head
                .lines()
                .find_map(|line| {
                    let line = line.to_ascii_lowercase();
                    line.strip_prefix("content-length:")
                        .and_then(|value| value.trim().parse::<usize>().ok())
                })
                .unwrap_or(0);
            if buffer.len() >= end + 4 + length {
                return head;
            }
        }
        String::from_utf8_lossy(&buffer).to_string()
    }

    fn client(base_url: &str) -> HttpRemoteApi {
        HttpRemoteApi::new(base_url, "token", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn list_events_sends_paging_parameters() {
        let (base_url, request) = spawn_one_shot_server("200 OK", "[]").await;

        let events = client(&base_url).list_events(5_000, 2_000).await.unwrap();

        assert!(events.is_empty());
        let head = request.await.unwrap();
        assert!(
            head.starts_with("GET /api/v1/events?limit=1000&offset=2000 "),
            "unexpected request line: {head}"
        );
    }

    #[tokio::test]
    async fn writes_carry_idempotency_key_and_surface_problem_detail() {
        let body = r#"{"title":"Validation Failed","status":422,"detail":"name is required"}"#;
        let (base_url, request) = spawn_one_shot_server("422 Unprocessable Entity", body).await;
        let update = UpdateEventTypeRequest::default();

        let error = client(&base_url)
            .update_event_type(&EventTypeId::new(), &update, "key-123")
            .await
            .unwrap_err();

        assert_eq!(
            error,
            ApiError::Validation {
                status: 422,
                message: "name is required (422)".to_string(),
            }
        );
        let head = request.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("put /api/v1/event-types/"));
        assert!(head.contains("idempotency-key: key-123"), "missing key: {head}");
    }

    #[tokio::test]
    async fn rate_limit_falls_back_to_body_retry_after() {
        let body = r#"{"title":"Too Many Requests","status":429,"retry_after":30}"#;
        let (base_url, _request) = spawn_one_shot_server("429 Too Many Requests", body).await;

        let error = client(&base_url).latest_cursor().await.unwrap_err();

        assert_eq!(
            error,
            ApiError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            }
        );
    }
}
