//! HTTP Remote Gateway backed by reqwest.
//!
//! ```text
//! POST {base}/v1/sync/{entity_type}/push      -> 200 {version, updated_at} | 409 {current}
//! GET  {base}/v1/sync/{entity_type}/changes?since=&since_id=&limit=
//! ```

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::models::{OperationId, RecordSnapshot};
use crate::sync::{
    AccessToken, GatewayError, PullBatch, PullRequest, PushOutcome, PushRequest, RemoteGateway,
};
use crate::util::{compact_text, is_http_url, normalize_text_option};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Clone)]
pub struct HttpGateway {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>) -> Result<Self, GatewayError> {
        let base_url = normalize_endpoint(base_url.into())?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("lectern/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| GatewayError::Transport(error.to_string()))?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, request_path: &str) -> String {
        format!("{}/v1/sync/{request_path}", self.base_url)
    }
}

#[derive(Serialize)]
struct PushBody<'a> {
    operation_id: &'a OperationId,
    record: &'a RecordSnapshot,
    expected_version: i64,
}

#[derive(Deserialize)]
struct AcceptedBody {
    version: i64,
    updated_at: i64,
}

#[derive(Deserialize)]
struct ConflictBody {
    current: RecordSnapshot,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    fn name(&self) -> &str {
        "http"
    }

    async fn push(
        &self,
        token: &AccessToken,
        request: &PushRequest,
    ) -> Result<PushOutcome, GatewayError> {
        let response = self
            .client
            .post(self.url(&format!("{}/push", request.entity_type)))
            .bearer_auth(token.secret())
            .header("Accept", "application/json")
            .header(IDEMPOTENCY_HEADER, request.operation_id.as_str())
            .json(&PushBody {
                operation_id: &request.operation_id,
                record: &request.record,
                expected_version: request.expected_version,
            })
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.is_success() {
            let body = response
                .json::<AcceptedBody>()
                .await
                .map_err(map_decode_error)?;
            return Ok(PushOutcome::Accepted {
                version: body.version,
                updated_at: body.updated_at,
            });
        }
        if status == StatusCode::CONFLICT {
            let body = response
                .json::<ConflictBody>()
                .await
                .map_err(map_decode_error)?;
            return Ok(PushOutcome::VersionConflict {
                current: body.current,
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn pull(
        &self,
        token: &AccessToken,
        request: &PullRequest,
    ) -> Result<PullBatch, GatewayError> {
        let mut query = vec![
            ("since", request.since.updated_at.to_string()),
            ("limit", request.limit.to_string()),
        ];
        if let Some(id) = request.since.id {
            query.push(("since_id", id.as_str()));
        }

        let response = self
            .client
            .get(self.url(&format!("{}/changes", request.entity_type)))
            .bearer_auth(token.secret())
            .header("Accept", "application/json")
            .query(&query)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        response.json::<PullBatch>().await.map_err(map_decode_error)
    }
}

/// Map a non-success status to a gateway error.
fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let message = parse_api_error(status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Unauthorized(message),
        StatusCode::BAD_REQUEST
        | StatusCode::NOT_FOUND
        | StatusCode::PAYLOAD_TOO_LARGE
        | StatusCode::UNPROCESSABLE_ENTITY => GatewayError::Rejected(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            GatewayError::Transport(message)
        }
        status if status.is_server_error() => GatewayError::Transport(message),
        _ => GatewayError::Protocol(message),
    }
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", compact_text(trimmed), status.as_u16())
    }
}

fn map_transport_error(error: reqwest::Error) -> GatewayError {
    if error.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Transport(error.to_string())
    }
}

fn map_decode_error(error: reqwest::Error) -> GatewayError {
    if error.is_decode() {
        GatewayError::Protocol(error.to_string())
    } else {
        map_transport_error(error)
    }
}

fn normalize_endpoint(raw: String) -> Result<String, GatewayError> {
    let endpoint = normalize_text_option(Some(raw))
        .ok_or_else(|| GatewayError::Protocol("endpoint must not be empty".to_string()))?;
    if is_http_url(&endpoint) {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(GatewayError::Protocol(
            "endpoint must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PullPosition;

    #[test]
    fn test_normalize_endpoint_trims_trailing_slash() {
        assert_eq!(
            normalize_endpoint(" https://sync.example.com/ ".to_string()).unwrap(),
            "https://sync.example.com"
        );
    }

    #[test]
    fn test_normalize_endpoint_rejects_invalid_values() {
        assert!(normalize_endpoint(String::new()).is_err());
        assert!(normalize_endpoint("sync.example.com".to_string()).is_err());
    }

    #[test]
    fn test_gateway_builds_versioned_urls() {
        let gateway = HttpGateway::new("http://localhost:8080/").unwrap();
        assert_eq!(
            gateway.url("sermon/push"),
            "http://localhost:8080/v1/sync/sermon/push"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            GatewayError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, r#"{"message":"title too long"}"#),
            GatewayError::Rejected(message) if message == "title too long (422)"
        ));
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(matches!(
            classify_status(StatusCode::IM_A_TEAPOT, "teapot"),
            GatewayError::Protocol(_)
        ));
    }

    #[test]
    fn test_parse_api_error_falls_back_to_status() {
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, "  "), "HTTP 502");
        assert_eq!(
            parse_api_error(StatusCode::BAD_REQUEST, r#"{"error":"bad cursor"}"#),
            "bad cursor (400)"
        );
    }

    #[test]
    fn test_pull_batch_decodes_without_has_more() {
        let batch: PullBatch = serde_json::from_str(
            r#"{"records":[],"next_cursor":{"updated_at":42,"id":null}}"#,
        )
        .unwrap();
        assert!(!batch.has_more);
        assert_eq!(
            batch.next_cursor,
            PullPosition {
                updated_at: 42,
                id: None
            }
        );
    }
}
