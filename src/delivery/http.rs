use super::sink::{InputLogEvent, LogSink, LogTarget, SinkError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const TARGET_PREFIX: &str = "Logs_20140328";

/// JSON-over-HTTP client for the remote log service.
///
/// Every operation is one POST to the endpoint, named by the `X-Amz-Target`
/// header. Failures are classified from the `__type` field of the error body.
#[derive(Debug, Clone)]
pub struct HttpLogSink {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpLogSink {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Misconfigured(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        body: serde_json::Value,
    ) -> Result<T, SinkError> {
        debug!(operation, endpoint = %self.endpoint, "Calling log service");

        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Amz-Target", format!("{}.{}", TARGET_PREFIX, operation))
            .header("Content-Type", "application/x-amz-json-1.1")
            .body(body.to_string())
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(classify_error(status.as_u16(), &text));
        }

        // Operations without output answer with an empty body.
        let text = if text.trim().is_empty() { "{}" } else { &text };
        serde_json::from_str(text)
            .map_err(|e| SinkError::Transient(format!("malformed {} response: {}", operation, e)))
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(e: reqwest::Error) -> Self {
        SinkError::Transient(e.to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(rename = "__type")]
    kind: Option<String>,
    #[serde(alias = "Message")]
    message: Option<String>,
    #[serde(rename = "expectedSequenceToken")]
    expected_sequence_token: Option<String>,
}

/// Map a failed response onto [`SinkError`].
pub fn classify_error(status: u16, body: &str) -> SinkError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed.message.unwrap_or_else(|| body.to_string());

    let Some(kind) = parsed.kind else {
        return match status {
            401 | 403 => SinkError::Misconfigured(format!("HTTP {}: {}", status, message)),
            _ => SinkError::Transient(format!("HTTP {}: {}", status, message)),
        };
    };

    // Some services qualify the type with a namespace: `ns#Name`.
    let name = kind.rsplit('#').next().unwrap_or(&kind);
    match name {
        "InvalidSequenceTokenException" => SinkError::InvalidSequenceToken {
            expected: parsed.expected_sequence_token,
        },
        "DataAlreadyAcceptedException" => SinkError::DataAlreadyAccepted {
            next_token: parsed.expected_sequence_token,
        },
        "ResourceNotFoundException" => SinkError::ResourceNotFound(message),
        "ResourceAlreadyExistsException" => SinkError::ResourceAlreadyExists(message),
        "InvalidParameterException"
        | "UnrecognizedClientException"
        | "AccessDeniedException"
        | "InvalidSignatureException"
        | "MissingAuthenticationTokenException" => {
            SinkError::Misconfigured(format!("{}: {}", name, message))
        }
        _ => SinkError::Transient(format!("HTTP {} {}: {}", status, name, message)),
    }
}

#[derive(Debug, Deserialize)]
struct Empty {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeGroupsResponse {
    #[serde(default)]
    log_groups: Vec<GroupEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupEntry {
    log_group_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeStreamsResponse {
    #[serde(default)]
    log_streams: Vec<StreamEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamEntry {
    log_stream_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PutEventsRequest<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
    log_events: &'a [InputLogEvent],
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutEventsResponse {
    next_sequence_token: Option<String>,
}

#[async_trait]
impl LogSink for HttpLogSink {
    async fn describe_groups(&self, prefix: &str) -> Result<Vec<String>, SinkError> {
        let response: DescribeGroupsResponse = self
            .call("DescribeLogGroups", json!({ "logGroupNamePrefix": prefix }))
            .await?;
        Ok(response
            .log_groups
            .into_iter()
            .map(|g| g.log_group_name)
            .collect())
    }

    async fn create_group(&self, group: &str) -> Result<(), SinkError> {
        let _: Empty = self
            .call("CreateLogGroup", json!({ "logGroupName": group }))
            .await?;
        Ok(())
    }

    async fn put_retention_policy(&self, group: &str, days: u32) -> Result<(), SinkError> {
        let _: Empty = self
            .call(
                "PutRetentionPolicy",
                json!({ "logGroupName": group, "retentionInDays": days }),
            )
            .await?;
        Ok(())
    }

    async fn describe_streams(&self, group: &str, prefix: &str) -> Result<Vec<String>, SinkError> {
        let response: DescribeStreamsResponse = self
            .call(
                "DescribeLogStreams",
                json!({ "logGroupName": group, "logStreamNamePrefix": prefix }),
            )
            .await?;
        Ok(response
            .log_streams
            .into_iter()
            .map(|s| s.log_stream_name)
            .collect())
    }

    async fn create_stream(&self, group: &str, stream: &str) -> Result<(), SinkError> {
        let _: Empty = self
            .call(
                "CreateLogStream",
                json!({ "logGroupName": group, "logStreamName": stream }),
            )
            .await?;
        Ok(())
    }

    async fn put_events(
        &self,
        target: &LogTarget,
        events: &[InputLogEvent],
        token: Option<&str>,
    ) -> Result<Option<String>, SinkError> {
        let request = PutEventsRequest {
            log_group_name: &target.group,
            log_stream_name: &target.stream,
            log_events: events,
            sequence_token: token,
        };
        let body = serde_json::to_value(&request)
            .map_err(|e| SinkError::Misconfigured(e.to_string()))?;

        let response: PutEventsResponse = self.call("PutLogEvents", body).await?;
        Ok(response.next_sequence_token)
    }
}
