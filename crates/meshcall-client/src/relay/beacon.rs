use meshcall_protocol::PeerId;
use serde::Serialize;
use std::time::Duration;

/// Best-effort notice to the api that this connection is leaving
pub trait LeaveBeacon: Send + Sync {
    /// Must return immediately; delivery is not awaited
    fn notify(&self, api_url: &str, connection_id: &PeerId);
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LeaveNotice {
    connection_id: PeerId,
}

/// Fire-and-forget `POST <api_url>/leave`
#[derive(Clone)]
pub struct HttpLeaveBeacon {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpLeaveBeacon {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl LeaveBeacon for HttpLeaveBeacon {
    fn notify(&self, api_url: &str, connection_id: &PeerId) {
        let url = leave_url(api_url);
        let request = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&LeaveNotice {
                connection_id: connection_id.clone(),
            });

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime available, leave notice for {} not sent", connection_id);
            return;
        };

        runtime.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!("Leave notice delivered to {}", url);
                }
                Ok(response) => {
                    tracing::warn!("Leave notice rejected with status {}", response.status());
                }
                Err(e) => {
                    tracing::warn!("Leave notice failed: {}", e);
                }
            }
        });
    }
}

fn leave_url(api_url: &str) -> String {
    format!("{}/leave", api_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notice_body() {
        let notice = LeaveNotice {
            connection_id: PeerId::from("A"),
        };
        assert_eq!(serde_json::to_value(notice).unwrap(), json!({"connectionId": "A"}));
    }

    #[test]
    fn test_leave_url() {
        assert_eq!(leave_url("http://api"), "http://api/leave");
        assert_eq!(leave_url("http://api/"), "http://api/leave");
    }

    #[test]
    fn test_notify_outside_runtime_does_not_block() {
        let beacon = HttpLeaveBeacon::new(Duration::from_millis(10));
        beacon.notify("http://127.0.0.1:9", &PeerId::from("A"));
    }
}
