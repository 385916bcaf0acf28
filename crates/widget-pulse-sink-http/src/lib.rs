use std::time::Duration;

use widget_pulse_core::{EventSink, SinkTransportError};

const CONNECT_TIMEOUT_MS: u64 = 5_000;
const REQUEST_TIMEOUT_MS: u64 = 15_000;

/// Form-encoded POST sink over a blocking agent. The endpoint is treated as
/// an opaque spreadsheet-backed collector; timeouts bound hung calls so a
/// caller waiting on a feedback settle is never stuck indefinitely.
pub struct HttpEventSink {
    agent: ureq::Agent,
    endpoint: String,
}

impl HttpEventSink {
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        Self::with_timeouts(
            endpoint,
            Duration::from_millis(CONNECT_TIMEOUT_MS),
            Duration::from_millis(REQUEST_TIMEOUT_MS),
        )
    }

    #[must_use]
    pub fn with_timeouts(endpoint: &str, connect: Duration, request: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect)
            .timeout_read(request)
            .timeout_write(request)
            .build();

        Self {
            agent,
            endpoint: endpoint.to_string(),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl EventSink for HttpEventSink {
    fn dispatch(&self, fields: &[(String, String)]) -> Result<String, SinkTransportError> {
        let pairs: Vec<(&str, &str)> = fields
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();

        match self.agent.post(&self.endpoint).send_form(&pairs) {
            Ok(resp) => resp
                .into_string()
                .map_err(|err| SinkTransportError(format!("failed to read sink reply: {err}"))),
            // A non-2xx reply with a readable body is still a sink reply;
            // collectors return their error payloads this way.
            Err(ureq::Error::Status(code, resp)) => {
                tracing::debug!(status = code, "sink replied with an http error status");
                resp.into_string().map_err(|err| {
                    SinkTransportError(format!(
                        "http status {code} with unreadable body: {err}"
                    ))
                })
            }
            Err(ureq::Error::Transport(err)) => {
                Err(SinkTransportError(format!("transport failure: {err}")))
            }
        }
    }
}
