//! Shared HTTP transport for the engine clients.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::multipart::Form;
use reqwest::{Client, Response};

use super::EngineError;

const RETRY_MIN_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);
/// Two retries on top of the initial attempt.
const RETRY_TIMES: usize = 2;

/// Stateless multipart POST helper shared by all engine clients. Cheap to
/// clone; the inner `reqwest::Client` pools connections.
#[derive(Debug, Clone)]
pub struct EngineTransport {
    http: Client,
    backoff: ExponentialBuilder,
}

impl EngineTransport {
    pub fn new(timeout: Duration) -> Result<Self, EngineError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| EngineError::Client { source })?;

        let backoff = ExponentialBuilder::default()
            .with_min_delay(RETRY_MIN_DELAY)
            .with_max_delay(RETRY_MAX_DELAY)
            .with_max_times(RETRY_TIMES)
            .with_jitter();

        Ok(Self { http, backoff })
    }

    /// POST a multipart form, rebuilding it for every attempt so each retry
    /// is a fresh upload. Retries only on the transport policy's statuses
    /// and connection-level failures.
    pub async fn post_multipart<F>(
        &self,
        engine: &'static str,
        url: &str,
        query: &[(&str, String)],
        build_form: F,
    ) -> Result<Response, EngineError>
    where
        F: Fn() -> Form,
    {
        debug_assert!(url.starts_with("http"));
        debug_assert!(query.len() <= 8);

        let attempt = || async {
            let response = self
                .http
                .post(url)
                .query(query)
                .multipart(build_form())
                .send()
                .await
                .map_err(|source| EngineError::Transport { engine, source })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(EngineError::Status {
                    engine,
                    status,
                    body: truncate_body(body),
                });
            }

            Ok(response)
        };

        attempt
            .retry(self.backoff)
            .when(EngineError::is_retryable)
            .notify(|err: &EngineError, delay: Duration| {
                tracing::warn!(
                    engine,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "retrying engine call"
                );
            })
            .await
    }
}

fn truncate_body(body: String) -> String {
    const MAX_BODY: usize = 512;
    if body.len() <= MAX_BODY {
        return body;
    }
    let mut end = MAX_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_truncation_respects_char_boundaries() {
        let long = "ж".repeat(600);
        let truncated = truncate_body(long);
        assert!(truncated.len() <= 512);
        assert!(truncated.chars().all(|c| c == 'ж'));
    }

    #[test]
    fn short_bodies_pass_through() {
        assert_eq!(truncate_body("oops".to_string()), "oops");
    }
}
