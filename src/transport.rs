//! JSON-over-HTTP transport with bounded retries.

use crate::config::TransportConfig;
use crate::error::{RestCacheError, Result};
use crate::http::{HttpClient, HttpError, HttpRequest};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Result of a single request attempt.
#[derive(Debug)]
enum Attempt {
    Done(Value),
    Retry(String),
    CertificateRejected(String),
}

/// Issues GET requests against a feature service and decodes the JSON body.
///
/// Every request is retried up to `max_attempts` times. Connection failures,
/// non-2xx statuses, undecodable bodies and bodies carrying an `error`
/// member all count as failed attempts.
pub struct Transport<C> {
    client: C,
    token: Option<String>,
    config: TransportConfig,
    // Set once a certificate failure triggered the opt-in fallback; stays set
    // for the rest of the session.
    tls_relaxed: AtomicBool,
}

impl<C: HttpClient> Transport<C> {
    pub fn new(client: C, token: Option<String>, config: TransportConfig) -> Self {
        Self {
            client,
            token,
            config,
            tls_relaxed: AtomicBool::new(false),
        }
    }

    /// Whether certificate verification has been switched off for this session.
    pub fn is_tls_relaxed(&self) -> bool {
        self.tls_relaxed.load(Ordering::SeqCst)
    }

    /// Fetch `url` with `params` and return the decoded body.
    ///
    /// When the body is an object with a `features` member, only that member
    /// is returned.
    pub fn fetch(&self, url: &str, params: &[(&str, String)]) -> Result<Value> {
        let mut query: Vec<(String, String)> = params
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        if let Some(token) = &self.token {
            query.push(("token".to_string(), token.clone()));
        }

        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.config.retry_delay();
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }

            debug!(url = %url, attempt, "Sending request");
            match self.attempt(url, &query) {
                Attempt::Done(value) => return Ok(value),
                Attempt::Retry(reason) => {
                    warn!(url = %url, attempt, max_attempts, reason = %reason, "Request failed");
                }
                Attempt::CertificateRejected(reason) => {
                    if self.config.allow_insecure_tls_fallback
                        && !self.tls_relaxed.swap(true, Ordering::SeqCst)
                    {
                        warn!(
                            url = %url,
                            attempt,
                            reason = %reason,
                            "Certificate verification failed; disabling verification for this session"
                        );
                    } else {
                        warn!(url = %url, attempt, max_attempts, reason = %reason, "Certificate verification failed");
                    }
                }
            }
        }

        warn!(url = %url, attempts = max_attempts, "Giving up on request");
        Err(RestCacheError::ServiceUnavailable {
            url: url.to_string(),
            attempts: max_attempts,
        })
    }

    fn attempt(&self, url: &str, query: &[(String, String)]) -> Attempt {
        let request = HttpRequest {
            url,
            params: query,
            relax_tls: self.is_tls_relaxed(),
        };

        let response = match self.client.get(&request) {
            Ok(response) => response,
            Err(HttpError::Certificate(msg)) => return Attempt::CertificateRejected(msg),
            Err(err) => return Attempt::Retry(err.to_string()),
        };

        if !(200..300).contains(&response.status) {
            return Attempt::Retry(format!("HTTP status {}", response.status));
        }
        decode_body(&response.body)
    }
}

fn decode_body(body: &str) -> Attempt {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => return Attempt::Retry(format!("invalid JSON body: {e}")),
    };

    match value {
        Value::Object(mut map) => {
            match map.get("error") {
                None | Some(Value::Null) => {}
                Some(error) => {
                    return Attempt::Retry(format!("service error: {}", service_error_message(error)));
                }
            }
            match map.remove("features") {
                Some(features) => Attempt::Done(features),
                None => Attempt::Done(Value::Object(map)),
            }
        }
        other => Attempt::Done(other),
    }
}

fn service_error_message(error: &Value) -> String {
    let message = error.get("message").and_then(Value::as_str);
    match (error.get("code").and_then(Value::as_i64), message) {
        (Some(code), Some(message)) => format!("{code} {message}"),
        (None, Some(message)) => message.to_string(),
        _ => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::Transport;
    use crate::config::TransportConfig;
    use crate::error::{RestCacheError, Result};
    use crate::http::{HttpClient, HttpError, HttpRequest, HttpResponse};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Reply = std::result::Result<HttpResponse, HttpError>;

    /// Replays canned replies in order and records what it was asked.
    #[derive(Default)]
    struct ScriptedClient {
        replies: Mutex<VecDeque<Reply>>,
        seen: Mutex<Vec<(Vec<(String, String)>, bool)>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::default(),
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn relax_flags(&self) -> Vec<bool> {
            self.seen.lock().unwrap().iter().map(|(_, r)| *r).collect()
        }
    }

    impl HttpClient for ScriptedClient {
        fn get(&self, request: &HttpRequest<'_>) -> Reply {
            self.seen
                .lock()
                .unwrap()
                .push((request.params.to_vec(), request.relax_tls));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(HttpError::Connection("no more replies".to_string())))
        }
    }

    fn ok(body: &str) -> Reply {
        Ok(HttpResponse {
            status: 200,
            body: body.to_string(),
        })
    }

    fn config() -> TransportConfig {
        TransportConfig::default().with_retry_delay_secs(0)
    }

    #[test]
    fn features_member_is_unwrapped() -> Result<()> {
        let client = ScriptedClient::new(vec![ok(r#"{"features": [{"attributes": {}}]}"#)]);
        let transport = Transport::new(&client, None, config());

        let value = transport.fetch("https://example.com/query", &[])?;
        assert_eq!(value, json!([{ "attributes": {} }]));

        let client = ScriptedClient::new(vec![ok(r#"{"count": 3}"#)]);
        let transport = Transport::new(&client, None, config());
        assert_eq!(transport.fetch("https://example.com/query", &[])?, json!({ "count": 3 }));
        Ok(())
    }

    #[test]
    fn failed_attempts_are_retried() -> Result<()> {
        let client = ScriptedClient::new(vec![
            Err(HttpError::Connection("reset".to_string())),
            Ok(HttpResponse {
                status: 503,
                body: String::new(),
            }),
            ok("<html>not json</html>"),
            ok(r#"{"error": {"code": 498, "message": "Invalid token"}}"#),
            ok(r#"{"count": 7}"#),
        ]);
        let transport = Transport::new(&client, None, config());

        let value = transport.fetch("https://example.com/query", &[])?;
        assert_eq!(value["count"], 7);
        assert_eq!(client.calls(), 5);
        Ok(())
    }

    #[test]
    fn exhausted_attempts_report_unavailable() {
        let client = ScriptedClient::new(vec![]);
        let transport = Transport::new(&client, None, config().with_max_attempts(3));

        let err = transport
            .fetch("https://example.com/info", &[("f", "json".to_string())])
            .expect_err("service should be unavailable");
        match err {
            RestCacheError::ServiceUnavailable { url, attempts } => {
                assert_eq!(url, "https://example.com/info");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(client.calls(), 3);
    }

    #[test]
    fn token_is_appended_to_every_request() -> Result<()> {
        let client = ScriptedClient::new(vec![ok("{}")]);
        let transport = Transport::new(&client, Some("s3cr3t".to_string()), config());

        transport.fetch("https://example.com", &[("f", "json".to_string())])?;
        let seen = client.seen.lock().unwrap();
        assert_eq!(
            seen[0].0,
            vec![
                ("f".to_string(), "json".to_string()),
                ("token".to_string(), "s3cr3t".to_string())
            ]
        );
        Ok(())
    }

    #[test]
    fn certificate_failure_without_fallback_keeps_verifying() {
        let client = ScriptedClient::new(vec![
            Err(HttpError::Certificate("self-signed".to_string())),
            Err(HttpError::Certificate("self-signed".to_string())),
        ]);
        let transport = Transport::new(&client, None, config().with_max_attempts(2));

        assert!(transport.fetch("https://example.com", &[]).is_err());
        assert_eq!(client.relax_flags(), vec![false, false]);
        assert!(!transport.is_tls_relaxed());
    }

    #[test]
    fn certificate_fallback_relaxes_the_session() -> Result<()> {
        let client = ScriptedClient::new(vec![
            Err(HttpError::Certificate("self-signed".to_string())),
            ok("{}"),
            ok("{}"),
        ]);
        let transport = Transport::new(&client, None, config().with_insecure_tls_fallback(true));

        transport.fetch("https://example.com", &[])?;
        transport.fetch("https://example.com", &[])?;
        assert!(transport.is_tls_relaxed());
        assert_eq!(client.relax_flags(), vec![false, true, true]);
        Ok(())
    }
}
