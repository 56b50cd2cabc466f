//! Proxy channels to a running agent
//!
//! Two independent channels are created per session from the same host and
//! port: a session-bound channel that carries the caller's session id, and
//! a session-less channel used for status polling and build-only work. The
//! request forwarding itself is the upstream driver's business; this module
//! only owns the channel configuration and a `command` helper.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::Method;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use wda_protocol::{AgentError, AgentResponse, AgentStatus, ChannelRole, ProxyConfig, STATUS_PATH};

/// A channel shared between the orchestrator and the active backend.
pub type SharedChannel = Arc<Mutex<ProxyChannel>>;

/// Errors from proxy channel operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u128 },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}: {body}")]
    Http { url: String, status: u16, body: String },

    #[error("invalid JSON from {url}: {source}")]
    InvalidJson {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("a session-less channel cannot carry a session id")]
    SessionNotAllowed,
}

/// One proxy channel to the agent.
#[derive(Debug)]
pub struct ProxyChannel {
    role: ChannelRole,
    config: ProxyConfig,
    session_id: Option<String>,
    client: Client,
}

impl ProxyChannel {
    /// Create a channel with the given role.
    pub fn new(role: ChannelRole, config: ProxyConfig) -> Result<Self, ProxyError> {
        // the agent is always reached directly
        let client = Client::builder().no_proxy().build().map_err(ProxyError::Client)?;
        Ok(Self {
            role,
            config,
            session_id: None,
            client,
        })
    }

    /// Channel that will carry `session_id`.
    pub fn session_bound(config: ProxyConfig, session_id: Option<String>) -> Result<Self, ProxyError> {
        let mut channel = Self::new(ChannelRole::SessionBound, config)?;
        channel.session_id = session_id;
        Ok(channel)
    }

    /// Channel that never carries a session id.
    pub fn session_less(config: ProxyConfig) -> Result<Self, ProxyError> {
        Self::new(ChannelRole::SessionLess, config)
    }

    /// Wrap the channel for sharing with a backend.
    pub fn shared(self) -> SharedChannel {
        Arc::new(Mutex::new(self))
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Attach or clear the session id.
    pub fn set_session_id(&mut self, session_id: Option<String>) -> Result<(), ProxyError> {
        if session_id.is_some() && !self.role.accepts_session() {
            return Err(ProxyError::SessionNotAllowed);
        }
        self.session_id = session_id;
        Ok(())
    }

    /// Full URL for `path`, scoped to the session when one is attached.
    ///
    /// `/status` and routes that already name a session are never rewritten.
    pub fn url_for(&self, path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        match self.session_id.as_deref() {
            Some(id) if path != STATUS_PATH && !path.starts_with("/session") => {
                format!("{}/session/{}{}", self.config.root_url(), id, path)
            }
            _ => format!("{}{}", self.config.root_url(), path),
        }
    }

    /// Send one command to the agent and unwrap the response `value`.
    pub fn command(&self, path: &str, method: Method, body: Option<&Value>) -> Result<Value, ProxyError> {
        let url = self.url_for(path);
        debug!("proxying {} {} (timeout {}ms)", method, url, self.config.timeout.as_millis());

        let mut request = self
            .client
            .request(method, &url)
            .timeout(self.config.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().map_err(|source| {
            if source.is_timeout() {
                ProxyError::Timeout {
                    url: url.clone(),
                    timeout_ms: self.config.timeout.as_millis(),
                }
            } else {
                ProxyError::Transport {
                    url: url.clone(),
                    source,
                }
            }
        })?;

        let status = response.status();
        let text = response.text().map_err(|source| ProxyError::Transport {
            url: url.clone(),
            source,
        })?;

        let parsed = serde_json::from_str::<AgentResponse>(&text);
        if !status.is_success() {
            if let Ok(envelope) = parsed {
                envelope.into_value()?;
            }
            return Err(ProxyError::Http {
                url,
                status: status.as_u16(),
                body: text,
            });
        }

        let envelope = parsed.map_err(|source| ProxyError::InvalidJson { url, source })?;
        Ok(envelope.into_value()?)
    }

    /// Run `f` with the per-request timeout temporarily set to `timeout`.
    ///
    /// The previous timeout is restored before returning.
    pub fn with_timeout<T>(&mut self, timeout: Duration, f: impl FnOnce(&Self) -> T) -> T {
        let saved = self.config.timeout;
        self.config.timeout = timeout;
        let result = f(self);
        self.config.timeout = saved;
        result
    }

    /// GET `/status` with a one-off per-request timeout.
    pub fn status(&mut self, timeout: Duration) -> Result<AgentStatus, ProxyError> {
        self.with_timeout(timeout, |channel| {
            channel.command(STATUS_PATH, Method::GET, None)
        })
        .map(AgentStatus::from_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn config(port: u16) -> ProxyConfig {
        ProxyConfig::new("127.0.0.1", port)
    }

    /// Serve `count` requests with a fixed status code and body.
    fn stub_agent(count: usize, code: u16, body: &'static str) -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tiny_http::Server::from_listener(listener, None).unwrap();
        thread::spawn(move || {
            for _ in 0..count {
                let Ok(request) = server.recv() else { return };
                let response = tiny_http::Response::from_string(body).with_status_code(code);
                let _ = request.respond(response);
            }
        });
        port
    }

    #[test]
    fn test_url_for_session_bound() {
        let channel = ProxyChannel::session_bound(config(8100), Some("abc".into())).unwrap();
        assert_eq!(channel.url_for("/status"), "http://127.0.0.1:8100/status");
        assert_eq!(channel.url_for("/url"), "http://127.0.0.1:8100/session/abc/url");
        assert_eq!(channel.url_for("window/size"), "http://127.0.0.1:8100/session/abc/window/size");
        assert_eq!(channel.url_for("/session/xyz/url"), "http://127.0.0.1:8100/session/xyz/url");
    }

    #[test]
    fn test_url_for_session_less() {
        let channel = ProxyChannel::session_less(config(8100)).unwrap();
        assert_eq!(channel.url_for("/url"), "http://127.0.0.1:8100/url");
    }

    #[test]
    fn test_session_less_rejects_session_id() {
        let mut channel = ProxyChannel::session_less(config(8100)).unwrap();
        assert!(matches!(
            channel.set_session_id(Some("abc".into())),
            Err(ProxyError::SessionNotAllowed)
        ));
        assert!(channel.set_session_id(None).is_ok());
        assert_eq!(channel.session_id(), None);
    }

    #[test]
    fn test_with_timeout_restores_previous_value() {
        let mut channel = ProxyChannel::session_less(config(8100).with_timeout(Some(Duration::from_secs(30)))).unwrap();
        let seen = channel.with_timeout(Duration::from_secs(1), |c| c.timeout());
        assert_eq!(seen, Duration::from_secs(1));
        assert_eq!(channel.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_status_parses_ip() {
        let port = stub_agent(
            1,
            200,
            r#"{"value":{"state":"success","ios":{"ip":"10.0.0.7"}},"sessionId":null,"status":0}"#,
        );
        let mut channel = ProxyChannel::session_less(config(port)).unwrap();
        let status = channel.status(Duration::from_secs(5)).unwrap();
        assert_eq!(status.ip(), Some("10.0.0.7"));
        assert_eq!(channel.timeout(), wda_protocol::channel::DEFAULT_PROXY_TIMEOUT);
    }

    #[test]
    fn test_http_error_with_agent_envelope() {
        let port = stub_agent(1, 404, r#"{"value":"Session does not exist","status":6}"#);
        let channel = ProxyChannel::session_less(config(port)).unwrap();
        let err = channel.command("/url", Method::GET, None).unwrap_err();
        match err {
            ProxyError::Agent(agent) => assert_eq!(agent.status, 6),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_http_error_without_envelope() {
        let port = stub_agent(1, 500, "internal failure");
        let channel = ProxyChannel::session_less(config(port)).unwrap();
        let err = channel.command("/status", Method::GET, None).unwrap_err();
        assert!(matches!(err, ProxyError::Http { status: 500, .. }));
    }

    #[test]
    fn test_connection_refused_is_transport_error() {
        let port = {
            let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut channel = ProxyChannel::session_less(config(port)).unwrap();
        let err = channel.status(Duration::from_millis(500)).unwrap_err();
        assert!(matches!(err, ProxyError::Transport { .. } | ProxyError::Timeout { .. }));
    }
}
