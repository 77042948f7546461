//! TUN helper client
//!
//! TUN mode needs privileges the session does not have. Before launching the
//! engine the orchestrator asks a privileged helper daemon to bring the
//! tunnel up for that engine and config, and asks it to take the tunnel down
//! again when the connection ends. The protocol is one JSON object per line
//! over loopback TCP:
//!
//! ```text
//! → {"token":"…","action":"start_tun","engine":"/usr/bin/xray","config":"/tmp/veil/config.json"}
//! ← {"ok":true}
//! ← {"ok":false,"error":"engine not found"}
//! ```
//!
//! Every request opens its own connection and is bounded by one timeout.

use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Bound on one helper round trip
pub const HELPER_TIMEOUT: Duration = Duration::from_secs(3);

/// Longest response line accepted
const MAX_RESPONSE_LINE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperAction {
    Ping,
    Shutdown,
    StartTun,
    StopTun,
}

#[derive(Debug, Serialize)]
struct HelperRequest<'a> {
    token: &'a str,
    action: HelperAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    engine: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HelperResponse {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("TUN helper unreachable: {0}")]
    Io(#[from] io::Error),

    #[error("TUN helper did not answer in time")]
    Timeout,

    #[error("TUN helper closed the connection")]
    Closed,

    #[error("Malformed TUN helper response: {0}")]
    Protocol(String),

    #[error("TUN helper refused {action:?}: {message}")]
    Refused { action: HelperAction, message: String },
}

/// Client side of the helper protocol
#[derive(Debug, Clone)]
pub struct TunHelperClient {
    addr: SocketAddr,
    token: String,
    timeout: Duration,
}

impl TunHelperClient {
    pub fn new(addr: SocketAddr, token: impl Into<String>) -> Self {
        Self {
            addr,
            token: token.into(),
            timeout: HELPER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn ping(&self) -> Result<(), HelperError> {
        self.call(HelperAction::Ping, None, None).await
    }

    pub async fn start_tun(&self, engine: &Path, config: &Path) -> Result<(), HelperError> {
        let engine = engine.to_string_lossy();
        let config = config.to_string_lossy();
        self.call(HelperAction::StartTun, Some(engine.as_ref()), Some(config.as_ref()))
            .await
    }

    pub async fn stop_tun(&self) -> Result<(), HelperError> {
        self.call(HelperAction::StopTun, None, None).await
    }

    pub async fn shutdown(&self) -> Result<(), HelperError> {
        self.call(HelperAction::Shutdown, None, None).await
    }

    async fn call(
        &self,
        action: HelperAction,
        engine: Option<&str>,
        config: Option<&str>,
    ) -> Result<(), HelperError> {
        let request = HelperRequest {
            token: &self.token,
            action,
            engine,
            config,
        };
        let response = tokio::time::timeout(self.timeout, self.round_trip(&request))
            .await
            .map_err(|_| HelperError::Timeout)??;

        if response.ok {
            Ok(())
        } else {
            Err(HelperError::Refused {
                action,
                message: response.error.unwrap_or_else(|| "unknown error".to_string()),
            })
        }
    }

    async fn round_trip(&self, request: &HelperRequest<'_>) -> Result<HelperResponse, HelperError> {
        let mut line =
            serde_json::to_string(request).map_err(|e| HelperError::Protocol(e.to_string()))?;
        line.push('\n');

        let mut stream = TcpStream::connect(self.addr).await?;
        stream.write_all(line.as_bytes()).await?;
        debug!("TUN helper request: {:?}", request.action);

        let mut reader = BufReader::new(stream.take(MAX_RESPONSE_LINE as u64 + 1));
        let mut reply = String::new();
        let n = reader.read_line(&mut reply).await?;
        if n == 0 {
            return Err(HelperError::Closed);
        }
        if reply.len() > MAX_RESPONSE_LINE {
            return Err(HelperError::Protocol("response too long".into()));
        }
        serde_json::from_str(reply.trim()).map_err(|e| HelperError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::net::TcpListener;

    /// Answer one request with `reply` and hand back what was received
    async fn fake_helper(reply: &'static str) -> (SocketAddr, tokio::task::JoinHandle<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            reader.get_mut().write_all(reply.as_bytes()).await.unwrap();
            serde_json::from_str(&line).unwrap()
        });
        (addr, task)
    }

    #[tokio::test]
    async fn test_start_tun_request() {
        let (addr, helper) = fake_helper("{\"ok\":true}\n").await;
        let client = TunHelperClient::new(addr, "secret");

        client
            .start_tun(Path::new("/usr/bin/xray"), Path::new("/tmp/veil/config.json"))
            .await
            .unwrap();

        let request = helper.await.unwrap();
        assert_eq!(request["token"], "secret");
        assert_eq!(request["action"], "start_tun");
        assert_eq!(request["engine"], "/usr/bin/xray");
        assert_eq!(request["config"], "/tmp/veil/config.json");
    }

    #[tokio::test]
    async fn test_refusal_carries_message() {
        let (addr, helper) = fake_helper("{\"ok\":false,\"error\":\"bad token\"}\n").await;
        let err = TunHelperClient::new(addr, "wrong").stop_tun().await.unwrap_err();

        match err {
            HelperError::Refused { action, message } => {
                assert_eq!(action, HelperAction::StopTun);
                assert_eq!(message, "bad token");
            }
            other => panic!("unexpected error: {}", other),
        }
        let request = helper.await.unwrap();
        assert!(request.get("engine").is_none());
    }

    #[tokio::test]
    async fn test_silent_helper_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let err = TunHelperClient::new(addr, "t")
            .with_timeout(Duration::from_millis(200))
            .ping()
            .await
            .unwrap_err();
        assert!(matches!(err, HelperError::Timeout));
    }

    #[tokio::test]
    async fn test_oversized_response_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _helper = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let flood = vec![b'a'; 4 * MAX_RESPONSE_LINE];
            let _ = stream.write_all(&flood).await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let err = TunHelperClient::new(addr, "t").ping().await.unwrap_err();
        assert!(matches!(err, HelperError::Protocol(_)), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_unreachable_helper() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let err = TunHelperClient::new(addr, "t").ping().await.unwrap_err();
        assert!(matches!(err, HelperError::Io(_)));
    }
}
