//! Remote counter client.
//!
//! Each call opens its own connection, optionally authenticates, and runs a
//! single server-side script that increments the counter, sets its expiry on
//! the first hit and reports the remaining TTL. The script makes those three
//! steps atomic with respect to other callers on the same key.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use super::endpoint::StoreConfig;
use crate::resp::{encode_command, try_parse_reply, RespError, RespValue};

/// Upper bound on a whole increment exchange, connect included.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

const INCREMENT_SCRIPT: &str = "\
local current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
return {current, ttl}";

/// Errors that can occur while talking to the remote store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("remote store rejected authentication: {0}")]
    AuthRejected(String),
    #[error("unexpected reply from remote store: {0}")]
    ProtocolError(String),
    #[error("invalid store url: {0}")]
    InvalidUrl(String),
}

impl StoreError {
    /// Short, stable label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::RemoteUnavailable(_) => "unavailable",
            StoreError::AuthRejected(_) => "auth_rejected",
            StoreError::ProtocolError(_) => "protocol",
            StoreError::InvalidUrl(_) => "invalid_url",
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::RemoteUnavailable(err.to_string())
    }
}

impl From<RespError> for StoreError {
    fn from(err: RespError) -> Self {
        StoreError::RemoteUnavailable(format!("malformed reply: {}", err))
    }
}

/// Counter state returned by one increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReply {
    /// Value of the counter after this increment.
    pub count: u32,
    /// Time until the counter expires.
    pub ttl_remaining_ms: u32,
}

/// Client for the increment-and-expire operation.
#[derive(Debug, Clone)]
pub struct CounterClient {
    config: StoreConfig,
    timeout: Duration,
}

impl CounterClient {
    /// Create a client with the default 1 second timeout.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the exchange timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Increment `key` within a window of `window_ms` milliseconds.
    pub async fn increment(&self, key: &str, window_ms: u32) -> Result<CounterReply, StoreError> {
        match tokio::time::timeout(self.timeout, self.increment_inner(key, window_ms)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::RemoteUnavailable(format!(
                "timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }

    async fn increment_inner(&self, key: &str, window_ms: u32) -> Result<CounterReply, StoreError> {
        let mut conn = Connection::connect(&self.config.address()).await?;

        if let Some(password) = &self.config.password {
            let mut auth = vec!["AUTH"];
            if let Some(username) = &self.config.username {
                auth.push(username.as_str());
            }
            auth.push(password.as_str());

            if let RespValue::Error(message) = conn.request(&auth).await? {
                return Err(StoreError::AuthRejected(message));
            }
        }

        if self.config.database != 0 {
            let db = self.config.database.to_string();
            if let RespValue::Error(message) = conn.request(&["SELECT", db.as_str()]).await? {
                return Err(StoreError::ProtocolError(format!("SELECT {} failed: {}", db, message)));
            }
        }

        let window = window_ms.to_string();
        let reply = conn
            .request(&["EVAL", INCREMENT_SCRIPT, "1", key, window.as_str()])
            .await?;

        let counter = counter_reply(reply, window_ms)?;
        trace!(
            key = %key,
            count = counter.count,
            ttl_ms = counter.ttl_remaining_ms,
            "Remote counter incremented"
        );
        Ok(counter)
    }
}

fn counter_reply(reply: RespValue, window_ms: u32) -> Result<CounterReply, StoreError> {
    match reply {
        RespValue::Array(items) if items.len() == 2 => {
            match (items[0].as_integer(), items[1].as_integer()) {
                (Some(count), Some(ttl)) if count >= 0 => Ok(CounterReply {
                    count: u32::try_from(count).unwrap_or(u32::MAX),
                    // A key without expiry reports a negative TTL.
                    ttl_remaining_ms: if ttl < 0 {
                        window_ms
                    } else {
                        u32::try_from(ttl).unwrap_or(u32::MAX)
                    },
                }),
                _ => Err(StoreError::ProtocolError(format!(
                    "expected two integers, got {:?}",
                    items
                ))),
            }
        }
        RespValue::Error(message) => {
            Err(StoreError::ProtocolError(format!("script failed: {}", message)))
        }
        other => Err(StoreError::ProtocolError(format!(
            "expected a two-element array, got {:?}",
            other
        ))),
    }
}

/// One request/response socket with its read buffer.
struct Connection {
    stream: TcpStream,
    buffer: BytesMut,
}

impl Connection {
    async fn connect(addr: &str) -> Result<Self, StoreError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            buffer: BytesMut::with_capacity(512),
        })
    }

    async fn request(&mut self, parts: &[&str]) -> Result<RespValue, StoreError> {
        self.stream.write_all(&encode_command(parts)).await?;

        loop {
            if let Some((value, used)) = try_parse_reply(&self.buffer)? {
                self.buffer.advance(used);
                return Ok(value);
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(StoreError::RemoteUnavailable(
                    "connection closed before a full reply".to_string(),
                ));
            }
        }
    }
}
