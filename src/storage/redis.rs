//! Redis-protocol store client
//!
//! Talks RESP2 to any server that speaks the Redis hash, expiry and scan
//! commands. One connection is shared behind a lock; an I/O failure drops
//! it and the next call reconnects.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::resp::{encode_command, parse_reply, FrameScanner, Parsed, Reply};
use super::KvStore;
use crate::error::{Result, WatcherError};

const DEFAULT_PORT: u16 = 6379;
const SCAN_BATCH: &str = "256";

/// Parsed `redis://[user:password@]host[:port][/db]` connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUrl {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: u32,
}

impl StoreUrl {
    /// Parse a connection string
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |reason: &str| WatcherError::InvalidStoreUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let rest = url
            .strip_prefix("redis://")
            .ok_or_else(|| invalid("expected redis:// scheme"))?;

        let (authority, path) = match rest.split_once('/') {
            Some((a, p)) => (a, p),
            None => (rest, ""),
        };

        let (credentials, host_port) = match authority.rsplit_once('@') {
            Some((c, h)) => (Some(c), h),
            None => (None, authority),
        };

        let (username, password) = match credentials {
            Some(c) => match c.split_once(':') {
                Some((u, p)) => (
                    (!u.is_empty()).then(|| u.to_string()),
                    Some(p.to_string()),
                ),
                None => (None, Some(c.to_string())),
            },
            None => (None, None),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((h, p)) => (h, p.parse().map_err(|_| invalid("invalid port"))?),
            None => (host_port, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let database = if path.is_empty() {
            0
        } else {
            path.parse().map_err(|_| invalid("invalid database index"))?
        };

        Ok(Self {
            host: host.to_string(),
            port,
            username,
            password,
            database,
        })
    }

    /// `host:port` for dialing and logs
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct Connection {
    stream: TcpStream,
    buf: BytesMut,
}

impl Connection {
    async fn open(url: &StoreUrl) -> Result<Self> {
        let stream = TcpStream::connect(url.endpoint())
            .await
            .map_err(|e| WatcherError::ConnectionFailed {
                endpoint: url.endpoint(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        };

        if let Some(password) = &url.password {
            let reply = match &url.username {
                Some(user) => conn.request(&["AUTH", user.as_str(), password.as_str()]).await?,
                None => conn.request(&["AUTH", password.as_str()]).await?,
            };
            expect_ok(reply).map_err(|e| WatcherError::ConnectionFailed {
                endpoint: url.endpoint(),
                reason: format!("authentication failed: {}", e),
            })?;
        }

        if url.database != 0 {
            let db = url.database.to_string();
            expect_ok(conn.request(&["SELECT", db.as_str()]).await?)?;
        }

        Ok(conn)
    }

    async fn request<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<Reply> {
        let mut out = BytesMut::new();
        encode_command(args, &mut out);
        self.stream.write_all(&out).await?;

        // Locate the end of the reply incrementally, then decode it once.
        let mut scanner = FrameScanner::default();
        let len = loop {
            match scanner.scan(&self.buf) {
                Ok(Some(len)) => break len,
                Ok(None) => {
                    if self.stream.read_buf(&mut self.buf).await? == 0 {
                        return Err(WatcherError::Store {
                            message: "connection closed by server".into(),
                        });
                    }
                }
                Err(reason) => return Err(WatcherError::Protocol { reason }),
            }
        };

        match parse_reply(&self.buf[..len]) {
            Parsed::Complete(reply, used) => {
                self.buf.advance(used);
                Ok(reply)
            }
            Parsed::Invalid(reason) => Err(WatcherError::Protocol { reason }),
            Parsed::Incomplete => Err(WatcherError::Protocol {
                reason: "reply shorter than its frame".into(),
            }),
        }
    }
}

/// Shared store reached over the Redis protocol
pub struct RedisStore {
    url: StoreUrl,
    io_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl RedisStore {
    /// Parse `url` and open the first connection
    pub async fn connect(url: &str, io_timeout: Duration) -> Result<Self> {
        let url = StoreUrl::parse(url)?;
        info!("Connecting to store at {}", url.endpoint());

        let conn = tokio::time::timeout(io_timeout, Connection::open(&url))
            .await
            .map_err(|_| WatcherError::ConnectionFailed {
                endpoint: url.endpoint(),
                reason: "timed out".into(),
            })??;

        Ok(Self {
            url,
            io_timeout,
            conn: Mutex::new(Some(conn)),
        })
    }

    async fn command<A: AsRef<[u8]>>(&self, args: &[A]) -> Result<Reply> {
        let mut guard = self.conn.lock().await;

        let result = tokio::time::timeout(self.io_timeout, async {
            if guard.is_none() {
                debug!("Reconnecting to store at {}", self.url.endpoint());
                *guard = Some(Connection::open(&self.url).await?);
            }
            match guard.as_mut() {
                Some(conn) => conn.request(args).await,
                None => Err(WatcherError::ConnectionFailed {
                    endpoint: self.url.endpoint(),
                    reason: "not connected".into(),
                }),
            }
        })
        .await
        .unwrap_or_else(|_| {
            Err(WatcherError::Store {
                message: format!("request to {} timed out", self.url.endpoint()),
            })
        });

        match result {
            Ok(Reply::Error(message)) => Err(WatcherError::Store { message }),
            Ok(reply) => Ok(reply),
            Err(e) => {
                // The stream may hold half a reply; start over on the next call.
                warn!("Dropping store connection after error: {}", e);
                *guard = None;
                Err(e)
            }
        }
    }
}

fn expect_ok(reply: Reply) -> Result<()> {
    match reply {
        Reply::Simple(s) if s == "OK" => Ok(()),
        Reply::Error(message) => Err(WatcherError::Store { message }),
        other => Err(unexpected(&other)),
    }
}

fn expect_int(reply: Reply) -> Result<i64> {
    match reply {
        Reply::Integer(n) => Ok(n),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(reply: &Reply) -> WatcherError {
    WatcherError::Protocol {
        reason: format!("unexpected reply {:?}", reply),
    }
}

fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

#[async_trait]
impl KvStore for RedisStore {
    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        let mut args = Vec::with_capacity(2 + fields.len() * 2);
        args.push("HSET");
        args.push(key);
        for (field, value) in fields {
            args.push(*field);
            args.push(*value);
        }
        expect_int(self.command(args.as_slice()).await?)?;
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        Ok(expect_int(self.command(&["HSETNX", key, field, value]).await?)? == 1)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        Ok(expect_int(self.command(&["HDEL", key, field]).await?)? == 1)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let items = match self.command(&["HGETALL", key]).await? {
            Reply::Array(items) => items,
            Reply::Nil => return Ok(HashMap::new()),
            other => return Err(unexpected(&other)),
        };

        let mut fields = HashMap::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            match (field.into_string(), value.into_string()) {
                (Some(f), Some(v)) => {
                    fields.insert(f, v);
                }
                _ => {
                    return Err(WatcherError::Protocol {
                        reason: format!("non-text hash field under {}", key),
                    })
                }
            }
        }
        Ok(fields)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let secs = ttl.as_secs().max(1).to_string();
        Ok(expect_int(self.command(&["EXPIRE", key, secs.as_str()]).await?)? == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        // -2: missing, -1: no expiry
        let millis = expect_int(self.command(&["PTTL", key]).await?)?;
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(expect_int(self.command(&["DEL", key]).await?)? > 0)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = escape_glob(prefix);
        let mut cursor = "0".to_string();
        // SCAN may return a key more than once across pages.
        let mut keys = HashSet::new();

        loop {
            let reply = self
                .command(&["SCAN", cursor.as_str(), "MATCH", pattern.as_str(), "COUNT", SCAN_BATCH])
                .await?;

            let (next, batch) = match reply {
                Reply::Array(mut parts) if parts.len() == 2 => {
                    let batch = parts.pop();
                    let next = parts.pop().and_then(Reply::into_string);
                    match (next, batch) {
                        (Some(next), Some(Reply::Array(batch))) => (next, batch),
                        _ => {
                            return Err(WatcherError::Protocol {
                                reason: "malformed SCAN reply".into(),
                            })
                        }
                    }
                }
                other => return Err(unexpected(&other)),
            };

            keys.extend(batch.into_iter().filter_map(Reply::into_string));

            if next == "0" {
                break;
            }
            cursor = next;
        }

        Ok(keys.into_iter().collect())
    }
}
