//! RESP2 client codec.
//!
//! Commands go out as arrays of bulk strings; replies are parsed
//! incrementally so a partial read simply yields [`Parsed::Incomplete`].

use bytes::{BufMut, Bytes, BytesMut};

/// Maximum nesting depth accepted in a reply.
const MAX_DEPTH: usize = 8;

/// Maximum bulk string length accepted in a reply.
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// A decoded server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// +OK
    Simple(String),
    /// -ERR message
    Error(String),
    /// :42
    Integer(i64),
    /// $3\r\nfoo
    Bulk(Bytes),
    /// *N
    Array(Vec<Reply>),
    /// $-1 or *-1
    Nil,
}

impl Reply {
    /// Interpret the reply as UTF-8 text.
    pub fn into_string(self) -> Option<String> {
        match self {
            Reply::Simple(s) => Some(s),
            Reply::Bulk(b) => String::from_utf8(b.to_vec()).ok(),
            Reply::Integer(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Outcome of a parse attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Parsed {
    /// A full reply and the number of bytes it occupied.
    Complete(Reply, usize),
    /// More bytes are needed.
    Incomplete,
    /// The buffer does not hold valid RESP2.
    Invalid(String),
}

/// Append `args` to `buf` as a RESP2 command array.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], buf: &mut BytesMut) {
    buf.put_u8(b'*');
    buf.put_slice(args.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        buf.put_u8(b'$');
        buf.put_slice(arg.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
}

/// Parse one reply from the front of `data`.
pub fn parse_reply(data: &[u8]) -> Parsed {
    parse_at(data, 0)
}

fn parse_at(data: &[u8], depth: usize) -> Parsed {
    if depth > MAX_DEPTH {
        return Parsed::Invalid("maximum nesting depth exceeded".into());
    }
    let Some(&prefix) = data.first() else {
        return Parsed::Incomplete;
    };
    let body = &data[1..];
    let Some(line_end) = find_crlf(body) else {
        return Parsed::Incomplete;
    };
    let line = &body[..line_end];
    // prefix byte + line + CRLF
    let header_len = line_end + 3;

    match prefix {
        b'+' => Parsed::Complete(Reply::Simple(lossy(line)), header_len),
        b'-' => Parsed::Complete(Reply::Error(lossy(line)), header_len),
        b':' => match parse_int(line) {
            Some(n) => Parsed::Complete(Reply::Integer(n), header_len),
            None => Parsed::Invalid("invalid integer".into()),
        },
        b'$' => match parse_int(line) {
            Some(-1) => Parsed::Complete(Reply::Nil, header_len),
            Some(len) if len >= 0 && (len as usize) <= MAX_BULK_LEN => {
                let len = len as usize;
                let start = header_len;
                let end = start + len;
                if data.len() < end + 2 {
                    return Parsed::Incomplete;
                }
                if &data[end..end + 2] != b"\r\n" {
                    return Parsed::Invalid("missing CRLF after bulk string".into());
                }
                Parsed::Complete(Reply::Bulk(Bytes::copy_from_slice(&data[start..end])), end + 2)
            }
            _ => Parsed::Invalid("invalid bulk string length".into()),
        },
        b'*' => match parse_int(line) {
            Some(-1) => Parsed::Complete(Reply::Nil, header_len),
            Some(len) if len >= 0 => {
                let mut offset = header_len;
                let mut items = Vec::with_capacity((len as usize).min(1024));
                for _ in 0..len {
                    match parse_at(&data[offset..], depth + 1) {
                        Parsed::Complete(item, used) => {
                            items.push(item);
                            offset += used;
                        }
                        other => return other,
                    }
                }
                Parsed::Complete(Reply::Array(items), offset)
            }
            _ => Parsed::Invalid("invalid array length".into()),
        },
        other => Parsed::Invalid(format!("unknown reply type byte {:#04x}", other)),
    }
}

/// Finds where the next reply ends across partial reads.
///
/// Each element is walked once: completed elements are never re-read when
/// more bytes arrive, so locating a large reply stays linear in its size.
#[derive(Debug, Default)]
pub struct FrameScanner {
    offset: usize,
    /// Elements still owed by each open array, outermost first.
    open: Vec<i64>,
}

impl FrameScanner {
    /// Length of the first complete reply in `data`, or `None` if more
    /// bytes are needed. `data` must only grow between calls.
    pub fn scan(&mut self, data: &[u8]) -> Result<Option<usize>, String> {
        loop {
            if self.open.len() > MAX_DEPTH {
                return Err("maximum nesting depth exceeded".into());
            }
            let rest = &data[self.offset..];
            let Some(&prefix) = rest.first() else {
                return Ok(None);
            };
            let Some(line_end) = find_crlf(&rest[1..]) else {
                return Ok(None);
            };
            let line = &rest[1..1 + line_end];
            let header_len = line_end + 3;

            let used = match prefix {
                b'+' | b'-' | b':' => header_len,
                b'$' => match parse_int(line) {
                    Some(-1) => header_len,
                    Some(len) if len >= 0 && (len as usize) <= MAX_BULK_LEN => {
                        let total = header_len + len as usize + 2;
                        if rest.len() < total {
                            return Ok(None);
                        }
                        total
                    }
                    _ => return Err("invalid bulk string length".into()),
                },
                b'*' => match parse_int(line) {
                    Some(-1) | Some(0) => header_len,
                    Some(n) if n > 0 => {
                        self.offset += header_len;
                        self.open.push(n);
                        continue;
                    }
                    _ => return Err("invalid array length".into()),
                },
                other => return Err(format!("unknown reply type byte {:#04x}", other)),
            };
            self.offset += used;

            // Close every array this element completed.
            loop {
                match self.open.last_mut() {
                    None => {
                        let end = self.offset;
                        *self = Self::default();
                        return Ok(Some(end));
                    }
                    Some(owed) => {
                        *owed -= 1;
                        if *owed > 0 {
                            break;
                        }
                        self.open.pop();
                    }
                }
            }
        }
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn parse_int(line: &[u8]) -> Option<i64> {
    std::str::from_utf8(line).ok()?.parse().ok()
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}
