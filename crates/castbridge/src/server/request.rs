use tokio::io::{AsyncRead, AsyncReadExt};

use crate::BridgeError;

/// Parsed head of a listener request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    /// Path without the query string
    pub path: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Parse `METHOD /path HTTP/1.x` followed by header lines
    pub fn parse(head: &str) -> Result<Self, BridgeError> {
        let mut lines = head.lines();
        let request_line = lines
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or_else(|| BridgeError::ProtocolHandshake("Empty request".to_string()))?;

        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(BridgeError::ProtocolHandshake(format!(
                "Malformed request line: {request_line}"
            )));
        };
        if !version.starts_with("HTTP/1.") {
            return Err(BridgeError::ProtocolHandshake(format!(
                "Unsupported protocol version: {version}"
            )));
        }
        if !target.starts_with('/') {
            return Err(BridgeError::ProtocolHandshake(format!(
                "Unsupported request target: {target}"
            )));
        }
        let path = target.split(['?', '#']).next().unwrap_or(target);

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                BridgeError::ProtocolHandshake(format!("Malformed header line: {line}"))
            })?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

fn head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
        .or_else(|| buffer.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2))
}

/// Read up to the blank line ending the request head, at most `max_len`
/// bytes. Anything the client sent after the head is discarded.
pub async fn read_head<R>(reader: &mut R, max_len: usize) -> Result<String, BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(max_len.min(1024));
    let mut chunk = [0u8; 512];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Err(BridgeError::ProtocolHandshake(
                "Connection closed before the request head was complete".to_string(),
            ));
        }
        buffer.extend_from_slice(&chunk[..read]);

        if let Some(end) = head_end(&buffer) {
            if end > max_len {
                break;
            }
            buffer.truncate(end);
            return String::from_utf8(buffer).map_err(|_| {
                BridgeError::ProtocolHandshake("Request head is not valid UTF-8".to_string())
            });
        }
        if buffer.len() > max_len {
            break;
        }
    }
    Err(BridgeError::ProtocolHandshake(format!(
        "Request head exceeds {max_len} bytes"
    )))
}
