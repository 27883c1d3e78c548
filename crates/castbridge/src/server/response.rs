use axum::http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::channel::Channel;
use crate::{BridgeError, ServerConfig};

pub const CONTENT_TYPE_AAC: &str = "audio/aacp";

/// Status a failed request is answered with
pub fn status_for(error: &BridgeError) -> StatusCode {
    match error {
        BridgeError::UnknownChannel(_) | BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
        BridgeError::ProtocolHandshake(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn reason_phrase(status: StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("Error")
}

/// Head of a stream response. Shoutcast-era players expect the `ICY` status
/// line, everything else is served as plain HTTP/1.0. `metaint` is only
/// announced to clients that asked for in-band metadata.
pub fn stream_head(
    channel: &Channel,
    stream_url: &str,
    config: &ServerConfig,
    metaint: Option<usize>,
) -> String {
    let status = if config.legacy_icy_status {
        "ICY 200 OK"
    } else {
        "HTTP/1.0 200 OK"
    };
    let metaint = metaint
        .map(|interval| format!("icy-metaint: {interval}\r\n"))
        .unwrap_or_default();
    format!(
        "{status}\r\n\
         Content-Type: {CONTENT_TYPE_AAC}\r\n\
         icy-br: {bitrate}\r\n\
         icy-name: {name}\r\n\
         icy-genre: {genre}\r\n\
         icy-url: {stream_url}\r\n\
         icy-pub: 0\r\n\
         {metaint}\
         Cache-Control: no-cache\r\n\
         Connection: close\r\n\
         \r\n",
        bitrate = config.icy_bitrate,
        name = header_value(&channel.name),
        genre = header_value(&channel.genre),
    )
}

/// Strip characters that would end a header line early
fn header_value(value: &str) -> String {
    value.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

/// Write a complete HTTP/1.0 response. `headers` must not repeat
/// `Content-Length` or `Connection`.
pub async fn write_body<W>(
    writer: &mut W,
    status: StatusCode,
    headers: &[(String, String)],
    body: &[u8],
) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.0 {} {}\r\n",
        status.as_u16(),
        reason_phrase(status)
    );
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection") {
            continue;
        }
        head.push_str(&format!("{}: {}\r\n", display_name(name), header_value(value)));
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));

    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// `content-type` -> `Content-Type`, old players match header names exactly
fn display_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

pub async fn write_error<W>(
    writer: &mut W,
    status: StatusCode,
    message: &str,
) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    let body = format!("{} {}: {message}\n", status.as_u16(), reason_phrase(status));
    let mut headers = vec![(
        "Content-Type".to_string(),
        "text/plain; charset=utf-8".to_string(),
    )];
    if status == StatusCode::METHOD_NOT_ALLOWED {
        headers.push(("Allow".to_string(), "GET".to_string()));
    }
    write_body(writer, status, &headers, body.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> Channel {
        Channel {
            id: "20".to_string(),
            number: 20,
            name: "Octane".to_string(),
            genre: "Rock\r\nX-Injected: 1".to_string(),
            key: "octane".to_string(),
            account: "main".to_string(),
        }
    }

    #[test]
    fn test_stream_head() {
        let config = ServerConfig::default();
        let head = stream_head(&channel(), "http://localhost:30000/channel/20", &config, None);
        assert!(head.starts_with("ICY 200 OK\r\n"));
        assert!(head.contains("Content-Type: audio/aacp\r\n"));
        assert!(head.contains("icy-br: 64\r\n"));
        assert!(head.contains("icy-name: Octane\r\n"));
        assert!(head.contains("icy-genre: RockX-Injected: 1\r\n"));
        assert!(head.contains("icy-url: http://localhost:30000/channel/20\r\n"));
        assert!(!head.contains("icy-metaint"));
        assert!(head.ends_with("\r\n\r\n"));

        let config = ServerConfig {
            legacy_icy_status: false,
            ..Default::default()
        };
        let head = stream_head(&channel(), "http://x/", &config, Some(16000));
        assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(head.contains("icy-metaint: 16000\r\n"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&BridgeError::UnknownChannel("9".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&BridgeError::ProtocolHandshake("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&BridgeError::ChannelFailed {
                channel: "20".into(),
                reason: "auth".into()
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&BridgeError::Timeout("start".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_error_response() {
        let mut out = Vec::new();
        write_error(&mut out, StatusCode::METHOD_NOT_ALLOWED, "only GET is supported")
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.0 405 Method Not Allowed\r\n"));
        assert!(text.contains("Allow: GET\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(text.ends_with("405 Method Not Allowed: only GET is supported\n"));
    }

    #[tokio::test]
    async fn test_framework_headers_are_rewritten() {
        let mut out = Vec::new();
        let headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("content-length".to_string(), "999".to_string()),
        ];
        write_body(&mut out, StatusCode::OK, &headers, b"[]").await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(!text.contains("999"));
        assert!(text.ends_with("\r\n\r\n[]"));
    }
}
