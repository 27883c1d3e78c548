//! # Downstream Server
//!
//! Speaks just enough HTTP/1.x for internet-radio players:
//!
//! - `GET /channel/{id}` attaches a listener and streams raw ADTS after an
//!   ICY style head, with in-band titles for clients sending `Icy-MetaData: 1`
//! - `GET /channels` returns the channel directory as JSON
//! - `GET /metadata/{id}` returns one directory entry
//!
//! The JSON routes are an axum [`Router`] driven from the same connection
//! handler. Each connection is served by its own task. A stream ends when the
//! client goes away, a write stalls past the write timeout or the hub
//! detaches the listener.

mod api;
mod icy;
mod request;
mod response;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use icy::{MetadataInterleaver, metadata_block};
pub use request::Request;
pub use response::{CONTENT_TYPE_AAC, status_for};

use crate::lifecycle::ChannelManager;
use crate::{BridgeError, EngineConfig, ServerConfig};

/// Where a request is routed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route<'a> {
    Stream(&'a str),
    /// Served by the JSON router, with the trailing slash dropped
    Api(&'a str),
}

impl<'a> Route<'a> {
    pub fn resolve(path: &'a str) -> Self {
        let trimmed = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        match trimmed.strip_prefix("/channel/") {
            Some(id) if !id.is_empty() && !id.contains('/') => Route::Stream(id),
            _ => Route::Api(trimmed),
        }
    }
}

/// Accepts listener connections and serves them from the channel manager
#[derive(Clone)]
pub struct StreamServer {
    manager: ChannelManager,
    api: Router,
    config: Arc<ServerConfig>,
    start_timeout: Duration,
}

impl StreamServer {
    pub fn new(manager: ChannelManager, config: &EngineConfig) -> Self {
        Self {
            api: api::router(manager.clone()),
            manager,
            config: Arc::new(config.server.clone()),
            start_timeout: config.lifecycle.start_timeout,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener, BridgeError> {
        let address = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            BridgeError::Config(format!("Failed to bind {address}: {e}"))
        })?;
        info!("Stream server listening on http://{}", address);
        Ok(listener)
    }

    /// Accept connections until `cancel` fires
    pub async fn run(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), BridgeError> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Stream server stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually out of file descriptors, keep serving the
                    // connections we have
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
            }

            let server = self.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer, cancel).await {
                    debug!(%peer, error = %e, "Connection ended with error");
                }
            });
        }
    }

    pub async fn handle_connection<S>(
        &self,
        mut stream: S,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), BridgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let head = match timeout(
            self.config.handshake_timeout,
            request::read_head(&mut stream, self.config.max_request_head),
        )
        .await
        {
            Ok(head) => head,
            Err(_) => {
                return Err(BridgeError::ProtocolHandshake(
                    "Timed out waiting for the request head".to_string(),
                ));
            }
        };
        let request = match head.and_then(|head| Request::parse(&head)) {
            Ok(request) => request,
            Err(e) => {
                response::write_error(&mut stream, StatusCode::BAD_REQUEST, &e.to_string())
                    .await?;
                return Err(e);
            }
        };
        debug!(%peer, method = %request.method, path = %request.path, "Request");

        if request.method != "GET" {
            return response::write_error(
                &mut stream,
                StatusCode::METHOD_NOT_ALLOWED,
                "only GET is supported",
            )
            .await;
        }

        match Route::resolve(&request.path) {
            Route::Stream(id) => {
                let metadata = request
                    .header("icy-metadata")
                    .is_some_and(|value| value.trim() == "1");
                self.stream(stream, peer, id, metadata, cancel).await
            }
            Route::Api(path) => match api::dispatch(&self.api, path).await {
                Ok((status, headers, body)) => {
                    response::write_body(&mut stream, status, &headers, &body).await
                }
                Err(e) => self.reject(&mut stream, &e).await,
            },
        }
    }

    async fn reject<S>(&self, stream: &mut S, error: &BridgeError) -> Result<(), BridgeError>
    where
        S: AsyncWrite + Unpin,
    {
        response::write_error(stream, status_for(error), &error.to_string()).await
    }

    async fn stream<S>(
        &self,
        mut stream: S,
        peer: SocketAddr,
        id: &str,
        metadata: bool,
        cancel: CancellationToken,
    ) -> Result<(), BridgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (channel, stream_url) =
            match self.manager.channel(id).and_then(|c| Ok((c, self.manager.stream_url(id)?))) {
                Ok(found) => found,
                Err(e) => return self.reject(&mut stream, &e).await,
            };

        let mut subscription = match self.manager.attach(id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(%peer, channel = %id, error = %e, "Failed to attach listener");
                return self.reject(&mut stream, &e).await;
            }
        };
        if let Err(e) = self.manager.wait_ready(id, self.start_timeout).await {
            warn!(%peer, channel = %id, error = %e, "Channel did not become ready");
            subscription.detach();
            return self.reject(&mut stream, &e).await;
        }

        let mut icy = (metadata && self.config.icy_metaint > 0)
            .then(|| MetadataInterleaver::new(self.config.icy_metaint));
        let metaint = icy.as_ref().map(MetadataInterleaver::interval);
        let head = response::stream_head(&channel, &stream_url, &self.config, metaint);
        self.write(&mut stream, head.as_bytes()).await?;
        info!(
            %peer,
            channel = %id,
            listener = subscription.id(),
            metadata = metaint.is_some(),
            "Listener attached"
        );

        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut scratch = [0u8; 256];
        let mut out = BytesMut::new();
        let mut sent_bytes = 0u64;
        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                read = reader.read(&mut scratch) => match read {
                    // Players send nothing after the head, EOF means hang-up
                    Ok(0) | Err(_) => break Ok(()),
                    Ok(_) => continue,
                },
                frame = subscription.recv() => match frame {
                    Ok(frame) => {
                        let written = match icy.as_mut() {
                            Some(icy) => {
                                if let Some(track) = subscription.now_playing_changed() {
                                    icy.set_title(&track.stream_title());
                                }
                                out.clear();
                                icy.interleave(&frame.data, &mut out);
                                self.write(&mut writer, &out).await
                            }
                            None => self.write(&mut writer, &frame.data).await,
                        };
                        if let Err(e) = written {
                            break Err(e);
                        }
                        sent_bytes += frame.data.len() as u64;
                    }
                    Err(reason) => {
                        debug!(channel = %id, %reason, "Listener detached by hub");
                        break reason.error(id).map_or(Ok(()), Err);
                    }
                },
            }
        };
        subscription.detach();

        info!(
            %peer,
            channel = %id,
            listener = subscription.id(),
            sent_bytes,
            "Listener disconnected"
        );
        result
    }

    async fn write<W>(&self, writer: &mut W, data: &[u8]) -> Result<(), BridgeError>
    where
        W: AsyncWrite + Unpin,
    {
        match timeout(self.config.write_timeout, writer.write_all(data)).await {
            Ok(written) => Ok(written?),
            Err(_) => Err(BridgeError::Timeout("Listener write stalled".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use crate::channel::Channel;
    use crate::session::{Credentials, SessionStore};
    use crate::test_util::{MockProvider, encrypted_segment, encrypted_segment_with_track};
    use crate::SessionConfig;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn server(provider: &Arc<MockProvider>) -> (StreamServer, ChannelManager) {
        server_with(provider, EngineConfig::default())
    }

    fn server_with(
        provider: &Arc<MockProvider>,
        config: EngineConfig,
    ) -> (StreamServer, ChannelManager) {
        let sessions = Arc::new(SessionStore::new(provider.clone(), SessionConfig::default()));
        sessions.register(Credentials::new("main", "user", "secret"));
        let channels = vec![Channel {
            id: "20".to_string(),
            number: 20,
            name: "Octane".to_string(),
            genre: "Rock".to_string(),
            key: "octane".to_string(),
            account: "main".to_string(),
        }];
        let manager =
            ChannelManager::new(config.clone(), provider.clone(), sessions, channels).unwrap();
        (StreamServer::new(manager.clone(), &config), manager)
    }

    fn connect(server: &StreamServer) -> (DuplexStream, tokio::task::JoinHandle<Result<(), BridgeError>>) {
        let (client, conn) = tokio::io::duplex(64 * 1024);
        let server = server.clone();
        let task = tokio::spawn(async move {
            server
                .handle_connection(conn, peer(), CancellationToken::new())
                .await
        });
        (client, task)
    }

    async fn exchange(server: &StreamServer, request: &str) -> String {
        let (mut client, task) = connect(server);
        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        let _ = task.await.unwrap();
        response
    }

    #[test]
    fn test_routes() {
        assert_eq!(Route::resolve("/channel/20"), Route::Stream("20"));
        assert_eq!(Route::resolve("/channel/20/"), Route::Stream("20"));
        assert_eq!(Route::resolve("/channels/"), Route::Api("/channels"));
        assert_eq!(Route::resolve("/metadata/20"), Route::Api("/metadata/20"));
        assert_eq!(Route::resolve("/channel/"), Route::Api("/channel"));
        assert_eq!(Route::resolve("/channel/20/extra"), Route::Api("/channel/20/extra"));
        assert_eq!(Route::resolve("/"), Route::Api("/"));
    }

    #[tokio::test]
    async fn test_directory_and_metadata() {
        let provider = Arc::new(MockProvider::new());
        let (server, _manager) = server(&provider);

        let response = exchange(&server, "GET /channels HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(response.contains("Content-Type: application/json\r\n"));
        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        let channels: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(channels[0]["id"], "20");
        assert_eq!(channels[0]["stream_url"], "http://localhost:30000/channel/20");
        assert_eq!(channels[0]["state"]["state"], "idle");

        let response = exchange(&server, "GET /metadata/20/ HTTP/1.0\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        let info: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(info["name"], "Octane");
        assert_eq!(info["now_playing"], serde_json::Value::Null);

        let response = exchange(&server, "GET /metadata/99 HTTP/1.0\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.0 404 Not Found\r\n"));
        assert!(response.contains("Content-Type: application/json\r\n"));
        // Directory queries never start channels
        assert_eq!(provider.opens(), 0);
    }

    #[tokio::test]
    async fn test_rejected_requests() {
        let provider = Arc::new(MockProvider::new());
        let (server, _manager) = server(&provider);

        let response = exchange(&server, "POST /channel/20 HTTP/1.0\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.0 405 Method Not Allowed\r\n"));
        assert!(response.contains("Allow: GET\r\n"));

        let response = exchange(&server, "GET /channel/99 HTTP/1.0\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.0 404 Not Found\r\n"));

        let response = exchange(&server, "GET /favicon.ico HTTP/1.0\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.0 404 Not Found\r\n"));

        let response = exchange(&server, "HELLO\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.0 400 Bad Request\r\n"));
        assert_eq!(provider.opens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_sends_icy_head_then_audio() {
        let provider = Arc::new(MockProvider::new());
        provider.push_segment("octane", encrypted_segment(&[1, 2, 3]));
        let (server, manager) = server(&provider);

        let (mut client, task) = connect(&server);
        client
            .write_all(b"GET /channel/20 HTTP/1.0\r\nIcy-MetaData: 1\r\n\r\n")
            .await
            .unwrap();

        let mut received = Vec::new();
        let mut chunk = [0u8; 1024];
        let head_end = loop {
            let read = client.read(&mut chunk).await.unwrap();
            assert!(read > 0, "server closed the stream early");
            received.extend_from_slice(&chunk[..read]);
            if let Some(pos) = received.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&received[..head_end]).to_string();
        assert!(head.starts_with("ICY 200 OK\r\n"));
        assert!(head.contains("Content-Type: audio/aacp\r\n"));
        assert!(head.contains("icy-name: Octane\r\n"));
        assert!(head.contains("icy-metaint: 32768\r\n"));

        while received.len() < head_end + 2 {
            let read = client.read(&mut chunk).await.unwrap();
            assert!(read > 0, "server closed the stream early");
            received.extend_from_slice(&chunk[..read]);
        }
        // Raw ADTS, the first byte after the head is a frame syncword
        assert_eq!(received[head_end], 0xFF);
        assert_eq!(received[head_end + 1] & 0xF0, 0xF0);
        assert_eq!(manager.channel_info("20").unwrap().listeners, 1);

        drop(client);
        task.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.channel_info("20").unwrap().listeners, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_interleaves_track_titles() {
        let provider = Arc::new(MockProvider::new());
        provider.push_segment(
            "octane",
            encrypted_segment_with_track(&[1, 2, 3, 4, 5, 6], "Everlong", "Foo Fighters"),
        );
        let mut config = EngineConfig::default();
        config.server.icy_metaint = 64;
        let (server, _manager) = server_with(&provider, config);

        let (mut client, task) = connect(&server);
        client
            .write_all(b"GET /channel/20 HTTP/1.0\r\nicy-metadata: 1\r\n\r\n")
            .await
            .unwrap();

        let title = b"StreamTitle='Foo Fighters - Everlong';";
        let mut received = Vec::new();
        let mut chunk = [0u8; 1024];
        let head_end = loop {
            let read = client.read(&mut chunk).await.unwrap();
            assert!(read > 0, "server closed the stream early");
            received.extend_from_slice(&chunk[..read]);
            if let Some(pos) = received.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&received[..head_end]).to_string();
        assert!(head.contains("icy-metaint: 64\r\n"));

        // 64 audio bytes, the title block, 64 more audio bytes, an empty block
        let block_len = 1 + title.len().div_ceil(16) * 16;
        let second = head_end + 64 + block_len + 64;
        while received.len() <= second {
            let read = client.read(&mut chunk).await.unwrap();
            assert!(read > 0, "server closed the stream early");
            received.extend_from_slice(&chunk[..read]);
        }
        let first = head_end + 64;
        assert_eq!(received[head_end], 0xFF);
        assert_eq!(received[first] as usize, title.len().div_ceil(16));
        assert_eq!(&received[first + 1..=first + title.len()], title);
        assert_eq!(received[second], 0);

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_of_failing_channel_is_unavailable() {
        let provider = Arc::new(MockProvider::new());
        provider.reject_credentials(true);
        let (server, _manager) = server(&provider);

        let response = exchange(&server, "GET /channel/20 HTTP/1.0\r\n\r\n").await;
        assert!(
            response.starts_with("HTTP/1.0 503 Service Unavailable\r\n"),
            "{response}"
        );
    }
}
