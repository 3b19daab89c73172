//! Access to workloads behind a cluster's API server
//!
//! Tunnels talk to pods through two operations: open a byte stream to a
//! container port, and read the pod's phase. [`KubeConnector`] implements
//! them against a real API server using the websocket port-forward
//! subprotocol; tests substitute their own [`WorkloadConnector`].

use crate::error::WorkloadError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rustls::ClientConfig;
use serde::Deserialize;
use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::Connector;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};
use url::Url;

/// Subprotocol spoken on the port-forward websocket
pub const PORT_FORWARD_PROTOCOL: &str = "v4.channel.k8s.io";

/// Pod phase reported while containers are up
pub const POD_RUNNING: &str = "Running";

const DATA_CHANNEL: u8 = 0;
const ERROR_CHANNEL: u8 = 1;
const STREAM_BUFFER: usize = 64 * 1024;

/// A bidirectional byte stream to a workload port
pub trait WorkloadIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> WorkloadIo for T {}

pub type WorkloadStream = Box<dyn WorkloadIo>;

/// Connection parameters for one cluster
#[derive(Clone)]
pub struct WorkloadTransport {
    pub server: Url,
    pub tls: Arc<ClientConfig>,
    pub http: reqwest::Client,
    pub token: Option<String>,
}

impl std::fmt::Debug for WorkloadTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadTransport")
            .field("server", &self.server.as_str())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Operations a tunnel needs against one cluster
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Open a stream to `port` inside the pod
    async fn open_stream(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<WorkloadStream, WorkloadError>;

    /// Current lifecycle phase of the pod
    async fn pod_phase(&self, namespace: &str, pod: &str) -> Result<String, WorkloadError>;
}

/// Creates [`WorkloadClient`]s from a cluster's transport
pub trait WorkloadConnector: Send + Sync {
    fn connect(&self, transport: WorkloadTransport) -> Arc<dyn WorkloadClient>;
}

/// Talks to a Kubernetes API server
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeConnector;

impl WorkloadConnector for KubeConnector {
    fn connect(&self, transport: WorkloadTransport) -> Arc<dyn WorkloadClient> {
        Arc::new(KubeWorkloadClient { transport })
    }
}

#[derive(Debug)]
struct KubeWorkloadClient {
    transport: WorkloadTransport,
}

#[derive(Debug, Deserialize)]
struct PodObject {
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: String,
}

impl KubeWorkloadClient {
    fn api_url(&self, namespace: &str, pod: &str, suffix: &str) -> Url {
        let mut url = self.transport.server.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!(
            "{}/api/v1/namespaces/{}/pods/{}{}",
            base, namespace, pod, suffix
        ));
        url
    }

    fn port_forward_url(&self, namespace: &str, pod: &str, port: u16) -> Result<Url, WorkloadError> {
        let mut url = self.api_url(namespace, pod, "/portforward");
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| WorkloadError::Request(format!("cannot use scheme {} for websocket", scheme)))?;
        url.query_pairs_mut().append_pair("ports", &port.to_string());
        Ok(url)
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn open_stream(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<WorkloadStream, WorkloadError> {
        let url = self.port_forward_url(namespace, pod, port)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| WorkloadError::Request(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(PORT_FORWARD_PROTOCOL),
        );
        if let Some(token) = &self.transport.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| WorkloadError::Request(e.to_string()))?;
            headers.insert("Authorization", value);
        }

        debug!(namespace, pod, port, url = %url, "Opening port-forward stream");

        let connector = Connector::Rustls(Arc::clone(&self.transport.tls));
        let (socket, _) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, true, Some(connector))
                .await
                .map_err(|e| classify_error(&e))?;

        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        let closed = CancellationToken::new();
        let label = format!("{}/{}:{}", namespace, pod, port);
        tokio::spawn(pump(socket, remote, closed.clone(), label));

        Ok(Box::new(PortForwardStream {
            io: local,
            _closed: closed.drop_guard(),
        }))
    }

    async fn pod_phase(&self, namespace: &str, pod: &str) -> Result<String, WorkloadError> {
        let url = self.api_url(namespace, pod, "");
        let mut request = self.transport.http.get(url);
        if let Some(token) = &self.transport.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| classify_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(WorkloadError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let pod: PodObject = response
            .json()
            .await
            .map_err(|e| WorkloadError::Request(e.to_string()))?;
        Ok(pod.status.phase)
    }
}

/// Local end of a port-forward; dropping it stops the websocket pump
struct PortForwardStream {
    io: DuplexStream,
    _closed: DropGuard,
}

impl AsyncRead for PortForwardStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for PortForwardStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Shuttle bytes between the websocket and the local half of a duplex pipe.
///
/// The protocol has no half-close, so EOF from the local side only stops
/// outbound frames. The stream stays open until the pod side finishes or
/// the local end is dropped.
async fn pump<S>(socket: S, remote: DuplexStream, closed: CancellationToken, label: String)
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut ws_write, mut ws_read) = socket.split();
    let (mut pipe_read, mut pipe_write) = tokio::io::split(remote);

    let outbound = async {
        let mut buf = vec![0u8; STREAM_BUFFER];
        loop {
            let n = match pipe_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let mut frame = Vec::with_capacity(n + 1);
            frame.push(DATA_CHANNEL);
            frame.extend_from_slice(&buf[..n]);
            if ws_write.send(Message::Binary(frame.into())).await.is_err() {
                break;
            }
        }
        debug!(stream = %label, "Local side finished sending");
        std::future::pending::<()>().await
    };

    let inbound = async {
        let mut demux = ChannelDemux::default();
        while let Some(message) = ws_read.next().await {
            let data = match message {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!(stream = %label, error = %e, "Port-forward websocket failed");
                    break;
                }
                Ok(_) => continue,
            };
            match demux.accept(&data) {
                Frame::Data(payload) => {
                    if pipe_write.write_all(payload).await.is_err() {
                        break;
                    }
                }
                Frame::Error(message) => {
                    warn!(stream = %label, error = %message, "Port-forward stream error");
                    break;
                }
                Frame::Skip => {}
            }
        }
        let _ = pipe_write.shutdown().await;
    };

    tokio::select! {
        _ = outbound => {}
        _ = inbound => {}
        _ = closed.cancelled() => {}
    }

    let _ = ws_write.send(Message::Close(None)).await;
    debug!(stream = %label, "Port-forward stream closed");
}

enum Frame<'a> {
    Data(&'a [u8]),
    Error(String),
    Skip,
}

/// Splits port-forward frames by channel.
///
/// The first frame on each channel carries the port number (two bytes,
/// little-endian) and no payload.
#[derive(Debug, Default)]
struct ChannelDemux {
    data_started: bool,
    error_started: bool,
}

impl ChannelDemux {
    fn accept<'a>(&mut self, frame: &'a [u8]) -> Frame<'a> {
        let Some((&channel, rest)) = frame.split_first() else {
            return Frame::Skip;
        };
        let started = match channel {
            DATA_CHANNEL => &mut self.data_started,
            ERROR_CHANNEL => &mut self.error_started,
            _ => return Frame::Skip,
        };

        let payload = if *started {
            rest
        } else {
            *started = true;
            rest.get(2..).unwrap_or_default()
        };

        match channel {
            _ if payload.is_empty() => Frame::Skip,
            DATA_CHANNEL => Frame::Data(payload),
            _ => Frame::Error(String::from_utf8_lossy(payload).into_owned()),
        }
    }
}

/// Map a transport error, singling out refused connections and handshake violations
fn classify_error(err: &(dyn StdError + 'static)) -> WorkloadError {
    if is_connection_refused(err) {
        WorkloadError::ConnectionRefused(err.to_string())
    } else if let Some(tungstenite::Error::Protocol(e)) = err.downcast_ref::<tungstenite::Error>() {
        WorkloadError::Protocol(e.to_string())
    } else {
        WorkloadError::Request(err.to_string())
    }
}

/// Walk the source chain looking for ECONNREFUSED
pub fn is_connection_refused(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        if let Some(tungstenite::Error::Io(io)) = e.downcast_ref::<tungstenite::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::WebSocketStream;

    fn client(server: &str) -> KubeWorkloadClient {
        let tls = crate::factory::build_tls_config("c1", &Default::default()).unwrap();
        KubeWorkloadClient {
            transport: WorkloadTransport {
                server: Url::parse(server).unwrap(),
                tls,
                http: reqwest::Client::new(),
                token: None,
            },
        }
    }

    #[test]
    fn test_port_forward_url() {
        let url = client("https://10.0.0.1:6443/prefix/")
            .port_forward_url("ns1", "pod1", 8080)
            .unwrap();
        assert_eq!(
            url.as_str(),
            "wss://10.0.0.1:6443/prefix/api/v1/namespaces/ns1/pods/pod1/portforward?ports=8080"
        );

        let url = client("http://127.0.0.1:8001")
            .port_forward_url("ns1", "pod1", 80)
            .unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn test_demux_strips_port_prefix() {
        let mut demux = ChannelDemux::default();
        assert!(matches!(demux.accept(&[0, 0x90, 0x1f]), Frame::Skip));
        assert!(matches!(demux.accept(&[1, 0x90, 0x1f]), Frame::Skip));

        match demux.accept(&[0, b'h', b'i']) {
            Frame::Data(payload) => assert_eq!(payload, b"hi"),
            _ => panic!("expected data"),
        }
        match demux.accept(&[1, b'b', b'o', b'o', b'm']) {
            Frame::Error(message) => assert_eq!(message, "boom"),
            _ => panic!("expected error"),
        }
        assert!(matches!(demux.accept(&[7, 1, 2]), Frame::Skip));
        assert!(matches!(demux.accept(&[]), Frame::Skip));
    }

    #[test]
    fn test_demux_payload_in_first_frame() {
        let mut demux = ChannelDemux::default();
        match demux.accept(&[0, 0x50, 0x00, b'x']) {
            Frame::Data(payload) => assert_eq!(payload, b"x"),
            _ => panic!("expected data"),
        }
    }

    #[test]
    fn test_connection_refused_detection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(is_connection_refused(&io));

        let ws = tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(classify_error(&ws), WorkloadError::ConnectionRefused(_)));

        let other = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(classify_error(&other), WorkloadError::Request(_)));
    }

    #[tokio::test]
    async fn test_pod_phase_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = client(&format!("http://127.0.0.1:{}", port))
            .pod_phase("ns1", "pod1")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkloadError::ConnectionRefused(_)));
    }

    /// Port-forward endpoint that agrees on the subprotocol and hands the socket to `handler`
    async fn spawn_port_forward_server<F, Fut>(handler: F) -> u16
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = |req: &Request, mut response: Response| {
                assert_eq!(req.uri().path(), "/api/v1/namespaces/ns1/pods/pod1/portforward");
                assert_eq!(req.uri().query(), Some("ports=8080"));
                response.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_static(PORT_FORWARD_PROTOCOL),
                );
                Ok::<_, ErrorResponse>(response)
            };
            let socket = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();
            handler(socket).await;
        });
        port
    }

    async fn send_port_headers(socket: &mut WebSocketStream<TcpStream>) {
        for channel in [DATA_CHANNEL, ERROR_CHANNEL] {
            socket
                .send(Message::Binary(vec![channel, 0x90, 0x1f].into()))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_reply_delivered_after_local_half_close() {
        let port = spawn_port_forward_server(|mut socket| async move {
            send_port_headers(&mut socket).await;
            match socket.next().await {
                Some(Ok(Message::Binary(data))) => assert_eq!(&data[..], b"\0ping"),
                other => panic!("unexpected message {:?}", other),
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            socket
                .send(Message::Binary(b"\0pong".to_vec().into()))
                .await
                .unwrap();
            socket.close(None).await.unwrap();
        })
        .await;

        let mut stream = client(&format!("http://127.0.0.1:{}", port))
            .open_stream("ns1", "pod1", 8080)
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"pong");
    }

    #[tokio::test]
    async fn test_error_channel_ends_stream() {
        let port = spawn_port_forward_server(|mut socket| async move {
            send_port_headers(&mut socket).await;
            socket
                .send(Message::Binary(b"\0partial".to_vec().into()))
                .await
                .unwrap();
            socket
                .send(Message::Binary(b"\x01lost connection to pod".to_vec().into()))
                .await
                .unwrap();
            // keep the socket open; only the error frame may end the stream
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await;

        let mut stream = client(&format!("http://127.0.0.1:{}", port))
            .open_stream("ns1", "pod1", 8080)
            .await
            .unwrap();

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"partial");
    }

    #[tokio::test]
    async fn test_dropping_stream_closes_websocket() {
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        let port = spawn_port_forward_server(|mut socket| async move {
            send_port_headers(&mut socket).await;
            let mut saw_close = false;
            while let Some(Ok(message)) = socket.next().await {
                if message.is_close() {
                    saw_close = true;
                    break;
                }
            }
            let _ = closed_tx.send(saw_close);
        })
        .await;

        let stream = client(&format!("http://127.0.0.1:{}", port))
            .open_stream("ns1", "pod1", 8080)
            .await
            .unwrap();
        drop(stream);

        let saw_close = tokio::time::timeout(Duration::from_secs(2), closed_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(saw_close);
    }

    #[tokio::test]
    async fn test_missing_subprotocol_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = tokio_tungstenite::accept_async(stream).await;
        });

        let err = match client(&format!("http://127.0.0.1:{}", port))
            .open_stream("ns1", "pod1", 8080)
            .await
        {
            Ok(_) => panic!("handshake without subprotocol accepted"),
            Err(e) => e,
        };
        assert!(matches!(err, WorkloadError::Protocol(_)), "{:?}", err);
    }
}
