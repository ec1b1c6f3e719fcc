use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{VmError, VmResult};

/// Connect timeout for the framebuffer endpoint.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const READ_BUF_SIZE: usize = 64 * 1024;

/// A frame received from the client side of a console session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Binary(Vec<u8>),
    Text(String),
    Close,
}

/// Receiving half of a console client (a WebSocket in production).
#[async_trait]
pub trait ConsoleSource: Send {
    /// Next frame, `None` once the transport is gone.
    async fn recv(&mut self) -> Option<anyhow::Result<TransportFrame>>;
}

/// Sending half of a console client.
#[async_trait]
pub trait ConsoleSink: Send {
    async fn send_binary(&mut self, data: Vec<u8>) -> anyhow::Result<()>;
    async fn send_text(&mut self, text: String) -> anyhow::Result<()>;
    /// Best-effort close.
    async fn close(&mut self);
}

/// Which side ended the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayEnd {
    ClientClosed,
    ClientError(String),
    UpstreamClosed,
    UpstreamError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
    pub ended_by: RelayEnd,
}

/// Bridge a console client to the VNC server on `127.0.0.1:port` until
/// either side closes, then close the other side.
///
/// Bytes are forwarded untouched. The two directions are pumped concurrently,
/// so a slow client never holds back input headed for the server. If the
/// endpoint cannot be reached within `connect_timeout`, a single
/// `{"error": ...}` text frame is sent and the client is closed.
pub async fn relay<R: ConsoleSource, W: ConsoleSink>(
    source: &mut R,
    sink: &mut W,
    vm_id: Uuid,
    port: u16,
    connect_timeout: Duration,
) -> VmResult<RelayStats> {
    let upstream = match connect(port, connect_timeout).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(vm_id = %vm_id, port, error = %err, "console endpoint unreachable");
            let msg = serde_json::json!({ "error": err.to_string() }).to_string();
            if let Err(e) = sink.send_text(msg).await {
                debug!(vm_id = %vm_id, error = %e, "could not deliver console error to client");
            }
            sink.close().await;
            return Err(err);
        }
    };
    upstream.set_nodelay(true).ok();
    info!(vm_id = %vm_id, port, "console session opened");

    let (mut upstream_rd, mut upstream_wr) = upstream.into_split();
    let mut to_upstream: u64 = 0;
    let mut to_client: u64 = 0;

    let ended_by = {
        // Client -> VNC server
        let client_to_upstream = async {
            loop {
                let data = match source.recv().await {
                    Some(Ok(TransportFrame::Binary(data))) => data,
                    Some(Ok(TransportFrame::Text(text))) => text.into_bytes(),
                    Some(Ok(TransportFrame::Close)) | None => return RelayEnd::ClientClosed,
                    Some(Err(e)) => return RelayEnd::ClientError(e.to_string()),
                };
                if let Err(e) = upstream_wr.write_all(&data).await {
                    return RelayEnd::UpstreamError(e.to_string());
                }
                to_upstream += data.len() as u64;
            }
        };

        // VNC server -> client
        let upstream_to_client = async {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                let n = match upstream_rd.read(&mut buf).await {
                    Ok(0) => return RelayEnd::UpstreamClosed,
                    Ok(n) => n,
                    Err(e) => return RelayEnd::UpstreamError(e.to_string()),
                };
                if let Err(e) = sink.send_binary(buf[..n].to_vec()).await {
                    return RelayEnd::ClientError(e.to_string());
                }
                to_client += n as u64;
            }
        };

        tokio::select! {
            end = client_to_upstream => end,
            end = upstream_to_client => end,
        }
    };

    match &ended_by {
        RelayEnd::ClientClosed | RelayEnd::ClientError(_) => {
            upstream_wr.shutdown().await.ok();
        }
        RelayEnd::UpstreamClosed | RelayEnd::UpstreamError(_) => {
            sink.close().await;
        }
    }

    info!(
        vm_id = %vm_id,
        port,
        bytes_to_upstream = to_upstream,
        bytes_to_client = to_client,
        ended_by = ?ended_by,
        "console session closed"
    );
    Ok(RelayStats {
        bytes_to_upstream: to_upstream,
        bytes_to_client: to_client,
        ended_by,
    })
}

async fn connect(port: u16, connect_timeout: Duration) -> VmResult<TcpStream> {
    match tokio::time::timeout(connect_timeout, TcpStream::connect((Ipv4Addr::LOCALHOST, port)))
        .await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(VmError::UpstreamConnectFailure {
            port,
            reason: e.to_string(),
        }),
        Err(_) => Err(VmError::UpstreamConnectFailure {
            port,
            reason: format!("timed out after {:?}", connect_timeout),
        }),
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, oneshot};

    use super::*;

    #[derive(Debug, PartialEq)]
    enum Sent {
        Binary(Vec<u8>),
        Text(String),
        Close,
    }

    struct ChannelSource(mpsc::UnboundedReceiver<TransportFrame>);

    #[async_trait]
    impl ConsoleSource for ChannelSource {
        async fn recv(&mut self) -> Option<anyhow::Result<TransportFrame>> {
            self.0.recv().await.map(Ok)
        }
    }

    struct ChannelSink(mpsc::UnboundedSender<Sent>);

    #[async_trait]
    impl ConsoleSink for ChannelSink {
        async fn send_binary(&mut self, data: Vec<u8>) -> anyhow::Result<()> {
            self.0.send(Sent::Binary(data))?;
            Ok(())
        }

        async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
            self.0.send(Sent::Text(text))?;
            Ok(())
        }

        async fn close(&mut self) {
            let _ = self.0.send(Sent::Close);
        }
    }

    /// A client that never finishes accepting the first binary frame.
    struct StalledSink {
        entered: Option<oneshot::Sender<()>>,
    }

    #[async_trait]
    impl ConsoleSink for StalledSink {
        async fn send_binary(&mut self, _data: Vec<u8>) -> anyhow::Result<()> {
            if let Some(tx) = self.entered.take() {
                let _ = tx.send(());
            }
            std::future::pending().await
        }

        async fn send_text(&mut self, _text: String) -> anyhow::Result<()> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn transport() -> (
        ChannelSource,
        ChannelSink,
        mpsc::UnboundedSender<TransportFrame>,
        mpsc::UnboundedReceiver<Sent>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (ChannelSource(in_rx), ChannelSink(out_tx), in_tx, out_rx)
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_connect_failure_sends_error_and_closes() {
        let port = unused_port().await;
        let (mut source, mut sink, _in_tx, mut out_rx) = transport();

        let err = relay(&mut source, &mut sink, Uuid::new_v4(), port, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::UpstreamConnectFailure { port: p, .. } if p == port));

        let Some(Sent::Text(text)) = out_rx.recv().await else {
            panic!("expected an error text frame");
        };
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(json["error"].as_str().unwrap().contains(&port.to_string()));
        assert_eq!(out_rx.recv().await, Some(Sent::Close));
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways_until_upstream_closes() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"RFB 003.008\n").await.unwrap();
            let mut reply = [0u8; 5];
            sock.read_exact(&mut reply).await.unwrap();
            reply
        });

        let (mut source, mut sink, in_tx, mut out_rx) = transport();
        in_tx.send(TransportFrame::Binary(b"hello".to_vec())).unwrap();

        let stats = relay(&mut source, &mut sink, Uuid::new_v4(), port, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&server.await.unwrap(), b"hello");
        assert_eq!(stats.ended_by, RelayEnd::UpstreamClosed);
        assert_eq!(stats.bytes_to_upstream, 5);
        assert_eq!(stats.bytes_to_client, 12);

        let mut received = Vec::new();
        loop {
            match out_rx.recv().await {
                Some(Sent::Binary(data)) => received.extend(data),
                Some(Sent::Close) => break,
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(received, b"RFB 003.008\n");
    }

    #[tokio::test]
    async fn test_client_close_shuts_down_upstream() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut all = Vec::new();
            sock.read_to_end(&mut all).await.unwrap();
            all
        });

        let (mut source, mut sink, in_tx, _out_rx) = transport();
        in_tx.send(TransportFrame::Text("abc".into())).unwrap();
        in_tx.send(TransportFrame::Binary(vec![1, 2, 3])).unwrap();
        in_tx.send(TransportFrame::Close).unwrap();

        let stats = relay(&mut source, &mut sink, Uuid::new_v4(), port, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(stats.ended_by, RelayEnd::ClientClosed);
        assert_eq!(server.await.unwrap(), b"abc\x01\x02\x03");
    }

    #[tokio::test]
    async fn test_dropped_transport_ends_session() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut all = Vec::new();
            sock.read_to_end(&mut all).await.unwrap();
            all.len()
        });

        let (mut source, mut sink, in_tx, _out_rx) = transport();
        drop(in_tx);

        let stats = relay(&mut source, &mut sink, Uuid::new_v4(), port, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(stats.ended_by, RelayEnd::ClientClosed);
        assert_eq!(server.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stalled_client_does_not_block_input() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"RFB 003.008\n").await.unwrap();
            let mut reply = [0u8; 5];
            sock.read_exact(&mut reply).await.unwrap();
            (sock, reply)
        });

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (entered_tx, entered_rx) = oneshot::channel();
        let mut source = ChannelSource(in_rx);
        let mut sink = StalledSink {
            entered: Some(entered_tx),
        };
        let session = tokio::spawn(async move {
            relay(&mut source, &mut sink, Uuid::new_v4(), port, Duration::from_secs(1)).await
        });

        // The greeting is stuck on its way to the client.
        entered_rx.await.unwrap();
        in_tx.send(TransportFrame::Binary(b"hello".to_vec())).unwrap();

        let (_sock, reply) = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("input held back by the stalled client")
            .unwrap();
        assert_eq!(&reply, b"hello");

        drop(in_tx);
        let stats = tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .expect("session did not end after client closed")
            .unwrap()
            .unwrap();
        assert_eq!(stats.ended_by, RelayEnd::ClientClosed);
        assert_eq!(stats.bytes_to_upstream, 5);
        assert_eq!(stats.bytes_to_client, 0);
    }
}
