//! Transport over a TCP socket to a GEA2 bridge.
//!
//! The bridge relays raw packets between the socket and the physical bus.
//! A reader task decodes inbound packets; a writer task drains an unbounded
//! queue so that `send` never waits on the socket.

use super::{BoxFuture, Link, Transport};
use crate::bus::TaskGuard;
use crate::config::TransportConfig;
use crate::error::BusError;
use bytes::Bytes;
use gea2_protocol::{Message, PacketDecoder, PacketEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 1024;

/// A link to a GEA2 bridge socket.
pub struct TcpTransport {
    peer: SocketAddr,
    writer: mpsc::UnboundedSender<Bytes>,
    _tasks: TaskGuard,
}

impl TcpTransport {
    /// Connects to a bridge and starts the socket tasks.
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Link, BusError> {
        tracing::debug!("Connecting to bridge {}...", addr);

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                tracing::debug!("Bridge connect timeout");
                BusError::Timeout
            })?
            .map_err(|e| {
                tracing::debug!("Bridge connect failed: {}", e);
                BusError::Io(e)
            })?;

        stream.set_nodelay(true).ok();
        tracing::info!("Connected to bridge {}", addr);

        Ok(Self::from_stream(addr, stream))
    }

    fn from_stream(peer: SocketAddr, stream: TcpStream) -> Link {
        let (read_half, write_half) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(peer, read_half, inbound_tx));
        let writer = tokio::spawn(write_loop(peer, write_half, writer_rx));

        let transport = TcpTransport {
            peer,
            writer: writer_tx,
            _tasks: TaskGuard::new(vec![reader, writer]),
        };
        Link::new(Arc::new(transport), inbound_rx)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    fn send(&self, message: &Message) -> Result<(), BusError> {
        let packet = PacketEncoder::encode(message)?;
        self.writer
            .send(packet)
            .map_err(|_| BusError::Transport(format!("bridge {} disconnected", self.peer)))
    }
}

/// Registry factory for the `tcp` transport.
pub(super) fn open(config: TransportConfig) -> BoxFuture<'static, Result<Link, BusError>> {
    Box::pin(async move { TcpTransport::connect(config.address, config.connect_timeout()).await })
}

async fn read_loop(
    peer: SocketAddr,
    mut reader: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<Message>,
) {
    let mut decoder = PacketDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::info!("Bridge {} closed the connection", peer);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Bridge {} read failed: {}", peer, e);
                return;
            }
        };

        decoder.extend(&buf[..n]);

        loop {
            match decoder.decode() {
                Ok(Some(message)) => {
                    if inbound.send(message).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Resync by dropping everything buffered.
                    tracing::warn!(
                        "Bridge {}: discarding {} bytes: {}",
                        peer,
                        decoder.buffered(),
                        e
                    );
                    decoder.clear();
                    break;
                }
            }
        }
    }
}

async fn write_loop(
    peer: SocketAddr,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(packet) = outbound.recv().await {
        if let Err(e) = writer.write_all(&packet).await {
            tracing::warn!("Bridge {} write failed: {}", peer, e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}
