/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! TCP channel glue.
//!
//! Thin tokio tasks that sit between a socket and the framer: a reader
//! splits the byte stream into frames with the protocol's codec and feeds
//! [`TransportEvent`]s into the framer's inbound queue; a writer drains an
//! outbound channel the engine wiring fills from the session's publication.
//! All protocol logic stays in the session state machines.

use crate::engine::TransportEvent;
use bytes::Bytes;
use crossbeam_channel::Sender;
use fixgate_codec::{FixFrameCodec, SofhFrameCodec};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, tcp::OwnedReadHalf};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

/// Which wire protocol a channel speaks; selects the framing codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    /// FIX tag=value framing.
    Fix,
    /// ILink3 SOFH framing.
    Ilink3,
}

/// Connects out and runs the channel until either side closes.
///
/// Frames read from the socket are posted as [`TransportEvent::Frame`];
/// frames received on `outbound` are written to the socket. A
/// [`TransportEvent::Disconnected`] is posted when the channel ends.
///
/// # Errors
/// Returns the connect error; errors after connect surface as the
/// disconnect event.
pub async fn run_initiator_channel(
    addr: &str,
    protocol: WireProtocol,
    connection_id: u64,
    inbound: Sender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
) -> std::io::Result<()> {
    let stream = TcpStream::connect(addr).await?;
    info!(connection_id, addr, ?protocol, "initiator connected");
    run_channel(stream, protocol, connection_id, inbound, outbound).await;
    Ok(())
}

/// Accepts one inbound connection and runs the channel until it closes.
///
/// # Errors
/// Returns the accept error; errors after accept surface as the
/// disconnect event.
pub async fn run_acceptor_channel(
    listener: &TcpListener,
    protocol: WireProtocol,
    connection_id: u64,
    inbound: Sender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
) -> std::io::Result<()> {
    let (stream, peer) = listener.accept().await?;
    info!(connection_id, %peer, ?protocol, "acceptor connected");
    run_channel(stream, protocol, connection_id, inbound, outbound).await;
    Ok(())
}

async fn run_channel(
    stream: TcpStream,
    protocol: WireProtocol,
    connection_id: u64,
    inbound: Sender<TransportEvent>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) {
    let (read_half, mut write_half) = stream.into_split();

    let reader_inbound = inbound.clone();
    let reader = tokio::spawn(async move {
        match protocol {
            WireProtocol::Fix => {
                read_frames(
                    FramedRead::new(read_half, FixFrameCodec::new()),
                    connection_id,
                    reader_inbound,
                )
                .await;
            }
            WireProtocol::Ilink3 => {
                read_frames(
                    FramedRead::new(read_half, SofhFrameCodec::new()),
                    connection_id,
                    reader_inbound,
                )
                .await;
            }
        }
    });

    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            warn!(connection_id, error = %e, "write failed");
            break;
        }
    }
    let _ = write_half.shutdown().await;
    reader.abort();
    let _ = inbound.send(TransportEvent::Disconnected { connection_id });
}

async fn read_frames<C>(
    mut framed: FramedRead<OwnedReadHalf, C>,
    connection_id: u64,
    inbound: Sender<TransportEvent>,
) where
    C: tokio_util::codec::Decoder<Item = bytes::BytesMut>,
    C::Error: std::fmt::Display,
{
    loop {
        match framed.next().await {
            Some(Ok(frame)) => {
                if inbound
                    .send(TransportEvent::Frame {
                        connection_id,
                        frame: frame.freeze(),
                    })
                    .is_err()
                {
                    return;
                }
            }
            Some(Err(e)) => {
                warn!(connection_id, error = %e, "frame decode failed");
                break;
            }
            None => {
                debug!(connection_id, "peer closed");
                break;
            }
        }
    }
    let _ = inbound.send(TransportEvent::Disconnected { connection_id });
}
