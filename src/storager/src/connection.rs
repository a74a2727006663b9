use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use protocol::FrameBuffer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::controller::{ControllerLink, Outbound};
use crate::router::{Action, Router};

/// Serve one controller connection until the peer closes it.
///
/// Replies and job notifications share one writer task so frames never
/// interleave. A malformed frame drops the buffered bytes and the
/// connection stays open.
pub async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    router: Arc<Router>,
    link: Arc<ControllerLink>,
    max_frame_bytes: usize,
) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();
    let (outbound, mut queued) = mpsc::unbounded_channel::<Outbound>();
    let connection_id = link.attach(outbound.clone());

    let writer_task = tokio::spawn(async move {
        while let Some(item) = queued.recv().await {
            match item {
                Outbound::Frame(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        warn!("Failed to write to {addr}: {e}");
                        break;
                    }
                }
                Outbound::Flush(done) => {
                    if let Err(e) = writer.flush().await {
                        warn!("Failed to flush {addr}: {e}");
                    }
                    let _ = done.send(());
                }
            }
        }
    });

    let mut frames = FrameBuffer::new(max_frame_bytes);
    let result = loop {
        let read = match reader.read_buf(frames.buffer_mut()).await {
            Ok(read) => read,
            Err(e) => break Err(e.into()),
        };
        if read == 0 {
            if !frames.is_empty() {
                warn!(buffered = frames.len(), "Connection closed with incomplete frame");
            }
            info!("Controller {addr} closed the connection");
            break Ok(());
        }
        debug!("Read {read} bytes from {addr}");

        loop {
            match frames.next_message() {
                Ok(Some(message)) => {
                    for action in router.handle(&message).await {
                        match action {
                            Action::Reply(reply) => {
                                let _ = outbound.send(Outbound::Frame(reply.to_bytes()));
                            }
                            Action::Shutdown => {
                                let (done, flushed) = oneshot::channel();
                                let _ = outbound.send(Outbound::Flush(done));
                                let _ = flushed.await;
                                router.shutdown_signal().notify_one();
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Discarding buffered bytes from {addr}: {e}");
                    break;
                }
            }
        }
    };

    link.detach(connection_id);
    drop(outbound);
    if let Err(e) = writer_task.await {
        warn!("Writer task for {addr} ended abnormally: {e}");
    }
    result
}
