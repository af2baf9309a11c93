//! Framed TCP connections.
//!
//! The read side delimits requests by a terminator byte (`;` by default)
//! and hands each request string to the handler; the write side emits a
//! sequence of u32-le length-prefixed frames per request.

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Handles one request string, producing the response frames to write back
pub trait RequestHandler: Send + Sync {
    fn handle_request(&self, request: &str) -> Vec<Bytes>;
}

/// Extract the next delimiter-terminated request from `buffer`, consuming
/// it (delimiter included). Returns None until a full request is buffered.
fn next_request(buffer: &mut BytesMut, delimiter: u8) -> Option<String> {
    let pos = buffer.iter().position(|b| *b == delimiter)?;
    let request = buffer.split_to(pos + 1);
    Some(String::from_utf8_lossy(&request[..pos]).trim().to_string())
}

/// Accept loop: one task per connection
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    delimiter: u8,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        info!("connection from {peer}");
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, handler, delimiter).await {
                warn!("connection {peer} closed with error: {e}");
            } else {
                debug!("connection {peer} closed");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    delimiter: u8,
) -> anyhow::Result<()> {
    let mut buffer = BytesMut::with_capacity(4 * 1024);
    loop {
        while let Some(request) = next_request(&mut buffer, delimiter) {
            if request.is_empty() {
                continue;
            }
            debug!("request from {peer}: {request}");
            // Handlers block on disk and source I/O; keep the reactor free
            let handler = Arc::clone(&handler);
            let frames =
                tokio::task::spawn_blocking(move || handler.handle_request(&request)).await?;
            for frame in frames {
                stream.write_u32_le(frame.len() as u32).await?;
                stream.write_all(&frame).await?;
            }
            stream.flush().await?;
        }
        if stream.read_buf(&mut buffer).await? == 0 {
            return Ok(());
        }
    }
}
