//! Point-to-point cluster sends.
//!
//! One TCP connection per message keeps the transport stateless; the
//! volume of cluster traffic (heartbeats, replication records) is far
//! below where connection reuse would matter.

use std::{net::SocketAddr, time::Duration};

use tokio::net::TcpStream;

use crate::{
    error::{ClusterError, Result},
    message::{read_frame, write_frame, AckPayload, Frame, Payload},
};

/// Send `frame` to `endpoint`. When the frame requires an ack, waits
/// for it and returns it.
pub async fn send(
    endpoint: SocketAddr,
    frame: &Frame,
    timeout: Duration,
) -> Result<Option<AckPayload>> {
    let result = tokio::time::timeout(timeout, send_inner(endpoint, frame)).await;
    match result {
        Ok(inner) => inner,
        Err(_) => Err(ClusterError::Timeout(endpoint.to_string())),
    }
}

async fn send_inner(endpoint: SocketAddr, frame: &Frame) -> Result<Option<AckPayload>> {
    let mut stream = TcpStream::connect(endpoint).await?;
    write_frame(&mut stream, frame).await?;

    if !frame.requires_ack {
        return Ok(None);
    }

    loop {
        let Some(response) = read_frame(&mut stream).await? else {
            return Err(ClusterError::Rejected(format!(
                "{endpoint} closed before acknowledging"
            )));
        };

        if let Payload::Ack(ack) = response.payload {
            if ack.original_message_id == frame.message_id {
                return Ok(Some(ack));
            }
            // An ack for something else on this connection is a
            // protocol bug; keep waiting for ours until the timeout
        }
    }
}
