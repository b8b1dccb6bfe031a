use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use super::{serve_connection, TransportClient};
use crate::service::ServiceDispatcher;
use crate::sync::DescriptorTable;

async fn read_lines<R, M>(reader: R, sink: mpsc::UnboundedSender<M>) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read message")? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<M>(&line) {
            Ok(message) => {
                if sink.send(message).is_err() {
                    break;
                }
            }
            Err(e) => log::warn!("[transport] Dropping malformed message: {}", e),
        }
    }
    Ok(())
}

async fn write_lines<W, M>(mut writer: W, mut source: mpsc::UnboundedReceiver<M>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    while let Some(message) = source.recv().await {
        let mut line = serde_json::to_string(&message).context("Failed to encode message")?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .context("Failed to write message")?;
        writer.flush().await.context("Failed to flush message")?;
    }
    Ok(())
}

/// Serves one frontend speaking newline-delimited JSON, until `reader` ends.
pub async fn serve_lines<R, W>(
    dispatcher: Arc<ServiceDispatcher>,
    reader: R,
    writer: W,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let server = tokio::spawn(serve_connection(dispatcher, inbound_rx, outbound_tx));
    let writer = tokio::spawn(write_lines(writer, outbound_rx));

    let read = read_lines(reader, inbound_tx).await;
    server.await.context("Connection task failed")?;

    // Calls still running hold the outbound side open; don't wait on them forever.
    match tokio::time::timeout(Duration::from_secs(2), writer).await {
        Ok(joined) => joined.context("Writer task failed")??,
        Err(_) => log::debug!("[transport] Writer still busy after disconnect, leaving it"),
    }
    read
}

/// Connects to a backend speaking newline-delimited JSON.
pub fn connect_lines<R, W>(reader: R, writer: W, descriptors: DescriptorTable) -> TransportClient
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        if let Err(e) = write_lines(writer, outbound_rx).await {
            log::warn!("[transport] {:#}", e);
        }
    });
    tokio::spawn(async move {
        if let Err(e) = read_lines(reader, inbound_tx).await {
            log::warn!("[transport] {:#}", e);
        }
    });

    TransportClient::new(outbound_tx, inbound_rx, descriptors)
}
