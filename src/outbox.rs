use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

pub const PROMPT: &str = "% ";

/// Ordered write queue for one client connection.
///
/// Every byte sent to a client, whether its own command output or a notice
/// broadcast by another session, goes through its outbox. A single writer
/// task drains the queue onto the socket, so per-client ordering is the
/// order of `send` calls.
#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, data: impl Into<Bytes>) {
        // Ignore error - means the writer task already exited
        if self.tx.send(data.into()).is_err() {
            tracing::debug!("outbox closed, dropping data");
        }
    }

    /// Send `text` followed by a newline.
    pub fn line(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        data.push(b'\n');
        self.send(data);
    }

    pub fn prompt(&self) {
        self.send(Bytes::from_static(PROMPT.as_bytes()));
    }
}

/// Drain `rx` onto `writer` until every [`Outbox`] handle is dropped, then
/// shut the writer down.
pub async fn run_writer<W: AsyncWrite + Unpin>(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut writer: W,
) -> std::io::Result<()> {
    while let Some(data) = rx.recv().await {
        writer.write_all(&data).await?;
    }
    writer.flush().await?;
    writer.shutdown().await
}
