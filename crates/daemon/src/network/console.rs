//! Local console transport.
//!
//! Treats each line on stdin as a message from a fixed sender in a single
//! room and prints relayed output to stdout. Useful for trying the bridge
//! without a homeserver.

use chat_protocol::{BoxFuture, ChatTransport, InboundEvent, Result, TransportError, TransportSession};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, Stdin, Stdout};
use tokio::sync::Mutex;

/// Room id used for every console message.
pub const CONSOLE_ROOM: &str = "console";

/// Identity the bridge reports for itself in console mode.
const CONSOLE_USER: &str = "shellbridge";

/// Console transport over an async reader and writer (stdin/stdout by default).
pub struct ConsoleTransport<R = Stdin, W = Stdout> {
    sender: String,
    lines: Mutex<Lines<BufReader<R>>>,
    out: Mutex<W>,
}

impl ConsoleTransport {
    /// Creates a transport on the process's stdin and stdout.
    pub fn stdio(sender: impl Into<String>) -> Self {
        Self::with_io(sender, tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> ConsoleTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Creates a transport over arbitrary streams.
    pub fn with_io(sender: impl Into<String>, reader: R, writer: W) -> Self {
        Self {
            sender: sender.into(),
            lines: Mutex::new(BufReader::new(reader).lines()),
            out: Mutex::new(writer),
        }
    }

    /// Sender attached to every line read.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    async fn read_line(&self) -> Result<Vec<InboundEvent>> {
        let mut lines = self.lines.lock().await;
        match lines.next_line().await {
            Ok(Some(line)) => Ok(vec![InboundEvent::message(&self.sender, CONSOLE_ROOM, line)]),
            Ok(None) => Err(TransportError::Closed("stdin closed".to_string())),
            Err(e) => Err(TransportError::Closed(format!("stdin read failed: {}", e))),
        }
    }

    async fn write_body(&self, body: &str) -> Result<()> {
        let mut out = self.out.lock().await;
        let write = async {
            out.write_all(body.as_bytes()).await?;
            if !body.ends_with('\n') {
                out.write_all(b"\n").await?;
            }
            out.flush().await
        };
        write
            .await
            .map_err(|e| TransportError::Closed(format!("stdout write failed: {}", e)))
    }
}

impl<R, W> ChatTransport for ConsoleTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn connect(&self) -> BoxFuture<'_, Result<TransportSession>> {
        Box::pin(async {
            tracing::info!(sender = %self.sender, "Console transport ready");
            Ok(TransportSession {
                user_id: CONSOLE_USER.to_string(),
                joined_rooms: vec![CONSOLE_ROOM.to_string()],
            })
        })
    }

    fn next_events(&self) -> BoxFuture<'_, Result<Vec<InboundEvent>>> {
        Box::pin(self.read_line())
    }

    fn send<'a>(&'a self, _room_id: &'a str, body: &'a str, _html: Option<&'a str>) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.write_body(body))
    }

    fn join<'a>(&'a self, _room_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
