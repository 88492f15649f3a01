//! Line-delimited JSON-RPC over a byte stream
//!
//! One line is one message. A reader task scans lines, settles peer responses and
//! cancellation notices, and hands everything else to the serving loop through a
//! bounded queue, so a blocked read never delays cancellation of the scope.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{mpsc, Mutex as AsyncMutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{dispatch_stage, read_stage, Inbound, PeerSender, Transport};
use crate::errors::TransportError;
use crate::mcp::{rpc::Message, server::McpServer, session::Session};

const HANDOFF_CAPACITY: usize = 16;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Serialized, newline-terminated writes with a bounded wait.
pub struct LineWriter<W> {
    inner: AsyncMutex<W>,
    timeout: Duration,
}

impl<W> LineWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(inner: W, timeout: Duration) -> Self {
        Self {
            inner: AsyncMutex::new(inner),
            timeout,
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), TransportError> {
        let mut writer = self.inner.lock().await;
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        tokio::time::timeout(self.timeout, write)
            .await
            .map_err(|_| TransportError::WriteTimeout(self.timeout))??;
        Ok(())
    }
}

#[async_trait]
impl<W> PeerSender for LineWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let line = message.encode()?;
        self.write_line(&line).await
    }
}

pub struct StdioTransport<R, W> {
    reader: Mutex<Option<R>>,
    writer: Arc<LineWriter<W>>,
}

impl StdioTransport<io::Stdin, io::Stdout> {
    /// Binds to the process's stdin and stdout.
    pub fn stdio() -> Self {
        Self::new(io::stdin(), io::stdout())
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_write_timeout(reader, writer, DEFAULT_WRITE_TIMEOUT)
    }

    pub fn with_write_timeout(reader: R, writer: W, timeout: Duration) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Arc::new(LineWriter::new(writer, timeout)),
        }
    }

    pub fn sender(&self) -> Arc<LineWriter<W>> {
        Arc::clone(&self.writer)
    }

    async fn serve_session(
        &self,
        scope: &CancellationToken,
        server: &Arc<McpServer>,
        session: &Arc<Session>,
        reader: R,
    ) -> Result<(), TransportError> {
        let (tx, mut rx) = mpsc::channel(HANDOFF_CAPACITY);
        let reader_task = tokio::spawn(read_lines(
            reader,
            scope.clone(),
            Arc::clone(server),
            Arc::clone(session),
            tx,
        ));

        let result = loop {
            tokio::select! {
                _ = scope.cancelled() => {
                    debug!(session_id = %session.id(), "stdio scope cancelled");
                    break Ok(());
                }
                inbound = rx.recv() => {
                    let Some(inbound) = inbound else {
                        break match reader_task.await {
                            Ok(result) => result.map_err(TransportError::from),
                            Err(join) => Err(TransportError::Io(io::Error::other(join))),
                        };
                    };
                    if let Some(response) = dispatch_stage(server, scope, session, inbound).await {
                        if let Err(err) = self.writer.send(response.into()).await {
                            break Err(err);
                        }
                    }
                }
            }
        };

        // The reader may still be parked on a read that will never complete.
        scope.cancel();
        result
    }
}

async fn read_lines<R>(
    reader: R,
    scope: CancellationToken,
    server: Arc<McpServer>,
    session: Arc<Session>,
    handoff: mpsc::Sender<Inbound>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    // Raw bytes: invalid UTF-8 is a parse error for that line, not a dead stream.
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = scope.cancelled() => return Ok(()),
            read = reader.read_until(b'\n', &mut line) => read?,
        };
        if read == 0 {
            debug!(session_id = %session.id(), "stdio input closed");
            return Ok(());
        }
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(inbound) = read_stage(&server, &session, trimmed) {
            if handoff.send(inbound).await.is_err() {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn serve(&self, scope: CancellationToken, server: Arc<McpServer>) -> Result<(), TransportError> {
        let reader = self.reader.lock().take().ok_or(TransportError::AlreadyServing)?;
        let session = server.sessions().create(self.sender());
        info!(session_id = %session.id(), "serving mcp over stdio");

        // A child scope so ending this connection never cancels the caller's scope.
        let connection = scope.child_token();
        let result = self.serve_session(&connection, &server, &session, reader).await;
        server.sessions().remove(session.id());

        if let Err(err) = &result {
            error!(session_id = %session.id(), error = %err, "stdio transport failed");
        }
        result
    }

    fn addr(&self) -> String {
        "stdio".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };

    use serde_json::{json, Value};
    use tokio::io::{DuplexStream, Lines, ReadBuf, ReadHalf, WriteHalf};

    use super::*;
    use crate::mcp::server::testing::server;

    struct Client {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, value: Value) {
            self.send_raw(&value.to_string()).await;
        }

        async fn send_raw(&mut self, line: &str) {
            self.send_bytes(line.as_bytes()).await;
        }

        async fn send_bytes(&mut self, line: &[u8]) {
            self.writer.write_all(line).await.expect("write");
            self.writer.write_all(b"\n").await.expect("write");
        }

        async fn recv(&mut self) -> Value {
            let line = self.lines.next_line().await.expect("read").expect("line");
            serde_json::from_str(&line).expect("json line")
        }
    }

    type DuplexTransport = StdioTransport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pair() -> (Arc<DuplexTransport>, Client) {
        let (client_side, server_side) = io::duplex(64 * 1024);
        let (server_read, server_write) = io::split(server_side);
        let (client_read, client_write) = io::split(client_side);
        let transport = Arc::new(StdioTransport::new(server_read, server_write));
        let client = Client {
            lines: BufReader::new(client_read).lines(),
            writer: client_write,
        };
        (transport, client)
    }

    fn spawn_serve(
        transport: &Arc<DuplexTransport>,
        scope: &CancellationToken,
    ) -> tokio::task::JoinHandle<Result<(), TransportError>> {
        let (transport, scope, server) = (Arc::clone(transport), scope.clone(), server());
        tokio::spawn(async move { transport.serve(scope, server).await })
    }

    #[tokio::test]
    async fn ping_gets_exactly_one_line_and_notifications_none() {
        let (transport, mut client) = pair();
        let scope = CancellationToken::new();
        let serving = spawn_serve(&transport, &scope);

        client.send(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).await;
        assert_eq!(client.recv().await, json!({"jsonrpc": "2.0", "id": 1, "result": {}}));

        client.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"})).await;
        client.send(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"})).await;
        assert_eq!(client.recv().await["id"], json!(2));

        drop(client);
        serving.await.expect("task").expect("eof is a clean exit");
    }

    #[tokio::test]
    async fn malformed_lines_get_parse_errors() {
        let (transport, mut client) = pair();
        let scope = CancellationToken::new();
        let _serving = spawn_serve(&transport, &scope);

        client.send_raw("{oops").await;
        let reply = client.recv().await;
        assert_eq!(reply["id"], Value::Null);
        assert_eq!(reply["error"]["code"], json!(-32700));

        client.send(json!({"jsonrpc": "2.0", "id": "a", "method": "nope/nope"})).await;
        assert_eq!(client.recv().await["error"]["code"], json!(-32601));
        scope.cancel();
    }

    #[tokio::test]
    async fn invalid_utf8_gets_a_parse_error_and_keeps_the_connection() {
        let (transport, mut client) = pair();
        let scope = CancellationToken::new();
        let serving = spawn_serve(&transport, &scope);

        client
            .send_bytes(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"\xff\xfe\"}")
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["error"]["code"], json!(-32700));

        client.send(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"})).await;
        assert_eq!(client.recv().await, json!({"jsonrpc": "2.0", "id": 2, "result": {}}));

        scope.cancel();
        serving.await.expect("task").expect("clean stop");
    }

    #[tokio::test]
    async fn cancelling_the_scope_unblocks_a_pending_read() {
        let (transport, _client) = pair();
        let scope = CancellationToken::new();
        let serving = spawn_serve(&transport, &scope);

        tokio::task::yield_now().await;
        scope.cancel();
        serving.await.expect("task").expect("clean stop");
    }

    #[tokio::test]
    async fn serving_twice_is_refused() {
        let (transport, _client) = pair();
        let scope = CancellationToken::new();
        let _serving = spawn_serve(&transport, &scope);
        tokio::task::yield_now().await;

        let err = transport.serve(scope.clone(), server()).await.expect_err("second serve");
        assert!(matches!(err, TransportError::AlreadyServing));
        scope.cancel();
    }

    #[tokio::test]
    async fn outbound_requests_complete_while_a_call_is_in_flight() {
        let (transport, mut client) = pair();
        let scope = CancellationToken::new();
        let _serving = spawn_serve(&transport, &scope);

        client
            .send(json!({
                "jsonrpc": "2.0", "id": 1, "method": "initialize",
                "params": {"protocolVersion": "2025-06-18", "capabilities": {"roots": {}}}
            }))
            .await;
        assert!(client.recv().await["result"]["protocolVersion"].is_string());

        client
            .send(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "roots"}}))
            .await;
        let outbound = client.recv().await;
        assert_eq!(outbound["method"], json!("roots/list"));

        client
            .send(json!({"jsonrpc": "2.0", "id": outbound["id"], "result": {"roots": [{"uri": "file:///src"}]}}))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["id"], json!(2));
        assert_eq!(reply["result"]["roots"][0]["uri"], json!("file:///src"));
        scope.cancel();
    }

    struct BrokenReader;

    impl AsyncRead for BrokenReader {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
        }
    }

    #[tokio::test]
    async fn read_errors_propagate() {
        let transport = StdioTransport::new(BrokenReader, io::sink());
        let err = transport
            .serve(CancellationToken::new(), server())
            .await
            .expect_err("read error");
        assert!(matches!(err, TransportError::Io(ref io) if io.kind() == io::ErrorKind::BrokenPipe));
    }
}
