//! RESP2 broker driver over TCP.
//!
//! # Responsibilities
//! - Open one TCP connection per `redis://host[:port]` URI
//! - Encode commands as RESP arrays and match replies to callers in order
//! - Route `message` pushes to the inbound stream while subscribed
//!
//! # Design Decisions
//! - A single reader task owns the read half; callers wait on oneshots
//! - Commands that must be contiguous (MULTI..EXEC) are written under one lock
//! - Regular commands are refused while the connection holds subscriptions

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;

use crate::backend::{BackendError, BackendResult, BrokerConnection, Connector, InboundMessage};

/// Default broker port when the URI has none.
pub const DEFAULT_PORT: u16 = 6379;

/// Largest bulk string accepted from the broker (Redis proto-max-bulk-len).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest array accepted from the broker.
pub const MAX_ARRAY_LEN: i64 = 1_048_576;

/// A RESP2 protocol value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Frame>>),
}

impl Frame {
    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        Frame::Bulk(Some(data.into()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Text content of a simple or bulk string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Frame::Simple(s) => Some(s),
            Frame::Bulk(Some(b)) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Raw content of a simple or bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::Simple(s) => Some(s.as_bytes()),
            Frame::Bulk(Some(b)) => Some(b),
            _ => None,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => out.extend_from_slice(format!("+{}\r\n", s).as_bytes()),
            Frame::Error(s) => out.extend_from_slice(format!("-{}\r\n", s).as_bytes()),
            Frame::Integer(n) => out.extend_from_slice(format!(":{}\r\n", n).as_bytes()),
            Frame::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
            Frame::Bulk(Some(data)) => {
                out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            Frame::Array(None) => out.extend_from_slice(b"*-1\r\n"),
            Frame::Array(Some(items)) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode(out);
                }
            }
        }
    }
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[&str], out: &mut Vec<u8>) {
    Frame::Array(Some(args.iter().map(|arg| Frame::bulk(*arg)).collect())).encode(out);
}

/// Read one frame. `Ok(None)` means the peer closed the connection cleanly.
pub fn read_frame<'a, R>(reader: &'a mut R) -> BoxFuture<'a, BackendResult<Option<Frame>>>
where
    R: AsyncBufRead + Unpin + Send,
{
    async move {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');
        let (tag, rest) = match line.chars().next() {
            Some(tag) => (tag, &line[tag.len_utf8()..]),
            None => return Err(BackendError::Protocol("empty line".to_string())),
        };

        let frame = match tag {
            '+' => Frame::Simple(rest.to_string()),
            '-' => Frame::Error(rest.to_string()),
            ':' => Frame::Integer(parse_len(rest, "integer")?),
            '$' => {
                let len = parse_len(rest, "bulk length")?;
                if len < 0 {
                    Frame::Bulk(None)
                } else {
                    let len = checked_len(len, MAX_BULK_LEN, "bulk length")?;
                    let mut buf = Vec::with_capacity(len.min(64 * 1024) + 2);
                    let wanted = len as u64 + 2;
                    if (&mut *reader).take(wanted).read_to_end(&mut buf).await? as u64 != wanted {
                        return Err(BackendError::Closed);
                    }
                    buf.truncate(len);
                    Frame::Bulk(Some(buf))
                }
            }
            '*' => {
                let count = parse_len(rest, "array length")?;
                if count < 0 {
                    Frame::Array(None)
                } else {
                    let count = checked_len(count, MAX_ARRAY_LEN, "array length")?;
                    let mut items = Vec::with_capacity(count.min(64));
                    for _ in 0..count {
                        match read_frame(&mut *reader).await? {
                            Some(item) => items.push(item),
                            None => return Err(BackendError::Closed),
                        }
                    }
                    Frame::Array(Some(items))
                }
            }
            _ => {
                return Err(BackendError::Protocol(format!("unknown RESP type: {}", line)));
            }
        };
        Ok(Some(frame))
    }
    .boxed()
}

fn parse_len(raw: &str, what: &str) -> BackendResult<i64> {
    raw.parse()
        .map_err(|_| BackendError::Protocol(format!("invalid {}: {}", what, raw)))
}

fn checked_len(len: i64, max: i64, what: &str) -> BackendResult<usize> {
    if len > max {
        return Err(BackendError::Protocol(format!("{} {} exceeds limit {}", what, len, max)));
    }
    usize::try_from(len).map_err(|_| BackendError::Protocol(format!("invalid {}: {}", what, len)))
}

/// Opens [`RespConnection`]s.
#[derive(Debug, Clone)]
pub struct RespConnector {
    connect_timeout: Duration,
}

impl RespConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for RespConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Connector for RespConnector {
    type Conn = RespConnection;

    async fn connect(&self, uri: &Url) -> BackendResult<RespConnection> {
        if uri.scheme() != "redis" {
            return Err(BackendError::UnsupportedScheme(uri.scheme().to_string()));
        }
        let host = uri
            .host_str()
            .ok_or_else(|| BackendError::Refused(format!("missing host in {}", uri)))?;
        let port = uri.port().unwrap_or(DEFAULT_PORT);

        let connecting = TcpStream::connect((host, port));
        let stream = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(BackendError::Refused(e.to_string())),
            Err(_) => {
                return Err(BackendError::Refused(format!(
                    "timed out after {:?} connecting to {}:{}",
                    self.connect_timeout, host, port
                )));
            }
        };

        let conn = RespConnection::from_stream(stream);

        // The connection is only handed out once the broker answers.
        match conn.command(&["PING"]).await? {
            Frame::Simple(pong) if pong == "PONG" => {}
            other => {
                conn.abort_reader();
                return Err(BackendError::Protocol(format!("unexpected PING reply: {:?}", other)));
            }
        }

        tracing::debug!(host = %host, port, "RESP connection ready");
        Ok(conn)
    }
}

type PendingReplies = VecDeque<oneshot::Sender<BackendResult<Frame>>>;

/// One TCP connection speaking RESP2.
#[derive(Debug)]
pub struct RespConnection {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<PendingReplies>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    subscriptions: Arc<AtomicI64>,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RespConnection {
    fn from_stream(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let pending = Arc::new(Mutex::new(PendingReplies::new()));
        let subscriptions = Arc::new(AtomicI64::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            BufReader::new(read_half),
            pending.clone(),
            tx,
            subscriptions.clone(),
            closed.clone(),
        ));

        Self {
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            inbound: Mutex::new(Some(rx)),
            subscriptions,
            closed,
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Number of channels the broker reports this connection subscribed to.
    pub fn subscription_count(&self) -> i64 {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Send one command and wait for its reply.
    pub async fn command(&self, args: &[&str]) -> BackendResult<Frame> {
        let mut replies = self.pipeline(&[args]).await?;
        match replies.pop() {
            Some(reply) => reply.await.map_err(|_| BackendError::Closed)?,
            None => Err(BackendError::Closed),
        }
    }

    /// Write several commands back to back, with nothing interleaved between them.
    async fn pipeline(
        &self,
        commands: &[&[&str]],
    ) -> BackendResult<Vec<oneshot::Receiver<BackendResult<Frame>>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }

        let mut buf = Vec::new();
        for args in commands {
            encode_command(args, &mut buf);
        }

        let mut writer = self.writer.lock().await;
        let mut replies = Vec::with_capacity(commands.len());
        {
            let mut pending = lock(&self.pending);
            // The reader drains under this lock after marking the connection closed.
            if self.closed.load(Ordering::SeqCst) {
                return Err(BackendError::Closed);
            }
            for _ in commands {
                let (tx, rx) = oneshot::channel();
                pending.push_back(tx);
                replies.push(rx);
            }
        }
        if let Err(e) = write_all(&mut writer, &buf).await {
            self.closed.store(true, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(replies)
    }

    fn ensure_command_mode(&self) -> BackendResult<()> {
        if self.subscription_count() > 0 {
            return Err(BackendError::SubscriberMode);
        }
        Ok(())
    }

    fn abort_reader(&self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }
}

impl BrokerConnection for RespConnection {
    async fn publish(&self, channel: &str, payload: &str) -> BackendResult<i64> {
        self.ensure_command_mode()?;
        match self.command(&["PUBLISH", channel, payload]).await? {
            Frame::Integer(receivers) => Ok(receivers),
            other => Err(BackendError::Protocol(format!(
                "unexpected PUBLISH reply: {:?}",
                other
            ))),
        }
    }

    async fn push_bounded(&self, key: &str, value: &str, max_len: usize) -> BackendResult<()> {
        self.ensure_command_mode()?;
        let stop = (i64::try_from(max_len).unwrap_or(i64::MAX) - 1).to_string();
        let commands: [&[&str]; 4] = [
            &["MULTI"],
            &["LPUSH", key, value],
            &["LTRIM", key, "0", stop.as_str()],
            &["EXEC"],
        ];
        let replies = self.pipeline(&commands).await?;

        let mut last = None;
        for reply in replies {
            last = Some(reply.await.map_err(|_| BackendError::Closed)??);
        }
        match last {
            Some(Frame::Array(Some(results))) => {
                if let Some(Frame::Error(e)) = results.iter().find(|r| r.is_error()) {
                    return Err(BackendError::Server(e.clone()));
                }
                Ok(())
            }
            Some(Frame::Array(None)) => {
                Err(BackendError::Server("transaction aborted".to_string()))
            }
            other => Err(BackendError::Protocol(format!("unexpected EXEC reply: {:?}", other))),
        }
    }

    async fn subscribe(&self, channel: &str) -> BackendResult<()> {
        expect_ack(self.command(&["SUBSCRIBE", channel]).await?, "subscribe")
    }

    async fn unsubscribe(&self, channel: &str) -> BackendResult<()> {
        expect_ack(self.command(&["UNSUBSCRIBE", channel]).await?, "unsubscribe")
    }

    fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        lock(&self.inbound).take()
    }

    async fn close(&self) -> BackendResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            self.abort_reader();
            return Ok(());
        }
        let reply = self.command(&["QUIT"]).await;
        self.closed.store(true, Ordering::SeqCst);
        let shutdown = self.writer.lock().await.shutdown().await;
        self.abort_reader();

        match reply? {
            Frame::Error(e) => Err(BackendError::Server(e)),
            _ => shutdown.map_err(BackendError::from),
        }
    }
}

impl Drop for RespConnection {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn write_all(writer: &mut OwnedWriteHalf, buf: &[u8]) -> io::Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await
}

fn expect_ack(reply: Frame, kind: &str) -> BackendResult<()> {
    match reply {
        Frame::Array(Some(items)) if items.first().and_then(Frame::as_str) == Some(kind) => Ok(()),
        Frame::Error(e) => Err(BackendError::Server(e)),
        other => Err(BackendError::Protocol(format!("unexpected {} reply: {:?}", kind, other))),
    }
}

/// Pub/sub pushes look like `["message", channel, payload]`, whatever the
/// encoding of the last two elements.
fn is_push(frame: &Frame) -> bool {
    match frame {
        Frame::Array(Some(items)) => {
            items.len() == 3 && items[0].as_bytes() == Some(b"message".as_slice())
        }
        _ => false,
    }
}

/// Decode a push. Invalid UTF-8 is replaced rather than rejected.
fn as_push(frame: &Frame) -> Option<InboundMessage> {
    if !is_push(frame) {
        return None;
    }
    let Frame::Array(Some(items)) = frame else {
        return None;
    };
    let text = |item: &Frame| item.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned());
    Some(InboundMessage {
        channel: text(&items[1])?,
        payload: text(&items[2])?,
    })
}

/// Subscription acks carry the connection's remaining subscription count.
fn ack_count(frame: &Frame) -> Option<i64> {
    let Frame::Array(Some(items)) = frame else {
        return None;
    };
    match items.as_slice() {
        [kind, _, Frame::Integer(count)]
            if matches!(kind.as_str(), Some("subscribe") | Some("unsubscribe")) =>
        {
            Some(*count)
        }
        _ => None,
    }
}

/// Marks the connection closed and fails every waiter when the reader stops,
/// including when it is aborted or panics.
struct ReaderExit {
    pending: Arc<Mutex<PendingReplies>>,
    closed: Arc<AtomicBool>,
}

impl Drop for ReaderExit {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        for tx in lock(&self.pending).drain(..) {
            let _ = tx.send(Err(BackendError::Closed));
        }
    }
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    pending: Arc<Mutex<PendingReplies>>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    subscriptions: Arc<AtomicI64>,
    closed: Arc<AtomicBool>,
) {
    let _exit = ReaderExit {
        pending: pending.clone(),
        closed,
    };
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!("RESP connection closed by peer");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "RESP read failed");
                break;
            }
        };

        if is_push(&frame) {
            match as_push(&frame) {
                Some(message) => {
                    let _ = inbound.send(message);
                }
                None => tracing::warn!(frame = ?frame, "Undecodable pub/sub push dropped"),
            }
            continue;
        }
        if let Some(count) = ack_count(&frame) {
            subscriptions.store(count, Ordering::SeqCst);
        }

        let waiter = lock(&pending).pop_front();
        match waiter {
            Some(tx) => {
                let reply = match frame {
                    Frame::Error(e) => Err(BackendError::Server(e)),
                    frame => Ok(frame),
                };
                let _ = tx.send(reply);
            }
            None => tracing::warn!(frame = ?frame, "Unsolicited RESP frame dropped"),
        }
    }
}
