//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use pubsub_lifecycle::backend::resp::{read_frame, Frame};
use pubsub_lifecycle::lifecycle::{ExitCoordinator, Terminator};

/// Terminator that records exit codes instead of exiting.
#[derive(Default)]
pub struct RecordingTerminator {
    codes: Mutex<Vec<i32>>,
}

impl RecordingTerminator {
    pub fn codes(&self) -> Vec<i32> {
        self.codes.lock().unwrap().clone()
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, code: i32) {
        self.codes.lock().unwrap().push(code);
    }
}

/// Coordinator wired to a [`RecordingTerminator`].
pub fn coordinator(deadline: Duration) -> (Arc<ExitCoordinator>, Arc<RecordingTerminator>) {
    let terminator = Arc::new(RecordingTerminator::default());
    let coordinator = ExitCoordinator::new(deadline).with_terminator(terminator.clone());
    (Arc::new(coordinator), terminator)
}

#[derive(Default)]
struct ServerState {
    commands: Vec<Vec<String>>,
    lists: HashMap<String, VecDeque<String>>,
    /// Map of channel -> (connection id, outbound bytes).
    subscribers: HashMap<String, Vec<(usize, mpsc::UnboundedSender<Vec<u8>>)>>,
    next_conn: usize,
    /// Raw bytes written just before the next reply to a command.
    before: HashMap<String, Vec<u8>>,
    /// Raw bytes written in place of the next reply to a command.
    instead: HashMap<String, Vec<u8>>,
}

/// In-process RESP2 server covering the commands the driver sends.
#[derive(Clone, Default)]
pub struct MockRespServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockRespServer {
    /// Bind to an ephemeral port and start accepting connections.
    pub async fn start() -> (Self, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Self::default();

        let accept = server.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let server = accept.clone();
                tokio::spawn(async move { server.serve(socket).await });
            }
        });

        (server, addr)
    }

    /// Every command received, in arrival order.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Number of received commands whose name is `name`.
    pub fn count(&self, name: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some(name))
            .count()
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Push a message to subscribers of `channel`, as another client would.
    pub fn publish(&self, channel: &str, payload: impl AsRef<[u8]>) -> i64 {
        let state = self.state.lock().unwrap();
        deliver(&state, channel, payload.as_ref())
    }

    /// Write `raw` on the connection right before the next `command` reply.
    pub fn inject_before(&self, command: &str, raw: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().unwrap();
        state.before.insert(command.to_string(), raw.into());
    }

    /// Write `raw` instead of the next `command` reply.
    pub fn reply_raw(&self, command: &str, raw: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().unwrap();
        state.instead.insert(command.to_string(), raw.into());
    }

    async fn serve(self, socket: tokio::net::TcpStream) {
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let id = {
            let mut state = self.state.lock().unwrap();
            state.next_conn += 1;
            state.next_conn
        };

        tokio::spawn(async move {
            while let Some(buf) = rx.recv().await {
                if write_half.write_all(&buf).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let mut queued: Option<Vec<Vec<String>>> = None;
        let mut channels = 0i64;

        while let Ok(Some(frame)) = read_frame(&mut reader).await {
            let Some(args) = command_args(&frame) else {
                let _ = tx.send(encoded(&Frame::Error("ERR malformed command".into())));
                continue;
            };
            self.state.lock().unwrap().commands.push(args.clone());

            let name = args[0].to_ascii_uppercase();
            let reply = match name.as_str() {
                "MULTI" => {
                    queued = Some(Vec::new());
                    Frame::Simple("OK".into())
                }
                "EXEC" => match queued.take() {
                    Some(commands) => {
                        let mut state = self.state.lock().unwrap();
                        Frame::Array(Some(commands.iter().map(|c| apply(&mut state, c)).collect()))
                    }
                    None => Frame::Error("ERR EXEC without MULTI".into()),
                },
                _ if queued.is_some() => {
                    if let Some(q) = queued.as_mut() {
                        q.push(args.clone());
                    }
                    Frame::Simple("QUEUED".into())
                }
                "SUBSCRIBE" => {
                    let mut state = self.state.lock().unwrap();
                    let subs = state.subscribers.entry(args[1].clone()).or_default();
                    if !subs.iter().any(|(conn, _)| *conn == id) {
                        subs.push((id, tx.clone()));
                        channels += 1;
                    }
                    ack("subscribe", &args[1], channels)
                }
                "UNSUBSCRIBE" => {
                    let mut state = self.state.lock().unwrap();
                    if let Some(subs) = state.subscribers.get_mut(&args[1]) {
                        let before = subs.len();
                        subs.retain(|(conn, _)| *conn != id);
                        if subs.len() < before {
                            channels -= 1;
                        }
                    }
                    ack("unsubscribe", &args[1], channels)
                }
                "QUIT" => {
                    let _ = tx.send(encoded(&Frame::Simple("OK".into())));
                    break;
                }
                _ => {
                    let mut state = self.state.lock().unwrap();
                    apply(&mut state, &args)
                }
            };
            let (before, instead) = {
                let mut state = self.state.lock().unwrap();
                (state.before.remove(&name), state.instead.remove(&name))
            };
            let mut out = before.unwrap_or_default();
            match instead {
                Some(raw) => out.extend_from_slice(&raw),
                None => reply.encode(&mut out),
            }
            if tx.send(out).is_err() {
                break;
            }
        }

        let mut state = self.state.lock().unwrap();
        for subs in state.subscribers.values_mut() {
            subs.retain(|(conn, _)| *conn != id);
        }
    }
}

fn command_args(frame: &Frame) -> Option<Vec<String>> {
    let Frame::Array(Some(items)) = frame else {
        return None;
    };
    let args: Option<Vec<String>> = items.iter().map(|f| f.as_str().map(String::from)).collect();
    args.filter(|a| !a.is_empty())
}

fn encoded(frame: &Frame) -> Vec<u8> {
    let mut buf = Vec::new();
    frame.encode(&mut buf);
    buf
}

/// Wire bytes of a `message` push.
pub fn message_push(channel: &str, payload: &[u8]) -> Vec<u8> {
    encoded(&Frame::Array(Some(vec![
        Frame::bulk("message"),
        Frame::bulk(channel),
        Frame::bulk(payload.to_vec()),
    ])))
}

fn ack(kind: &str, channel: &str, count: i64) -> Frame {
    Frame::Array(Some(vec![
        Frame::bulk(kind),
        Frame::bulk(channel),
        Frame::Integer(count),
    ]))
}

fn deliver(state: &ServerState, channel: &str, payload: &[u8]) -> i64 {
    let Some(subs) = state.subscribers.get(channel) else {
        return 0;
    };
    let mut delivered = 0;
    for (_, tx) in subs {
        if tx.send(message_push(channel, payload)).is_ok() {
            delivered += 1;
        }
    }
    delivered
}

fn apply(state: &mut ServerState, args: &[String]) -> Frame {
    match (args[0].to_ascii_uppercase().as_str(), &args[1..]) {
        ("PING", _) => Frame::Simple("PONG".into()),
        ("PUBLISH", [channel, payload]) => {
            Frame::Integer(deliver(state, channel, payload.as_bytes()))
        }
        ("LPUSH", [key, values @ ..]) => {
            let list = state.lists.entry(key.clone()).or_default();
            for value in values {
                list.push_front(value.clone());
            }
            Frame::Integer(list.len() as i64)
        }
        ("LTRIM", [key, start, stop]) => {
            let (Ok(start), Ok(stop)) = (start.parse::<usize>(), stop.parse::<usize>()) else {
                return Frame::Error("ERR value is not an integer".into());
            };
            if let Some(list) = state.lists.get_mut(key) {
                let kept: VecDeque<String> = list
                    .iter()
                    .skip(start)
                    .take(stop + 1 - start.min(stop + 1))
                    .cloned()
                    .collect();
                *list = kept;
            }
            Frame::Simple("OK".into())
        }
        (other, _) => Frame::Error(format!("ERR unknown command '{}'", other)),
    }
}
