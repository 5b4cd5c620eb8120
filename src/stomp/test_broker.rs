//! Minimal in-process STOMP broker for tests

use std::collections::VecDeque;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::frame::{decode_message, Command, Frame, Incoming};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestBroker {
    pub url: String,
    conns: mpsc::UnboundedReceiver<BrokerConn>,
}

impl TestBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, conns) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let mut uri = String::new();
                let callback = |req: &Request, resp: Response| {
                    uri = req.uri().to_string();
                    Ok::<_, ErrorResponse>(resp)
                };
                let ws = match tokio_tungstenite::accept_hdr_async(tcp, callback).await {
                    Ok(ws) => ws,
                    Err(_) => continue,
                };
                let conn = BrokerConn {
                    ws,
                    uri,
                    pending: VecDeque::new(),
                };
                if tx.send(conn).is_err() {
                    break;
                }
            }
        });

        Self {
            url: format!("ws://{}/ws", addr),
            conns,
        }
    }

    /// Next client connection. Panics if none arrives in time.
    pub async fn accept(&mut self) -> BrokerConn {
        self.try_accept(STEP_TIMEOUT)
            .await
            .expect("no client connection")
    }

    pub async fn try_accept(&mut self, wait: Duration) -> Option<BrokerConn> {
        tokio::time::timeout(wait, self.conns.recv()).await.ok().flatten()
    }
}

pub struct BrokerConn {
    ws: WebSocketStream<TcpStream>,
    /// Request URI of the WebSocket upgrade, query included.
    pub uri: String,
    pending: VecDeque<Frame>,
}

impl BrokerConn {
    /// Next frame from the client, skipping heart-beats.
    pub async fn next_frame(&mut self) -> Frame {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return frame;
            }
            let msg = tokio::time::timeout(STEP_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for client frame")
                .expect("client went away")
                .expect("websocket error");
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => panic!("client closed the connection"),
                _ => continue,
            };
            for item in decode_message(&text).expect("client sent garbage") {
                if let Incoming::Frame(frame) = item {
                    self.pending.push_back(frame);
                }
            }
        }
    }

    /// Skip ahead to the next frame with `command`.
    pub async fn expect(&mut self, command: Command) -> Frame {
        loop {
            let frame = self.next_frame().await;
            if frame.command == command {
                return frame;
            }
        }
    }

    /// Accept CONNECT with heart-beats disabled.
    pub async fn handshake(&mut self) -> Frame {
        let connect = self.expect(Command::Connect).await;
        self.reply_connected("0,0").await;
        connect
    }

    pub async fn reply_connected(&mut self, heart_beat: &str) {
        let frame = Frame::new(Command::Connected)
            .header("version", "1.2")
            .header("heart-beat", heart_beat);
        self.send_raw(&frame.encode()).await;
    }

    pub async fn send_message(&mut self, subscription: &str, destination: &str, body: &str) {
        let frame = Frame::new(Command::Message)
            .header("subscription", subscription)
            .header("destination", destination)
            .header("message-id", uuid::Uuid::new_v4().to_string())
            .header("content-type", "application/json")
            .with_body(body);
        self.send_raw(&frame.encode()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    /// WebSocket-level ping, no STOMP content.
    pub async fn send_ping(&mut self) {
        self.ws.send(Message::Ping(b"ping".to_vec())).await.unwrap();
    }

    pub async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
