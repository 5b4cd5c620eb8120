//! STOMP-over-WebSocket connection and frame handling

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::frame::{decode_message, Frame, Incoming};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct StompSocket {
    stream: WsStream,
    trace_frames: bool,
}

impl StompSocket {
    /// Open the WebSocket to the broker endpoint.
    ///
    /// `http(s)://` URLs are rewritten to `ws(s)://`.
    pub async fn connect(url: &str, trace_frames: bool) -> Result<Self> {
        let ws_url = url
            .replace("https://", "wss://")
            .replace("http://", "ws://");

        tracing::info!("Connecting WebSocket to {}", ws_url);

        let (stream, response) = connect_async(&ws_url)
            .await
            .context("WebSocket connection failed")?;

        tracing::info!("WebSocket connected (status={})", response.status());

        Ok(Self {
            stream,
            trace_frames,
        })
    }

    /// Send a STOMP frame as one text message.
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let text = frame.encode();
        if self.trace_frames {
            tracing::debug!(">>> {}", text.trim_end_matches('\0'));
        }
        self.stream
            .send(Message::Text(text))
            .await
            .with_context(|| format!("Failed to send {} frame", frame.command))
    }

    /// Send a heart-beat (a single EOL).
    pub async fn send_heartbeat(&mut self) -> Result<()> {
        if self.trace_frames {
            tracing::trace!(">>> PING");
        }
        self.stream
            .send(Message::Text("\n".to_string()))
            .await
            .context("Failed to send heart-beat")
    }

    /// Receive the next batch of STOMP traffic.
    ///
    /// WebSocket pings and pongs come back as a heart-beat so they count as
    /// broker traffic.
    ///
    /// Returns `Ok(None)` once the peer has closed the connection. Frames that
    /// fail to decode are logged and skipped so one bad message cannot tear
    /// down the connection.
    pub async fn recv(&mut self) -> Result<Option<Vec<Incoming>>> {
        loop {
            let text = match self.stream.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Dropping non UTF-8 binary message: {}", e);
                        continue;
                    }
                },
                // tungstenite queues the pong itself and flushes it on the
                // next read, so nothing is sent from here.
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    if self.trace_frames {
                        tracing::trace!("<<< WebSocket ping/pong");
                    }
                    return Ok(Some(vec![Incoming::Heartbeat]));
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                    continue;
                }
                Some(Err(e)) => {
                    return Err(e).context("WebSocket receive error");
                }
                None => {
                    return Ok(None);
                }
            };

            if self.trace_frames {
                if text.trim_matches(|c| c == '\r' || c == '\n').is_empty() {
                    tracing::trace!("<<< PONG");
                } else {
                    tracing::debug!("<<< {}", text.trim_end_matches('\0'));
                }
            }

            match decode_message(&text) {
                Ok(items) => return Ok(Some(items)),
                Err(e) => {
                    tracing::warn!("Skipping undecodable STOMP message: {}", e);
                    // Still counts as traffic for liveness purposes.
                    return Ok(Some(vec![Incoming::Heartbeat]));
                }
            }
        }
    }

    /// Close the WebSocket, ignoring errors from an already-dead peer.
    pub async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("WebSocket close error (ignored): {}", e);
        }
    }
}
