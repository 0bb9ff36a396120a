use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::error_handling::types::SessionError;
use crate::terminal_relay::relay::{TerminalRelay, TerminalSize};
use crate::web_interface::types::TerminalControl;

/// Pumps one client terminal over a WebSocket.
///
/// Output goes out as binary frames. Binary frames from the client are
/// keystrokes; text frames are keystrokes too unless they parse as a
/// [`TerminalControl`] message.
pub async fn run_terminal_socket(
    socket: WebSocket,
    session_id: Uuid,
    size: TerminalSize,
    relay: Arc<TerminalRelay>,
) {
    let (mut sink, mut incoming) = socket.split();

    let mut output = match relay.attach(session_id, size).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("[{}] Terminal attach failed: {}", session_id, e);
            let _ = sink.send(Message::text(e.to_string())).await;
            let _ = sink.close().await;
            return;
        }
    };

    let forward = tokio::spawn(async move {
        while let Some(chunk) = output.next().await {
            if sink.send(Message::binary(chunk.to_vec())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = incoming.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                debug!("[{}] Terminal socket error: {}", session_id, e);
                break;
            }
        };
        if message.is_close() {
            break;
        }

        let result = if message.is_binary() {
            relay.send_input(session_id, message.as_bytes()).await
        } else if let Ok(text) = message.to_str() {
            match serde_json::from_str::<TerminalControl>(text) {
                Ok(TerminalControl::Resize { cols, rows }) => {
                    relay.resize(session_id, TerminalSize { cols, rows }).await
                }
                Err(_) => relay.send_input(session_id, text.as_bytes()).await,
            }
        } else {
            continue;
        };

        match result {
            Ok(()) => {}
            Err(e @ (SessionError::NotFound(_) | SessionError::Unavailable(_))) => {
                warn!("[{}] Closing terminal: {}", session_id, e);
                break;
            }
            Err(e) => warn!("[{}] Terminal input dropped: {}", session_id, e),
        }
    }

    forward.abort();
    info!("[{}] Terminal detached", session_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_frames_are_recognised() {
        assert_eq!(
            serde_json::from_str::<TerminalControl>(r#"{"type":"resize","cols":80,"rows":24}"#)
                .unwrap(),
            TerminalControl::Resize { cols: 80, rows: 24 }
        );
        assert!(serde_json::from_str::<TerminalControl>("ls -la\r").is_err());
        assert!(serde_json::from_str::<TerminalControl>(r#"{"type":"input"}"#).is_err());
    }
}
