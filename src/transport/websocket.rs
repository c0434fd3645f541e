use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tungstenite::protocol::Message as WsMessage;

use std::sync::Arc;

use crate::broker::notifier::{Notification, Notifier, SubscriberId};
use crate::transport::message::ClientFrame;

/// Dispatches one client frame against the notifier registry.
///
/// Malformed and unknown frames are answered with an `error` frame through
/// the session's channel; the connection stays open.
pub(crate) fn handle_frame(notifier: &Arc<Notifier>, session_id: &SubscriberId, text: &str) {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::SubscribeTopic { topic }) => {
            notifier.subscribe_topic(&topic, session_id.clone());
            tracing::info!("{session_id} subscribed to topic {topic}");
        }

        Ok(ClientFrame::SubscribeConsumerGroup { consumer_group }) => {
            notifier.subscribe_group(&consumer_group, session_id.clone());
            tracing::info!("{session_id} subscribed to consumer group {consumer_group}");
        }

        Ok(ClientFrame::Unsubscribe) => {
            notifier.unsubscribe(session_id);
            tracing::info!("{session_id} unsubscribed from all notifications");
        }

        Ok(ClientFrame::Ping) => {
            notifier.send_to(session_id, Notification::pong());
        }

        Ok(ClientFrame::Unknown) => {
            tracing::warn!("unknown action from {session_id}: {text}");
            notifier.send_to(
                session_id,
                Notification::error("unknown_action", "action not recognized"),
            );
        }

        Err(err) => {
            tracing::warn!("invalid client frame from {session_id}: {err}");
            notifier.send_to(
                session_id,
                Notification::error("message_error", format!("failed to process message: {err}")),
            );
        }
    }
}

/// Accepts WebSocket connections and bridges each session to the notifier.
///
/// Every session gets an unbounded channel registered with the notifier; a
/// forward task serializes the broker's notification frames onto the
/// socket, while the receive loop feeds client frames to `handle_frame`.
/// Disconnecting removes the session from every registry.
pub async fn start_websocket_server(addr: &str, notifier: Arc<Notifier>) {
    let listener = TcpListener::bind(addr).await.expect("Can't bind");

    tracing::info!("notification server listening on ws://{addr}");

    while let Ok((stream, _)) = listener.accept().await {
        let notifier = notifier.clone();
        let session_id = format!("session-{}", uuid::Uuid::new_v4());

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    tracing::error!("WebSocket handshake error: {e}");
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();

            // Channel carrying this session's notification frames
            let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
            notifier.register(session_id.clone(), tx);

            let forward_id = session_id.clone();
            spawn(async move {
                while let Some(notification) = rx.recv().await {
                    let text = match serde_json::to_string(&notification) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!("failed to serialize notification: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = ws_sender.send(WsMessage::text(text)).await {
                        tracing::warn!("failed to send frame to {forward_id}: {e}");
                        break;
                    }
                }
                tracing::debug!("send loop closed for {forward_id}");
            });

            while let Some(Ok(msg)) = ws_receiver.next().await {
                if msg.is_text() {
                    let Ok(text) = msg.to_text() else { continue };
                    handle_frame(&notifier, &session_id, text);
                }
            }

            tracing::info!("{session_id} disconnected");
            notifier.remove(&session_id);
        });
    }
}
