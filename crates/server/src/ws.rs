//! `/api/ws`: pushes every log record as `{"event":"log","data":...}` and
//! answers `ping` with `pong`. The subscription lives as long as the socket.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use chakrator_core::LogRecord;
use chakrator_logbus::Subscription;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info};

use crate::AppState;

pub(crate) async fn websocket_handler(ws: WebSocketUpgrade, State(st): State<AppState>) -> Response {
    let sub = st.api.subscribe_logs();
    ws.on_upgrade(move |socket| handle_socket(socket, sub))
}

fn log_frame(record: &LogRecord) -> String {
    serde_json::json!({ "event": "log", "data": record.render() }).to_string()
}

async fn handle_socket(socket: WebSocket, mut sub: Subscription) {
    info!(subscriber = %sub.id(), "websocket client connected");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) if text.trim() == "ping" => {
                    if sender.send(Message::Text("pong".into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "websocket receive failed");
                    break;
                }
            },
            record = sub.recv() => match record {
                Some(record) => {
                    if sender.send(Message::Text(log_frame(&record))).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    info!(subscriber = %sub.id(), dropped = sub.dropped(), "websocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_carry_the_rendered_record() {
        let rec = LogRecord::warn("careful");
        let v: serde_json::Value = serde_json::from_str(&log_frame(&rec)).unwrap();
        assert_eq!(v["event"], "log");
        assert_eq!(v["data"], rec.render());
    }
}
