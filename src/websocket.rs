//! # Live Event Feed
//!
//! `GET /api/v1/ws/live` upgrades to a WebSocket that mirrors the live
//! session: state changes, transcript lines, interrupts and dropped chunks.
//!
//! ## Protocol:
//! 1. **Connect**: the server sends a `snapshot` with the full session status
//! 2. **Events**: every [`SessionEvent`] follows as JSON text, tagged by `type`
//! 3. **Requests**: the client may send `{"type":"status"}` for a fresh snapshot
//! 4. **Heartbeat**: the server pings every 15s and drops clients silent for 45s
//!
//! A client that falls behind the event buffer gets a `lagged` message with
//! the number of events it missed, then continues with new ones.

use crate::live::session::{SessionEvent, SessionStatus};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(45);

/// Messages the server sends besides raw session events.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage<'a> {
    Snapshot { status: &'a SessionStatus },
    Lagged { missed: u64 },
    Error { message: String },
}

/// Messages a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedRequest {
    Status,
}

/// One connected observer.
pub struct LiveFeed {
    state: web::Data<AppState>,
    last_heartbeat: Instant,
}

impl LiveFeed {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            last_heartbeat: Instant::now(),
        }
    }

    fn send<T: Serialize>(ctx: &mut ws::WebsocketContext<Self>, message: &T) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => warn!("Failed to serialize feed message: {}", e),
        }
    }

    fn send_snapshot(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let status = self.state.live.status();
        Self::send(ctx, &FeedMessage::Snapshot { status: &status });
    }
}

impl Actor for LiveFeed {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Live feed connected");
        self.state.increment_feed_subscribers();

        // Subscribe before the snapshot so no event falls between the two
        let events = self.state.live.monitor().subscribe();
        ctx.add_stream(BroadcastStream::new(events));
        self.send_snapshot(ctx);

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Live feed heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.decrement_feed_subscribers();
        info!("Live feed disconnected");
    }
}

/// Session events from the monitor's broadcast channel.
impl StreamHandler<Result<SessionEvent, BroadcastStreamRecvError>> for LiveFeed {
    fn handle(&mut self, event: Result<SessionEvent, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match event {
            Ok(event) => Self::send(ctx, &event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                debug!(missed, "Live feed lagged");
                Self::send(ctx, &FeedMessage::Lagged { missed });
            }
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        // The monitor outlives every feed; keep the socket open regardless
        debug!("Live event stream ended");
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for LiveFeed {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<FeedRequest>(&text) {
                    Ok(FeedRequest::Status) => self.send_snapshot(ctx),
                    Err(e) => Self::send(
                        ctx,
                        &FeedMessage::Error {
                            message: format!("Invalid request: {}", e),
                        },
                    ),
                }
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Binary(_)) => {
                warn!("Ignoring binary frame on live feed");
            }
            Ok(ws::Message::Close(reason)) => {
                debug!("Live feed closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!("Live feed protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

pub async fn live_feed(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!("Live feed upgrade from {:?}", req.connection_info().peer_addr());
    ws::start(LiveFeed::new(state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::session::SessionState;
    use uuid::Uuid;

    #[test]
    fn test_feed_messages_are_tagged() {
        let status = SessionStatus::default();
        let json = serde_json::to_value(FeedMessage::Snapshot { status: &status }).unwrap();
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["status"]["state"], "idle");

        let json = serde_json::to_value(FeedMessage::Lagged { missed: 3 }).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "lagged", "missed": 3 }));
    }

    #[test]
    fn test_session_events_share_the_tag() {
        let session_id = Uuid::nil();
        let json = serde_json::to_value(SessionEvent::StateChanged {
            session_id,
            state: SessionState::Open,
        })
        .unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["state"], "open");
    }

    #[test]
    fn test_status_request_parses() {
        assert!(matches!(
            serde_json::from_str::<FeedRequest>(r#"{"type":"status"}"#),
            Ok(FeedRequest::Status)
        ));
        assert!(serde_json::from_str::<FeedRequest>(r#"{"type":"dance"}"#).is_err());
    }
}
