use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

use crate::error::AppError;
use crate::state::{AppState, EventKind, SseMessage};

const HEARTBEAT: Duration = Duration::from_secs(30);

fn frame(msg: &SseMessage) -> Result<Event, Infallible> {
    Ok(Event::default().data(serde_json::to_string(msg).unwrap_or_default()))
}

/// GET /api/events: `{type, data}` frames, starting with the current run
/// state. Slow consumers lose frames; clients re-fetch state on reconnect.
pub async fn sse_events(
    State(app): State<AppState>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    // Subscribe first so nothing emitted after the snapshot is missed.
    let rx = app.event_tx.subscribe();
    let state = app.blocking(|s| s.run_state()).await?;
    let initial = SseMessage {
        kind: EventKind::RunState,
        data: serde_json::to_value(&state)?,
    };

    let updates = BroadcastStream::new(rx).filter_map(|msg| msg.ok().map(|m| frame(&m)));
    let stream = tokio_stream::once(frame(&initial)).chain(updates);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT).text("heartbeat")))
}
