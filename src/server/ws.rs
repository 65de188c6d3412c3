//! WebSocket session handlers.
//!
//! The owning connection starts the build with `start_build` and receives
//! `started`, the ordered `log` events and one `done`. If it disconnects before
//! the session finishes, the session is cancelled. Attached listeners get the
//! same stream and never cancel anything.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

use super::protocol::{ClientEvent, ServerEvent};
use super::{ApiError, AppState};
use crate::error::BuildError;
use crate::models::SessionId;
use crate::orchestrator::{AttachedSession, SessionWatcher};

type Outbound = SplitSink<WebSocket, Message>;

enum Inbound {
    Event(ClientEvent),
    Invalid(String),
    Ignore,
    Closed,
}

async fn recv(rx: &mut SplitStream<WebSocket>) -> Inbound {
    match rx.next().await {
        Some(Ok(Message::Text(text))) => match ClientEvent::parse(&text) {
            Ok(event) => Inbound::Event(event),
            Err(why) => Inbound::Invalid(why),
        },
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => Inbound::Closed,
        Some(Ok(_)) => Inbound::Ignore,
    }
}

/// False once the peer is gone.
async fn send(tx: &mut Outbound, event: &ServerEvent) -> bool {
    tx.send(Message::Text(event.to_json())).await.is_ok()
}

async fn reject(tx: &mut Outbound, err: BuildError) -> bool {
    send(tx, &ServerEvent::rejected(&err)).await
}

/// `GET /ws`
pub async fn owner_socket(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| run_owner(socket, app))
}

/// `GET /ws/sessions/:id`
pub async fn attach_socket(
    ws: WebSocketUpgrade,
    Path(raw): Path<String>,
    State(app): State<AppState>,
) -> Response {
    let attached = raw
        .parse::<SessionId>()
        .ok()
        .and_then(|id| app.orchestrator.attach(id));
    match attached {
        Some(attached) => ws.on_upgrade(move |socket| run_listener(socket, attached)),
        None => ApiError::session_not_found(&raw).into_response(),
    }
}

async fn run_owner(socket: WebSocket, app: AppState) {
    let (mut tx, mut rx) = socket.split();

    let attached = loop {
        match recv(&mut rx).await {
            Inbound::Event(ClientEvent::StartBuild(request)) => {
                match app.orchestrator.start_attached(&request) {
                    Ok(attached) => break attached,
                    Err(err) => {
                        log::info!("[Server] Rejected build request: {}", err);
                        if !reject(&mut tx, err).await {
                            return;
                        }
                    }
                }
            }
            Inbound::Event(ClientEvent::Cancel) | Inbound::Ignore => {}
            Inbound::Invalid(why) => {
                if !reject(&mut tx, BuildError::InvalidInput(why)).await {
                    return;
                }
            }
            Inbound::Closed => return,
        }
    };

    let AttachedSession { id, mut logs, watcher } = attached;
    log::info!("[Server] [{}] Owner connection attached", id);
    if !send(&mut tx, &ServerEvent::Started { session_id: id }).await {
        owner_gone(&app, id, &watcher);
        return;
    }

    loop {
        tokio::select! {
            item = logs.next() => match item {
                Some(item) => {
                    if !send(&mut tx, &ServerEvent::from_log(item)).await {
                        owner_gone(&app, id, &watcher);
                        return;
                    }
                }
                None => break,
            },
            inbound = recv(&mut rx) => match inbound {
                Inbound::Event(ClientEvent::Cancel) => {
                    watcher.cancel();
                }
                Inbound::Event(ClientEvent::StartBuild(_)) => {
                    let err = BuildError::InvalidInput(
                        "a build is already running on this connection".to_string(),
                    );
                    if !reject(&mut tx, err).await {
                        owner_gone(&app, id, &watcher);
                        return;
                    }
                }
                Inbound::Invalid(why) => {
                    if !reject(&mut tx, BuildError::InvalidInput(why)).await {
                        owner_gone(&app, id, &watcher);
                        return;
                    }
                }
                Inbound::Ignore => {}
                Inbound::Closed => {
                    owner_gone(&app, id, &watcher);
                    return;
                }
            },
        }
    }

    finish(&mut tx, &watcher).await;
}

fn owner_gone(app: &AppState, id: SessionId, watcher: &SessionWatcher) {
    if app.cancel_on_disconnect && watcher.cancel() {
        log::info!("[Server] [{}] Owner disconnected, cancelling", id);
    }
}

async fn run_listener(socket: WebSocket, attached: AttachedSession) {
    let (mut tx, mut rx) = socket.split();
    let AttachedSession { id, mut logs, watcher } = attached;
    log::debug!("[Server] [{}] Listener attached", id);

    if !send(&mut tx, &ServerEvent::Started { session_id: id }).await {
        return;
    }
    loop {
        tokio::select! {
            item = logs.next() => match item {
                Some(item) => {
                    if !send(&mut tx, &ServerEvent::from_log(item)).await {
                        return;
                    }
                }
                None => break,
            },
            inbound = recv(&mut rx) => {
                if matches!(inbound, Inbound::Closed) {
                    return;
                }
            }
        }
    }
    finish(&mut tx, &watcher).await;
}

async fn finish(tx: &mut Outbound, watcher: &SessionWatcher) {
    let snapshot = watcher.finished().await;
    let _ = send(tx, &ServerEvent::Done { zip_url: snapshot.zip_url }).await;
    let _ = tx.send(Message::Close(None)).await;
}
