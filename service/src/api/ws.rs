//! The killmail channel: join, adjust interest, receive pushes.
//!
//! Every connection joins the `killmails:lobby` topic implicitly. A join
//! creates one subscription bound to this connection's outbound queue; the
//! registry worker pushes `killmail_update` and `system_stats` frames into
//! that queue and a writer task flushes it with a send timeout. Preload is
//! planned inside the join reply and trickles in afterwards without ever
//! blocking it. Disconnect cancels the subscription worker.

use crate::error::Error;
use crate::subs::{SubscriptionSpec, Transport};
use crate::App;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State as AxumState;
use axum::response::IntoResponse;
use chrono::{Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use killfeed_types::{
    CharacterId, ClientFrame, EventRecord, PreloadPlan, PreloadRequest, PreloadSystemPlan,
    ServerFrame, SystemId,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

pub(super) async fn socket(
    AxumState(app): AxumState<Arc<App>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

async fn handle_socket(socket: WebSocket, app: Arc<App>) {
    tracing::info!("channel connected");
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) =
        mpsc::channel::<ServerFrame>(app.config.channel.outbound_capacity);

    let send_timeout = app.config.channel.send_timeout;
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let payload = match serde_json::to_string(&frame) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(%err, "failed to encode outbound frame");
                    continue;
                }
            };
            match timeout(send_timeout, sender.send(Message::Text(payload))).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    tracing::debug!("channel client disconnected mid-send");
                    break;
                }
                Err(_) => {
                    tracing::warn!("channel send timed out, closing connection");
                    break;
                }
            }
        }
        let _ = sender.close().await;
    });

    let mut subscription_id: Option<String> = None;
    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => {
                    if handle_frame(frame, &app, &out_tx, &mut subscription_id)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    let reply = ServerFrame::Error {
                        request_id: None,
                        code: "invalid_format".into(),
                        message: err.to_string(),
                    };
                    if out_tx.send(reply).await.is_err() {
                        break;
                    }
                }
            },
            Message::Close(_) => break,
            // Ping/pong are answered by the transport layer.
            _ => {}
        }
    }

    // Disconnect cancels the subscription worker.
    if let Some(id) = subscription_id {
        app.registry.stop(&id).await;
    }
    drop(out_tx);
    let _ = writer.await;
    tracing::info!("channel disconnected");
}

/// Err means the outbound queue is gone and the read loop should end.
async fn handle_frame(
    frame: ClientFrame,
    app: &Arc<App>,
    out_tx: &mpsc::Sender<ServerFrame>,
    subscription_id: &mut Option<String>,
) -> Result<(), ()> {
    let reply = match frame {
        ClientFrame::Join {
            request_id,
            systems,
            character_ids,
            preload,
        } => join(app, out_tx, subscription_id, request_id, systems, character_ids, preload),
        ClientFrame::SubscribeSystems {
            request_id,
            systems,
        } => adjust_systems(app, subscription_id, request_id, systems, true),
        ClientFrame::UnsubscribeSystems {
            request_id,
            systems,
        } => adjust_systems(app, subscription_id, request_id, systems, false),
        ClientFrame::SubscribeCharacters {
            request_id,
            character_ids,
        } => adjust_characters(app, subscription_id, request_id, character_ids, true),
        ClientFrame::UnsubscribeCharacters {
            request_id,
            character_ids,
        } => adjust_characters(app, subscription_id, request_id, character_ids, false),
    };
    out_tx.send(reply).await.map_err(|_| ())
}

fn join(
    app: &Arc<App>,
    out_tx: &mpsc::Sender<ServerFrame>,
    subscription_id: &mut Option<String>,
    request_id: String,
    systems: Vec<SystemId>,
    character_ids: Vec<CharacterId>,
    preload: Option<PreloadRequest>,
) -> ServerFrame {
    if subscription_id.is_some() {
        return error_frame(request_id, Error::Validation("already joined".into()));
    }
    let systems: HashSet<SystemId> = systems.into_iter().collect();
    let spec = SubscriptionSpec {
        subscriber_id: format!("channel-{}", Uuid::new_v4()),
        systems: systems.clone(),
        characters: character_ids.into_iter().collect(),
        transport: Transport::Channel {
            outbound: out_tx.clone(),
        },
    };
    match app.registry.register(spec) {
        Ok(id) => {
            let plan = preload
                .filter(|request| request.enabled)
                .map(|request| plan_preload(app, &id, &systems, request));
            *subscription_id = Some(id);
            ServerFrame::Ack {
                request_id,
                preload: plan,
            }
        }
        Err(err) => error_frame(request_id, err),
    }
}

/// Collect the backfill per requested system and hand it to the registry's
/// trickle scheduler. The join reply only carries the plan.
fn plan_preload(
    app: &Arc<App>,
    subscription_id: &str,
    systems: &HashSet<SystemId>,
    request: PreloadRequest,
) -> PreloadPlan {
    let since = Utc::now() - ChronoDuration::hours(i64::from(request.since_hours));
    let mut plan = PreloadPlan {
        systems: Vec::with_capacity(systems.len()),
        total: 0,
    };
    let mut backfill: Vec<EventRecord> = Vec::new();
    for &system_id in systems {
        let events = app.store.recent_for_system(system_id, since, request.limit);
        plan.systems.push(PreloadSystemPlan {
            system_id,
            count: events.len(),
        });
        plan.total += events.len();
        backfill.extend(events);
    }
    backfill.sort_by_key(|record| record.sequence);
    app.registry.schedule_preload(subscription_id, backfill);
    plan
}

fn adjust_systems(
    app: &Arc<App>,
    subscription_id: &Option<String>,
    request_id: String,
    systems: Vec<SystemId>,
    subscribe: bool,
) -> ServerFrame {
    let Some(id) = subscription_id else {
        return error_frame(request_id, Error::Validation("join first".into()));
    };
    let Some((mut current, _)) = app.registry.entity_sets(id) else {
        return error_frame(request_id, Error::NotFound(format!("subscription {id}")));
    };
    for system_id in systems {
        if subscribe {
            current.insert(system_id);
        } else {
            current.remove(&system_id);
        }
    }
    match app.registry.replace_systems(id, current) {
        Ok(()) => ServerFrame::Ack {
            request_id,
            preload: None,
        },
        Err(err) => error_frame(request_id, err),
    }
}

fn adjust_characters(
    app: &Arc<App>,
    subscription_id: &Option<String>,
    request_id: String,
    character_ids: Vec<CharacterId>,
    subscribe: bool,
) -> ServerFrame {
    let Some(id) = subscription_id else {
        return error_frame(request_id, Error::Validation("join first".into()));
    };
    let Some((_, mut current)) = app.registry.entity_sets(id) else {
        return error_frame(request_id, Error::NotFound(format!("subscription {id}")));
    };
    for character_id in character_ids {
        if subscribe {
            current.insert(character_id);
        } else {
            current.remove(&character_id);
        }
    }
    match app.registry.replace_characters(id, current) {
        Ok(()) => ServerFrame::Ack {
            request_id,
            preload: None,
        },
        Err(err) => error_frame(request_id, err),
    }
}

fn error_frame(request_id: String, err: Error) -> ServerFrame {
    ServerFrame::Error {
        request_id: Some(request_id),
        code: err.kind().into(),
        message: err.to_string(),
    }
}
