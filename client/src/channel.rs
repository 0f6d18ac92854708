//! Typed handle over the killmail channel.
//!
//! A background reader task decodes frames off the socket into a bounded
//! queue (and is aborted when the handle drops). Request/reply operations
//! correlate on `request_id`; pushed frames that arrive while a reply is
//! pending are buffered so `next()` still sees them in order.

use crate::{Error, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use killfeed_types::{
    CharacterId, ClientFrame, Killmail, PreloadPlan, PreloadRequest, ServerFrame, SystemId,
};
use std::collections::VecDeque;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;
use uuid::Uuid;

const FRAME_QUEUE_CAPACITY: usize = 1024;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct Channel {
    sink: WsSink,
    frames: mpsc::Receiver<Result<ServerFrame>>,
    buffered: VecDeque<ServerFrame>,
    reader: tokio::task::JoinHandle<()>,
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl Channel {
    pub(crate) async fn connect(url: Url) -> Result<Self> {
        let (ws, _) = connect_async(url.as_str()).await?;
        let (sink, mut stream) = ws.split();
        let (tx, rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);

        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let forward = match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => tx.send(Ok(frame)).await,
                        Err(err) => tx.send(Err(Error::InvalidFrame(err))).await,
                    },
                    Ok(Message::Close(_)) => {
                        let _ = tx.send(Err(Error::ConnectionClosed)).await;
                        break;
                    }
                    Ok(_) => Ok(()),
                    Err(err) => {
                        let _ = tx.send(Err(err.into())).await;
                        break;
                    }
                };
                if forward.is_err() {
                    break; // Receiver dropped
                }
            }
        });

        Ok(Self {
            sink,
            frames: rx,
            buffered: VecDeque::new(),
            reader,
        })
    }

    /// Join the lobby with the given interest sets. Returns the preload plan
    /// when one was requested.
    pub async fn join(
        &mut self,
        systems: Vec<SystemId>,
        character_ids: Vec<CharacterId>,
        preload: Option<PreloadRequest>,
    ) -> Result<Option<PreloadPlan>> {
        let request_id = Uuid::new_v4().to_string();
        self.request(ClientFrame::Join {
            request_id: request_id.clone(),
            systems,
            character_ids,
            preload,
        })
        .await
    }

    pub async fn subscribe_systems(&mut self, systems: Vec<SystemId>) -> Result<()> {
        let request_id = Uuid::new_v4().to_string();
        self.request(ClientFrame::SubscribeSystems {
            request_id,
            systems,
        })
        .await
        .map(|_| ())
    }

    pub async fn unsubscribe_systems(&mut self, systems: Vec<SystemId>) -> Result<()> {
        let request_id = Uuid::new_v4().to_string();
        self.request(ClientFrame::UnsubscribeSystems {
            request_id,
            systems,
        })
        .await
        .map(|_| ())
    }

    pub async fn subscribe_characters(&mut self, character_ids: Vec<CharacterId>) -> Result<()> {
        let request_id = Uuid::new_v4().to_string();
        self.request(ClientFrame::SubscribeCharacters {
            request_id,
            character_ids,
        })
        .await
        .map(|_| ())
    }

    pub async fn unsubscribe_characters(&mut self, character_ids: Vec<CharacterId>) -> Result<()> {
        let request_id = Uuid::new_v4().to_string();
        self.request(ClientFrame::UnsubscribeCharacters {
            request_id,
            character_ids,
        })
        .await
        .map(|_| ())
    }

    /// Next pushed frame (killmail updates, system stats), buffered frames
    /// first.
    pub async fn next(&mut self) -> Result<ServerFrame> {
        if let Some(frame) = self.buffered.pop_front() {
            return Ok(frame);
        }
        match self.frames.recv().await {
            Some(result) => result,
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Convenience: skip frames until the next killmail update.
    pub async fn next_killmail(&mut self) -> Result<Killmail> {
        loop {
            if let ServerFrame::KillmailUpdate { killmail } = self.next().await? {
                return Ok(killmail);
            }
        }
    }

    async fn request(&mut self, frame: ClientFrame) -> Result<Option<PreloadPlan>> {
        let request_id = match &frame {
            ClientFrame::Join { request_id, .. }
            | ClientFrame::SubscribeSystems { request_id, .. }
            | ClientFrame::UnsubscribeSystems { request_id, .. }
            | ClientFrame::SubscribeCharacters { request_id, .. }
            | ClientFrame::UnsubscribeCharacters { request_id, .. } => request_id.clone(),
        };
        let payload = serde_json::to_string(&frame)?;
        self.sink.send(Message::Text(payload.into())).await?;

        loop {
            let frame = match self.frames.recv().await {
                Some(result) => result?,
                None => return Err(Error::ConnectionClosed),
            };
            match frame {
                ServerFrame::Ack {
                    request_id: reply_id,
                    preload,
                } if reply_id == request_id => return Ok(preload),
                ServerFrame::Error {
                    request_id: Some(reply_id),
                    code,
                    message,
                } if reply_id == request_id => return Err(Error::Rejected { code, message }),
                // A push racing the reply; keep it for next().
                other => self.buffered.push_back(other),
            }
        }
    }
}
