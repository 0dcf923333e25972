use anyhow::{anyhow, Context, Result};
use core_types::SessionDescription;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    IceGatheringState, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent,
    RemoteTrack, SignalingState, TrackKind,
};

/// PeerSessionの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// リモートSDPを受け取って生成された直後
    Created,
    /// ローカル記述を設定済みでICE候補を収集中
    Gathering,
    /// 収集完了、ローカル記述を送信済み
    Ready,
    Connected,
    Closed,
}

/// PeerSessionへの入力
#[derive(Debug)]
pub enum SessionSignal {
    Peer(PeerEvent),
    /// ネゴシエーションタスクの結果（成功時は生成したAnswer）
    Negotiated(Result<SessionDescription>),
}

/// PeerSessionがコントローラーに依頼する処理
#[derive(Debug)]
pub enum SessionAction {
    /// 収集完了後のローカル記述をシグナリングサーバーへ送る
    SendDescription(SessionDescription),
    Connected,
    AttachVideo {
        stream_id: String,
        track: RemoteTrack,
    },
    Closed,
}

/// 1通話分のPeerConnectionとそのネゴシエーション
pub struct PeerSession {
    pc: Arc<dyn PeerConnection>,
    events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    events_open: bool,
    negotiation: Option<JoinHandle<Result<SessionDescription>>>,
    state: SessionState,
    description_sent: bool,
    connected: bool,
    closed: bool,
}

impl PeerSession {
    /// リモートSDPからセッションを生成し、Answer生成までを別タスクで開始する
    pub async fn start(
        factory: &dyn PeerConnectionFactory,
        remote: SessionDescription,
    ) -> Result<Self> {
        info!("Creating PeerSession for remote {:?}", remote.sdp_type);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pc = factory
            .create(events_tx)
            .await
            .context("Failed to create peer connection")?;

        let negotiation = tokio::spawn(negotiate(pc.clone(), remote));

        Ok(Self {
            pc,
            events_rx,
            events_open: true,
            negotiation: Some(negotiation),
            state: SessionState::Created,
            description_sent: false,
            connected: false,
            closed: false,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 次の入力を待つ。イベント元もネゴシエーションも終わっていればNone
    pub async fn recv(&mut self) -> Option<SessionSignal> {
        let Self {
            events_rx,
            events_open,
            negotiation,
            ..
        } = self;

        loop {
            if negotiation.is_none() && !*events_open {
                return None;
            }

            tokio::select! {
                result = async {
                    match negotiation.as_mut() {
                        Some(handle) => handle.await,
                        None => std::future::pending().await,
                    }
                } => {
                    *negotiation = None;
                    let outcome = result
                        .unwrap_or_else(|e| Err(anyhow!("Negotiation task failed: {}", e)));
                    return Some(SessionSignal::Negotiated(outcome));
                }
                event = events_rx.recv(), if *events_open => match event {
                    Some(event) => return Some(SessionSignal::Peer(event)),
                    None => {
                        debug!("Peer event channel closed");
                        *events_open = false;
                    }
                },
            }
        }
    }

    /// 入力を1つ処理する。Closed以降はすべて無視する
    pub async fn handle(&mut self, signal: SessionSignal) -> Option<SessionAction> {
        if self.closed {
            debug!("Ignoring signal for closed PeerSession: {:?}", signal);
            return None;
        }

        match signal {
            SessionSignal::Negotiated(Ok(answer)) => {
                info!("Answer set as local description ({:?})", answer.sdp_type);
                if self.state == SessionState::Created {
                    self.state = SessionState::Gathering;
                }
                None
            }
            SessionSignal::Negotiated(Err(e)) => {
                warn!("Negotiation failed: {:#}", e);
                None
            }
            SessionSignal::Peer(event) => self.handle_peer_event(event).await,
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) -> Option<SessionAction> {
        match event {
            PeerEvent::IceGatheringStateChanged(state) => {
                info!("RTC: new ICE gathering state {:?}", state);
                match state {
                    IceGatheringState::Gathering => {
                        if self.state == SessionState::Created {
                            self.state = SessionState::Gathering;
                        }
                        None
                    }
                    IceGatheringState::Complete => self.on_gathering_complete().await,
                    IceGatheringState::New => None,
                }
            }
            PeerEvent::ConnectionStateChanged(state) => {
                match state {
                    PeerConnectionState::Connected => {
                        info!("RTC: new connection state Connected");
                        if !self.connected {
                            self.connected = true;
                            self.state = SessionState::Connected;
                            return Some(SessionAction::Connected);
                        }
                    }
                    PeerConnectionState::Failed => warn!("RTC: new connection state Failed"),
                    PeerConnectionState::Disconnected => {
                        warn!("RTC: new connection state Disconnected")
                    }
                    other => info!("RTC: new connection state {:?}", other),
                }
                None
            }
            PeerEvent::SignalingStateChanged(state) => {
                info!("RTC: new signaling state {:?}", state);
                if state == SignalingState::Closed {
                    self.close().await;
                    return Some(SessionAction::Closed);
                }
                None
            }
            PeerEvent::Track(track) => self.on_track(track),
            PeerEvent::IceCandidate(Some(candidate)) => {
                debug!("RTC: new ICE candidate {}", candidate);
                None
            }
            PeerEvent::IceCandidate(None) => {
                debug!("RTC: end of ICE candidates");
                None
            }
            PeerEvent::IceCandidateError(e) => {
                warn!("RTC: ICE candidate error {}", e);
                None
            }
            PeerEvent::IceConnectionStateChanged(state) => {
                info!("RTC: new ICE connection state {}", state);
                None
            }
            PeerEvent::NegotiationNeeded => {
                info!("RTC: negotiation needed");
                None
            }
        }
    }

    async fn on_gathering_complete(&mut self) -> Option<SessionAction> {
        // トリクルICEは使わない。収集完了時に1回だけ送る
        if self.description_sent {
            debug!("Local description already sent, ignoring gathering complete");
            return None;
        }

        match self.pc.local_description().await {
            Some(description) => {
                self.description_sent = true;
                if self.state != SessionState::Connected {
                    self.state = SessionState::Ready;
                }
                info!("ICE gathering complete, sending local description");
                Some(SessionAction::SendDescription(description))
            }
            None => {
                warn!("ICE gathering complete but no local description is set");
                None
            }
        }
    }

    fn on_track(&mut self, track: RemoteTrack) -> Option<SessionAction> {
        info!("RTC: new track {:?} ({})", track.kind, track.id);
        if track.kind != TrackKind::Video {
            return None;
        }

        match track.stream_ids.first().cloned() {
            Some(stream_id) => Some(SessionAction::AttachVideo { stream_id, track }),
            None => {
                warn!("Video track {} has no associated stream", track.id);
                None
            }
        }
    }

    /// PeerConnectionを閉じる。2回目以降は何もしない
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state = SessionState::Closed;

        if let Err(e) = self.pc.close().await {
            error!("Failed to close PeerConnection: {:#}", e);
        } else {
            info!("PeerConnection closed");
        }
    }
}

/// リモート記述の設定 → Answer生成 → ローカル記述の設定を順番に行う
async fn negotiate(
    pc: Arc<dyn PeerConnection>,
    remote: SessionDescription,
) -> Result<SessionDescription> {
    pc.set_remote_description(remote)
        .await
        .context("Failed to set remote description")?;

    let answer = pc.create_answer().await.context("Failed to create answer")?;

    pc.set_local_description(answer.clone())
        .await
        .context("Failed to set local description")?;

    Ok(answer)
}
