mod connection;
mod session;
mod video_sink;

use anyhow::Result;
use async_trait::async_trait;
use core_types::SessionDescription;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc_rs::track::track_remote::TrackRemote;

pub use connection::WebRtcPeerFactory;
pub use session::{PeerSession, SessionAction, SessionSignal, SessionState};
pub use video_sink::{RecordingSink, VideoSink};

/// PeerConnectionの接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE候補の収集状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// シグナリング状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// 受信したリモートトラック
#[derive(Clone)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub id: String,
    pub stream_ids: Vec<String>,
    /// RTPの読み出し元（モックではNone）
    pub source: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("stream_ids", &self.stream_ids)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

/// PeerConnectionから届くイベント
#[derive(Debug, Clone)]
pub enum PeerEvent {
    ConnectionStateChanged(PeerConnectionState),
    IceGatheringStateChanged(IceGatheringState),
    SignalingStateChanged(SignalingState),
    /// 新しいICE候補（Noneは収集終了）
    IceCandidate(Option<String>),
    IceCandidateError(String),
    IceConnectionStateChanged(String),
    NegotiationNeeded,
    Track(RemoteTrack),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// PeerSessionが操作するPeerConnection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// ICE候補を含む現在のローカル記述
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn close(&self) -> Result<()>;
}

/// PeerConnectionを生成するファクトリ
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// 生成したPeerConnectionのイベントはすべて`events`へ流す
    async fn create(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>>;
}
