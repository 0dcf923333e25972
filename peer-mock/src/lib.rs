use anyhow::{anyhow, Result};
use async_trait::async_trait;
use core_types::{SdpType, SessionDescription};
use peer::{
    IceGatheringState, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent,
    PeerEventSender, RemoteTrack, TrackKind,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// モックが生成するAnswer SDP
const MOCK_ANSWER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=peermock\r\nt=0 0\r\n";

/// モックの動作設定
#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// ローカル記述の設定後に、収集完了・接続・映像トラックのイベントを自動で流す
    pub scripted: bool,
    /// set_remote_descriptionを失敗させる
    pub fail_remote: bool,
    /// set_local_descriptionが完了するまでの遅延
    pub local_delay: Duration,
}

/// モックに対して行われた操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    SetRemote(SessionDescription),
    CreateAnswer,
    SetLocal(SessionDescription),
    Close,
}

/// ダミーのPeerConnectionを生成するファクトリ
pub struct MockPeerFactory {
    options: MockOptions,
    created_tx: mpsc::UnboundedSender<MockPeerHandle>,
}

impl MockPeerFactory {
    /// 生成されたPeerConnectionのハンドルは戻り値のReceiverに届く
    pub fn new(options: MockOptions) -> (Self, mpsc::UnboundedReceiver<MockPeerHandle>) {
        let (created_tx, created_rx) = mpsc::unbounded_channel();
        (
            Self {
                options,
                created_tx,
            },
            created_rx,
        )
    }

    /// ハンドルを使わずに自動でハンドシェイクを進めるファクトリ
    pub fn scripted() -> Self {
        let (factory, _) = Self::new(MockOptions {
            scripted: true,
            ..Default::default()
        });
        factory
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>> {
        let handle = MockPeerHandle {
            inner: Arc::new(Inner {
                options: self.options.clone(),
                events,
                calls: Mutex::new(Vec::new()),
                local: Mutex::new(None),
            }),
        };
        info!("PeerConnection (mock) created");
        let _ = self.created_tx.send(handle.clone());
        Ok(Arc::new(handle))
    }
}

struct Inner {
    options: MockOptions,
    events: PeerEventSender,
    calls: Mutex<Vec<MockCall>>,
    local: Mutex<Option<SessionDescription>>,
}

/// モックPeerConnectionの操作・観測用ハンドル
#[derive(Clone)]
pub struct MockPeerHandle {
    inner: Arc<Inner>,
}

impl MockPeerHandle {
    /// PeerConnectionのイベントを発火する。セッションが破棄済みならfalse
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.inner.events.send(event).is_ok()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock_calls().clone()
    }

    pub fn close_count(&self) -> usize {
        self.lock_calls()
            .iter()
            .filter(|c| **c == MockCall::Close)
            .count()
    }

    fn record(&self, call: MockCall) {
        debug!("PeerConnection (mock) call: {:?}", call);
        self.lock_calls().push(call);
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<MockCall>> {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_script(&self) {
        let script = [
            PeerEvent::IceGatheringStateChanged(IceGatheringState::Gathering),
            PeerEvent::IceCandidate(Some(
                "candidate:1 1 udp 2130706431 192.0.2.1 50000 typ host".to_string(),
            )),
            PeerEvent::IceCandidate(None),
            PeerEvent::IceGatheringStateChanged(IceGatheringState::Complete),
            PeerEvent::ConnectionStateChanged(PeerConnectionState::Connecting),
            PeerEvent::ConnectionStateChanged(PeerConnectionState::Connected),
            PeerEvent::Track(RemoteTrack {
                kind: TrackKind::Video,
                id: "mock-video".to_string(),
                stream_ids: vec!["mock-stream".to_string()],
                source: None,
            }),
        ];
        for event in script {
            if !self.emit(event) {
                debug!("PeerSession gone, stopping mock script");
                break;
            }
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeerHandle {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.record(MockCall::SetRemote(description));
        if self.inner.options.fail_remote {
            return Err(anyhow!("mock rejects remote description"));
        }
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(MockCall::CreateAnswer);
        Ok(SessionDescription::answer(MOCK_ANSWER_SDP))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        if !self.inner.options.local_delay.is_zero() {
            tokio::time::sleep(self.inner.options.local_delay).await;
        }
        if description.sdp_type != SdpType::Answer {
            return Err(anyhow!("mock only accepts answers"));
        }
        self.record(MockCall::SetLocal(description.clone()));
        *self
            .inner
            .local
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(description);

        if self.inner.options.scripted {
            self.run_script();
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.inner
            .local
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn close(&self) -> Result<()> {
        self.record(MockCall::Close);
        Ok(())
    }
}
