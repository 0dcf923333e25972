use anyhow::Result;
use core_types::{
    ButtonAction, ConnectionStatus, ControlMessage, SessionDescription, UiCommand, UiEvent,
};
use peer::{PeerConnectionFactory, PeerSession, SessionAction, SessionSignal, VideoSink};
use signaling::{TransportChannel, TransportEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 開いているトランスポートチャンネルとそのイベント
struct ActiveTransport {
    channel: TransportChannel,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

/// セッションコントローラー
pub struct SessionController {
    endpoint: String,
    factory: Arc<dyn PeerConnectionFactory>,
    sink: Box<dyn VideoSink>,
    ui_tx: mpsc::UnboundedSender<UiEvent>,
    command_rx: mpsc::Receiver<UiCommand>,
    status: ConnectionStatus,
    button: ButtonAction,
    transport: Option<ActiveTransport>,
    session: Option<PeerSession>,
}

impl SessionController {
    pub fn new(
        endpoint: impl Into<String>,
        factory: Arc<dyn PeerConnectionFactory>,
        sink: Box<dyn VideoSink>,
        ui_tx: mpsc::UnboundedSender<UiEvent>,
    ) -> (Self, mpsc::Sender<UiCommand>) {
        let (command_tx, command_rx) = mpsc::channel(100);
        (
            Self {
                endpoint: endpoint.into(),
                factory,
                sink,
                ui_tx,
                command_rx,
                status: ConnectionStatus::Unknown,
                button: ButtonAction::Connect,
                transport: None,
                session: None,
            },
            command_tx,
        )
    }

    pub async fn run(mut self) -> Result<()> {
        info!("SessionController started (endpoint: {})", self.endpoint);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(UiCommand::Toggle) => self.toggle().await,
                    Some(UiCommand::SubmitText(text)) => self.submit_text(text),
                    Some(UiCommand::Shutdown) => {
                        info!("Shutdown requested");
                        break;
                    }
                    None => {
                        debug!("Command channel closed");
                        break;
                    }
                },
                event = next_transport_event(&mut self.transport) => {
                    self.handle_transport_event(event).await;
                }
                signal = next_session_signal(&mut self.session) => {
                    self.handle_session_signal(signal).await;
                }
            }
        }

        // 終了時は接続とPeerConnectionを片付ける
        if let Some(transport) = self.transport.take() {
            transport.channel.close();
        }
        self.close_session().await;

        info!("SessionController stopped");
        Ok(())
    }

    async fn toggle(&mut self) {
        match self.button {
            ButtonAction::Connect => self.connect(),
            ButtonAction::Disconnect => self.disconnect().await,
        }
    }

    fn connect(&mut self) {
        if self.transport.is_some() {
            warn!("Signaling connection already exists, ignoring connect");
            return;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = TransportChannel::open(self.endpoint.clone(), events_tx);
        self.transport = Some(ActiveTransport { channel, events_rx });

        // Connectedへの遷移はPeerSessionの接続完了でのみ行う
        self.set_status(ConnectionStatus::Connecting);
        self.set_button(ButtonAction::Disconnect);
    }

    async fn disconnect(&mut self) {
        match &self.transport {
            // 状態の更新はClosedイベントを受けてから行う
            Some(transport) => transport.channel.close(),
            None => self.set_button(ButtonAction::Connect),
        }
        self.close_session().await;
    }

    fn submit_text(&mut self, text: String) {
        let Some(transport) = &self.transport else {
            debug!("No signaling connection, dropping text message");
            return;
        };

        if let Err(e) = transport.channel.send(&ControlMessage::Text { text }) {
            warn!("Failed to send text message: {}", e);
            transport.channel.close();
        }
    }

    async fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Opened) => {
                info!("WebSocket connection opened");
            }
            Some(TransportEvent::Message(message)) => self.handle_message(message).await,
            Some(TransportEvent::Closed) | None => self.on_transport_closed().await,
        }
    }

    async fn handle_message(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Sdp { sdp } => {
                // 切断要求後に届いていたOfferでは新しいセッションを作らない
                if self.transport.as_ref().map_or(true, |t| t.channel.is_closing()) {
                    info!("Signaling connection is closing, ignoring remote description");
                    return;
                }
                self.start_session(sdp).await;
            }
            ControlMessage::Error { message } => {
                error!("Received error from signaling server: {}", message);
            }
            ControlMessage::Text { .. } | ControlMessage::Unknown => {
                debug!("Ignoring message from server");
            }
        }
    }

    async fn start_session(&mut self, remote: SessionDescription) {
        // PeerSessionは同時に1つだけ
        if self.session.is_some() {
            info!("Cleaning up existing PeerSession before creating new one");
            self.close_session().await;
        }

        match PeerSession::start(self.factory.as_ref(), remote).await {
            Ok(session) => self.session = Some(session),
            Err(e) => warn!("Failed to start PeerSession: {:#}", e),
        }
    }

    async fn on_transport_closed(&mut self) {
        info!("WebSocket connection closed");
        self.transport = None;
        self.close_session().await;
        self.set_status(ConnectionStatus::Disconnected);
        self.set_button(ButtonAction::Connect);
    }

    async fn handle_session_signal(&mut self, signal: Option<SessionSignal>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(signal) = signal else {
            debug!("PeerSession has no more events, discarding it");
            self.session = None;
            return;
        };

        let action = session.handle(signal).await;
        match action {
            Some(SessionAction::SendDescription(description)) => {
                self.send_description(description);
            }
            Some(SessionAction::Connected) => self.set_status(ConnectionStatus::Connected),
            Some(SessionAction::AttachVideo { stream_id, track }) => {
                self.sink.attach(&stream_id, &track);
                if let Err(e) = self.sink.play() {
                    warn!("Failed to start video playback: {:#}", e);
                }
            }
            Some(SessionAction::Closed) => {
                info!("PeerSession closed by signaling state");
                self.session = None;
            }
            None => {}
        }
    }

    fn send_description(&mut self, description: SessionDescription) {
        let Some(transport) = &self.transport else {
            warn!("Signaling connection is gone, dropping local description");
            return;
        };

        match transport.channel.send(&ControlMessage::Sdp { sdp: description }) {
            Ok(()) => info!("Local description sent to signaling server"),
            Err(e) => {
                warn!("Failed to send local description: {}", e);
                transport.channel.close();
            }
        }
    }

    async fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        debug!("Status {:?} -> {:?}", self.status, status);
        self.status = status;
        let _ = self.ui_tx.send(UiEvent::StatusChanged(status));
    }

    fn set_button(&mut self, action: ButtonAction) {
        if self.button == action {
            return;
        }
        self.button = action;
        let _ = self.ui_tx.send(UiEvent::ButtonChanged(action));
    }
}

async fn next_transport_event(transport: &mut Option<ActiveTransport>) -> Option<TransportEvent> {
    match transport {
        Some(transport) => transport.events_rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_session_signal(session: &mut Option<PeerSession>) -> Option<SessionSignal> {
    match session {
        Some(session) => session.recv().await,
        None => std::future::pending().await,
    }
}
