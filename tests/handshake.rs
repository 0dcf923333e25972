#[cfg(test)]
mod tests {
    use anyhow::Result;
    use client::SessionController;
    use core_types::{ButtonAction, ConnectionStatus, SessionDescription, UiCommand, UiEvent};
    use futures::{SinkExt, StreamExt};
    use peer::{
        IceGatheringState, PeerConnectionFactory, PeerConnectionState, PeerEvent, RemoteTrack,
        SignalingState, VideoSink,
    };
    use peermock::{MockCall, MockOptions, MockPeerFactory, MockPeerHandle};
    use serde_json::Value;
    use std::sync::{Arc, Mutex, Once};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout, Duration};
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    const OFFER_FRAME: &str = r#"{"type":"sdp","sdp":{"type":"offer","sdp":"v=0 offer"}}"#;

    static INIT_TRACING: Once = Once::new();

    /// tracingを初期化（テスト実行時に一度だけ実行される）
    fn init_tracing() {
        INIT_TRACING.call_once(|| {
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .with_test_writer()
                .init();
        });
    }

    /// 1接続だけ受け付けるシグナリングサーバー
    struct SignalingServer {
        endpoint: String,
        to_client: mpsc::UnboundedSender<WsMessage>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    impl SignalingServer {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (to_client, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
            let (in_tx, from_client) = mpsc::unbounded_channel();

            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                loop {
                    tokio::select! {
                        msg = out_rx.recv() => match msg {
                            Some(msg) => {
                                if ws.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        frame = ws.next() => match frame {
                            Some(Ok(WsMessage::Text(text))) => {
                                let _ = in_tx.send(text.to_string());
                            }
                            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                    }
                }
            });

            Self {
                endpoint: format!("ws://{}/ws", addr),
                to_client,
                from_client,
            }
        }

        fn send_text(&self, text: &str) {
            self.to_client
                .send(WsMessage::Text(text.to_string()))
                .unwrap();
        }

        fn close(&self) {
            self.to_client.send(WsMessage::Close(None)).unwrap();
        }

        async fn expect_frame(&mut self) -> Value {
            let text = timeout(Duration::from_secs(5), self.from_client.recv())
                .await
                .expect("timed out waiting for client frame")
                .expect("client connection closed");
            serde_json::from_str(&text).unwrap()
        }

        /// 接続が閉じるまでに届いたフレームをすべて返す
        async fn drain_until_closed(&mut self) -> Vec<Value> {
            let mut frames = Vec::new();
            loop {
                match timeout(Duration::from_secs(5), self.from_client.recv()).await {
                    Ok(Some(text)) => frames.push(serde_json::from_str(&text).unwrap()),
                    Ok(None) => return frames,
                    Err(_) => panic!("client connection did not close"),
                }
            }
        }

        async fn expect_no_frame(&mut self, wait: Duration) {
            if let Ok(Some(text)) = timeout(wait, self.from_client.recv()).await {
                panic!("unexpected client frame: {}", text);
            }
        }
    }

    /// attach/playの呼び出しを記録するシンク
    #[derive(Clone, Default)]
    struct LogSink {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl LogSink {
        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl VideoSink for LogSink {
        fn attach(&mut self, stream_id: &str, _track: &RemoteTrack) {
            self.log.lock().unwrap().push(format!("attach:{}", stream_id));
        }

        fn play(&mut self) -> Result<()> {
            self.log.lock().unwrap().push("play".to_string());
            Ok(())
        }
    }

    struct Viewer {
        commands: mpsc::Sender<UiCommand>,
        ui_rx: mpsc::UnboundedReceiver<UiEvent>,
        sink: LogSink,
        handle: JoinHandle<Result<()>>,
    }

    impl Viewer {
        fn spawn(endpoint: &str, factory: Arc<dyn PeerConnectionFactory>) -> Self {
            let sink = LogSink::default();
            let (ui_tx, ui_rx) = mpsc::unbounded_channel();
            let (controller, commands) =
                SessionController::new(endpoint, factory, Box::new(sink.clone()), ui_tx);
            let handle = tokio::spawn(controller.run());
            Self {
                commands,
                ui_rx,
                sink,
                handle,
            }
        }

        async fn command(&self, command: UiCommand) {
            self.commands.send(command).await.unwrap();
        }

        async fn next_ui(&mut self) -> UiEvent {
            timeout(Duration::from_secs(5), self.ui_rx.recv())
                .await
                .expect("timed out waiting for UI event")
                .expect("UI channel closed")
        }

        async fn expect_quiet_ui(&mut self, wait: Duration) {
            if let Ok(Some(event)) = timeout(wait, self.ui_rx.recv()).await {
                panic!("unexpected UI event: {:?}", event);
            }
        }

        /// 接続ボタンを押してConnectingになるまで待つ
        async fn connect(&mut self) {
            self.command(UiCommand::Toggle).await;
            assert_eq!(
                self.next_ui().await,
                UiEvent::StatusChanged(ConnectionStatus::Connecting)
            );
            assert_eq!(
                self.next_ui().await,
                UiEvent::ButtonChanged(ButtonAction::Disconnect)
            );
        }

        async fn expect_disconnected(&mut self) {
            assert_eq!(
                self.next_ui().await,
                UiEvent::StatusChanged(ConnectionStatus::Disconnected)
            );
            assert_eq!(
                self.next_ui().await,
                UiEvent::ButtonChanged(ButtonAction::Connect)
            );
        }

        async fn shutdown(self) {
            self.commands.send(UiCommand::Shutdown).await.unwrap();
            self.handle.await.unwrap().unwrap();
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    async fn next_handle(rx: &mut mpsc::UnboundedReceiver<MockPeerHandle>) -> MockPeerHandle {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for peer connection")
            .expect("factory dropped")
    }

    async fn wait_local_set(handle: &MockPeerHandle) {
        wait_until(|| {
            handle
                .calls()
                .iter()
                .any(|c| matches!(c, MockCall::SetLocal(_)))
        })
        .await;
    }

    #[tokio::test]
    async fn test_offer_is_answered_after_gathering() {
        init_tracing();

        let mut server = SignalingServer::start().await;
        let mut viewer = Viewer::spawn(&server.endpoint, Arc::new(MockPeerFactory::scripted()));
        viewer.connect().await;

        server.send_text(OFFER_FRAME);

        let frame = server.expect_frame().await;
        assert_eq!(frame["type"], "sdp");
        assert_eq!(frame["sdp"]["type"], "answer");
        assert!(frame["sdp"]["sdp"].as_str().is_some_and(|s| !s.is_empty()));

        assert_eq!(
            viewer.next_ui().await,
            UiEvent::StatusChanged(ConnectionStatus::Connected)
        );
        let sink = viewer.sink.clone();
        wait_until(|| sink.entries().len() == 2).await;
        assert_eq!(sink.entries(), vec!["attach:mock-stream", "play"]);

        // Answerは1回だけ
        server.expect_no_frame(Duration::from_millis(300)).await;

        viewer.command(UiCommand::Toggle).await;
        viewer.expect_disconnected().await;
        viewer.shutdown().await;
    }

    #[tokio::test]
    async fn test_text_submission() {
        init_tracing();

        let mut server = SignalingServer::start().await;
        let mut viewer = Viewer::spawn(&server.endpoint, Arc::new(MockPeerFactory::scripted()));

        // 未接続なら何も起きない
        viewer.command(UiCommand::SubmitText("hi".into())).await;
        viewer.expect_quiet_ui(Duration::from_millis(200)).await;

        viewer.connect().await;

        // Answerが届けば接続済み
        server.send_text(OFFER_FRAME);
        assert_eq!(server.expect_frame().await["type"], "sdp");

        viewer.command(UiCommand::SubmitText("hi".into())).await;
        let frame = server.expect_frame().await;
        assert_eq!(frame, serde_json::json!({"type": "text", "text": "hi"}));

        viewer.shutdown().await;
    }

    #[tokio::test]
    async fn test_connected_is_reported_once() {
        init_tracing();

        let (factory, mut created_rx) = MockPeerFactory::new(MockOptions::default());
        let mut server = SignalingServer::start().await;
        let mut viewer = Viewer::spawn(&server.endpoint, Arc::new(factory));
        viewer.connect().await;

        server.send_text(OFFER_FRAME);
        let handle = next_handle(&mut created_rx).await;
        wait_local_set(&handle).await;
        assert_eq!(
            handle.calls()[0],
            MockCall::SetRemote(SessionDescription::offer("v=0 offer"))
        );

        assert!(handle.emit(PeerEvent::IceGatheringStateChanged(
            IceGatheringState::Complete
        )));
        assert_eq!(server.expect_frame().await["sdp"]["type"], "answer");

        assert!(handle.emit(PeerEvent::ConnectionStateChanged(
            PeerConnectionState::Connected
        )));
        assert!(handle.emit(PeerEvent::ConnectionStateChanged(
            PeerConnectionState::Connected
        )));
        // 2回目の収集完了では再送しない
        assert!(handle.emit(PeerEvent::IceGatheringStateChanged(
            IceGatheringState::Complete
        )));

        assert_eq!(
            viewer.next_ui().await,
            UiEvent::StatusChanged(ConnectionStatus::Connected)
        );
        viewer.expect_quiet_ui(Duration::from_millis(300)).await;
        server.expect_no_frame(Duration::from_millis(100)).await;

        viewer.shutdown().await;
    }

    #[tokio::test]
    async fn test_signaling_closed_discards_session() {
        init_tracing();

        let (factory, mut created_rx) = MockPeerFactory::new(MockOptions::default());
        let server = SignalingServer::start().await;
        let mut viewer = Viewer::spawn(&server.endpoint, Arc::new(factory));
        viewer.connect().await;

        server.send_text(OFFER_FRAME);
        let handle = next_handle(&mut created_rx).await;
        wait_local_set(&handle).await;

        assert!(handle.emit(PeerEvent::SignalingStateChanged(SignalingState::Closed)));

        // セッションが破棄されるとイベントは届かなくなる
        wait_until(|| !handle.emit(PeerEvent::NegotiationNeeded)).await;
        assert_eq!(handle.close_count(), 1);

        // 切断してもPeerConnectionを二重に閉じない
        viewer.command(UiCommand::Toggle).await;
        viewer.expect_disconnected().await;
        assert_eq!(handle.close_count(), 1);

        viewer.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_is_ignored() {
        init_tracing();

        let mut server = SignalingServer::start().await;
        let mut viewer = Viewer::spawn(&server.endpoint, Arc::new(MockPeerFactory::scripted()));
        viewer.connect().await;

        server.send_text("not json");
        server.send_text(r#"{"type":"presence","user":"x"}"#);
        server.send_text(r#"{"type":"text","text":"hello"}"#);
        server.send_text(r#"{"type":"error","message":"room full"}"#);
        viewer.expect_quiet_ui(Duration::from_millis(300)).await;

        // 接続は維持されていて、続くOfferは処理される
        server.send_text(OFFER_FRAME);
        assert_eq!(server.expect_frame().await["sdp"]["type"], "answer");
        assert_eq!(
            viewer.next_ui().await,
            UiEvent::StatusChanged(ConnectionStatus::Connected)
        );

        viewer.command(UiCommand::SubmitText("still here".into())).await;
        assert_eq!(server.expect_frame().await["text"], "still here");

        viewer.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_close_closes_session() {
        init_tracing();

        let (factory, mut created_rx) = MockPeerFactory::new(MockOptions::default());
        let server = SignalingServer::start().await;
        let mut viewer = Viewer::spawn(&server.endpoint, Arc::new(factory));
        viewer.connect().await;

        server.send_text(OFFER_FRAME);
        let handle = next_handle(&mut created_rx).await;
        wait_local_set(&handle).await;

        server.close();
        viewer.expect_disconnected().await;
        assert_eq!(handle.close_count(), 1);
        assert!(!handle.emit(PeerEvent::NegotiationNeeded));

        viewer.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_during_negotiation_suppresses_answer() {
        init_tracing();

        let (factory, mut created_rx) = MockPeerFactory::new(MockOptions {
            scripted: true,
            local_delay: Duration::from_millis(300),
            ..Default::default()
        });
        let mut server = SignalingServer::start().await;
        let mut viewer = Viewer::spawn(&server.endpoint, Arc::new(factory));
        viewer.connect().await;

        server.send_text(OFFER_FRAME);
        let handle = next_handle(&mut created_rx).await;

        viewer.command(UiCommand::Toggle).await;
        viewer.expect_disconnected().await;

        let frames = server.drain_until_closed().await;
        assert!(frames.is_empty(), "no answer expected: {:?}", frames);
        assert_eq!(handle.close_count(), 1);

        // 遅れて完了したネゴシエーションもUIを変えない
        wait_local_set(&handle).await;
        viewer.expect_quiet_ui(Duration::from_millis(200)).await;

        viewer.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_offer_replaces_session() {
        init_tracing();

        let (factory, mut created_rx) = MockPeerFactory::new(MockOptions::default());
        let server = SignalingServer::start().await;
        let mut viewer = Viewer::spawn(&server.endpoint, Arc::new(factory));
        viewer.connect().await;

        server.send_text(OFFER_FRAME);
        let first = next_handle(&mut created_rx).await;
        server.send_text(OFFER_FRAME);
        let second = next_handle(&mut created_rx).await;

        wait_until(|| first.close_count() == 1).await;
        assert_eq!(second.close_count(), 0);
        assert!(!first.emit(PeerEvent::NegotiationNeeded));
        assert!(second.emit(PeerEvent::NegotiationNeeded));

        viewer.shutdown().await;
        assert_eq!(second.close_count(), 1);
    }
}
