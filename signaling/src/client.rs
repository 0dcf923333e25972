use core_types::ControlMessage;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::codec::{decode_frame, encode_frame};

/// サーバーのClose応答を待つ最大時間
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// トランスポートチャンネルからの通知
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// WebSocketのハンドシェイク完了（ログ用、状態は変えない）
    Opened,
    Message(ControlMessage),
    /// チャンネルの終了。1チャンネルにつき必ず1回だけ届く
    Closed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport channel is closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

enum Outbound {
    Frame(String),
    Close,
}

/// シグナリングサーバーとのWebSocket接続
pub struct TransportChannel {
    endpoint: String,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    close_requested: AtomicBool,
}

impl TransportChannel {
    /// 接続タスクを起動してすぐに返す。接続の成否はイベントで通知される
    pub fn open(
        endpoint: impl Into<String>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let endpoint = endpoint.into();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let url = endpoint.clone();
        tokio::spawn(async move {
            match Self::connect_and_run(&url, outbound_rx, &events_tx).await {
                Ok(()) => info!("WebSocket connection closed"),
                Err(e) => error!("WebSocket error: {}", e),
            }
            // 正常終了でもエラーでもここで1回だけ通知する
            let _ = events_tx.send(TransportEvent::Closed);
        });

        Self {
            endpoint,
            outbound_tx,
            close_requested: AtomicBool::new(false),
        }
    }

    /// close()が呼ばれたあとはtrue
    pub fn is_closing(&self) -> bool {
        self.close_requested.load(Ordering::Relaxed)
    }

    /// メッセージを送信キューに積む
    pub fn send(&self, message: &ControlMessage) -> Result<(), TransportError> {
        if self.close_requested.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        let json = encode_frame(message)?;
        self.outbound_tx
            .send(Outbound::Frame(json))
            .map_err(|_| TransportError::Closed)
    }

    /// グレースフルに切断する。何度呼んでもよい
    pub fn close(&self) {
        if self.close_requested.swap(true, Ordering::Relaxed) {
            debug!("WebSocket close already requested");
            return;
        }
        info!("Closing WebSocket connection to {}", self.endpoint);
        let _ = self.outbound_tx.send(Outbound::Close);
    }

    async fn connect_and_run(
        endpoint: &str,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
        events_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        info!("Connecting to WebSocket: {}", endpoint);

        // 接続中に切断要求が来たら接続を待たずに終了する
        let connect = connect_async(endpoint);
        tokio::pin!(connect);
        let ws_stream = loop {
            tokio::select! {
                result = &mut connect => break result?.0,
                outbound = outbound_rx.recv() => match outbound {
                    Some(Outbound::Frame(_)) => {
                        warn!("WebSocket is not open yet, dropping outbound message");
                    }
                    Some(Outbound::Close) | None => {
                        info!("Close requested before WebSocket connected");
                        return Ok(());
                    }
                },
            }
        };

        info!("WebSocket connected");
        let _ = events_tx.send(TransportEvent::Opened);

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => match outbound {
                    Some(Outbound::Frame(json)) => {
                        write.send(WsMessage::Text(json.into())).await?;
                        debug!("Message sent to signaling server");
                    }
                    Some(Outbound::Close) | None => {
                        if let Err(e) = write.send(WsMessage::Close(None)).await {
                            debug!("Failed to send close frame: {}", e);
                            return Ok(());
                        }
                        // サーバーのClose応答を読み捨てる
                        let drain = async {
                            while let Some(Ok(msg)) = read.next().await {
                                if let WsMessage::Close(_) = msg {
                                    break;
                                }
                            }
                        };
                        if timeout(CLOSE_HANDSHAKE_TIMEOUT, drain).await.is_err() {
                            warn!("Timed out waiting for close handshake");
                        }
                        return Ok(());
                    }
                },
                msg = read.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        debug!("Message from server: {}", text);
                        if let Some(message) = decode_frame(text.as_str()) {
                            if events_tx.send(TransportEvent::Message(message)).is_err() {
                                debug!("Event receiver dropped");
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!("WebSocket closed by server: {:?}", frame);
                        return Ok(());
                    }
                    Some(Ok(_)) => {
                        debug!("Received non-text message");
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        info!("WebSocket stream ended");
                        return Ok(());
                    }
                },
            }
        }
    }
}
