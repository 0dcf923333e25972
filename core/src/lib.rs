use serde::{Deserialize, Serialize};

/// シグナリングサーバーの接続先（固定）
pub const SIGNALING_ENDPOINT: &str = "ws://localhost:8080/ws";

/// ICE設定に使う公開STUNサーバー（固定、TURNなし）
pub const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// SDPの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// セッション記述（中身は解釈せずそのまま受け渡す）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// シグナリングチャンネル上でやり取りするメッセージ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// ユーザーが入力したテキスト（送信のみ）
    #[serde(rename = "text")]
    Text { text: String },
    /// SDP（送受信）
    #[serde(rename = "sdp")]
    Sdp { sdp: SessionDescription },
    /// サーバー側のエラー通知（受信のみ、ログに出すだけ）
    #[serde(rename = "error")]
    Error { message: String },
    /// 未知のtype。黙って無視する
    #[serde(other)]
    Unknown,
}

/// 接続状態バッジに表示する状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Connecting,
    Connected,
    Disconnected,
}

/// 接続ボタンを押したときに実行するアクション
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ButtonAction {
    #[default]
    Connect,
    Disconnect,
}

/// UI要素に反映するラベルとクラス
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub label: &'static str,
    pub class: &'static str,
}

impl ConnectionStatus {
    pub fn descriptor(self) -> Descriptor {
        let (label, class) = match self {
            ConnectionStatus::Connected => ("Connected", "text-bg-success"),
            ConnectionStatus::Connecting => ("Connecting", "text-bg-warning"),
            ConnectionStatus::Disconnected => ("Disconnected", "text-bg-danger"),
            ConnectionStatus::Unknown => ("Unknown", "text-bg-light"),
        };
        Descriptor { label, class }
    }
}

impl ButtonAction {
    pub fn descriptor(self) -> Descriptor {
        let (label, class) = match self {
            ButtonAction::Connect => ("Connect", "btn-primary"),
            ButtonAction::Disconnect => ("Disconnect", "btn-danger"),
        };
        Descriptor { label, class }
    }
}

/// UIからコントローラーへの操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    /// 接続/切断ボタンのクリック
    Toggle,
    /// メッセージフォームの送信
    SubmitText(String),
    Shutdown,
}

/// コントローラーからUIへの通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    StatusChanged(ConnectionStatus),
    ButtonChanged(ButtonAction),
}
