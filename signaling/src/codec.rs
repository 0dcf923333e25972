use core_types::ControlMessage;
use serde_json::Value;
use tracing::{debug, warn};

/// 受信フレームをControlMessageに変換
///
/// 壊れたフレームはwarnログを1回出して捨てる。
/// typeが未知、またはtypeを持たないフレームはログなしで捨てる。
pub fn decode_frame(text: &str) -> Option<ControlMessage> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to parse message: {}", e);
            return None;
        }
    };

    if !value.get("type").is_some_and(Value::is_string) {
        return None;
    }

    match serde_json::from_value::<ControlMessage>(value) {
        Ok(ControlMessage::Unknown) => None,
        Ok(message) => Some(message),
        Err(e) => {
            warn!("Malformed message body: {}", e);
            None
        }
    }
}

/// 送信用にJSON文字列へ変換
pub fn encode_frame(message: &ControlMessage) -> serde_json::Result<String> {
    let json = serde_json::to_string(message)?;
    debug!("Encoded outbound frame ({} bytes)", json.len());
    Ok(json)
}
