// TransportChannel: シグナリングサーバーへのWebSocketクライアント
pub mod client;
pub mod codec;
pub use client::{TransportChannel, TransportError, TransportEvent};
pub use codec::{decode_frame, encode_frame};
