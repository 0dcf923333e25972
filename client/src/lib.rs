// SessionController: トランスポートチャンネルとPeerSessionを1つずつ所有する
mod controller;

pub use controller::SessionController;
