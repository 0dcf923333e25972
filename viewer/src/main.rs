use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use client::SessionController;
use core_types::{UiEvent, SIGNALING_ENDPOINT};
use peer::{PeerConnectionFactory, RecordingSink, WebRtcPeerFactory};
use peermock::MockPeerFactory;

mod ui;

#[derive(Parser, Debug)]
#[command(name = "viewer")]
#[command(about = "WebRTC signaling viewer")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Directory where received video is recorded
    #[arg(long, env = "VIEWER_RECORD_DIR", default_value = "recordings")]
    record_dir: String,

    /// Use a scripted mock instead of a real peer connection
    #[arg(long)]
    mock: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ログ設定
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting viewer");
    info!("Signaling endpoint: {}", SIGNALING_ENDPOINT);
    info!("Log Level: {}", args.log_level);
    info!("Record dir: {}", args.record_dir);

    let factory: Arc<dyn PeerConnectionFactory> = if args.mock {
        info!("Using mock peer connection");
        Arc::new(MockPeerFactory::scripted())
    } else {
        Arc::new(WebRtcPeerFactory::default())
    };
    let sink = Box::new(RecordingSink::new(&args.record_dir));

    let (ui_tx, ui_rx) = mpsc::unbounded_channel::<UiEvent>();
    let (controller, command_tx) =
        SessionController::new(SIGNALING_ENDPOINT, factory, sink, ui_tx);

    println!("Commands: /toggle (connect/disconnect), /quit, anything else is sent as text");

    let controller_handle = tokio::spawn(async move { controller.run().await });
    let input_handle = tokio::spawn(async move { ui::read_commands(command_tx).await });
    let render_handle = tokio::spawn(async move { ui::render_events(ui_rx).await });

    // コントローラーの終了で全体を止める（入力タスクはShutdownを送ったあとに抜ける）
    tokio::select! {
        result = controller_handle => match result {
            Ok(Ok(())) => info!("SessionController finished"),
            Ok(Err(e)) => tracing::error!("SessionController error: {}", e),
            Err(e) => tracing::error!("SessionController task panicked: {}", e),
        },
        result = render_handle => match result {
            Ok(Ok(())) => info!("Renderer finished"),
            Ok(Err(e)) => tracing::error!("Renderer error: {}", e),
            Err(e) => tracing::error!("Renderer task panicked: {}", e),
        },
    };
    input_handle.abort();

    info!("Viewer stopped");
    Ok(())
}
