use anyhow::Result;
use core_types::{UiCommand, UiEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// 1行の入力をUIコマンドに変換する
pub fn parse_line(line: &str) -> Option<UiCommand> {
    let line = line.trim();
    match line {
        "" => None,
        "/toggle" => Some(UiCommand::Toggle),
        "/quit" => Some(UiCommand::Shutdown),
        text => Some(UiCommand::SubmitText(text.to_string())),
    }
}

/// 標準入力を読んでコントローラーにコマンドを送る
pub async fn read_commands(command_tx: mpsc::Sender<UiCommand>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let Some(command) = parse_line(&line) else {
            continue;
        };
        let shutdown = matches!(command, UiCommand::Shutdown);
        if command_tx.send(command).await.is_err() {
            debug!("SessionController gone, stop reading input");
            return Ok(());
        }
        if shutdown {
            return Ok(());
        }
    }

    // EOFは終了扱い
    info!("Input closed");
    let _ = command_tx.send(UiCommand::Shutdown).await;
    Ok(())
}

/// バッジとボタンの表示を更新する
pub async fn render_events(mut ui_rx: mpsc::UnboundedReceiver<UiEvent>) -> Result<()> {
    while let Some(event) = ui_rx.recv().await {
        println!("{}", render(&event));
    }
    Ok(())
}

fn render(event: &UiEvent) -> String {
    match event {
        UiEvent::StatusChanged(status) => {
            let d = status.descriptor();
            format!("[status] {} ({})", d.label, d.class)
        }
        UiEvent::ButtonChanged(action) => {
            let d = action.descriptor();
            format!("[button] {} ({})", d.label, d.class)
        }
    }
}
