use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc_rs::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc_rs::media::io::h264_writer::H264Writer;
use webrtc_rs::media::io::ivf_reader::IVFFileHeader;
use webrtc_rs::media::io::ivf_writer::IVFWriter;
use webrtc_rs::media::io::Writer;
use webrtc_rs::track::track_remote::TrackRemote;

use crate::RemoteTrack;

/// 受信映像の描画先
pub trait VideoSink: Send {
    /// 映像ストリームを差し替える
    fn attach(&mut self, stream_id: &str, track: &RemoteTrack);

    /// 差し替えたストリームの再生を開始する
    fn play(&mut self) -> Result<()>;
}

/// 受信した映像をファイルに書き出すシンク
pub struct RecordingSink {
    dir: PathBuf,
    attached: Option<(String, RemoteTrack)>,
    recorder: Option<JoinHandle<()>>,
}

impl RecordingSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            attached: None,
            recorder: None,
        }
    }

    fn open_writer(
        &self,
        stream_id: &str,
        mime_type: &str,
    ) -> Result<(PathBuf, Box<dyn Writer + Send>)> {
        let (extension, four_cc) = if mime_type.eq_ignore_ascii_case(MIME_TYPE_VP8) {
            ("ivf", Some(*b"VP80"))
        } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_VP9) {
            ("ivf", Some(*b"VP90"))
        } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
            ("h264", None)
        } else {
            anyhow::bail!("Unsupported video codec: {}", mime_type);
        };

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = recording_path(&self.dir, stream_id, extension);
        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;

        let writer: Box<dyn Writer + Send> = match four_cc {
            Some(four_cc) => {
                let header = IVFFileHeader {
                    signature: *b"DKIF",
                    version: 0,
                    header_size: 32,
                    four_cc,
                    width: 640,
                    height: 480,
                    timebase_denominator: 30,
                    timebase_numerator: 1,
                    num_frames: 900,
                    unused: 0,
                };
                Box::new(IVFWriter::new(file, &header).context("Failed to write IVF header")?)
            }
            None => Box::new(H264Writer::new(file)),
        };
        Ok((path, writer))
    }
}

impl VideoSink for RecordingSink {
    fn attach(&mut self, stream_id: &str, track: &RemoteTrack) {
        info!("Attaching video stream {} (track {})", stream_id, track.id);
        self.attached = Some((stream_id.to_string(), track.clone()));
    }

    fn play(&mut self) -> Result<()> {
        let Some((stream_id, track)) = self.attached.take() else {
            warn!("play() called without an attached stream");
            return Ok(());
        };
        let Some(source) = track.source else {
            info!("Stream {} has no media source, nothing to record", stream_id);
            return Ok(());
        };

        let mime_type = source.codec().capability.mime_type;
        let (path, writer) = self.open_writer(&stream_id, &mime_type)?;
        info!("Recording {} ({}) to {}", stream_id, mime_type, path.display());

        // 前のストリームの書き出しは止める
        if let Some(previous) = self.recorder.replace(tokio::spawn(record(source, writer))) {
            previous.abort();
        }
        Ok(())
    }
}

fn recording_path(dir: &Path, stream_id: &str, extension: &str) -> PathBuf {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let name: String = stream_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    dir.join(format!("{}_{}.{}", name, timestamp, extension))
}

/// RTPパケットを読み出して書き込むループ
async fn record(track: Arc<TrackRemote>, mut writer: Box<dyn Writer + Send>) {
    let mut packets: u64 = 0;
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if let Err(e) = writer.write_rtp(&packet) {
                    warn!("Failed to write RTP packet: {}", e);
                    break;
                }
                packets += 1;
            }
            Err(e) => {
                debug!("RTP read loop finished: {}", e);
                break;
            }
        }
    }

    if let Err(e) = writer.close() {
        warn!("Failed to finalize recording: {}", e);
    }
    info!("Recording finished ({} RTP packets)", packets);
}
