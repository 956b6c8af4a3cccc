use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Context;
use codec_bus::{packet::CompressedUnit, session::UnitSink};

pub const VIDEO_FILE: &str = "out.h264";
pub const AUDIO_FILE: &str = "out.aac";

struct Track {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    bytes: AtomicU64,
    errors: AtomicU64,
}

impl Track {
    fn create(path: PathBuf) -> anyhow::Result<Self> {
        let file = File::create(&path).with_context(|| format!("create {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            bytes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    fn write(&self, unit: &CompressedUnit) {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        match writer.write_all(unit.data()) {
            Ok(()) => {
                self.bytes.fetch_add(unit.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                // logged once per track
                if self.errors.fetch_add(1, Ordering::Relaxed) == 0 {
                    log::error!("write {} failed: {}", self.path.display(), e);
                }
            }
        }
    }

    fn flush(&self) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer
            .flush()
            .with_context(|| format!("flush {}", self.path.display()))
    }
}

/// Appends encoded units to raw elementary-stream files: Annex-B H.264 and
/// ADTS AAC, both playable as they are.
pub struct FileSink {
    video: Track,
    audio: Track,
}

impl FileSink {
    pub fn create(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(Self {
            video: Track::create(dir.join(VIDEO_FILE))?,
            audio: Track::create(dir.join(AUDIO_FILE))?,
        })
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.video.flush()?;
        self.audio.flush()
    }

    /// Bytes written so far, video then audio.
    pub fn written(&self) -> (u64, u64) {
        (
            self.video.bytes.load(Ordering::Relaxed),
            self.audio.bytes.load(Ordering::Relaxed),
        )
    }
}

impl UnitSink for FileSink {
    fn on_video(&self, unit: CompressedUnit) {
        self.video.write(&unit);
    }

    fn on_audio(&self, unit: CompressedUnit) {
        self.audio.write(&unit);
    }
}
