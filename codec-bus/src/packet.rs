use std::fmt::{Display, Formatter};

use bytes::Bytes;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
}

/// Media-type discriminator carried by every compressed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video(VideoCodec),
    Aac,
}

impl MediaKind {
    pub fn is_video(&self) -> bool {
        matches!(self, MediaKind::Video(_))
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, MediaKind::Aac)
    }
}

impl Display for MediaKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video(VideoCodec::H264) => write!(f, "h264"),
            MediaKind::Video(VideoCodec::H265) => write!(f, "h265"),
            MediaKind::Aac => write!(f, "aac"),
        }
    }
}

/// One elementary-stream access unit: a NAL unit bundle (Annex-B, with start
/// codes) or one ADTS-framed AAC frame.
///
/// Encoders hand their output back as `CompressedUnit`s as well.
#[derive(Clone)]
pub struct CompressedUnit {
    kind: MediaKind,
    data: Bytes,
    pts: Option<i64>,
    is_key: bool,
}

impl CompressedUnit {
    /// Copies caller-owned bytes into a new unit.
    pub fn copy_from(kind: MediaKind, data: &[u8]) -> Self {
        Self::new(kind, Bytes::copy_from_slice(data))
    }

    pub fn new(kind: MediaKind, data: Bytes) -> Self {
        Self {
            kind,
            data,
            pts: None,
            is_key: false,
        }
    }

    pub fn with_pts(mut self, pts: Option<i64>) -> Self {
        self.pts = pts;
        self
    }

    pub fn with_key(mut self, is_key: bool) -> Self {
        self.is_key = is_key;
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }
}

impl Display for CompressedUnit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CompressedUnit kind: {}, len: {}, pts: {:?}, is_key: {}",
            self.kind,
            self.data.len(),
            self.pts,
            self.is_key
        )
    }
}

impl std::fmt::Debug for CompressedUnit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedUnit")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .field("pts", &self.pts)
            .field("is_key", &self.is_key)
            .finish()
    }
}
