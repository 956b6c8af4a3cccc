//! Elementary-stream framing.
//!
//! Containers store H.264/HEVC as length-prefixed NAL units (AVCC/HVCC) with
//! the parameter sets in extradata, and AAC as bare access units with an
//! AudioSpecificConfig. Decoders fed unit by unit want start codes and ADTS
//! headers instead; these helpers do that rewrite without touching FFmpeg.

use bytes::{BufMut, Bytes, BytesMut};

/// Annex B start code (4-byte)
const START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

pub const ADTS_HEADER_LEN: usize = 7;

const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Whether `data` starts with a 3- or 4-byte start code.
pub fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&[0x00, 0x00, 0x00, 0x01]) || data.starts_with(&[0x00, 0x00, 0x01])
}

/// Whether extradata is an avcC/hvcC record rather than in-band Annex B.
pub fn needs_annexb_conversion(extradata: &[u8]) -> bool {
    extradata.len() >= 7 && !is_annexb(extradata) && extradata[0] == 0x01
}

/// Converts length-prefixed NAL units to start-code form. `length_size` is
/// the NAL length field width, 4 for nearly every stream. Trailing bytes
/// that do not form a whole unit are dropped.
pub fn avcc_to_annexb(avcc: &[u8], length_size: usize) -> Bytes {
    let mut out = BytesMut::with_capacity(avcc.len() + 16);
    let mut i = 0;
    while i + length_size <= avcc.len() {
        let len = avcc[i..i + length_size]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        i += length_size;
        if len == 0 || i + len > avcc.len() {
            break;
        }
        out.extend_from_slice(START_CODE);
        out.extend_from_slice(&avcc[i..i + len]);
        i += len;
    }
    out.freeze()
}

/// Parameter sets of an avcC or hvcC record, in start-code form, plus the
/// NAL length field width the samples use.
#[derive(Debug, Clone)]
pub struct ParameterSets {
    pub annexb: Bytes,
    pub length_size: usize,
}

fn push_nal(out: &mut BytesMut, data: &[u8], at: usize) -> Option<usize> {
    let len = u16::from_be_bytes([*data.get(at)?, *data.get(at + 1)?]) as usize;
    let nal = data.get(at + 2..at + 2 + len)?;
    out.extend_from_slice(START_CODE);
    out.extend_from_slice(nal);
    Some(at + 2 + len)
}

/// Reads an H.264 `AVCDecoderConfigurationRecord`.
pub fn avcc_parameter_sets(record: &[u8]) -> Option<ParameterSets> {
    if record.len() < 7 || record[0] != 1 {
        return None;
    }
    let length_size = (record[4] & 0x03) as usize + 1;
    let mut out = BytesMut::new();
    let mut at = 5;
    let sps = (record[at] & 0x1f) as usize;
    at += 1;
    for _ in 0..sps {
        at = push_nal(&mut out, record, at)?;
    }
    let pps = *record.get(at)? as usize;
    at += 1;
    for _ in 0..pps {
        at = push_nal(&mut out, record, at)?;
    }
    Some(ParameterSets {
        annexb: out.freeze(),
        length_size,
    })
}

/// Reads an HEVC `HEVCDecoderConfigurationRecord`.
pub fn hvcc_parameter_sets(record: &[u8]) -> Option<ParameterSets> {
    if record.len() < 23 || record[0] != 1 {
        return None;
    }
    let length_size = (record[21] & 0x03) as usize + 1;
    let arrays = record[22] as usize;
    let mut out = BytesMut::new();
    let mut at = 23;
    for _ in 0..arrays {
        // array_completeness, reserved, NAL_unit_type
        at += 1;
        let count = u16::from_be_bytes([*record.get(at)?, *record.get(at + 1)?]) as usize;
        at += 2;
        for _ in 0..count {
            at = push_nal(&mut out, record, at)?;
        }
    }
    Some(ParameterSets {
        annexb: out.freeze(),
        length_size,
    })
}

/// NAL unit payloads (start codes stripped) in an Annex B buffer.
pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push((i, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }
    let mut units = Vec::with_capacity(starts.len());
    for (n, (_, payload)) in starts.iter().enumerate() {
        let mut end = starts.get(n + 1).map(|(code, _)| *code).unwrap_or(data.len());
        // a 4-byte start code leaves one zero behind
        if n + 1 < starts.len() && end > *payload && data[end - 1] == 0 {
            end -= 1;
        }
        if end > *payload {
            units.push(&data[*payload..end]);
        }
    }
    units
}

/// Whether an H.264 access unit carries an IDR slice.
pub fn h264_is_idr(data: &[u8]) -> bool {
    split_nal_units(data)
        .iter()
        .any(|nal| nal.first().map(|b| b & 0x1f) == Some(5))
}

/// Fields of an AAC `AudioSpecificConfig` needed to frame ADTS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AacConfig {
    /// Audio object type, 2 for AAC-LC.
    pub object_type: u8,
    pub sample_rate_index: u8,
    pub channels: u8,
}

impl AacConfig {
    pub fn new(sample_rate: u32, channels: u16) -> Option<Self> {
        Some(Self {
            object_type: 2,
            sample_rate_index: sample_rate_index(sample_rate)?,
            channels: channels as u8,
        })
    }

    pub fn from_extradata(asc: &[u8]) -> Option<Self> {
        if asc.len() < 2 {
            return None;
        }
        let object_type = asc[0] >> 3;
        let sample_rate_index = ((asc[0] & 0x07) << 1) | (asc[1] >> 7);
        let channels = (asc[1] >> 3) & 0x0f;
        if object_type == 0 || sample_rate_index as usize >= AAC_SAMPLE_RATES.len() {
            return None;
        }
        Some(Self {
            object_type,
            sample_rate_index,
            channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        AAC_SAMPLE_RATES[self.sample_rate_index as usize]
    }

    /// 7-byte ADTS header (no CRC) for a payload of `payload_len` bytes.
    pub fn adts_header(&self, payload_len: usize) -> [u8; ADTS_HEADER_LEN] {
        let frame_len = payload_len + ADTS_HEADER_LEN;
        let profile = self.object_type.saturating_sub(1) & 0x03;
        [
            0xff,
            0xf1,
            (profile << 6) | (self.sample_rate_index << 2) | ((self.channels >> 2) & 0x01),
            ((self.channels & 0x03) << 6) | ((frame_len >> 11) & 0x03) as u8,
            ((frame_len >> 3) & 0xff) as u8,
            (((frame_len & 0x07) << 5) as u8) | 0x1f,
            0xfc,
        ]
    }

    /// Prefixes one raw access unit with its ADTS header.
    pub fn frame(&self, payload: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(payload.len() + ADTS_HEADER_LEN);
        out.put_slice(&self.adts_header(payload.len()));
        out.put_slice(payload);
        out.freeze()
    }
}

pub fn sample_rate_index(rate: u32) -> Option<u8> {
    AAC_SAMPLE_RATES
        .iter()
        .position(|r| *r == rate)
        .map(|i| i as u8)
}

/// Whether `data` starts with an ADTS sync word.
pub fn is_adts(data: &[u8]) -> bool {
    data.len() >= ADTS_HEADER_LEN && data[0] == 0xff && (data[1] & 0xf6) == 0xf0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_annexb() {
        assert!(is_annexb(&[0x00, 0x00, 0x00, 0x01, 0x67]));
        assert!(is_annexb(&[0x00, 0x00, 0x01, 0x67]));
        assert!(!is_annexb(&[0x01, 0x00, 0x00, 0x00]));
        assert!(!is_annexb(&[0x00, 0x00]));
    }

    #[test]
    fn test_avcc_to_annexb() {
        let avcc = [0, 0, 0, 4, 0x65, 0x88, 0x81, 0x00, 0, 0, 0, 2, 0x41, 0x9a];
        let out = avcc_to_annexb(&avcc, 4);
        assert_eq!(
            &out[..],
            &[0, 0, 0, 1, 0x65, 0x88, 0x81, 0x00, 0, 0, 0, 1, 0x41, 0x9a][..]
        );
        // truncated unit is dropped
        assert_eq!(avcc_to_annexb(&[0, 0, 0, 9, 0x65], 4).len(), 0);
        // 2-byte length fields
        assert_eq!(&avcc_to_annexb(&[0, 1, 0x09], 2)[..], &[0, 0, 0, 1, 0x09][..]);
    }

    #[test]
    fn test_avcc_parameter_sets() {
        let record = [
            0x01, 0x64, 0x00, 0x1f, 0xff, // version, profile, compat, level, length size 4
            0xe1, 0x00, 0x03, 0x67, 0x64, 0x1f, // one SPS
            0x01, 0x00, 0x02, 0x68, 0xee, // one PPS
        ];
        assert!(needs_annexb_conversion(&record));
        let sets = avcc_parameter_sets(&record).unwrap();
        assert_eq!(sets.length_size, 4);
        assert_eq!(
            &sets.annexb[..],
            &[0, 0, 0, 1, 0x67, 0x64, 0x1f, 0, 0, 0, 1, 0x68, 0xee][..]
        );
        assert!(avcc_parameter_sets(&record[..8]).is_none());
    }

    #[test]
    fn test_split_nal_units() {
        let data = [0, 0, 0, 1, 0x67, 0x01, 0, 0, 1, 0x68, 0x02, 0, 0, 0, 1, 0x65, 0x03];
        let units = split_nal_units(&data);
        assert_eq!(units, vec![&[0x67, 0x01][..], &[0x68, 0x02][..], &[0x65, 0x03][..]]);
        assert!(h264_is_idr(&data));
        assert!(!h264_is_idr(&data[..11]));
    }

    #[test]
    fn test_adts_header() {
        // AAC-LC, 44.1 kHz, stereo
        let asc = [0x12, 0x10];
        let config = AacConfig::from_extradata(&asc).unwrap();
        assert_eq!(config, AacConfig::new(44100, 2).unwrap());
        assert_eq!(config.sample_rate(), 44100);

        let framed = config.frame(&[0u8; 100]);
        assert_eq!(framed.len(), 107);
        assert!(is_adts(&framed));
        assert_eq!(&framed[..7], &[0xff, 0xf1, 0x50, 0x80, 0x0d, 0x7f, 0xfc]);
    }
}
