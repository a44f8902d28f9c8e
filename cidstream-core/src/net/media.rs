//! Container sniffing for playability probes.

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use super::{PlaybackProbe, ProbeError};

/// Minimum bytes needed for reliable format detection.
const MIN_DETECTION_BYTES: usize = 12;

/// MPEG transport stream packet size.
const TS_PACKET_SIZE: usize = 188;

/// Video container formats recognized from leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Mp4,
    Mov,
    WebM,
    Mkv,
    Avi,
    MpegTs,
    Unknown,
}

impl ContainerFormat {
    /// MIME type advertised for this container.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Mp4 => "video/mp4",
            Self::Mov => "video/quicktime",
            Self::WebM => "video/webm",
            Self::Mkv => "video/x-matroska",
            Self::Avi => "video/x-msvideo",
            Self::MpegTs => "video/mp2t",
            Self::Unknown => "application/octet-stream",
        }
    }
}

/// Detects the container format from leading bytes.
///
/// Samples shorter than twelve bytes are `Unknown`.
pub fn detect_container(data: &[u8]) -> ContainerFormat {
    if data.len() < MIN_DETECTION_BYTES {
        return ContainerFormat::Unknown;
    }

    // ISO base media: box size then box type
    if matches!(
        &data[4..8],
        b"ftyp" | b"moov" | b"mdat" | b"free" | b"skip" | b"wide"
    ) {
        if data[8..12].starts_with(b"qt") {
            return ContainerFormat::Mov;
        }
        return ContainerFormat::Mp4;
    }

    if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        let header = &data[..data.len().min(64)];
        if header.windows(4).any(|window| window == b"webm") {
            return ContainerFormat::WebM;
        }
        return ContainerFormat::Mkv;
    }

    if data.starts_with(b"RIFF") && &data[8..12] == b"AVI " {
        return ContainerFormat::Avi;
    }

    if data[0] == 0x47 && data.get(TS_PACKET_SIZE) == Some(&0x47) {
        return ContainerFormat::MpegTs;
    }

    ContainerFormat::Unknown
}

/// Probe accepting any sample with a recognized container signature.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContainerProbe;

#[async_trait]
impl PlaybackProbe for ContainerProbe {
    async fn probe(&self, url: &Url, sample: &Bytes) -> Result<ContainerFormat, ProbeError> {
        match detect_container(sample) {
            ContainerFormat::Unknown => {
                tracing::debug!("Unrecognized container from {} ({} bytes)", url, sample.len());
                Err(ProbeError::Undecodable {
                    reason: format!("no known container signature in {} bytes", sample.len()),
                })
            }
            format => Ok(format),
        }
    }
}
