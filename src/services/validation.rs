/// Container format detected from the first bytes of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub ext: &'static str,
    pub mime: &'static str,
}

const MP4: VideoFormat = VideoFormat {
    ext: "mp4",
    mime: "video/mp4",
};
const MOV: VideoFormat = VideoFormat {
    ext: "mov",
    mime: "video/quicktime",
};
const WEBM: VideoFormat = VideoFormat {
    ext: "webm",
    mime: "video/webm",
};
const MKV: VideoFormat = VideoFormat {
    ext: "mkv",
    mime: "video/x-matroska",
};
const AVI: VideoFormat = VideoFormat {
    ext: "avi",
    mime: "video/x-msvideo",
};

/// Sniff the container of an uploaded payload from its magic bytes.
///
/// Returns `None` for anything that is not a supported video container;
/// such uploads are rejected synchronously and never become jobs.
pub fn sniff_container(data: &[u8]) -> Option<VideoFormat> {
    if data.len() < 12 {
        return None;
    }

    // ISO base media (MP4/QuickTime): size + 'ftyp' + major brand.
    if &data[4..8] == b"ftyp" {
        return Some(if &data[8..10] == b"qt" { MOV } else { MP4 });
    }

    // EBML header (Matroska/WebM); the DocType string distinguishes them.
    if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        let head = &data[..data.len().min(64)];
        let is_webm = head.windows(4).any(|w| w == b"webm");
        return Some(if is_webm { WEBM } else { MKV });
    }

    // RIFF container with an AVI list.
    if data.starts_with(b"RIFF") && &data[8..12] == b"AVI " {
        return Some(AVI);
    }

    None
}
