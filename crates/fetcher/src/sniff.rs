//! Extension inference and magic-byte sniffing

use image::ImageFormat;
use media_scan_common::MediaKind;
use tracing::debug;

/// Bytes of the response head kept for sniffing
pub const SNIFF_LEN: usize = 32;

/// Media type recognised from leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub kind: MediaKind,
    pub extension: &'static str,
}

impl Signature {
    const fn new(kind: MediaKind, extension: &'static str) -> Self {
        Self { kind, extension }
    }
}

/// Recognise a supported container from its first bytes
#[must_use]
pub fn sniff_signature(head: &[u8]) -> Option<Signature> {
    if let Ok(format) = image::guess_format(head) {
        let extension = match format {
            ImageFormat::Jpeg => Some("jpg"),
            ImageFormat::Png => Some("png"),
            ImageFormat::Bmp => Some("bmp"),
            ImageFormat::WebP => Some("webp"),
            _ => None,
        };
        if let Some(extension) = extension {
            return Some(Signature::new(MediaKind::Images, extension));
        }
    }

    // ISO BMFF: size(4) "ftyp" brand(4)
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        let extension = if &head[8..12] == b"qt  " { "mov" } else { "mp4" };
        return Some(Signature::new(MediaKind::Videos, extension));
    }
    if head.len() >= 12 && &head[0..4] == b"RIFF" && &head[8..12] == b"AVI " {
        return Some(Signature::new(MediaKind::Videos, "avi"));
    }
    // EBML header, shared by Matroska and WebM
    if head.len() >= 4 && head[0..4] == [0x1A, 0x45, 0xDF, 0xA3] {
        let extension = if contains(head, b"webm") { "webm" } else { "mkv" };
        return Some(Signature::new(MediaKind::Videos, extension));
    }

    None
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Lowercase extension of the URL's last path segment, if any
#[must_use]
pub fn extension_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let without_scheme = path.split_once("://").map_or(path, |(_, rest)| rest);
    // A bare host has no file name
    let (_, path) = without_scheme.split_once('/')?;
    let filename = path.rsplit('/').next()?;
    let (_, extension) = filename.rsplit_once('.')?;

    if !extension.is_empty() && extension.len() <= 5 && extension.chars().all(char::is_alphanumeric)
    {
        Some(extension.to_ascii_lowercase())
    } else {
        None
    }
}

/// Extension for a supported `Content-Type`
#[must_use]
pub fn extension_from_content_type(content_type: &str) -> Option<&'static str> {
    let mime_type = content_type.split(';').next()?.trim().to_ascii_lowercase();

    match mime_type.as_str() {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/bmp" | "image/x-ms-bmp" => Some("bmp"),
        "image/webp" => Some("webp"),

        "video/mp4" => Some("mp4"),
        "video/quicktime" => Some("mov"),
        "video/x-msvideo" | "video/avi" => Some("avi"),
        "video/x-matroska" => Some("mkv"),
        "video/webm" => Some("webm"),

        _ => {
            debug!("Unrecognised content-type: {}", mime_type);
            None
        }
    }
}

/// File name the uploader gave the resource
#[must_use]
pub fn filename_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let without_scheme = path.split_once("://").map_or(path, |(_, rest)| rest);
    let (_, path) = without_scheme.split_once('/')?;
    let name = path.rsplit('/').next()?;
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_from_url() {
        assert_eq!(
            extension_from_url("https://example.com/video.MP4"),
            Some("mp4".to_string())
        );
        assert_eq!(
            extension_from_url("https://example.com/a/b/photo.jpeg?sig=abc.def"),
            Some("jpeg".to_string())
        );
        assert_eq!(extension_from_url("https://example.com/file"), None);
        assert_eq!(extension_from_url("https://example.com/"), None);
        assert_eq!(extension_from_url("https://example.com"), None);
        assert_eq!(extension_from_url("https://cdn.example.com/file.toolongext"), None);
    }

    #[test]
    fn test_extension_from_content_type() {
        assert_eq!(extension_from_content_type("image/jpeg"), Some("jpg"));
        assert_eq!(
            extension_from_content_type("video/mp4; codecs=avc1"),
            Some("mp4")
        );
        assert_eq!(extension_from_content_type("Video/QuickTime"), Some("mov"));
        assert_eq!(extension_from_content_type("image/gif"), None);
        assert_eq!(extension_from_content_type("application/octet-stream"), None);
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url("https://example.com/uploads/clip.mp4?x=1"),
            Some("clip.mp4".to_string())
        );
        assert_eq!(filename_from_url("https://example.com/"), None);
    }

    #[test]
    fn test_sniff_images() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(
            sniff_signature(&png),
            Some(Signature::new(MediaKind::Images, "png"))
        );

        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F', 0, 1];
        assert_eq!(sniff_signature(&jpeg).map(|s| s.extension), Some("jpg"));
    }

    #[test]
    fn test_sniff_videos() {
        let mp4 = *b"\x00\x00\x00\x20ftypisom\x00\x00\x02\x00";
        assert_eq!(
            sniff_signature(&mp4),
            Some(Signature::new(MediaKind::Videos, "mp4"))
        );

        let mov = *b"\x00\x00\x00\x14ftypqt  \x00\x00\x00\x00";
        assert_eq!(sniff_signature(&mov).map(|s| s.extension), Some("mov"));

        let avi = *b"RIFF\x00\x10\x00\x00AVI LIST";
        assert_eq!(sniff_signature(&avi).map(|s| s.extension), Some("avi"));

        let webm = *b"\x1a\x45\xdf\xa3\x9f\x42\x86\x81\x01\x42\x82\x84webm";
        assert_eq!(sniff_signature(&webm).map(|s| s.extension), Some("webm"));
    }

    #[test]
    fn test_sniff_unknown() {
        assert_eq!(sniff_signature(b"GIF89a\x01\x00\x01\x00"), None);
        assert_eq!(sniff_signature(b"<html>"), None);
        assert_eq!(sniff_signature(&[]), None);
    }
}
