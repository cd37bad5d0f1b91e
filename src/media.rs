use flate2::read::GzDecoder;
use image::{ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, Read};
use std::path::Path;
use std::str::FromStr;

use crate::error::{ConvertError, Result};

/// EBML header shared by Matroska and WebM containers
const EBML_MAGIC: [u8; 4] = [0x1a, 0x45, 0xdf, 0xa3];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// How many decompressed bytes to inspect when checking a gzip payload
const GZIP_PEEK_LEN: usize = 64;

/// Sticker-related media classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Still raster image (any sniffable format on input, WebP on output)
    StaticImage,
    /// GIF animation
    AnimatedGif,
    /// VP9 WebM video sticker
    VideoSticker,
    /// Gzip-compressed JSON vector animation (`.tgs`)
    VectorAnimation,
}

impl MediaKind {
    pub const ALL: [MediaKind; 4] = [
        MediaKind::StaticImage,
        MediaKind::AnimatedGif,
        MediaKind::VideoSticker,
        MediaKind::VectorAnimation,
    ];

    /// Canonical extension of artifacts of this kind
    pub fn extension(&self) -> &'static str {
        match self {
            MediaKind::StaticImage => "webp",
            MediaKind::AnimatedGif => "gif",
            MediaKind::VideoSticker => "webm",
            MediaKind::VectorAnimation => "tgs",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            MediaKind::StaticImage => "image/webp",
            MediaKind::AnimatedGif => "image/gif",
            MediaKind::VideoSticker => "video/webm",
            MediaKind::VectorAnimation => "application/x-tgsticker",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::StaticImage => "static_image",
            MediaKind::AnimatedGif => "animated_gif",
            MediaKind::VideoSticker => "video_sticker",
            MediaKind::VectorAnimation => "vector_animation",
        }
    }

    /// Classify a file extension, ignoring case
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "tgs" => Some(MediaKind::VectorAnimation),
            "webm" => Some(MediaKind::VideoSticker),
            "gif" => Some(MediaKind::AnimatedGif),
            "webp" | "png" | "jpg" | "jpeg" | "tif" | "tiff" => Some(MediaKind::StaticImage),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "static_image" | "image" | "static" => Ok(MediaKind::StaticImage),
            "animated_gif" | "gif" => Ok(MediaKind::AnimatedGif),
            "video_sticker" | "video" => Ok(MediaKind::VideoSticker),
            "vector_animation" | "vector" | "animated" => Ok(MediaKind::VectorAnimation),
            other => MediaKind::from_extension(other)
                .ok_or_else(|| ConvertError::UnknownFormat(format!("unrecognised media kind '{}'", s))),
        }
    }
}

/// Classify media by its leading bytes
pub fn detect_bytes(data: &[u8]) -> Option<MediaKind> {
    if data.starts_with(&EBML_MAGIC) {
        return Some(MediaKind::VideoSticker);
    }
    if data.starts_with(&GZIP_MAGIC) {
        return is_gzipped_json(data).then_some(MediaKind::VectorAnimation);
    }

    match image::guess_format(data).ok()? {
        ImageFormat::Gif => Some(MediaKind::AnimatedGif),
        format if is_recompressible(format) => Some(MediaKind::StaticImage),
        _ => None,
    }
}

/// Still formats the image recompressor can read
fn is_recompressible(format: ImageFormat) -> bool {
    matches!(
        format,
        ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP | ImageFormat::Tiff
    )
}

/// Extension to stage an input of `kind` under, so tools that look at the
/// file name see its real container
pub fn staging_extension(kind: MediaKind, head: &[u8]) -> &'static str {
    if kind != MediaKind::StaticImage {
        return kind.extension();
    }
    image::guess_format(head)
        .ok()
        .filter(|f| is_recompressible(*f))
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or(kind.extension())
}

/// Pixel size of an in-memory raster image, read from its header only
pub fn raster_dimensions(data: &[u8]) -> Result<(u32, u32)> {
    ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| ConvertError::resource("reading image header", e))?
        .into_dimensions()
        .map_err(|e| ConvertError::UnknownFormat(format!("unreadable image header: {}", e)))
}

/// Pixel size of a raster image file, read from its header only
pub fn raster_dimensions_of(path: &Path) -> Result<(u32, u32)> {
    ImageReader::open(path)
        .map_err(|e| ConvertError::resource(format!("opening {}", path.display()), e))?
        .with_guessed_format()
        .map_err(|e| ConvertError::resource(format!("reading {}", path.display()), e))?
        .into_dimensions()
        .map_err(|e| ConvertError::UnknownFormat(format!("unreadable image header: {}", e)))
}

/// Vector stickers are gzip streams wrapping a JSON document
fn is_gzipped_json(data: &[u8]) -> bool {
    let mut head = Vec::with_capacity(GZIP_PEEK_LEN);
    let mut decoder = GzDecoder::new(data).take(GZIP_PEEK_LEN as u64);
    if decoder.read_to_end(&mut head).is_err() && head.is_empty() {
        return false;
    }
    head.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|&b| b == b'{')
}

/// Infer the kind of an input from its leading bytes, falling back to the
/// file extension convention when the signature is not recognised.
pub fn infer_kind(head: &[u8], name_hint: Option<&Path>) -> Result<MediaKind> {
    if let Some(kind) = detect_bytes(head) {
        return Ok(kind);
    }

    if let Some(kind) = name_hint
        .and_then(|p| p.extension())
        .and_then(|e| e.to_str())
        .and_then(MediaKind::from_extension)
    {
        tracing::debug!("Signature not recognised, classified by extension as {}", kind);
        return Ok(kind);
    }

    Err(ConvertError::UnknownFormat(match name_hint {
        Some(path) => format!("could not classify {}", path.display()),
        None => format!("could not classify {} byte input", head.len()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_detect_signatures() {
        assert_eq!(detect_bytes(b"GIF89a\x01\x00"), Some(MediaKind::AnimatedGif));
        assert_eq!(
            detect_bytes(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR"),
            Some(MediaKind::StaticImage)
        );
        assert_eq!(detect_bytes(b"RIFF\x10\0\0\0WEBPVP8 "), Some(MediaKind::StaticImage));
        assert_eq!(
            detect_bytes(&[0x1a, 0x45, 0xdf, 0xa3, 0x9f, 0x42]),
            Some(MediaKind::VideoSticker)
        );
        assert_eq!(detect_bytes(b"plain text"), None);
    }

    #[test]
    fn test_formats_the_recompressor_cannot_read_are_unknown() {
        assert_eq!(detect_bytes(b"BM\x3a\0\0\0\0\0\0\0\x36\0\0\0"), None);
        assert_eq!(detect_bytes(b"qoif\0\0\0\x02\0\0\0\x02\x04\0"), None);
        assert!(matches!(
            infer_kind(b"BM\x3a\0\0\0", Some(Path::new("logo.bmp"))),
            Err(ConvertError::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_staging_extension_keeps_real_container() {
        let png = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
        assert_eq!(staging_extension(MediaKind::StaticImage, png), "png");
        assert_eq!(staging_extension(MediaKind::StaticImage, b"\xff\xd8\xff\xe0"), "jpg");
        assert_eq!(staging_extension(MediaKind::StaticImage, b"????"), "webp");
        assert_eq!(staging_extension(MediaKind::AnimatedGif, png), "gif");
    }

    #[test]
    fn test_raster_dimensions_from_header() {
        let mut png = Vec::new();
        image::DynamicImage::ImageRgba8(image::RgbaImage::new(40, 30))
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();
        assert_eq!(raster_dimensions(&png).unwrap(), (40, 30));

        let err = raster_dimensions(b"\x89PNG\r\n\x1a\n").unwrap_err();
        assert!(matches!(err, ConvertError::UnknownFormat(_)));
    }

    #[test]
    fn test_gzip_requires_json_payload() {
        let tgs = gzip(br#"{"v":"5.5.2","fr":50,"w":512,"h":512,"layers":[]}"#);
        assert_eq!(detect_bytes(&tgs), Some(MediaKind::VectorAnimation));

        let not_json = gzip(b"hello world");
        assert_eq!(detect_bytes(&not_json), None);
    }

    #[test]
    fn test_infer_falls_back_to_extension() {
        let kind = infer_kind(b"????", Some(Path::new("sticker.TGS"))).unwrap();
        assert_eq!(kind, MediaKind::VectorAnimation);

        let err = infer_kind(b"????", Some(Path::new("notes.txt"))).unwrap_err();
        assert!(matches!(err, ConvertError::UnknownFormat(_)));

        let err = infer_kind(b"", None).unwrap_err();
        assert!(matches!(err, ConvertError::UnknownFormat(_)));
    }

    #[test]
    fn test_parse_kind_names() {
        assert_eq!("gif".parse::<MediaKind>().unwrap(), MediaKind::AnimatedGif);
        assert_eq!("video-sticker".parse::<MediaKind>().unwrap(), MediaKind::VideoSticker);
        assert_eq!("webp".parse::<MediaKind>().unwrap(), MediaKind::StaticImage);
        assert!("mp3".parse::<MediaKind>().is_err());

        for kind in MediaKind::ALL {
            assert_eq!(kind.as_str().parse::<MediaKind>().unwrap(), kind);
        }
    }
}
