//! Mapping between device pixel formats and pipeline media formats.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Broad family a pixel format belongs to.
///
/// Mosaic formats carry one color channel per pixel and need downstream
/// reconstruction before they are displayable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatFamily {
    Raw,
    Mosaic,
}

/// Pixel formats the pipeline side understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaFormat {
    Gray8,
    /// 16-bit little-endian gray. Device formats with 10 to 14 significant
    /// bits are carried in the low bits without scaling, so they render
    /// darker than full-range 16-bit data.
    Gray16Le,
    Rgb,
    Bgr,
    Argb,
    Rgba,
    Bgra,
    Uyvy,
    /// Packed 4:4:4 YUV, one byte per component.
    Packed444,
    BayerGrbg,
    BayerRggb,
    BayerGbrg,
    BayerBggr,
}

impl MediaFormat {
    /// Identifier used when negotiating with the pipeline.
    pub fn name(&self) -> &'static str {
        match self {
            MediaFormat::Gray8 => "GRAY8",
            MediaFormat::Gray16Le => "GRAY16_LE",
            MediaFormat::Rgb => "RGB",
            MediaFormat::Bgr => "BGR",
            MediaFormat::Argb => "ARGB",
            MediaFormat::Rgba => "RGBA",
            MediaFormat::Bgra => "BGRA",
            MediaFormat::Uyvy => "UYVY",
            MediaFormat::Packed444 => "v308",
            MediaFormat::BayerGrbg => "grbg",
            MediaFormat::BayerRggb => "rggb",
            MediaFormat::BayerGbrg => "gbrg",
            MediaFormat::BayerBggr => "bggr",
        }
    }

    pub fn family(&self) -> FormatFamily {
        match self {
            MediaFormat::BayerGrbg
            | MediaFormat::BayerRggb
            | MediaFormat::BayerGbrg
            | MediaFormat::BayerBggr => FormatFamily::Mosaic,
            _ => FormatFamily::Raw,
        }
    }

    /// All formats handled here are single-plane packed layouts.
    pub fn plane_count(&self) -> usize {
        1
    }

    /// Bytes per pixel within the given plane.
    pub fn pixel_stride(&self, plane: usize) -> usize {
        debug_assert!(plane < self.plane_count());
        match self {
            MediaFormat::Gray8
            | MediaFormat::BayerGrbg
            | MediaFormat::BayerRggb
            | MediaFormat::BayerGbrg
            | MediaFormat::BayerBggr => 1,
            MediaFormat::Gray16Le | MediaFormat::Uyvy => 2,
            MediaFormat::Rgb | MediaFormat::Bgr | MediaFormat::Packed444 => 3,
            MediaFormat::Argb | MediaFormat::Rgba | MediaFormat::Bgra => 4,
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One row of the static translation table.
#[derive(Debug)]
pub struct FormatMapEntry {
    pub vendor: &'static str,
    pub media: MediaFormat,
}

impl FormatMapEntry {
    pub fn family(&self) -> FormatFamily {
        self.media.family()
    }
}

/// Device pixel formats with a pipeline representation, including the legacy
/// packed color names older firmware reports.
const FORMAT_MAP: &[FormatMapEntry] = &[
    FormatMapEntry { vendor: "Mono8", media: MediaFormat::Gray8 },
    FormatMapEntry { vendor: "Mono10", media: MediaFormat::Gray16Le },
    FormatMapEntry { vendor: "Mono12", media: MediaFormat::Gray16Le },
    FormatMapEntry { vendor: "Mono14", media: MediaFormat::Gray16Le },
    FormatMapEntry { vendor: "Mono16", media: MediaFormat::Gray16Le },
    FormatMapEntry { vendor: "RGB8", media: MediaFormat::Rgb },
    FormatMapEntry { vendor: "RGB8Packed", media: MediaFormat::Rgb },
    FormatMapEntry { vendor: "BGR8", media: MediaFormat::Bgr },
    FormatMapEntry { vendor: "BGR8Packed", media: MediaFormat::Bgr },
    FormatMapEntry { vendor: "Argb8", media: MediaFormat::Argb },
    FormatMapEntry { vendor: "Rgba8", media: MediaFormat::Rgba },
    FormatMapEntry { vendor: "Bgra8", media: MediaFormat::Bgra },
    FormatMapEntry { vendor: "YUV422Packed", media: MediaFormat::Uyvy },
    FormatMapEntry { vendor: "YCbCr422_8", media: MediaFormat::Uyvy },
    FormatMapEntry { vendor: "YUV444Packed", media: MediaFormat::Packed444 },
    FormatMapEntry { vendor: "YCbCr8", media: MediaFormat::Packed444 },
    FormatMapEntry { vendor: "BayerGR8", media: MediaFormat::BayerGrbg },
    FormatMapEntry { vendor: "BayerRG8", media: MediaFormat::BayerRggb },
    FormatMapEntry { vendor: "BayerGB8", media: MediaFormat::BayerGbrg },
    FormatMapEntry { vendor: "BayerBG8", media: MediaFormat::BayerBggr },
];

/// Looks up the pipeline format for a device format name.
pub fn media_from_vendor(vendor: &str) -> Option<MediaFormat> {
    FORMAT_MAP
        .iter()
        .find(|entry| entry.vendor == vendor)
        .map(|entry| entry.media)
}

/// Formats the connected device actually offers, in device enumeration order.
///
/// Built once per connection by intersecting the static table with the
/// formats the device reports as available; rebuilt on reconnect.
#[derive(Debug, Clone, Default)]
pub struct SupportedFormats {
    entries: Vec<&'static FormatMapEntry>,
}

impl SupportedFormats {
    pub fn from_available<S: AsRef<str>>(available: &[S]) -> Self {
        let mut entries = Vec::new();
        for name in available {
            let name = name.as_ref();
            match FORMAT_MAP.iter().find(|entry| entry.vendor == name) {
                Some(entry) => {
                    debug!(
                        "Device format \"{}\" corresponds to media format \"{}\"",
                        entry.vendor, entry.media
                    );
                    entries.push(entry);
                }
                None => {
                    debug!("No corresponding media format found for device format \"{name}\"");
                }
            }
        }
        Self { entries }
    }

    /// Device format name for a negotiated media format, first match wins.
    pub fn vendor_for(&self, media: MediaFormat) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|entry| entry.media == media)
            .map(|entry| entry.vendor)
    }

    pub fn media_formats(&self) -> impl Iterator<Item = MediaFormat> + '_ {
        self.entries.iter().map(|entry| entry.media)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_names_resolve_to_media_formats() {
        assert_eq!(media_from_vendor("Mono8"), Some(MediaFormat::Gray8));
        assert_eq!(media_from_vendor("Mono12"), Some(MediaFormat::Gray16Le));
        assert_eq!(media_from_vendor("RGB8Packed"), Some(MediaFormat::Rgb));
        assert_eq!(media_from_vendor("YCbCr422_8"), Some(MediaFormat::Uyvy));
        assert_eq!(media_from_vendor("BayerGB8"), Some(MediaFormat::BayerGbrg));
        assert_eq!(media_from_vendor("Mono11"), None);
    }

    #[test]
    fn bayer_formats_are_mosaic() {
        assert_eq!(MediaFormat::BayerRggb.family(), FormatFamily::Mosaic);
        assert_eq!(MediaFormat::Gray8.family(), FormatFamily::Raw);
        assert_eq!(MediaFormat::Uyvy.family(), FormatFamily::Raw);
    }

    #[test]
    fn pixel_strides_match_packed_layouts() {
        assert_eq!(MediaFormat::Gray8.pixel_stride(0), 1);
        assert_eq!(MediaFormat::Gray16Le.pixel_stride(0), 2);
        assert_eq!(MediaFormat::Uyvy.pixel_stride(0), 2);
        assert_eq!(MediaFormat::Rgb.pixel_stride(0), 3);
        assert_eq!(MediaFormat::Bgra.pixel_stride(0), 4);
        assert_eq!(MediaFormat::BayerBggr.pixel_stride(0), 1);
    }

    #[test]
    fn session_mapping_intersects_with_available_formats() {
        let formats = SupportedFormats::from_available(&["Mono8", "NoSuchFormat", "BayerRG8"]);
        assert_eq!(formats.len(), 2);
        assert_eq!(formats.vendor_for(MediaFormat::Gray8), Some("Mono8"));
        assert_eq!(formats.vendor_for(MediaFormat::BayerRggb), Some("BayerRG8"));
        assert_eq!(formats.vendor_for(MediaFormat::Rgb), None);
    }

    #[test]
    fn vendor_lookup_respects_device_order() {
        let formats = SupportedFormats::from_available(&["Mono16", "Mono12"]);
        assert_eq!(formats.vendor_for(MediaFormat::Gray16Le), Some("Mono16"));
    }
}
