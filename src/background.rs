//! Virtual background selection for the presenter's outgoing video.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Background requested by the presenter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "imageUrl", rename_all = "lowercase")]
pub enum BackgroundMode {
    #[default]
    None,
    Blur,
    Black,
    Green,
    Blue,
    /// Custom image, as a data URL.
    Image(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub fn hex(self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.0, self.1, self.2)
    }
}

/// Background parameter handed to the SDK when video is restarted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualBackground {
    Blur,
    Color(Rgb),
    Image(String),
}

/// Visual-only approximation the shell applies to the local preview when the
/// SDK could not apply the background.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FallbackEffect {
    None,
    Blur { radius_px: u8 },
    Color { css: String },
    Image { url: String },
}

impl BackgroundMode {
    pub fn solid_color(&self) -> Option<Rgb> {
        match self {
            BackgroundMode::Black => Some(Rgb(0x00, 0x00, 0x00)),
            BackgroundMode::Green => Some(Rgb(0x00, 0xFF, 0x00)),
            BackgroundMode::Blue => Some(Rgb(0x00, 0x66, 0xFF)),
            _ => None,
        }
    }

    /// `None` means plain video without any effect.
    pub fn virtual_background(&self) -> Option<VirtualBackground> {
        match self {
            BackgroundMode::None => None,
            BackgroundMode::Blur => Some(VirtualBackground::Blur),
            BackgroundMode::Image(url) => Some(VirtualBackground::Image(url.clone())),
            solid => solid.solid_color().map(VirtualBackground::Color),
        }
    }

    /// Custom images must arrive as base64 `data:image/...` URLs.
    pub fn validate(&self) -> Result<(), String> {
        let BackgroundMode::Image(url) = self else {
            return Ok(());
        };
        let (header, payload) = url.split_once(',').ok_or("not a data URL")?;
        let media_type = header
            .strip_prefix("data:")
            .and_then(|h| h.strip_suffix(";base64"))
            .ok_or("expected a base64 data URL")?;
        if !media_type.starts_with("image/") {
            return Err(format!("unsupported media type {media_type}"));
        }
        let bytes = STANDARD
            .decode(payload)
            .map_err(|e| format!("bad image data: {e}"))?;
        if bytes.is_empty() {
            return Err("image is empty".to_string());
        }
        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(format!("image is larger than {} MiB", MAX_IMAGE_BYTES / (1024 * 1024)));
        }
        Ok(())
    }

    pub fn fallback_effect(&self) -> FallbackEffect {
        match self {
            BackgroundMode::None => FallbackEffect::None,
            BackgroundMode::Blur => FallbackEffect::Blur { radius_px: 8 },
            BackgroundMode::Image(url) => FallbackEffect::Image { url: url.clone() },
            solid => solid
                .solid_color()
                .map(|color| FallbackEffect::Color { css: color.hex() })
                .unwrap_or(FallbackEffect::None),
        }
    }
}
