use crate::config::{ErrorCorrection, ModuleSize};
use crate::error::CodecError;
use crate::recognize::{Cascade, FrameContext};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use qrcode::bits::Bits;
use qrcode::{Color, QrCode, Version};
use serde::{Deserialize, Serialize};

/// Light modules around the symbol (ISO/IEC 18004 minimum).
pub const QUIET_ZONE: u32 = 4;
const MAX_VERSION: i16 = 40;
/// Upper bound on segments per file; the encoder refuses larger plans and
/// discovery rejects headers declaring more.
pub const MAX_SEGMENTS: u64 = 1 << 20;

/// Payload of frame 0 in every segment video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHeader {
    /// SHA-256 of the whole logical file, lowercase hex.
    pub hash: String,
    pub name: String,
    /// Zero-based segment number.
    pub index: u64,
    /// Total segment count for this file.
    pub len: u64,
    /// Module size in wire form (see [`ModuleSize`]).
    pub resize: i32,
}

impl IndexHeader {
    pub fn to_payload(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::InvalidHeader(e.to_string()))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, CodecError> {
        let hdr: IndexHeader = serde_json::from_slice(payload)
            .map_err(|e| CodecError::InvalidHeader(e.to_string()))?;
        hdr.validate()?;
        Ok(hdr)
    }

    fn validate(&self) -> Result<(), CodecError> {
        if self.hash.len() != 64
            || !self
                .hash
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(CodecError::InvalidHeader(format!(
                "hash is not 64 lowercase hex chars: {:?}",
                self.hash
            )));
        }
        if self.len == 0 || self.len > MAX_SEGMENTS {
            return Err(CodecError::InvalidHeader(format!(
                "len must be in 1..={}, got {}",
                MAX_SEGMENTS, self.len
            )));
        }
        if self.index >= self.len {
            return Err(CodecError::InvalidHeader(format!(
                "index {} out of range for len {}",
                self.index, self.len
            )));
        }
        Ok(())
    }
}

/// Build the smallest byte-mode QR symbol holding `base64(payload)`.
///
/// Byte mode is forced so that the symbol version depends only on payload
/// length; every full data slice then renders at the same size.
pub fn encode_symbol(payload: &[u8], ec: ErrorCorrection) -> Result<QrCode, CodecError> {
    let text = STANDARD.encode(payload);
    let level = ec.to_qr();

    for v in 1..=MAX_VERSION {
        let mut bits = Bits::new(Version::Normal(v));
        if bits.push_byte_data(text.as_bytes()).is_err() {
            continue;
        }
        if bits.push_terminator(level).is_err() {
            continue;
        }
        return QrCode::with_bits(bits, level).map_err(|e| CodecError::Qr(e.to_string()));
    }

    Err(CodecError::PayloadTooLarge {
        payload_len: payload.len(),
        encoded_len: text.len(),
        ec,
    })
}

/// Rasterize a symbol with its quiet zone. Dark modules are 0, light 255.
pub fn render_symbol(code: &QrCode, module_size: ModuleSize) -> GrayImage {
    let width = code.width() as u32;
    let modules = width + 2 * QUIET_ZONE;
    let px = module_size.module_px(modules);
    let side = modules * px;
    let colors = code.to_colors();

    GrayImage::from_fn(side, side, |x, y| {
        let mx = x / px;
        let my = y / px;
        if mx < QUIET_ZONE || my < QUIET_ZONE || mx >= QUIET_ZONE + width || my >= QUIET_ZONE + width
        {
            return Luma([255]);
        }
        let idx = ((my - QUIET_ZONE) * width + (mx - QUIET_ZONE)) as usize;
        match colors[idx] {
            Color::Dark => Luma([0]),
            Color::Light => Luma([255]),
        }
    })
}

/// Payload → raster image.
pub fn encode_frame(
    payload: &[u8],
    module_size: ModuleSize,
    ec: ErrorCorrection,
) -> Result<GrayImage, CodecError> {
    let code = encode_symbol(payload, ec)?;
    Ok(render_symbol(&code, module_size))
}

/// Common frame size of one segment video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canvas {
    pub side: u32,
}

impl Canvas {
    /// Smallest even square holding the index frame and a full data frame
    /// (and at least the fixed size, when one was requested).
    pub fn for_segment(
        header: &GrayImage,
        slice_len: usize,
        module_size: ModuleSize,
        ec: ErrorCorrection,
    ) -> Result<Self, CodecError> {
        let probe = encode_frame(&vec![0u8; slice_len], module_size, ec)?;
        let mut side = header.width().max(probe.width());
        if let ModuleSize::Fixed(px) = module_size {
            side = side.max(px);
        }
        Ok(Self {
            side: side + side % 2,
        })
    }

    pub fn frame_bytes(&self) -> usize {
        (self.side as usize) * (self.side as usize) * 3
    }

    /// Center `symbol` on a white canvas and return packed rgb24 bytes.
    pub fn compose_rgb(&self, symbol: &GrayImage) -> Vec<u8> {
        let side = self.side as usize;
        let mut out = vec![255u8; self.frame_bytes()];
        let (w, h) = (symbol.width() as usize, symbol.height() as usize);
        let (w, h) = (w.min(side), h.min(side));
        let ox = (side - w) / 2;
        let oy = (side - h) / 2;

        for y in 0..h {
            let row = (oy + y) * side;
            for x in 0..w {
                let v = symbol.get_pixel(x as u32, y as u32).0[0];
                let at = (row + ox + x) * 3;
                out[at..at + 3].copy_from_slice(&[v, v, v]);
            }
        }
        out
    }
}

/// Wrap one raw rgb24 frame read from the decoder.
pub fn raster_from_rgb(buf: Vec<u8>, width: u32, height: u32) -> Option<RgbImage> {
    RgbImage::from_raw(width, height, buf)
}

/// Grayscale and rescale a decoded frame before recognition.
pub fn prepare_luma(frame: &RgbImage, upscale: f32) -> GrayImage {
    let gray = imageops::grayscale(frame);
    if (upscale - 1.0).abs() < f32::EPSILON {
        return gray;
    }
    let w = ((gray.width() as f32) * upscale).round().max(1.0) as u32;
    let h = ((gray.height() as f32) * upscale).round().max(1.0) as u32;
    imageops::resize(&gray, w, h, FilterType::Lanczos3)
}

/// Raster image → payload, through the recognizer cascade.
pub fn decode_frame(
    frame: &RgbImage,
    upscale: f32,
    cascade: &Cascade,
    ctx: &FrameContext<'_>,
) -> Result<Vec<u8>, CodecError> {
    let luma = prepare_luma(frame, upscale);
    cascade.decode(&luma, ctx)
}
