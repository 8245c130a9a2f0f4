use anyhow::{bail, Result};
use clap::ValueEnum;
use std::fmt;
use std::path::PathBuf;

pub const MODULE_SIZE_MIN: i32 = -16;
pub const MODULE_SIZE_MAX: i32 = 1000;
pub const SLICE_LEN_MIN: usize = 50;
pub const SLICE_LEN_MAX: usize = 1500;
pub const FPS_MAX: u32 = 60;
pub const SEGMENT_SECONDS_MAX: u64 = 1_000_000_000;
pub const UPSCALE_MAX: f32 = 10.0;

/// QR error-correction level, lowest to highest redundancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCorrection {
    Low,
    Medium,
    Quartile,
    High,
}

impl ErrorCorrection {
    pub fn from_level(level: u8) -> Result<Self> {
        Ok(match level {
            0 => Self::Low,
            1 => Self::Medium,
            2 => Self::Quartile,
            3 => Self::High,
            _ => bail!("error correction level must be 0-3, got {}", level),
        })
    }

    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn to_qr(self) -> qrcode::EcLevel {
        match self {
            Self::Low => qrcode::EcLevel::L,
            Self::Medium => qrcode::EcLevel::M,
            Self::Quartile => qrcode::EcLevel::Q,
            Self::High => qrcode::EcLevel::H,
        }
    }
}

impl fmt::Display for ErrorCorrection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "L",
            Self::Medium => "M",
            Self::Quartile => "Q",
            Self::High => "H",
        };
        write!(f, "{}({})", name, self.level())
    }
}

/// Raster size of a QR frame.
///
/// On the wire (the `resize` header field and the `--module-size` flag) this
/// is one signed integer: negative means `Auto` with `|n|`-pixel modules,
/// positive means a `Fixed` image side in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSize {
    Auto(u32),
    Fixed(u32),
}

impl ModuleSize {
    pub fn from_wire(n: i32) -> Result<Self> {
        if !(MODULE_SIZE_MIN..=MODULE_SIZE_MAX).contains(&n) || n == 0 {
            bail!(
                "module size must be in {}..={} and non-zero, got {}",
                MODULE_SIZE_MIN,
                MODULE_SIZE_MAX,
                n
            );
        }
        Ok(if n < 0 {
            Self::Auto(n.unsigned_abs())
        } else {
            Self::Fixed(n as u32)
        })
    }

    pub fn to_wire(self) -> i32 {
        match self {
            Self::Auto(px) => -(px as i32),
            Self::Fixed(px) => px as i32,
        }
    }

    /// Pixels per module for a symbol `modules` wide (quiet zone included).
    pub fn module_px(self, modules: u32) -> u32 {
        match self {
            Self::Auto(px) => px.max(1),
            Self::Fixed(side) => (side / modules.max(1)).max(1),
        }
    }
}

impl fmt::Display for ModuleSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto(px) => write!(f, "auto({}px/module)", px),
            Self::Fixed(side) => write!(f, "fixed({}px)", side),
        }
    }
}

/// Scale applied to decoded frames before recognition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Upscale {
    Auto,
    Factor(f32),
}

impl Upscale {
    /// `-1` selects `Auto`; anything else must be in `(0, 10]`.
    pub fn from_flag(x: f32) -> Result<Self> {
        if x == -1.0 {
            return Ok(Self::Auto);
        }
        if !(x > 0.0 && x <= UPSCALE_MAX) {
            bail!("upscale must be -1 (auto) or 0 < x <= {}, got {}", UPSCALE_MAX, x);
        }
        Ok(Self::Factor(x))
    }

    /// Resolve against the `resize` wire value recorded by the encoder.
    ///
    /// For auto-fit frames the value is `numerator / module_px`. A positive
    /// `resize` is an image side, not a module size, so fixed-size frames are
    /// recognized at their native scale.
    pub fn resolve(self, resize: i32, numerator: f32) -> f32 {
        match self {
            Self::Factor(x) => x,
            Self::Auto if resize > 0 => 1.0,
            Self::Auto => {
                let px = resize.unsigned_abs().max(1) as f32;
                (numerator / px).clamp(0.05, UPSCALE_MAX)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum Preset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    Medium,
    Slow,
    Slower,
    Veryslow,
    Placebo,
}

impl Preset {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ultrafast => "ultrafast",
            Self::Superfast => "superfast",
            Self::Veryfast => "veryfast",
            Self::Faster => "faster",
            Self::Fast => "fast",
            Self::Medium => "medium",
            Self::Slow => "slow",
            Self::Slower => "slower",
            Self::Veryslow => "veryslow",
            Self::Placebo => "placebo",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodeConfig {
    pub error_correction: ErrorCorrection,
    pub module_size: ModuleSize,
    pub slice_len: usize,
    pub fps: u32,
    pub segment_seconds: u64,
    pub preset: Preset,
    pub crf: u8,
    pub output_root: Option<PathBuf>,
    pub force: bool,
    pub workers: usize,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            error_correction: ErrorCorrection::Low,
            module_size: ModuleSize::Auto(8),
            slice_len: 350,
            fps: 24,
            segment_seconds: 35_999,
            preset: Preset::Ultrafast,
            crf: 18,
            output_root: None,
            force: false,
            workers: default_workers(),
        }
    }
}

impl EncodeConfig {
    pub fn validate(&self) -> Result<()> {
        if !(SLICE_LEN_MIN..=SLICE_LEN_MAX).contains(&self.slice_len) {
            bail!(
                "slice length must be {}-{}, got {}",
                SLICE_LEN_MIN,
                SLICE_LEN_MAX,
                self.slice_len
            );
        }
        if !(1..=FPS_MAX).contains(&self.fps) {
            bail!("fps must be 1-{}, got {}", FPS_MAX, self.fps);
        }
        if !(1..=SEGMENT_SECONDS_MAX).contains(&self.segment_seconds) {
            bail!(
                "segment seconds must be 1-{}, got {}",
                SEGMENT_SECONDS_MAX,
                self.segment_seconds
            );
        }
        ModuleSize::from_wire(self.module_size.to_wire())?;
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DecodeConfig {
    pub upscale: Upscale,
    pub upscale_numerator: f32,
    pub hashes: Vec<String>,
    pub output_dir: Option<PathBuf>,
    pub interactive: bool,
    pub fallback_script: Option<PathBuf>,
    pub fallback_interpreter: String,
    pub workers: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            upscale: Upscale::Auto,
            upscale_numerator: 4.0,
            hashes: Vec::new(),
            output_dir: None,
            interactive: false,
            fallback_script: None,
            fallback_interpreter: default_interpreter().to_string(),
            workers: default_workers(),
        }
    }
}

impl DecodeConfig {
    pub fn validate(&self) -> Result<()> {
        if let Upscale::Factor(x) = self.upscale {
            Upscale::from_flag(x)?;
        }
        if !(self.upscale_numerator > 0.0) {
            bail!("upscale numerator must be positive");
        }
        for h in &self.hashes {
            if h.len() != 64 || !h.bytes().all(|b| b.is_ascii_hexdigit()) {
                bail!("--hash must be 64 hex characters, got {:?}", h);
            }
        }
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        Ok(())
    }
}

pub fn default_workers() -> usize {
    num_cpus::get().clamp(1, 8)
}

pub fn default_interpreter() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_size_wire_keeps_sign_meaning() {
        assert_eq!(ModuleSize::from_wire(-8).unwrap(), ModuleSize::Auto(8));
        assert_eq!(ModuleSize::from_wire(400).unwrap(), ModuleSize::Fixed(400));
        assert_eq!(ModuleSize::Auto(8).to_wire(), -8);
        assert_eq!(ModuleSize::Fixed(400).to_wire(), 400);
        assert!(ModuleSize::from_wire(0).is_err());
        assert!(ModuleSize::from_wire(-17).is_err());
        assert!(ModuleSize::from_wire(1001).is_err());
    }

    #[test]
    fn fixed_module_size_divides_side() {
        assert_eq!(ModuleSize::Fixed(400).module_px(41), 9);
        assert_eq!(ModuleSize::Fixed(10).module_px(41), 1);
        assert_eq!(ModuleSize::Auto(3).module_px(41), 3);
    }

    #[test]
    fn auto_upscale_uses_numerator_over_resize() {
        assert_eq!(Upscale::Auto.resolve(-8, 4.0), 0.5);
        assert_eq!(Upscale::Auto.resolve(-2, 4.0), 2.0);
        assert_eq!(Upscale::Auto.resolve(-8, 8.0), 1.0);
        assert_eq!(Upscale::Factor(1.5).resolve(-8, 4.0), 1.5);
    }

    #[test]
    fn auto_upscale_leaves_fixed_frames_alone() {
        assert_eq!(Upscale::Auto.resolve(600, 4.0), 1.0);
        assert_eq!(Upscale::Auto.resolve(1000, 4.0), 1.0);
        assert_eq!(Upscale::Factor(0.5).resolve(600, 4.0), 0.5);
    }

    #[test]
    fn upscale_flag_rejects_non_positive() {
        assert_eq!(Upscale::from_flag(-1.0).unwrap(), Upscale::Auto);
        assert!(Upscale::from_flag(0.0).is_err());
        assert!(Upscale::from_flag(-2.0).is_err());
        assert!(Upscale::from_flag(10.5).is_err());
        assert_eq!(Upscale::from_flag(10.0).unwrap(), Upscale::Factor(10.0));
    }

    #[test]
    fn encode_config_ranges() {
        assert!(EncodeConfig::default().validate().is_ok());

        let cfg = EncodeConfig {
            slice_len: 49,
            ..EncodeConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = EncodeConfig {
            fps: 0,
            ..EncodeConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = EncodeConfig {
            segment_seconds: 0,
            ..EncodeConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn decode_config_checks_hash_shape() {
        let mut cfg = DecodeConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.hashes.push("abc".into());
        assert!(cfg.validate().is_err());
        cfg.hashes = vec!["a".repeat(64)];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn error_correction_levels() {
        assert_eq!(ErrorCorrection::from_level(0).unwrap(), ErrorCorrection::Low);
        assert_eq!(ErrorCorrection::from_level(3).unwrap(), ErrorCorrection::High);
        assert!(ErrorCorrection::from_level(4).is_err());
        assert_eq!(ErrorCorrection::Quartile.level(), 2);
    }
}
