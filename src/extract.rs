//! Reading segment videos back: probe, index-frame read, full frame stream.

use crate::frame::{self, IndexHeader};
use crate::pipe::{self, ProcessPipe};
use crate::recognize::{Cascade, FrameContext};

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Stream geometry reported by ffprobe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoProbe {
    pub width: u32,
    pub height: u32,
    pub frame_count: u64,
}

impl VideoProbe {
    /// Size of one raw rgb24 frame.
    pub fn frame_bytes(&self) -> usize {
        (self.width as usize) * (self.height as usize) * 3
    }
}

pub fn probe(path: &Path) -> Result<VideoProbe> {
    let dims = pipe::run_capture(
        "ffprobe",
        probe_args(path, "stream=width,height", "csv=p=0"),
    )
    .with_context(|| format!("probe dimensions of {}", path.display()))?;
    let (width, height) = parse_dimensions(&dims)
        .with_context(|| format!("unreadable video {}", path.display()))?;

    let count = pipe::run_capture(
        "ffprobe",
        probe_args(
            path,
            "stream=nb_frames",
            "default=nokey=1:noprint_wrappers=1",
        ),
    )
    .with_context(|| format!("probe frame count of {}", path.display()))?;
    let frame_count = parse_frame_count(&count)
        .with_context(|| format!("unreadable video {}", path.display()))?;

    Ok(VideoProbe {
        width,
        height,
        frame_count,
    })
}

fn probe_args(path: &Path, entries: &str, format: &str) -> Vec<OsString> {
    vec![
        "-v".into(),
        "error".into(),
        "-select_streams".into(),
        "v:0".into(),
        "-show_entries".into(),
        entries.into(),
        "-of".into(),
        format.into(),
        path.as_os_str().to_owned(),
    ]
}

fn integers(text: &str) -> Vec<u64> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|t| !t.is_empty())
        .filter_map(|t| t.parse().ok())
        .collect()
}

fn parse_dimensions(text: &str) -> Result<(u32, u32)> {
    let nums = integers(text);
    if nums.len() != 2 {
        bail!("expected width,height from ffprobe, got {:?}", text.trim());
    }
    let (w, h) = (nums[0], nums[1]);
    if w == 0 || h == 0 || w > u32::MAX as u64 || h > u32::MAX as u64 {
        bail!("implausible frame size {}x{}", w, h);
    }
    Ok((w as u32, h as u32))
}

fn parse_frame_count(text: &str) -> Result<u64> {
    let nums = integers(text);
    if nums.len() != 1 {
        bail!("expected one frame count from ffprobe, got {:?}", text.trim());
    }
    Ok(nums[0])
}

fn decoder_args(path: &Path, first_only: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        path.as_os_str().to_owned(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
    ];
    if first_only {
        args.push("-frames:v".into());
        args.push("1".into());
    }
    args.push("pipe:1".into());
    args
}

/// Decode only frame 0 and parse it as an index header.
///
/// Runs at upscale 1.0 through `cascade`, which must not contain an
/// interactive stage. The decoder is killed as soon as the frame is in.
pub fn read_header(path: &Path, probe: &VideoProbe, cascade: &Cascade) -> Result<IndexHeader> {
    let mut pipe = ProcessPipe::spawn_reader("ffmpeg", decoder_args(path, true))
        .with_context(|| format!("start decoder for {}", path.display()))?;

    let mut buf = vec![0u8; probe.frame_bytes()];
    let n = pipe.read_frame(&mut buf)?;
    pipe.abandon();
    if n < buf.len() {
        bail!(
            "{} yielded {} of {} bytes for its first frame",
            path.display(),
            n,
            buf.len()
        );
    }

    let rgb = frame::raster_from_rgb(buf, probe.width, probe.height)
        .context("frame buffer does not match probed size")?;
    let ctx = FrameContext {
        source: path,
        position: 0,
    };
    let payload = frame::decode_frame(&rgb, 1.0, cascade, &ctx)
        .with_context(|| format!("index frame of {}", path.display()))?;
    let header = IndexHeader::from_payload(&payload)
        .with_context(|| format!("index frame of {}", path.display()))?;

    debug!(
        path = %path.display(),
        hash = %header.hash,
        index = header.index,
        len = header.len,
        "read index frame"
    );
    Ok(header)
}

/// Every frame of one video as raw rgb24 buffers, in display order.
///
/// Lazy and forward-only. The decoder is reaped (and its exit status checked)
/// when the stream ends; dropping the stream early kills it.
pub struct FrameStream {
    path: PathBuf,
    pipe: Option<ProcessPipe>,
    frame_bytes: usize,
    frames_read: u64,
}

impl FrameStream {
    pub fn open(path: &Path, probe: &VideoProbe) -> Result<Self> {
        let pipe = ProcessPipe::spawn_reader("ffmpeg", decoder_args(path, false))
            .with_context(|| format!("start decoder for {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            pipe: Some(pipe),
            frame_bytes: probe.frame_bytes(),
            frames_read: 0,
        })
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(pipe) = self.pipe.as_mut() else {
            return Ok(None);
        };

        let mut buf = vec![0u8; self.frame_bytes];
        let n = pipe.read_frame(&mut buf)?;
        if n == buf.len() {
            self.frames_read += 1;
            return Ok(Some(buf));
        }

        let pipe = self.pipe.take();
        if n > 0 {
            bail!(
                "trailing partial frame in {} after {} frames ({} of {} bytes)",
                self.path.display(),
                self.frames_read,
                n,
                self.frame_bytes
            );
        }
        if let Some(pipe) = pipe {
            pipe.finish()
                .with_context(|| format!("decode {}", self.path.display()))?;
        }
        Ok(None)
    }
}

impl Iterator for FrameStream {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_frame() {
            Ok(Some(buf)) => Some(Ok(buf)),
            Ok(None) => None,
            Err(err) => {
                self.pipe = None;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_need_exactly_two_integers() {
        assert_eq!(parse_dimensions("512,512\n").unwrap(), (512, 512));
        assert_eq!(parse_dimensions("640,480,\n").unwrap(), (640, 480));
        assert!(parse_dimensions("").is_err());
        assert!(parse_dimensions("512\n").is_err());
        assert!(parse_dimensions("512,512\n256,256\n").is_err());
        assert!(parse_dimensions("0,512").is_err());
    }

    #[test]
    fn frame_count_needs_one_integer() {
        assert_eq!(parse_frame_count("4\n").unwrap(), 4);
        assert!(parse_frame_count("N/A\n").is_err());
        assert!(parse_frame_count("4\n5\n").is_err());
    }

    #[test]
    fn decoder_args_limit_frames_for_header_reads() {
        let one = decoder_args(Path::new("a.mp4"), true);
        assert!(one.iter().any(|a| a == "-frames:v"));
        assert_eq!(one.last(), Some(&OsString::from("pipe:1")));

        let all = decoder_args(Path::new("a.mp4"), false);
        assert!(!all.iter().any(|a| a == "-frames:v"));
    }

    #[test]
    fn probe_frame_bytes() {
        let p = VideoProbe {
            width: 10,
            height: 4,
            frame_count: 2,
        };
        assert_eq!(p.frame_bytes(), 120);
    }
}
