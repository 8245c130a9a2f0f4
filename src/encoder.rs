use crate::config::EncodeConfig;
use crate::frame::{self, Canvas, IndexHeader};
use crate::pipe::ProcessPipe;
use crate::plan::SegmentationPlan;
use crate::pool;
use crate::progress::{
    average_rate, EncodeSummary, EncodedFile, ProgressConfig, ProgressHandle, ProgressReporter,
    Unit,
};
use crate::util;

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error};

/// Lifecycle of one segment video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Init,
    StreamingHeader,
    StreamingData,
    Finalizing,
    Done,
    Failed,
}

/// Encode a file, or every file under a directory.
///
/// Per-file failures are collected into the summary and the batch goes on;
/// configuration errors abort before anything is written.
pub fn encode_path(
    input: &Path,
    cfg: &EncodeConfig,
    progress_cfg: ProgressConfig,
) -> Result<EncodeSummary> {
    cfg.validate()?;
    // A full data slice must fit a QR symbol at this level.
    frame::encode_symbol(&vec![0u8; cfg.slice_len], cfg.error_correction)?;

    let (files, base) = if input.is_dir() {
        (util::list_input_files(input)?, Some(input))
    } else if input.is_file() {
        (vec![input.to_path_buf()], None)
    } else {
        bail!("input {} does not exist", input.display());
    };
    if files.is_empty() {
        bail!("no files to encode under {}", input.display());
    }

    let mut total_bytes = 0u64;
    for f in &files {
        total_bytes += std::fs::metadata(f)
            .with_context(|| format!("stat {}", f.display()))?
            .len();
    }

    let started = Instant::now();
    let reporter = ProgressReporter::new("encode", Unit::Bytes, total_bytes, progress_cfg);
    let progress = reporter.handle();

    let mut encoded = Vec::new();
    let mut failed = Vec::new();
    for (i, path) in files.iter().enumerate() {
        progress.set_op("file", format!("{}/{} {}", i + 1, files.len(), path.display()));
        let out_root = output_root_for(path, base, cfg.output_root.as_deref());
        match encode_file(path, out_root.as_deref(), cfg, &progress) {
            Ok(file) => encoded.push(file),
            Err(err) => {
                error!(path = %path.display(), "encode failed: {:#}", err);
                progress.warning(format!("{}: {:#}", path.display(), err));
                failed.push((path.clone(), format!("{:#}", err)));
            }
        }
    }
    progress.clear_op("file");

    let outcome = reporter.finish(format!(
        "encoded {} of {} file(s)",
        encoded.len(),
        files.len()
    ));
    let elapsed = started.elapsed();

    Ok(EncodeSummary {
        input: input.to_path_buf(),
        total_bytes,
        processed_bytes: outcome.done,
        files: encoded,
        failed,
        workers: cfg.workers,
        elapsed,
        avg_bytes_per_sec: average_rate(outcome.done, elapsed),
        warning_count: outcome.warning_count,
        warnings: outcome.warnings,
    })
}

/// Parent of the output directory for `file`: `--output` (mirroring the
/// layout below an input directory) or beside the file.
fn output_root_for(file: &Path, base: Option<&Path>, root: Option<&Path>) -> Option<PathBuf> {
    let root = root?;
    let rel_parent = base
        .and_then(|b| file.parent()?.strip_prefix(b).ok())
        .map(Path::to_path_buf)
        .unwrap_or_default();
    Some(root.join(rel_parent))
}

fn prepare_output_dir(dir: &Path, force: bool) -> Result<()> {
    if dir.exists() {
        if !force {
            bail!(
                "output directory {} already exists (use --force to replace it)",
                dir.display()
            );
        }
        std::fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))?;
    }
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))
}

fn encode_file(
    path: &Path,
    out_root: Option<&Path>,
    cfg: &EncodeConfig,
    progress: &ProgressHandle,
) -> Result<EncodedFile> {
    let name = util::file_name_of(path);
    let file_len = std::fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .len();

    progress.set_stage(format!("hash {}", name));
    let hash = util::sha256_file(path)?;

    let plan = SegmentationPlan::new(file_len, cfg.slice_len, cfg.fps, cfg.segment_seconds);
    if plan.segment_count > frame::MAX_SEGMENTS {
        bail!(
            "{} would need {} segments (max {}); raise --segment-seconds or --slice-len",
            path.display(),
            plan.segment_count,
            frame::MAX_SEGMENTS
        );
    }
    let out_dir = util::output_dir_for(path, out_root);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());

    progress.log(format!(
        "Encode plan: file={} output={} len={} slice={} ecc={} module={} fps={} segmented={} segments={} frames={} frames_per_segment={} duration={}s preset={} hash={}",
        path.display(),
        util::segment_path(&out_dir, &stem, 0, plan.segment_count).display(),
        file_len,
        cfg.slice_len,
        cfg.error_correction,
        cfg.module_size,
        cfg.fps,
        plan.is_segmented(),
        plan.segment_count,
        plan.total_frames,
        plan.frames_per_segment,
        plan.duration_secs(cfg.fps),
        cfg.preset.as_str(),
        hash
    ));

    prepare_output_dir(&out_dir, cfg.force)?;

    let mut segments = Vec::with_capacity(plan.segment_count as usize);
    let mut frames = 0u64;
    for (s, range) in plan.segments().enumerate() {
        let s = s as u64;
        let out_path = util::segment_path(&out_dir, &stem, s, plan.segment_count);
        let header = IndexHeader {
            hash: hash.clone(),
            name: name.clone(),
            index: s,
            len: plan.segment_count,
            resize: cfg.module_size.to_wire(),
        };
        progress.set_stage(format!(
            "segment {}/{} of {}",
            s + 1,
            plan.segment_count,
            name
        ));

        let mut seg = SegmentEncoder::new(cfg, header, out_path.clone());
        let res = seg.run(path, range, progress);
        debug!(path = %out_path.display(), state = ?seg.state(), "segment finished");
        let written = res.with_context(|| format!("segment {} ({})", s, out_path.display()))?;
        if written != plan.segment_frames(s) + 1 {
            bail!(
                "segment {} wrote {} frame(s), planned {}",
                s,
                written,
                plan.segment_frames(s) + 1
            );
        }
        frames += written;
        segments.push(out_path);
    }

    Ok(EncodedFile {
        source: path.to_path_buf(),
        hash,
        output_dir: out_dir,
        segments,
        frames,
    })
}

/// Writes one segment video: the index frame, then the data frames of its
/// byte range, into a transcoder fed raw rgb24 on stdin.
pub struct SegmentEncoder<'a> {
    cfg: &'a EncodeConfig,
    header: IndexHeader,
    out_path: PathBuf,
    state: SegmentState,
    canvas: Option<Canvas>,
    pipe: Option<ProcessPipe>,
    frames_written: u64,
}

impl<'a> SegmentEncoder<'a> {
    pub fn new(cfg: &'a EncodeConfig, header: IndexHeader, out_path: PathBuf) -> Self {
        Self {
            cfg,
            header,
            out_path,
            state: SegmentState::Init,
            canvas: None,
            pipe: None,
            frames_written: 0,
        }
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// Drive the segment from `Init` to `Done`. Returns the frames written.
    pub fn run(&mut self, source: &Path, range: Range<u64>, progress: &ProgressHandle) -> Result<u64> {
        let res = self.run_inner(source, range, progress);
        if res.is_err() {
            self.state = SegmentState::Failed;
            // Kills the transcoder if it is still running.
            self.pipe = None;
        }
        res
    }

    fn run_inner(&mut self, source: &Path, range: Range<u64>, progress: &ProgressHandle) -> Result<u64> {
        let header_img = self.start()?;
        self.write_header(&header_img)?;
        self.write_data(source, range, progress)?;
        self.finish()?;
        Ok(self.frames_written)
    }

    fn expect_state(&self, want: SegmentState) -> Result<()> {
        if self.state != want {
            bail!("segment encoder in state {:?}, expected {:?}", self.state, want);
        }
        Ok(())
    }

    fn start(&mut self) -> Result<image::GrayImage> {
        self.expect_state(SegmentState::Init)?;
        let payload = self.header.to_payload()?;
        let header_img =
            frame::encode_frame(&payload, self.cfg.module_size, self.cfg.error_correction)?;
        let canvas = Canvas::for_segment(
            &header_img,
            self.cfg.slice_len,
            self.cfg.module_size,
            self.cfg.error_correction,
        )?;
        debug!(
            path = %self.out_path.display(),
            side = canvas.side,
            "starting transcoder"
        );

        let pipe = ProcessPipe::spawn_writer("ffmpeg", transcoder_args(self.cfg, canvas.side, &self.out_path))?;
        self.canvas = Some(canvas);
        self.pipe = Some(pipe);
        self.state = SegmentState::StreamingHeader;
        Ok(header_img)
    }

    fn write_header(&mut self, header_img: &image::GrayImage) -> Result<()> {
        self.expect_state(SegmentState::StreamingHeader)?;
        let (canvas, pipe) = self.parts()?;
        pipe.write_all(&canvas.compose_rgb(header_img))?;
        self.frames_written += 1;
        self.state = SegmentState::StreamingData;
        Ok(())
    }

    fn write_data(&mut self, source: &Path, range: Range<u64>, progress: &ProgressHandle) -> Result<()> {
        self.expect_state(SegmentState::StreamingData)?;
        let cfg = self.cfg;
        let slices = SliceReader::open(source, range, cfg.slice_len)?;
        let (canvas, pipe) = self.parts()?;

        let render = |_seq: u64, chunk: Vec<u8>| -> Result<(usize, Vec<u8>)> {
            let img = frame::encode_frame(&chunk, cfg.module_size, cfg.error_correction)?;
            Ok((chunk.len(), canvas.compose_rgb(&img)))
        };
        let written = pool::ordered_map(slices, cfg.workers, cfg.workers * 2, render, |_, (n, rgb)| {
            pipe.write_all(&rgb)?;
            progress.advance(n as u64);
            Ok(())
        })?;

        self.frames_written += written;
        self.state = SegmentState::Finalizing;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.expect_state(SegmentState::Finalizing)?;
        let pipe = self.pipe.take().context("transcoder not running")?;
        pipe.finish()?;
        self.state = SegmentState::Done;
        Ok(())
    }

    fn parts(&mut self) -> Result<(Canvas, &mut ProcessPipe)> {
        let canvas = self.canvas.context("canvas not computed")?;
        let pipe = self.pipe.as_mut().context("transcoder not running")?;
        Ok((canvas, pipe))
    }
}

fn transcoder_args(cfg: &EncodeConfig, side: u32, out: &Path) -> Vec<OsString> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-s".into(),
        format!("{}x{}", side, side).into(),
        "-r".into(),
        cfg.fps.to_string().into(),
        "-i".into(),
        "pipe:0".into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        cfg.preset.as_str().into(),
        "-crf".into(),
        cfg.crf.to_string().into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        out.as_os_str().to_owned(),
    ]
}

/// Consecutive `slice_len` chunks of one byte range of a file.
struct SliceReader {
    reader: BufReader<File>,
    remaining: u64,
    slice_len: usize,
}

impl SliceReader {
    fn open(path: &Path, range: Range<u64>, slice_len: usize) -> Result<Self> {
        let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
        f.seek(SeekFrom::Start(range.start))
            .with_context(|| format!("seek {} to {}", path.display(), range.start))?;
        Ok(Self {
            reader: BufReader::with_capacity(1024 * 1024, f),
            remaining: range.end.saturating_sub(range.start),
            slice_len,
        })
    }
}

impl Iterator for SliceReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let take = (self.slice_len as u64).min(self.remaining) as usize;
        let mut buf = vec![0u8; take];
        if let Err(err) = self.reader.read_exact(&mut buf) {
            self.remaining = 0;
            return Some(Err(anyhow::Error::new(err).context("source file shrank while encoding")));
        }
        self.remaining -= take as u64;
        Some(Ok(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Preset;

    #[test]
    fn slices_cover_range_with_short_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("data.bin");
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&p, &data).unwrap();

        let chunks: Vec<Vec<u8>> = SliceReader::open(&p, 100..1000, 350)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            chunks.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![350, 350, 200]
        );
        assert_eq!(chunks.concat(), data[100..1000].to_vec());

        assert_eq!(SliceReader::open(&p, 0..0, 350).unwrap().count(), 0);
    }

    #[test]
    fn slice_reader_reports_truncated_source() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("short.bin");
        std::fs::write(&p, [1u8; 10]).unwrap();
        let mut r = SliceReader::open(&p, 0..20, 8).unwrap();
        assert!(r.next().unwrap().is_ok());
        assert!(r.next().unwrap().is_err());
        assert!(r.next().is_none());
    }

    #[test]
    fn transcoder_args_match_pipe_contract() {
        let cfg = EncodeConfig {
            fps: 24,
            preset: Preset::Veryfast,
            ..EncodeConfig::default()
        };
        let args: Vec<String> = transcoder_args(&cfg, 410, Path::new("o/x.mp4"))
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt rgb24 -s 410x410 -r 24 -i pipe:0"));
        assert!(joined.contains("-c:v libx264 -preset veryfast -crf 18 -pix_fmt yuv420p"));
        assert_eq!(args.last().map(String::as_str), Some("o/x.mp4"));
    }

    #[test]
    fn output_root_mirrors_input_layout() {
        let base = Path::new("/in");
        assert_eq!(
            output_root_for(Path::new("/in/a/b.txt"), Some(base), Some(Path::new("/out"))),
            Some(PathBuf::from("/out/a"))
        );
        assert_eq!(
            output_root_for(Path::new("/in/b.txt"), None, Some(Path::new("/out"))),
            Some(PathBuf::from("/out"))
        );
        assert_eq!(output_root_for(Path::new("/in/b.txt"), Some(base), None), None);
    }

    #[test]
    fn existing_output_needs_force() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("output_x_txt");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("stale.mp4"), b"old").unwrap();

        let err = prepare_output_dir(&dir, false).unwrap_err();
        assert!(err.to_string().contains("--force"));
        assert!(dir.join("stale.mp4").exists());

        prepare_output_dir(&dir, true).unwrap();
        assert!(dir.is_dir());
        assert!(!dir.join("stale.mp4").exists());
    }

    #[test]
    fn encoder_starts_in_init() {
        let cfg = EncodeConfig::default();
        let header = IndexHeader {
            hash: "0".repeat(64),
            name: "x".into(),
            index: 0,
            len: 1,
            resize: -8,
        };
        let mut enc = SegmentEncoder::new(&cfg, header, PathBuf::from("x.mp4"));
        assert_eq!(enc.state(), SegmentState::Init);
        assert!(enc.finish().is_err());
        assert_eq!(enc.state(), SegmentState::Init);
    }
}
