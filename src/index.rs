use crate::extract::{self, FrameStream, VideoProbe};
use crate::frame::{self, IndexHeader};
use crate::pool;
use crate::progress::ProgressHandle;
use crate::recognize::{Cascade, FrameContext};
use crate::util;

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SegmentSlot {
    pub path: PathBuf,
    pub probe: VideoProbe,
}

#[derive(Debug, Clone)]
pub struct ReconstructionEntry {
    /// Geometry of the first segment seen; each slot keeps its own probe.
    pub width: u32,
    pub height: u32,
    pub frame_count: u64,
    pub name: String,
    pub len: u64,
    pub resize: i32,
    pub slots: Vec<Option<SegmentSlot>>,
}

impl ReconstructionEntry {
    fn new(header: &IndexHeader, probe: &VideoProbe) -> Self {
        Self {
            width: probe.width,
            height: probe.height,
            frame_count: probe.frame_count,
            name: header.name.clone(),
            len: header.len,
            resize: header.resize,
            slots: vec![None; header.len as usize],
        }
    }

    pub fn is_complete(&self) -> bool {
        self.slots.len() as u64 == self.len && self.slots.iter().all(Option::is_some)
    }

    pub fn found(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Declared segment numbers with no video yet.
    pub fn missing(&self) -> Vec<u64> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i as u64)
            .collect()
    }

    pub fn paths(&self) -> impl Iterator<Item = (u64, &Path)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i as u64, s.path.as_path())))
    }
}

#[derive(Debug, Default)]
pub struct ReconstructionIndex {
    entries: BTreeMap<String, ReconstructionEntry>,
}

impl ReconstructionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `path` as segment `header.index` of file `header.hash`.
    ///
    /// A later video for an already filled slot replaces the earlier one.
    /// Declarations that disagree with the entry (total count, name) or fall
    /// outside it are rejected and leave the index untouched.
    pub fn upsert(&mut self, header: &IndexHeader, path: &Path, probe: VideoProbe) -> Result<()> {
        if header.len == 0 || header.len > frame::MAX_SEGMENTS || header.index >= header.len {
            bail!(
                "{}: segment {} out of range for {} segments",
                path.display(),
                header.index,
                header.len
            );
        }

        let entry = self
            .entries
            .entry(header.hash.clone())
            .or_insert_with(|| ReconstructionEntry::new(header, &probe));

        if entry.len != header.len {
            bail!(
                "{}: declares {} segments for {} but {} were declared earlier",
                path.display(),
                header.len,
                header.hash,
                entry.len
            );
        }
        if entry.name != header.name {
            bail!(
                "{}: declares name {:?} for {} but {:?} was declared earlier",
                path.display(),
                header.name,
                header.hash,
                entry.name
            );
        }

        let slot = &mut entry.slots[header.index as usize];
        if let Some(prev) = slot.as_ref() {
            if prev.path != path {
                debug!(
                    hash = %header.hash,
                    index = header.index,
                    "replacing {} with {}",
                    prev.path.display(),
                    path.display()
                );
            }
        }
        *slot = Some(SegmentSlot {
            path: path.to_path_buf(),
            probe,
        });
        Ok(())
    }

    pub fn get(&self, hash: &str) -> Option<&ReconstructionEntry> {
        self.entries.get(hash)
    }

    pub fn is_complete(&self, hash: &str) -> bool {
        self.entries.get(hash).is_some_and(ReconstructionEntry::is_complete)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &ReconstructionEntry)> + '_ {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of scanning candidate videos.
#[derive(Debug, Default)]
pub struct Discovery {
    pub index: ReconstructionIndex,
    pub scanned: usize,
    pub skipped: Vec<(PathBuf, String)>,
}

/// Read the index frame of every candidate and build the table.
///
/// Candidates that cannot be probed, read or parsed, and those whose header
/// conflicts with the table, are logged and skipped.
pub fn discover(
    candidates: &[PathBuf],
    cascade: &Cascade,
    workers: usize,
    progress: &ProgressHandle,
) -> Result<Discovery> {
    let mut out = Discovery::default();

    let inputs = candidates.iter().map(|p| Ok::<_, anyhow::Error>(p.as_path()));
    let read = |_seq: u64, path: &Path| -> Result<(PathBuf, Result<(VideoProbe, IndexHeader)>)> {
        let res = extract::probe(path)
            .and_then(|probe| extract::read_header(path, &probe, cascade).map(|h| (probe, h)));
        Ok((path.to_path_buf(), res))
    };

    pool::ordered_map(inputs, workers, workers * 2, read, |_, (path, res)| {
        out.scanned += 1;
        progress.set_op("discover", format!("{}/{}", out.scanned, candidates.len()));
        let applied = res.and_then(|(probe, header)| out.index.upsert(&header, &path, probe));
        if let Err(err) = applied {
            warn!(path = %path.display(), "skipping video: {:#}", err);
            out.skipped.push((path, format!("{:#}", err)));
        }
        Ok(())
    })?;
    progress.clear_op("discover");

    Ok(out)
}

#[derive(Debug, Clone)]
pub struct AssemblyReport {
    pub output: PathBuf,
    pub bytes_written: u64,
    pub frames_decoded: u64,
    pub actual_hash: String,
    pub matches: bool,
}

/// Decoding knobs for one assembly.
pub struct AssemblyOptions<'a> {
    pub cascade: &'a Cascade,
    pub upscale: f32,
    pub workers: usize,
}

/// Reassemble a complete entry into `output` and verify its hash.
///
/// Frames are decoded in parallel but written strictly in (segment, position)
/// order. Any frame that no recognizer can read aborts the file; bytes
/// already written stay on disk and are not authoritative.
pub fn assemble(
    hash: &str,
    entry: &ReconstructionEntry,
    output: &Path,
    opts: &AssemblyOptions<'_>,
    progress: &ProgressHandle,
) -> Result<AssemblyReport> {
    if !entry.is_complete() {
        bail!(
            "{} ({}) is missing segments {:?}",
            entry.name,
            hash,
            entry.missing()
        );
    }

    let file = File::create(output).with_context(|| format!("create {}", output.display()))?;
    let mut writer = BufWriter::with_capacity(1024 * 1024, file);
    let mut bytes_written = 0u64;
    let mut frames_decoded = 0u64;

    for (i, slot) in entry.slots.iter().enumerate() {
        let Some(slot) = slot else {
            bail!("segment {} of {} vanished during assembly", i, hash);
        };
        let op_id = format!("segment {}/{}", i + 1, entry.len);
        progress.set_stage(format!("decode {} {}", op_id, util::file_name_of(&slot.path)));

        let (seg_bytes, seg_frames, frames_read) = assemble_segment(slot, opts, &mut writer, progress)
            .with_context(|| format!("segment {} ({})", i, slot.path.display()))?;
        bytes_written += seg_bytes;
        frames_decoded += seg_frames;

        if frames_read != slot.probe.frame_count {
            warn!(
                path = %slot.path.display(),
                "read {} frames but ffprobe reported {}",
                frames_read,
                slot.probe.frame_count
            );
            progress.warning(format!(
                "{}: read {} frames, probe reported {}",
                slot.path.display(),
                frames_read,
                slot.probe.frame_count
            ));
        }
    }

    writer
        .flush()
        .with_context(|| format!("flush {}", output.display()))?;
    drop(writer);

    progress.set_stage("verify hash");
    let (actual_hash, matches) = verify_output(hash, output)?;

    Ok(AssemblyReport {
        output: output.to_path_buf(),
        bytes_written,
        frames_decoded,
        actual_hash,
        matches,
    })
}

/// Hash a reconstructed file and compare it with the declared hash. The file
/// is left in place either way.
pub fn verify_output(expected: &str, output: &Path) -> Result<(String, bool)> {
    let actual = util::sha256_file(output)?;
    let matches = actual == expected;
    if !matches {
        warn!(
            output = %output.display(),
            expected,
            actual = %actual,
            "hash mismatch"
        );
    }
    Ok((actual, matches))
}

fn assemble_segment(
    slot: &SegmentSlot,
    opts: &AssemblyOptions<'_>,
    writer: &mut impl Write,
    progress: &ProgressHandle,
) -> Result<(u64, u64, u64)> {
    let probe = slot.probe;
    let mut stream = FrameStream::open(&slot.path, &probe)?;

    // Frame 0 is the index frame; data starts at position 1.
    match stream.next() {
        Some(Ok(_)) => {}
        Some(Err(err)) => return Err(err),
        None => bail!("video has no frames"),
    }

    let mut bytes = 0u64;
    let decode = |seq: u64, buf: Vec<u8>| -> Result<Vec<u8>> {
        let rgb = frame::raster_from_rgb(buf, probe.width, probe.height)
            .context("frame buffer does not match probed size")?;
        let ctx = FrameContext {
            source: &slot.path,
            position: seq + 1,
        };
        Ok(frame::decode_frame(&rgb, opts.upscale, opts.cascade, &ctx)?)
    };

    let frames = pool::ordered_map(
        &mut stream,
        opts.workers,
        opts.workers * 4,
        decode,
        |_, payload| {
            writer.write_all(&payload).context("write decoded bytes")?;
            bytes += payload.len() as u64;
            progress.advance(1);
            Ok(())
        },
    )?;

    Ok((bytes, frames, stream.frames_read()))
}
