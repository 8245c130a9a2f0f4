use crate::config::DecodeConfig;
use crate::index::{self, AssemblyOptions, AssemblyReport, Discovery, ReconstructionEntry};
use crate::progress::{
    average_rate, DecodeSummary, ProgressConfig, ProgressHandle, ProgressReporter, RestoreStatus,
    RestoredFile, Unit,
};
use crate::recognize::{
    Cascade, ConsolePrompt, ManualFallbackProvider, NoManualFallback, RecognizerOptions,
};
use crate::util;

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Rebuild files from every segment video found under `input`.
///
/// Discovery reads only the index frame of each candidate. Every requested
/// hash then gets a [`RestoreStatus`]; one failing file does not stop the
/// others.
pub fn decode_path(
    input: &Path,
    cfg: &DecodeConfig,
    progress_cfg: ProgressConfig,
) -> Result<DecodeSummary> {
    cfg.validate()?;

    let candidates = util::list_videos(input)?;
    if candidates.is_empty() {
        bail!("no .{} videos found under {}", util::VIDEO_EXT, input.display());
    }

    let output_dir = resolve_output_dir(input, cfg.output_dir.as_deref());
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("create {}", output_dir.display()))?;

    let opts = RecognizerOptions {
        fallback_script: cfg.fallback_script.clone(),
        interpreter: cfg.fallback_interpreter.clone(),
        work_dir: output_dir.clone(),
    };

    let started = Instant::now();
    let reporter = ProgressReporter::new("decode", Unit::Frames, 0, progress_cfg);
    let progress = reporter.handle();

    progress.set_stage(format!("discover {} video(s)", candidates.len()));
    let header_cascade = Cascade::for_header(&opts);
    let discovery = index::discover(&candidates, &header_cascade, cfg.workers, &progress)?;
    report_discovery(&discovery, &progress);
    if discovery.index.is_empty() {
        warn!("none of the {} candidate video(s) carried a readable index frame", candidates.len());
    }

    let manual: Arc<dyn ManualFallbackProvider> = if cfg.interactive {
        Arc::new(ConsolePrompt::new())
    } else {
        Arc::new(NoManualFallback)
    };
    let data_cascade = Cascade::for_data(&opts, manual);
    debug!(stages = ?data_cascade.stage_names(), "data frame recognizers");

    let selected = select_hashes(&discovery, &cfg.hashes);
    progress.add_total(data_frames(&discovery, &selected));

    let mut files = Vec::new();
    let mut used_outputs = HashSet::new();
    for hash in selected {
        let Some(entry) = discovery.index.get(&hash) else {
            warn!(hash = %hash, "no segment video declares this hash");
            progress.warning(format!("{}: not found among the input videos", hash));
            files.push(RestoredFile {
                hash,
                name: String::new(),
                output: None,
                bytes: 0,
                frames: 0,
                status: RestoreStatus::Unknown,
            });
            continue;
        };

        let output = unique_output(&output_dir, &hash, entry, &mut used_outputs);
        let restored = restore_one(&hash, entry, &output, cfg, &data_cascade, &progress);
        files.push(restored);
    }

    let verified = files.iter().filter(|f| f.status.is_ok()).count();
    let outcome = reporter.finish(format!("verified {} of {} file(s)", verified, files.len()));
    let elapsed = started.elapsed();
    let processed_bytes = files.iter().map(|f| f.bytes).sum();
    let frames_decoded = files.iter().map(|f| f.frames).sum();

    Ok(DecodeSummary {
        input: input.to_path_buf(),
        output_dir,
        candidates: candidates.len(),
        skipped: discovery.skipped.len(),
        entries: discovery.index.len(),
        files,
        frames_decoded,
        processed_bytes,
        workers: cfg.workers,
        elapsed,
        avg_bytes_per_sec: average_rate(processed_bytes, elapsed),
        warning_count: outcome.warning_count,
        warnings: outcome.warnings,
    })
}

fn resolve_output_dir(input: &Path, requested: Option<&Path>) -> PathBuf {
    if let Some(dir) = requested {
        return dir.to_path_buf();
    }
    if input.is_dir() {
        return input.to_path_buf();
    }
    input
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Requested hashes in order, or every discovered entry.
fn select_hashes(discovery: &Discovery, requested: &[String]) -> Vec<String> {
    if requested.is_empty() {
        return discovery.index.entries().map(|(h, _)| h.to_string()).collect();
    }
    let mut seen = HashSet::new();
    requested
        .iter()
        .map(|h| h.to_ascii_lowercase())
        .filter(|h| seen.insert(h.clone()))
        .collect()
}

/// Data frames (every frame but the index frame) of the complete entries
/// that will be assembled.
fn data_frames(discovery: &Discovery, selected: &[String]) -> u64 {
    selected
        .iter()
        .filter(|h| discovery.index.is_complete(h))
        .filter_map(|h| discovery.index.get(h))
        .flat_map(|entry| entry.slots.iter().flatten())
        .map(|slot| slot.probe.frame_count.saturating_sub(1))
        .sum()
}

/// Two files may share a name; the second one gets a hash suffix.
fn unique_output(
    dir: &Path,
    hash: &str,
    entry: &ReconstructionEntry,
    used: &mut HashSet<PathBuf>,
) -> PathBuf {
    let mut out = util::decoded_path(dir, &entry.name);
    if used.contains(&out) {
        out = util::decoded_path(dir, &format!("{}_{}", &hash[..8], util::safe_file_name(&entry.name)));
    }
    used.insert(out.clone());
    out
}

fn restore_one(
    hash: &str,
    entry: &ReconstructionEntry,
    output: &Path,
    cfg: &DecodeConfig,
    cascade: &Cascade,
    progress: &ProgressHandle,
) -> RestoredFile {
    let mut restored = RestoredFile {
        hash: hash.to_string(),
        name: entry.name.clone(),
        output: None,
        bytes: 0,
        frames: 0,
        status: RestoreStatus::Verified,
    };

    if !entry.is_complete() {
        let missing = entry.missing();
        warn!(hash, name = %entry.name, ?missing, "incomplete, skipping");
        progress.warning(format!(
            "{} ({}): {} of {} segment(s) found, missing {:?}",
            entry.name,
            hash,
            entry.found(),
            entry.len,
            missing
        ));
        restored.status = RestoreStatus::Incomplete { missing };
        return restored;
    }

    let upscale = cfg.upscale.resolve(entry.resize, cfg.upscale_numerator);
    info!(hash, name = %entry.name, upscale, "assembling {}", output.display());
    progress.set_op("file", format!("{} -> {}", entry.name, output.display()));

    let opts = AssemblyOptions {
        cascade,
        upscale,
        workers: cfg.workers,
    };
    let res = index::assemble(hash, entry, output, &opts, progress);
    progress.clear_op("file");

    match res {
        Ok(report) => record_assembly(&mut restored, report, progress),
        Err(err) => {
            error!(hash, name = %entry.name, "reconstruction failed: {:#}", err);
            progress.warning(format!("{} ({}): {:#}", entry.name, hash, err));
            restored.status = RestoreStatus::Failed(format!("{:#}", err));
        }
    }
    restored
}

/// Fold a finished assembly into `restored`. A mismatching file is kept and
/// reported, never deleted.
fn record_assembly(restored: &mut RestoredFile, report: AssemblyReport, progress: &ProgressHandle) {
    debug!(
        hash = %restored.hash,
        frames = report.frames_decoded,
        bytes = report.bytes_written,
        "assembled"
    );
    restored.bytes = report.bytes_written;
    restored.frames = report.frames_decoded;
    if !report.matches {
        progress.warning(format!(
            "{}: hash mismatch, expected {} got {} (file kept)",
            report.output.display(),
            restored.hash,
            report.actual_hash
        ));
        restored.status = RestoreStatus::HashMismatch {
            actual: report.actual_hash,
        };
    }
    restored.output = Some(report.output);
}

fn report_discovery(discovery: &Discovery, progress: &ProgressHandle) {
    progress.log(format!(
        "Discovered {} file(s) in {} video(s), {} skipped",
        discovery.index.len(),
        discovery.scanned,
        discovery.skipped.len()
    ));
    for (hash, entry) in discovery.index.entries() {
        progress.log(format!(
            "  hash={} name={} size={}x{} resize={} frames={} segments={}/{} complete={}",
            hash,
            entry.name,
            entry.width,
            entry.height,
            entry.resize,
            entry.frame_count,
            entry.found(),
            entry.len,
            discovery.index.is_complete(hash)
        ));
        for (i, path) in entry.paths() {
            progress.log(format!("    [{}] {}", i, path.display()));
        }
    }
    for (path, why) in &discovery.skipped {
        progress.log(format!("  skipped {}: {}", path.display(), why));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::VideoProbe;
    use crate::frame::IndexHeader;

    fn discovery_with(hashes: &[&str]) -> Discovery {
        let mut d = Discovery::default();
        for h in hashes {
            let header = IndexHeader {
                hash: h.to_string(),
                name: "a.bin".into(),
                index: 0,
                len: 1,
                resize: -8,
            };
            let probe = VideoProbe {
                width: 64,
                height: 64,
                frame_count: 2,
            };
            d.index.upsert(&header, Path::new("a.mp4"), probe).unwrap();
        }
        d
    }

    #[test]
    fn default_selection_is_every_entry() {
        let a = "a".repeat(64);
        let b = "b".repeat(64);
        let d = discovery_with(&[&b, &a]);
        assert_eq!(select_hashes(&d, &[]), vec![a, b]);
    }

    #[test]
    fn progress_total_counts_data_frames_of_complete_entries() {
        let a = "a".repeat(64);
        let b = "b".repeat(64);
        let d = discovery_with(&[&a, &b]);
        // One index frame plus one data frame per video.
        assert_eq!(data_frames(&d, &[a.clone(), b.clone()]), 2);
        assert_eq!(data_frames(&d, &[a, "c".repeat(64)]), 1);
    }

    #[test]
    fn requested_hashes_are_normalized_and_deduplicated() {
        let d = discovery_with(&[]);
        let req = vec!["AB".repeat(32), "ab".repeat(32), "cd".repeat(32)];
        assert_eq!(select_hashes(&d, &req), vec!["ab".repeat(32), "cd".repeat(32)]);
    }

    #[test]
    fn same_name_gets_hash_prefix() {
        let a = "a".repeat(64);
        let b = "b".repeat(64);
        let d = discovery_with(&[&a, &b]);
        let mut used = HashSet::new();
        let dir = Path::new("/r");
        let first = unique_output(dir, &a, d.index.get(&a).unwrap(), &mut used);
        let second = unique_output(dir, &b, d.index.get(&b).unwrap(), &mut used);
        assert_eq!(first, PathBuf::from("/r/output_a.bin"));
        assert_eq!(second, PathBuf::from("/r/output_bbbbbbbb_a.bin"));
    }

    #[test]
    fn hash_mismatch_keeps_file_and_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("output_a.bin");
        std::fs::write(&out, b"not what was encoded").unwrap();
        let declared = "a".repeat(64);
        let (actual_hash, matches) = index::verify_output(&declared, &out).unwrap();

        let reporter = ProgressReporter::new(
            "decode",
            Unit::Frames,
            0,
            ProgressConfig::new(crate::progress::ProgressMode::Quiet),
        );
        let mut restored = RestoredFile {
            hash: declared,
            name: "a.bin".into(),
            output: None,
            bytes: 0,
            frames: 0,
            status: RestoreStatus::Verified,
        };
        let report = AssemblyReport {
            output: out.clone(),
            bytes_written: 20,
            frames_decoded: 1,
            actual_hash: actual_hash.clone(),
            matches,
        };
        record_assembly(&mut restored, report, &reporter.handle());
        let outcome = reporter.finish("done");

        assert_eq!(restored.status, RestoreStatus::HashMismatch { actual: actual_hash });
        assert!(!restored.status.is_ok());
        assert_eq!(restored.output.as_deref(), Some(out.as_path()));
        assert_eq!((restored.bytes, restored.frames), (20, 1));
        assert!(out.is_file());
        assert_eq!(outcome.warning_count, 1);
    }

    #[test]
    fn output_dir_defaults_to_input_location() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(resolve_output_dir(tmp.path(), None), tmp.path());
        let file = tmp.path().join("x.mp4");
        assert_eq!(resolve_output_dir(&file, None), tmp.path());
        assert_eq!(resolve_output_dir(Path::new("x.mp4"), None), PathBuf::from("."));
        assert_eq!(
            resolve_output_dir(&file, Some(Path::new("/o"))),
            PathBuf::from("/o")
        );
    }
}
