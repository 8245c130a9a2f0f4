use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

/// Prefix shared by generated output directories on both sides.
pub const OUTPUT_PREFIX: &str = "output_";
/// Working files (fallback frame, fallback script) start with this.
pub const WORK_FILE_PREFIX: &str = "qrvid_";
pub const VIDEO_EXT: &str = "mp4";

pub fn ensure_tool_available(tool: &str) -> Result<()> {
    let out = Command::new(tool)
        .arg("-version")
        .output()
        .with_context(|| format!("failed to run {} -version", tool))?;
    if !out.status.success() {
        bail!("{} exists but returned non-zero on -version", tool);
    }
    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("read {} for hashing", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn file_name_of(p: &Path) -> String {
    p.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string())
}

/// `output_<stem><ext with '.' replaced by '_'>`, e.g. `notes.txt` →
/// `output_notes_txt`.
pub fn output_dir_name(input: &Path) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let ext = input
        .extension()
        .map(|e| format!("_{}", e.to_string_lossy()))
        .unwrap_or_default();
    format!("{}{}{}", OUTPUT_PREFIX, stem, ext)
}

/// Output directory for encoding `input`: beside it, or under `root`.
pub fn output_dir_for(input: &Path, root: Option<&Path>) -> PathBuf {
    let parent = match root {
        Some(r) => r.to_path_buf(),
        None => input
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    parent.join(output_dir_name(input))
}

/// `<stem>.mp4` for a single segment, `<stem>_<i>.mp4` otherwise.
pub fn segment_path(dir: &Path, stem: &str, index: u64, count: u64) -> PathBuf {
    if count <= 1 {
        dir.join(format!("{}.{}", stem, VIDEO_EXT))
    } else {
        dir.join(format!("{}_{}.{}", stem, index, VIDEO_EXT))
    }
}

/// Reduce a declared file name to a single path component.
pub fn safe_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .find(|s| !s.is_empty() && *s != "." && *s != "..")
        .unwrap_or("file");
    base.to_string()
}

/// Where a reconstructed file named `name` lands.
pub fn decoded_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}{}", OUTPUT_PREFIX, safe_file_name(name)))
}

fn is_generated_dir(p: &Path) -> bool {
    p.file_name()
        .map(|n| n.to_string_lossy().starts_with(OUTPUT_PREFIX))
        .unwrap_or(false)
}

fn is_work_file(p: &Path) -> bool {
    p.file_name()
        .map(|n| n.to_string_lossy().starts_with(WORK_FILE_PREFIX))
        .unwrap_or(false)
}

/// Files to encode under `dir`, sorted, skipping generated output
/// directories and working files.
pub fn list_input_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut v = vec![];
    let walker = WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !(e.file_type().is_dir() && is_generated_dir(e.path())));
    for entry in walker {
        let e = entry?;
        if e.file_type().is_file() && !is_work_file(e.path()) {
            v.push(e.into_path());
        }
    }
    v.sort();
    Ok(v)
}

/// Candidate segment videos: `input` itself, or every `.mp4` below it.
pub fn list_videos(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    if !input.is_dir() {
        bail!("{} is neither a file nor a directory", input.display());
    }
    let mut v = vec![];
    for entry in WalkDir::new(input) {
        let e = entry?;
        let p = e.path();
        if !e.file_type().is_file() {
            continue;
        }
        if let Some(ext) = p.extension() {
            if ext.to_string_lossy().eq_ignore_ascii_case(VIDEO_EXT) {
                v.push(p.to_path_buf());
            }
        }
    }
    v.sort();
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_dir_replaces_extension_dot() {
        assert_eq!(output_dir_name(Path::new("a/notes.txt")), "output_notes_txt");
        assert_eq!(output_dir_name(Path::new("archive.tar.gz")), "output_archive.tar_gz");
        assert_eq!(output_dir_name(Path::new("README")), "output_README");
        assert_eq!(
            output_dir_for(Path::new("/data/in/notes.txt"), None),
            PathBuf::from("/data/in/output_notes_txt")
        );
        assert_eq!(
            output_dir_for(Path::new("/data/in/notes.txt"), Some(Path::new("/out"))),
            PathBuf::from("/out/output_notes_txt")
        );
    }

    #[test]
    fn segment_suffix_only_when_split() {
        let d = Path::new("/o");
        assert_eq!(segment_path(d, "notes", 0, 1), PathBuf::from("/o/notes.mp4"));
        assert_eq!(segment_path(d, "notes", 0, 3), PathBuf::from("/o/notes_0.mp4"));
        assert_eq!(segment_path(d, "notes", 2, 3), PathBuf::from("/o/notes_2.mp4"));
    }

    #[test]
    fn declared_names_cannot_escape_output_dir() {
        assert_eq!(safe_file_name("notes.txt"), "notes.txt");
        assert_eq!(safe_file_name("../../etc/passwd"), "passwd");
        assert_eq!(safe_file_name("dir\\x.bin"), "x.bin");
        assert_eq!(safe_file_name(".."), "file");
        assert_eq!(
            decoded_path(Path::new("/r"), "a/b.txt"),
            PathBuf::from("/r/output_b.txt")
        );
    }

    #[test]
    fn sha256_matches_known_vector() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("abc");
        std::fs::write(&p, b"abc").unwrap();
        assert_eq!(
            sha256_file(&p).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn single_byte_corruption_changes_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("data.bin");
        let mut data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&p, &data).unwrap();
        let clean = sha256_file(&p).unwrap();

        data[500] ^= 0x01;
        std::fs::write(&p, &data).unwrap();
        assert_ne!(sha256_file(&p).unwrap(), clean);
    }

    #[test]
    fn input_listing_skips_generated_output() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::create_dir_all(root.join("output_a_txt")).unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        std::fs::write(root.join("sub/b.bin"), b"b").unwrap();
        std::fs::write(root.join("output_a_txt/a.mp4"), b"v").unwrap();
        std::fs::write(root.join("qrvid_frame.png"), b"p").unwrap();

        let files = list_input_files(root).unwrap();
        assert_eq!(files, vec![root.join("a.txt"), root.join("sub/b.bin")]);

        let videos = list_videos(root).unwrap();
        assert_eq!(videos, vec![root.join("output_a_txt/a.mp4")]);
    }
}
