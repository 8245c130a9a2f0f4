use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn ffmpeg_available() -> bool {
    ["ffmpeg", "ffprobe"].iter().all(|tool| {
        std::process::Command::new(tool)
            .arg("-version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    })
}

fn combined_output(output: &std::process::Output) -> String {
    format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn write_test_file(path: &Path, size: usize, seed: u8) -> Vec<u8> {
    let mut data = vec![0u8; size];
    for (idx, b) in data.iter_mut().enumerate() {
        *b = seed.wrapping_add((idx % 251) as u8);
    }
    fs::write(path, &data).expect("write test file");
    data
}

fn qrvid() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("qrvid"))
}

fn encode(input: &Path, extra: &[&str]) -> std::process::Output {
    qrvid()
        .arg("encode")
        .arg(input)
        .args(["--progress", "quiet", "--workers", "2"])
        .args(extra)
        .output()
        .expect("encode runs")
}

fn decode(input: &Path, extra: &[&str]) -> std::process::Output {
    qrvid()
        .arg("decode")
        .arg(input)
        .args(["--progress", "quiet", "--workers", "2"])
        .args(extra)
        .output()
        .expect("decode runs")
}

fn mp4s(dir: &Path) -> Vec<PathBuf> {
    let mut v: Vec<PathBuf> = fs::read_dir(dir)
        .expect("read output dir")
        .map(|e| e.expect("dir entry").path())
        .filter(|p| p.extension().map(|e| e == "mp4").unwrap_or(false))
        .collect();
    v.sort();
    v
}

fn frame_count(video: &Path) -> u64 {
    let out = std::process::Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-count_frames",
            "-show_entries",
            "stream=nb_read_frames",
            "-of",
            "csv=p=0",
        ])
        .arg(video)
        .output()
        .expect("ffprobe runs");
    String::from_utf8_lossy(&out.stdout)
        .trim()
        .parse()
        .expect("frame count")
}

#[test]
fn small_file_roundtrips_through_one_segment() {
    if !ffmpeg_available() {
        return;
    }

    let tmp = TempDir::new().expect("tempdir");
    let input = tmp.path().join("notes.txt");
    let data = write_test_file(&input, 1000, 7);

    let enc = encode(&input, &["-d", "350"]);
    assert!(enc.status.success(), "{}", combined_output(&enc));
    assert!(
        combined_output(&enc).contains("Encode summary:"),
        "{}",
        combined_output(&enc)
    );

    let out_dir = tmp.path().join("output_notes_txt");
    let videos = mp4s(&out_dir);
    assert_eq!(videos, vec![out_dir.join("notes.mp4")]);
    // Index frame plus ceil(1000 / 350) data frames.
    assert_eq!(frame_count(&videos[0]), 4);

    let dec = decode(&out_dir, &[]);
    assert!(dec.status.success(), "{}", combined_output(&dec));
    let text = combined_output(&dec);
    assert!(text.contains("verified:"), "missing verified line: {text}");

    let restored = fs::read(out_dir.join("output_notes.txt")).expect("restored file");
    assert_eq!(restored, data);
}

#[test]
fn renamed_and_shuffled_segments_still_reassemble() {
    if !ffmpeg_available() {
        return;
    }

    let tmp = TempDir::new().expect("tempdir");
    let input = tmp.path().join("blob.bin");
    // 9 frames of 100 bytes at 2 frames per segment: 5 segments.
    let data = write_test_file(&input, 870, 41);

    let enc = encode(&input, &["-d", "100", "-p", "1", "-l", "2"]);
    assert!(enc.status.success(), "{}", combined_output(&enc));

    let videos = mp4s(&tmp.path().join("output_blob_bin"));
    assert_eq!(videos.len(), 5, "{:?}", videos);

    // Reverse the order and drop every hint in the file names.
    let shuffled = tmp.path().join("shuffled");
    fs::create_dir_all(shuffled.join("nested")).expect("create shuffled dir");
    for (i, v) in videos.iter().rev().enumerate() {
        let dest = if i % 2 == 0 {
            shuffled.join(format!("clip_{}.mp4", (b'a' + i as u8) as char))
        } else {
            shuffled.join("nested").join(format!("{}.mp4", 100 - i))
        };
        fs::rename(v, dest).expect("move segment");
    }

    let restored_dir = tmp.path().join("restored");
    let dec = decode(&shuffled, &["--output", restored_dir.to_str().unwrap()]);
    assert!(dec.status.success(), "{}", combined_output(&dec));

    let restored = fs::read(restored_dir.join("output_blob.bin")).expect("restored file");
    assert_eq!(restored, data);
}

#[test]
fn missing_segment_is_reported_incomplete() {
    if !ffmpeg_available() {
        return;
    }

    let tmp = TempDir::new().expect("tempdir");
    let input = tmp.path().join("part.bin");
    write_test_file(&input, 400, 3);

    let enc = encode(&input, &["-d", "100", "-p", "1", "-l", "2"]);
    assert!(enc.status.success(), "{}", combined_output(&enc));

    let out_dir = tmp.path().join("output_part_bin");
    let videos = mp4s(&out_dir);
    assert_eq!(videos.len(), 2, "{:?}", videos);
    fs::remove_file(out_dir.join("part_1.mp4")).expect("remove segment");

    let dec = decode(&out_dir, &[]);
    assert!(!dec.status.success(), "{}", combined_output(&dec));
    let text = combined_output(&dec);
    assert!(text.contains("incomplete:"), "missing incomplete line: {text}");
    assert!(text.contains("missing=[1]"), "missing index not named: {text}");
    assert!(!out_dir.join("output_part.bin").exists());
}

#[test]
fn unknown_hash_fails_without_touching_other_files() {
    if !ffmpeg_available() {
        return;
    }

    let tmp = TempDir::new().expect("tempdir");
    let input = tmp.path().join("one.bin");
    write_test_file(&input, 200, 99);

    let enc = encode(&input, &["-d", "100"]);
    assert!(enc.status.success(), "{}", combined_output(&enc));

    let out_dir = tmp.path().join("output_one_bin");
    let unknown = "f".repeat(64);
    let dec = decode(&out_dir, &["--hash", &unknown]);
    assert!(!dec.status.success(), "{}", combined_output(&dec));
    let text = combined_output(&dec);
    assert!(text.contains("unknown:"), "missing unknown line: {text}");
    assert!(!out_dir.join("output_one.bin").exists());
}

#[test]
fn existing_output_requires_force() {
    if !ffmpeg_available() {
        return;
    }

    let tmp = TempDir::new().expect("tempdir");
    let input = tmp.path().join("again.bin");
    write_test_file(&input, 120, 5);

    let first = encode(&input, &["-d", "100"]);
    assert!(first.status.success(), "{}", combined_output(&first));

    let second = encode(&input, &["-d", "100"]);
    assert!(!second.status.success(), "{}", combined_output(&second));
    assert!(
        combined_output(&second).contains("--force"),
        "{}",
        combined_output(&second)
    );

    let forced = encode(&input, &["-d", "100", "--force"]);
    assert!(forced.status.success(), "{}", combined_output(&forced));
}
