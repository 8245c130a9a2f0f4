use assert_cmd::Command;

fn help_text(sub: &str) -> String {
    let output = Command::new(assert_cmd::cargo::cargo_bin!("qrvid"))
        .arg(sub)
        .arg("--help")
        .output()
        .expect("--help runs");
    assert!(output.status.success());
    format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

#[test]
fn encode_help_lists_codec_flags() {
    let text = help_text("encode");
    for flag in [
        "--error-correction",
        "--module-size",
        "--slice-len",
        "--fps",
        "--segment-seconds",
        "--preset",
        "--force",
        "--workers",
        "--progress",
    ] {
        assert!(text.contains(flag), "help text missing {flag}: {text}");
    }
}

#[test]
fn decode_help_lists_recognition_flags() {
    let text = help_text("decode");
    for flag in [
        "--upscale",
        "--upscale-numerator",
        "--hash",
        "--interactive",
        "--fallback-script",
        "--fallback-interpreter",
        "--progress",
    ] {
        assert!(text.contains(flag), "help text missing {flag}: {text}");
    }
}

#[test]
fn out_of_range_error_correction_is_rejected() {
    let output = Command::new(assert_cmd::cargo::cargo_bin!("qrvid"))
        .args(["encode", "whatever.bin", "-q", "4"])
        .output()
        .expect("encode runs");
    assert!(!output.status.success());
}
