use crate::error::{CodecError, RecognizeError};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::GrayImage;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Well-known file name for frames handed to out-of-process stages.
pub const FALLBACK_FRAME_FILE: &str = "qrvid_frame.png";
pub const FALLBACK_SCRIPT_FILE: &str = "qrvid_fallback.py";
const BUNDLED_SCRIPT: &str = include_str!("../scripts/qrvid_fallback.py");

/// The one frame file on disk, shared by every out-of-process stage of a
/// cascade. Holding the guard from [`FallbackFrame::hold`] is required while
/// the file is written or read.
pub struct FallbackFrame {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FallbackFrame {
    pub fn new(path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock the file and replace its content with `image`.
    fn hold(&self, image: &GrayImage) -> Result<MutexGuard<'_, ()>, RecognizeError> {
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        image
            .save(&self.path)
            .map_err(|e| RecognizeError::Io(std::io::Error::other(e)))?;
        Ok(guard)
    }
}

/// Where a frame came from, for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    pub source: &'a Path,
    pub position: u64,
}

pub trait Recognizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Return the raw symbol text found in `image`.
    fn recognize(&self, image: &GrayImage, ctx: &FrameContext<'_>) -> Result<String, RecognizeError>;
}

/// Ordered list of recognizers; the first stage whose text is valid base64
/// wins.
pub struct Cascade {
    stages: Vec<Box<dyn Recognizer>>,
}

impl Cascade {
    pub fn new(stages: Vec<Box<dyn Recognizer>>) -> Self {
        Self { stages }
    }

    fn automated(opts: &RecognizerOptions, frame: &Arc<FallbackFrame>) -> Self {
        let mut stages: Vec<Box<dyn Recognizer>> =
            vec![Box::new(RxingRecognizer), Box::new(RqrrRecognizer)];
        if let Some(ext) = ExternalScript::from_options(opts, Arc::clone(frame)) {
            stages.push(Box::new(ext));
        }
        Self::new(stages)
    }

    /// Stages for index frames: automated only, never prompts.
    pub fn for_header(opts: &RecognizerOptions) -> Self {
        Self::automated(opts, &FallbackFrame::new(opts.frame_path()))
    }

    /// Stages for data frames, ending with the manual provider.
    pub fn for_data(opts: &RecognizerOptions, manual: Arc<dyn ManualFallbackProvider>) -> Self {
        let frame = FallbackFrame::new(opts.frame_path());
        let mut cascade = Self::automated(opts, &frame);
        cascade
            .stages
            .push(Box::new(ManualRecognizer::new(manual, frame)));
        cascade
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn decode(&self, image: &GrayImage, ctx: &FrameContext<'_>) -> Result<Vec<u8>, CodecError> {
        let mut attempts = Vec::with_capacity(self.stages.len());

        for (i, stage) in self.stages.iter().enumerate() {
            let text = match stage.recognize(image, ctx) {
                Ok(text) => text,
                Err(err) => {
                    debug!(
                        source = %ctx.source.display(),
                        frame = ctx.position,
                        stage = stage.name(),
                        "recognizer failed: {}",
                        err
                    );
                    attempts.push(format!("{}: {}", stage.name(), err));
                    continue;
                }
            };

            match STANDARD.decode(text.trim()) {
                Ok(bytes) => {
                    if i > 0 {
                        debug!(
                            source = %ctx.source.display(),
                            frame = ctx.position,
                            stage = stage.name(),
                            "frame recovered by fallback stage"
                        );
                    }
                    return Ok(bytes);
                }
                Err(err) => {
                    debug!(
                        source = %ctx.source.display(),
                        frame = ctx.position,
                        stage = stage.name(),
                        "symbol text is not base64: {}",
                        err
                    );
                    attempts.push(format!("{}: base64 {}", stage.name(), err));
                }
            }
        }

        Err(CodecError::Unrecognized {
            frame: ctx.position,
            attempts,
        })
    }
}

/// Settings shared by the out-of-process stages.
#[derive(Debug, Clone)]
pub struct RecognizerOptions {
    pub fallback_script: Option<PathBuf>,
    pub interpreter: String,
    /// Directory for the well-known frame file and the bundled script.
    pub work_dir: PathBuf,
}

impl RecognizerOptions {
    fn frame_path(&self) -> PathBuf {
        self.work_dir.join(FALLBACK_FRAME_FILE)
    }
}

/// ZXing port; the primary detector.
pub struct RxingRecognizer;

impl Recognizer for RxingRecognizer {
    fn name(&self) -> &'static str {
        "rxing"
    }

    fn recognize(&self, image: &GrayImage, _ctx: &FrameContext<'_>) -> Result<String, RecognizeError> {
        let (w, h) = image.dimensions();
        let result = rxing::helpers::detect_in_luma(
            image.as_raw().clone(),
            w,
            h,
            Some(rxing::BarcodeFormat::QR_CODE),
        )
        .map_err(|e| RecognizeError::NotFound(e.to_string()))?;
        Ok(result.getText().to_string())
    }
}

/// quirc-family detector with its own binarizer.
pub struct RqrrRecognizer;

impl Recognizer for RqrrRecognizer {
    fn name(&self) -> &'static str {
        "rqrr"
    }

    fn recognize(&self, image: &GrayImage, _ctx: &FrameContext<'_>) -> Result<String, RecognizeError> {
        let (w, h) = image.dimensions();
        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(w as usize, h as usize, |x, y| {
            image.get_pixel(x as u32, y as u32).0[0]
        });
        let grids = prepared.detect_grids();
        if grids.is_empty() {
            return Err(RecognizeError::NotFound("no grid detected".into()));
        }

        let mut last_err = String::new();
        for grid in grids {
            match grid.decode() {
                Ok((_meta, content)) => return Ok(content),
                Err(e) => last_err = format!("{:?}", e),
            }
        }
        Err(RecognizeError::NotFound(last_err))
    }
}

/// Runs `<interpreter> <script> <frame.png>` and reads the symbol text from
/// stdout.
pub struct ExternalScript {
    interpreter: String,
    script: PathBuf,
    frame: Arc<FallbackFrame>,
}

impl ExternalScript {
    pub fn new(interpreter: impl Into<String>, script: PathBuf, frame: Arc<FallbackFrame>) -> Self {
        Self {
            interpreter: interpreter.into(),
            script,
            frame,
        }
    }

    /// The configured script, else `qrvid_fallback.py` beside the
    /// executable, else the bundled zbar reader written into `work_dir`.
    pub fn from_options(opts: &RecognizerOptions, frame: Arc<FallbackFrame>) -> Option<Self> {
        let script = match opts.fallback_script.clone().or_else(script_beside_exe) {
            Some(script) => script,
            None => match install_bundled_script(&opts.work_dir) {
                Ok(script) => script,
                Err(err) => {
                    warn!("cannot write the bundled fallback script: {}", err);
                    return None;
                }
            },
        };
        Some(Self::new(opts.interpreter.clone(), script, frame))
    }
}

fn script_beside_exe() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let script = exe.parent()?.join(FALLBACK_SCRIPT_FILE);
    script.is_file().then_some(script)
}

fn install_bundled_script(dir: &Path) -> std::io::Result<PathBuf> {
    let script = dir.join(FALLBACK_SCRIPT_FILE);
    std::fs::write(&script, BUNDLED_SCRIPT)?;
    Ok(script)
}

impl Recognizer for ExternalScript {
    fn name(&self) -> &'static str {
        "external-script"
    }

    fn recognize(&self, image: &GrayImage, ctx: &FrameContext<'_>) -> Result<String, RecognizeError> {
        if !self.script.is_file() {
            return Err(RecognizeError::Unavailable(format!(
                "script {} not found",
                self.script.display()
            )));
        }

        let _guard = self.frame.hold(image)?;
        debug!(
            source = %ctx.source.display(),
            frame = ctx.position,
            "running {} {} {}",
            self.interpreter,
            self.script.display(),
            self.frame.path().display()
        );

        let output = Command::new(&self.interpreter)
            .arg(&self.script)
            .arg(self.frame.path())
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(RecognizeError::NotFound(format!(
                "script exited with {}",
                output.status
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(RecognizeError::NotFound("script printed nothing".into()));
        }
        Ok(text)
    }
}

/// Source of a human-supplied base64 string for a frame nothing could read.
pub trait ManualFallbackProvider: Send + Sync {
    fn is_available(&self) -> bool;

    /// Ask for the payload of the frame saved at `frame_path`.
    fn request(&self, frame_path: &Path, ctx: &FrameContext<'_>) -> Option<String>;
}

/// Batch runs: the manual stage always reports unavailable.
pub struct NoManualFallback;

impl ManualFallbackProvider for NoManualFallback {
    fn is_available(&self) -> bool {
        false
    }

    fn request(&self, _frame_path: &Path, _ctx: &FrameContext<'_>) -> Option<String> {
        None
    }
}

/// Prompts on stderr and reads one line from stdin.
pub struct ConsolePrompt {
    lock: Mutex<()>,
}

impl ConsolePrompt {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }
}

impl Default for ConsolePrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualFallbackProvider for ConsolePrompt {
    fn is_available(&self) -> bool {
        true
    }

    fn request(&self, frame_path: &Path, ctx: &FrameContext<'_>) -> Option<String> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        eprintln!(
            "\nNo recognizer could read frame {} of {}.",
            ctx.position,
            ctx.source.display()
        );
        eprintln!("The frame was saved to {}.", frame_path.display());
        eprint!("Scan it with any QR reader and paste the text (base64), or press Enter to give up: ");
        let _ = std::io::stderr().flush();

        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => {
                let line = line.trim();
                (!line.is_empty()).then(|| line.to_string())
            }
            Err(err) => {
                warn!("failed to read manual input: {}", err);
                None
            }
        }
    }
}

/// Last stage: persist the frame and defer to the provider.
pub struct ManualRecognizer {
    provider: Arc<dyn ManualFallbackProvider>,
    frame: Arc<FallbackFrame>,
}

impl ManualRecognizer {
    pub fn new(provider: Arc<dyn ManualFallbackProvider>, frame: Arc<FallbackFrame>) -> Self {
        Self { provider, frame }
    }
}

impl Recognizer for ManualRecognizer {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn recognize(&self, image: &GrayImage, ctx: &FrameContext<'_>) -> Result<String, RecognizeError> {
        if !self.provider.is_available() {
            return Err(RecognizeError::Unavailable("non-interactive run".into()));
        }
        let _guard = self.frame.hold(image)?;
        self.provider
            .request(self.frame.path(), ctx)
            .ok_or_else(|| RecognizeError::NotFound("no manual input".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Stub {
        name: &'static str,
        answer: Option<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    impl Stub {
        fn boxed(name: &'static str, answer: Option<&'static str>) -> (Box<dyn Recognizer>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Box::new(Stub {
                    name,
                    answer,
                    calls: Arc::clone(&calls),
                }),
                calls,
            )
        }
    }

    impl Recognizer for Stub {
        fn name(&self) -> &'static str {
            self.name
        }

        fn recognize(&self, _image: &GrayImage, _ctx: &FrameContext<'_>) -> Result<String, RecognizeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
                .map(str::to_string)
                .ok_or_else(|| RecognizeError::NotFound("stub".into()))
        }
    }

    struct Scripted(&'static str);

    impl ManualFallbackProvider for Scripted {
        fn is_available(&self) -> bool {
            true
        }

        fn request(&self, _frame_path: &Path, _ctx: &FrameContext<'_>) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn ctx() -> FrameContext<'static> {
        FrameContext {
            source: Path::new("seg.mp4"),
            position: 5,
        }
    }

    fn blank() -> GrayImage {
        GrayImage::from_pixel(8, 8, image::Luma([255]))
    }

    #[test]
    fn secondary_result_used_when_primary_fails() {
        let (primary, p_calls) = Stub::boxed("primary", None);
        let (secondary, s_calls) = Stub::boxed("secondary", Some("aGVsbG8="));
        let (third, t_calls) = Stub::boxed("third", Some("d29ybGQ="));
        let cascade = Cascade::new(vec![primary, secondary, third]);

        let out = cascade.decode(&blank(), &ctx()).unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(p_calls.load(Ordering::SeqCst), 1);
        assert_eq!(s_calls.load(Ordering::SeqCst), 1);
        assert_eq!(t_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invalid_base64_falls_through() {
        let (primary, _) = Stub::boxed("primary", Some("not base64 !!"));
        let (secondary, _) = Stub::boxed("secondary", Some("aGVsbG8="));
        let cascade = Cascade::new(vec![primary, secondary]);
        assert_eq!(cascade.decode(&blank(), &ctx()).unwrap(), b"hello");
    }

    #[test]
    fn all_stages_failing_reports_each_attempt() {
        let (a, _) = Stub::boxed("a", None);
        let (b, _) = Stub::boxed("b", Some("%%%"));
        let cascade = Cascade::new(vec![a, b]);
        match cascade.decode(&blank(), &ctx()).unwrap_err() {
            CodecError::Unrecognized { frame, attempts } => {
                assert_eq!(frame, 5);
                assert_eq!(attempts.len(), 2);
                assert!(attempts[0].starts_with("a:"));
                assert!(attempts[1].contains("base64"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn batch_manual_stage_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let frame = FallbackFrame::new(tmp.path().join("f.png"));
        let manual = ManualRecognizer::new(Arc::new(NoManualFallback), frame);
        let err = manual.recognize(&blank(), &ctx()).unwrap_err();
        assert!(matches!(err, RecognizeError::Unavailable(_)));
        assert!(!tmp.path().join("f.png").exists());
    }

    #[test]
    fn manual_stage_persists_frame_and_uses_provider() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(FALLBACK_FRAME_FILE);
        let manual = ManualRecognizer::new(Arc::new(Scripted("aGk=")), FallbackFrame::new(path.clone()));
        let cascade = Cascade::new(vec![Box::new(manual)]);
        assert_eq!(cascade.decode(&blank(), &ctx()).unwrap(), b"hi");
        assert!(path.is_file());
    }

    #[test]
    fn missing_script_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let ext = ExternalScript::new(
            "python3",
            tmp.path().join("absent.py"),
            FallbackFrame::new(tmp.path().join(FALLBACK_FRAME_FILE)),
        );
        assert!(matches!(
            ext.recognize(&blank(), &ctx()),
            Err(RecognizeError::Unavailable(_))
        ));
    }

    #[test]
    fn data_cascade_orders_stages() {
        let tmp = tempfile::tempdir().unwrap();
        let opts = RecognizerOptions {
            fallback_script: Some(tmp.path().join("absent.py")),
            interpreter: "python3".into(),
            work_dir: tmp.path().to_path_buf(),
        };
        let data = Cascade::for_data(&opts, Arc::new(NoManualFallback));
        assert_eq!(
            data.stage_names(),
            vec!["rxing", "rqrr", "external-script", "manual"]
        );
        let header = Cascade::for_header(&opts);
        assert_eq!(header.stage_names(), vec!["rxing", "rqrr", "external-script"]);
    }

    #[test]
    fn bundled_script_lands_in_work_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let opts = RecognizerOptions {
            fallback_script: None,
            interpreter: "python3".into(),
            work_dir: tmp.path().to_path_buf(),
        };
        let header = Cascade::for_header(&opts);
        assert_eq!(header.stage_names(), vec!["rxing", "rqrr", "external-script"]);
        let installed = std::fs::read_to_string(tmp.path().join(FALLBACK_SCRIPT_FILE)).unwrap();
        assert_eq!(installed, BUNDLED_SCRIPT);
    }

    #[cfg(unix)]
    #[test]
    fn script_stdout_is_decoded_by_cascade() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("reader.sh");
        std::fs::write(&script, "test -f \"$1\" || exit 3\nprintf 'aGVsbG8='\n").unwrap();
        let frame_path = tmp.path().join(FALLBACK_FRAME_FILE);

        let (primary, _) = Stub::boxed("primary", None);
        let ext = ExternalScript::new("sh", script, FallbackFrame::new(frame_path.clone()));
        let cascade = Cascade::new(vec![primary, Box::new(ext)]);

        assert_eq!(cascade.decode(&blank(), &ctx()).unwrap(), b"hello");
        assert!(frame_path.is_file());
    }

    struct SlowReader {
        widths: Mutex<Vec<u32>>,
        opened: crossbeam_channel::Sender<()>,
    }

    impl ManualFallbackProvider for SlowReader {
        fn is_available(&self) -> bool {
            true
        }

        fn request(&self, frame_path: &Path, _ctx: &FrameContext<'_>) -> Option<String> {
            let first = image::open(frame_path).unwrap().width();
            self.opened.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(300));
            let second = image::open(frame_path).unwrap().width();
            self.widths.lock().unwrap().extend([first, second]);
            Some("aGk=".into())
        }
    }

    #[cfg(unix)]
    #[test]
    fn script_waits_while_human_reads_frame() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("fails.sh");
        std::fs::write(&script, "exit 1\n").unwrap();
        let frame = FallbackFrame::new(tmp.path().join(FALLBACK_FRAME_FILE));

        let (opened, on_open) = crossbeam_channel::bounded(1);
        let reader = Arc::new(SlowReader {
            widths: Mutex::new(Vec::new()),
            opened,
        });
        let manual = ManualRecognizer::new(reader.clone(), Arc::clone(&frame));
        let ext = ExternalScript::new("sh", script, Arc::clone(&frame));

        std::thread::scope(|s| {
            s.spawn(|| manual.recognize(&blank(), &ctx()).unwrap());
            on_open.recv().unwrap();
            let other = GrayImage::from_pixel(64, 64, image::Luma([0]));
            assert!(ext.recognize(&other, &ctx()).is_err());
        });

        assert_eq!(*reader.widths.lock().unwrap(), vec![8, 8]);
    }
}
