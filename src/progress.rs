use clap::ValueEnum;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MAX_STORED_WARNINGS: usize = 32;
const TICK: Duration = Duration::from_millis(500);
const RATE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressMode {
    Auto,
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Display {
    Rich,
    Plain,
    Quiet,
}

impl ProgressMode {
    fn display(self, stderr_is_tty: bool) -> Display {
        match self {
            ProgressMode::Auto if stderr_is_tty => Display::Rich,
            ProgressMode::Auto | ProgressMode::Plain => Display::Plain,
            ProgressMode::Rich => Display::Rich,
            ProgressMode::Quiet => Display::Quiet,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    pub mode: ProgressMode,
    /// Recognizing one frame can take seconds when every fallback runs, so
    /// a stall is only reported after this long.
    pub stall_after: Duration,
    pub plain_every: Duration,
    tty_override: Option<bool>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            mode: ProgressMode::Auto,
            stall_after: Duration::from_secs(60),
            plain_every: Duration::from_secs(2),
            tty_override: None,
        }
    }
}

impl ProgressConfig {
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn with_tty_override(mut self, is_tty: bool) -> Self {
        self.tty_override = Some(is_tty);
        self
    }

    pub fn display(self) -> Display {
        let tty = self
            .tty_override
            .unwrap_or_else(|| std::io::stderr().is_terminal());
        self.mode.display(tty)
    }
}

/// What the work counter counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Bytes,
    Frames,
}

impl Unit {
    pub fn amount(self, n: u64) -> String {
        match self {
            Unit::Bytes => HumanBytes(n).to_string(),
            Unit::Frames => format!("{} frames", n),
        }
    }

    pub fn rate(self, per_sec: f64) -> String {
        match self {
            Unit::Bytes if per_sec <= 0.1 => "0 B/s".to_string(),
            Unit::Bytes => format!("{}/s", HumanBytes(per_sec as u64)),
            Unit::Frames if per_sec <= 0.1 => "0 fps".to_string(),
            Unit::Frames => format!("{:.1} fps", per_sec),
        }
    }

    fn bar_template(self) -> &'static str {
        match self {
            Unit::Bytes => {
                "{prefix:.bold} [{elapsed_precise}] {wide_bar:.cyan/blue} {bytes}/{total_bytes} | {msg}"
            }
            Unit::Frames => {
                "{prefix:.bold} [{elapsed_precise}] {wide_bar:.cyan/blue} {pos}/{len} frames | {msg}"
            }
        }
    }
}

/// One encoded file.
#[derive(Debug, Clone)]
pub struct EncodedFile {
    pub source: PathBuf,
    pub hash: String,
    pub output_dir: PathBuf,
    pub segments: Vec<PathBuf>,
    pub frames: u64,
}

#[derive(Debug, Clone)]
pub struct EncodeSummary {
    pub input: PathBuf,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub files: Vec<EncodedFile>,
    pub failed: Vec<(PathBuf, String)>,
    pub workers: usize,
    pub elapsed: Duration,
    pub avg_bytes_per_sec: f64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

impl EncodeSummary {
    pub fn segment_count(&self) -> usize {
        self.files.iter().map(|f| f.segments.len()).sum()
    }

    pub fn frame_count(&self) -> u64 {
        self.files.iter().map(|f| f.frames).sum()
    }
}

/// How one requested hash ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreStatus {
    Verified,
    HashMismatch { actual: String },
    Incomplete { missing: Vec<u64> },
    Unknown,
    Failed(String),
}

impl RestoreStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, RestoreStatus::Verified)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RestoreStatus::Verified => "verified",
            RestoreStatus::HashMismatch { .. } => "hash-mismatch",
            RestoreStatus::Incomplete { .. } => "incomplete",
            RestoreStatus::Unknown => "unknown",
            RestoreStatus::Failed(_) => "failed",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            RestoreStatus::Verified => "-".to_string(),
            RestoreStatus::HashMismatch { actual } => format!("actual={}", actual),
            RestoreStatus::Incomplete { missing } => format!("missing={:?}", missing),
            RestoreStatus::Unknown => "no video declares this hash".to_string(),
            RestoreStatus::Failed(why) => why.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoredFile {
    pub hash: String,
    pub name: String,
    pub output: Option<PathBuf>,
    pub bytes: u64,
    pub frames: u64,
    pub status: RestoreStatus,
}

#[derive(Debug, Clone)]
pub struct DecodeSummary {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub candidates: usize,
    pub skipped: usize,
    pub entries: usize,
    pub files: Vec<RestoredFile>,
    pub frames_decoded: u64,
    pub processed_bytes: u64,
    pub workers: usize,
    pub elapsed: Duration,
    pub avg_bytes_per_sec: f64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

impl DecodeSummary {
    pub fn verified(&self) -> usize {
        self.files.iter().filter(|f| f.status.is_ok()).count()
    }

    pub fn all_ok(&self) -> bool {
        self.files.iter().all(|f| f.status.is_ok())
    }
}

/// Final counters handed back by [`ProgressReporter::finish`].
#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    pub elapsed: Duration,
    pub done: u64,
    pub total: u64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

/// Exponentially smoothed work rate, resampled at most every [`RATE_WINDOW`].
#[derive(Debug)]
struct RateMeter {
    sampled_at: Instant,
    sampled_done: u64,
    per_sec: f64,
}

impl RateMeter {
    fn new(now: Instant) -> Self {
        Self {
            sampled_at: now,
            sampled_done: 0,
            per_sec: 0.0,
        }
    }

    fn sample(&mut self, done: u64, now: Instant) {
        let dt = now.duration_since(self.sampled_at);
        if dt < RATE_WINDOW {
            return;
        }
        let instant = done.saturating_sub(self.sampled_done) as f64 / dt.as_secs_f64();
        self.per_sec = if self.per_sec <= f64::EPSILON {
            instant
        } else {
            self.per_sec * 0.7 + instant * 0.3
        };
        self.sampled_at = now;
        self.sampled_done = done;
    }
}

#[derive(Debug)]
struct Counters {
    started: Instant,
    stage: String,
    done: u64,
    total: u64,
    last_advance: Instant,
    last_plain: Instant,
    last_stall_warning: Option<Instant>,
    rate: RateMeter,
    ops: BTreeMap<String, String>,
    warnings: Vec<String>,
    warning_count: usize,
}

impl Counters {
    fn new(total: u64, now: Instant) -> Self {
        Self {
            started: now,
            stage: "starting".to_string(),
            done: 0,
            total,
            last_advance: now,
            last_plain: now,
            last_stall_warning: None,
            rate: RateMeter::new(now),
            ops: BTreeMap::new(),
            warnings: Vec::new(),
            warning_count: 0,
        }
    }

    fn per_sec(&self) -> f64 {
        if self.rate.per_sec > 0.1 {
            self.rate.per_sec
        } else {
            average_rate(self.done, self.started.elapsed())
        }
    }

    fn eta(&self) -> Option<Duration> {
        eta(self.total, self.done, self.per_sec())
    }

    /// Keeps the newest warnings; the count covers all of them.
    fn push_warning(&mut self, message: &str) {
        if self.warnings.len() >= MAX_STORED_WARNINGS {
            self.warnings.remove(0);
        }
        self.warnings.push(message.to_string());
        self.warning_count += 1;
    }

    fn ops_line(&self) -> String {
        if self.ops.is_empty() {
            return "-".to_string();
        }
        self.ops
            .iter()
            .take(3)
            .map(|(id, status)| format!("{}={}", id, status))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn outcome(&self) -> ProgressOutcome {
        ProgressOutcome {
            elapsed: self.started.elapsed(),
            done: self.done,
            total: self.total,
            warning_count: self.warning_count,
            warnings: self.warnings.clone(),
        }
    }
}

struct Shared {
    label: String,
    unit: Unit,
    display: Display,
    stall_after: Duration,
    plain_every: Duration,
    counters: Mutex<Counters>,
    bars: Option<Bars>,
    stop: AtomicBool,
    finished: AtomicBool,
}

struct Bars {
    multi: MultiProgress,
    overall: ProgressBar,
    stage: ProgressBar,
    ops: Mutex<BTreeMap<String, ProgressBar>>,
}

/// Clonable reporting end, safe to use from any thread.
#[derive(Clone)]
pub struct ProgressHandle {
    shared: Arc<Shared>,
}

pub struct ProgressReporter {
    handle: ProgressHandle,
    ticker: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, unit: Unit, total: u64, config: ProgressConfig) -> Self {
        let label = label.into();
        let display = config.display();
        let bars = (display == Display::Rich).then(|| Bars::new(&label, unit, total));

        let shared = Arc::new(Shared {
            label,
            unit,
            display,
            stall_after: config.stall_after,
            plain_every: config.plain_every,
            counters: Mutex::new(Counters::new(total, Instant::now())),
            bars,
            stop: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });

        let ticker = (display != Display::Quiet).then(|| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                while !shared.stop.load(Ordering::Relaxed) {
                    thread::sleep(TICK);
                    shared.tick();
                }
            })
        });

        Self {
            handle: ProgressHandle { shared },
            ticker,
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    pub fn finish(mut self, message: impl Into<String>) -> ProgressOutcome {
        self.stop_ticker();
        self.handle.shared.finish(Some(message.into()))
    }

    fn stop_ticker(&mut self) {
        self.handle.shared.stop.store(true, Ordering::Relaxed);
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop_ticker();
        let _ = self.handle.shared.finish(None);
    }
}

impl ProgressHandle {
    pub fn set_stage(&self, stage: impl Into<String>) {
        let stage = stage.into();
        self.shared.with_counters(|c, _| c.stage = stage);
        self.shared.redraw(true);
    }

    /// Raise the expected total, e.g. once a file's frame count is known.
    pub fn add_total(&self, n: u64) {
        let total = self.shared.with_counters(|c, _| {
            c.total = c.total.saturating_add(n);
            c.total
        });
        if let Some(bars) = &self.shared.bars {
            bars.overall.set_length(total.max(1));
        }
    }

    pub fn advance(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.shared.with_counters(|c, now| {
            c.done = c.done.saturating_add(n);
            if c.total > 0 {
                c.done = c.done.min(c.total);
            }
            c.last_advance = now;
        });
        self.shared.redraw(false);
    }

    pub fn set_op(&self, id: &str, status: impl Into<String>) {
        let status = status.into();
        if let Some(bars) = &self.shared.bars {
            bars.set_op(id, &status);
        }
        self.shared.with_counters(|c, _| {
            c.ops.insert(id.to_string(), status);
        });
        self.shared.redraw(false);
    }

    pub fn clear_op(&self, id: &str) {
        self.shared.with_counters(|c, _| {
            c.ops.remove(id);
        });
        if let Some(bars) = &self.shared.bars {
            bars.clear_op(id);
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        self.shared.emit("INFO", &message.into());
    }

    /// Shows a warning now and keeps it for the final summary.
    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        self.shared.with_counters(|c, _| c.push_warning(&message));
        self.shared.emit("WARN", &message);
    }
}

impl Shared {
    fn with_counters<T>(&self, f: impl FnOnce(&mut Counters, Instant) -> T) -> T {
        let mut c = self.counters.lock().unwrap();
        let now = Instant::now();
        let out = f(&mut c, now);
        let done = c.done;
        c.rate.sample(done, now);
        out
    }

    fn tick(&self) {
        let (plain_due, stalled) = self.with_counters(|c, now| {
            let plain_due = now.duration_since(c.last_plain) >= self.plain_every;
            if plain_due {
                c.last_plain = now;
            }
            let stalled = stall_due(
                now,
                c.last_advance,
                c.last_stall_warning,
                self.stall_after,
                c.done,
                c.total,
            )
            .then(|| {
                c.last_stall_warning = Some(now);
                let msg = format!(
                    "nothing done for {}s (stage={}, active={})",
                    now.duration_since(c.last_advance).as_secs(),
                    c.stage,
                    c.ops_line()
                );
                c.push_warning(&msg);
                msg
            });
            (plain_due, stalled)
        });

        self.redraw(plain_due);
        if let Some(msg) = stalled {
            self.emit("WARN", &msg);
        }
    }

    fn redraw(&self, plain_now: bool) {
        match self.display {
            Display::Rich => self.draw_bars(),
            Display::Plain if plain_now => self.print_line(),
            _ => {}
        }
    }

    fn draw_bars(&self) {
        let Some(bars) = &self.bars else {
            return;
        };
        let c = self.counters.lock().unwrap();
        bars.overall.set_length(c.total.max(1));
        bars.overall.set_position(c.done.min(c.total.max(1)));
        bars.overall.set_message(format!(
            "rate={} ETA={}",
            self.unit.rate(c.per_sec()),
            format_eta(c.eta())
        ));
        bars.stage.set_message(format!(
            "{} | elapsed {}",
            c.stage,
            format_duration(c.started.elapsed())
        ));
    }

    fn print_line(&self) {
        let c = self.counters.lock().unwrap();
        let pct = if c.total == 0 {
            0.0
        } else {
            c.done as f64 * 100.0 / c.total as f64
        };
        eprintln!(
            "[PROGRESS] {} elapsed={} stage={} done={} / {} ({:.1}%) rate={} ETA={} active={}",
            self.label,
            format_duration(c.started.elapsed()),
            c.stage,
            self.unit.amount(c.done),
            self.unit.amount(c.total),
            pct,
            self.unit.rate(c.per_sec()),
            format_eta(c.eta()),
            c.ops_line()
        );
    }

    fn emit(&self, level: &str, message: &str) {
        let line = format!("[{}] {}: {}", level, self.label, message);
        match (self.display, &self.bars) {
            (Display::Quiet, _) => {}
            (Display::Rich, Some(bars)) => bars.stage.println(line),
            _ => eprintln!("{}", line),
        }
    }

    fn finish(&self, message: Option<String>) -> ProgressOutcome {
        let outcome = self.counters.lock().unwrap().outcome();
        if self.finished.swap(true, Ordering::Relaxed) {
            return outcome;
        }

        match self.display {
            Display::Quiet => {}
            Display::Plain => {
                self.print_line();
                if let Some(msg) = &message {
                    eprintln!("[DONE] {}: {}", self.label, msg);
                }
            }
            Display::Rich => {
                if let Some(bars) = &self.bars {
                    bars.overall.finish_with_message(format!(
                        "done={} / {} elapsed={}",
                        self.unit.amount(outcome.done),
                        self.unit.amount(outcome.total),
                        format_duration(outcome.elapsed)
                    ));
                    match message {
                        Some(msg) => bars.stage.finish_with_message(msg),
                        None => bars.stage.finish_and_clear(),
                    }
                    bars.clear_all();
                }
            }
        }
        outcome
    }
}

impl Bars {
    fn new(label: &str, unit: Unit, total: u64) -> Self {
        let multi = MultiProgress::new();
        let overall = multi.add(ProgressBar::new(total.max(1)));
        let stage = multi.add(ProgressBar::new_spinner());

        overall.set_style(
            ProgressStyle::with_template(unit.bar_template()).expect("valid progress template"),
        );
        overall.set_prefix(label.to_string());

        stage.set_style(
            ProgressStyle::with_template("{spinner:.yellow} {msg}")
                .expect("valid stage template")
                .tick_chars("|/-\\ "),
        );
        stage.enable_steady_tick(Duration::from_millis(120));
        stage.set_message("starting");

        Self {
            multi,
            overall,
            stage,
            ops: Mutex::new(BTreeMap::new()),
        }
    }

    fn set_op(&self, id: &str, status: &str) {
        let mut ops = self.ops.lock().unwrap();
        let bar = ops.entry(id.to_string()).or_insert_with(|| {
            let pb = self.multi.add(ProgressBar::new_spinner());
            pb.set_style(
                ProgressStyle::with_template("  {prefix:.bold} {msg}")
                    .expect("valid operation template"),
            );
            pb.set_prefix(id.to_string());
            pb
        });
        bar.set_message(status.to_string());
    }

    fn clear_op(&self, id: &str) {
        if let Some(bar) = self.ops.lock().unwrap().remove(id) {
            bar.finish_and_clear();
        }
    }

    fn clear_all(&self) {
        let mut ops = self.ops.lock().unwrap();
        while let Some((_, bar)) = ops.pop_first() {
            bar.finish_and_clear();
        }
    }
}

pub fn average_rate(n: u64, elapsed: Duration) -> f64 {
    n as f64 / elapsed.as_secs_f64().max(1e-6)
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

fn format_eta(eta: Option<Duration>) -> String {
    eta.map(format_duration)
        .unwrap_or_else(|| "--:--".to_string())
}

fn eta(total: u64, done: u64, per_sec: f64) -> Option<Duration> {
    if per_sec <= 0.1 || done >= total {
        return None;
    }
    Some(Duration::from_secs_f64((total - done) as f64 / per_sec))
}

/// A stall is reported once per `after` while unfinished work stands still.
fn stall_due(
    now: Instant,
    last_advance: Instant,
    last_warning: Option<Instant>,
    after: Duration,
    done: u64,
    total: u64,
) -> bool {
    if total > 0 && done >= total {
        return false;
    }
    if now.duration_since(last_advance) < after {
        return false;
    }
    last_warning.map_or(true, |at| now.duration_since(at) >= after)
}
