//! Progress and confirmation collaborators.
//!
//! The lister never draws anything itself. Long-running operations report
//! through these traits and ask [`UserDialog`] before continuing past a
//! partial download. The terminal implementations share one
//! `Rc<RefCell<ProgressState>>` so the download and install phases render
//! onto the same status line.

use std::cell::RefCell;
use std::io::{self, BufRead, Write};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::size_str;

// ============================================================================
// Collaborator traits
// ============================================================================

/// Progress of cache open/reset
pub trait OpProgress {
    fn update(&mut self, _op: &str, _percent: f32) {}
    fn done(&mut self) {}
}

/// Snapshot of a running fetch job
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FetchPulse {
    pub percent: f64,
    pub current_bytes: u64,
    pub total_bytes: u64,
    pub speed_bps: u64,
}

/// Progress of an index or archive fetch job.
///
/// Cancellation is cooperative: the engine polls [`AcquireStatus::pulse`]
/// between items and stops queuing new ones once it returns false.
pub trait AcquireStatus {
    fn start(&mut self) {}
    fn fetch(&mut self, _desc: &str) {}
    fn done(&mut self, _desc: &str) {}
    fn fail(&mut self, _desc: &str, _error: &str) {}
    /// Return false to cancel the job
    fn pulse(&mut self, _pulse: &FetchPulse) -> bool {
        !self.cancelled()
    }
    fn stop(&mut self) {}
    fn cancelled(&self) -> bool {
        false
    }
}

/// Progress of the installer state machine
pub trait InstallProgress {
    fn status_changed(&mut self, _pkgname: &str, _steps_done: u64, _total_steps: u64, _action: &str) {}
    fn error(&mut self, _pkgname: &str, _error: &str) {}
}

/// Yes/no prompts raised during a commit
pub trait UserDialog {
    fn confirm(&mut self, title: &str, message: &str) -> bool;
}

/// Silent progress for callers that do not display anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl OpProgress for NoProgress {}
impl AcquireStatus for NoProgress {}
impl InstallProgress for NoProgress {}

/// Dialog that always gives the same answer
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl UserDialog for FixedAnswer {
    fn confirm(&mut self, title: &str, message: &str) -> bool {
        tracing::info!(title, message, answer = self.0, "confirmation answered automatically");
        self.0
    }
}

// ============================================================================
// Terminal implementations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Opening,
    Downloading,
    Installing,
    Done,
}

/// Shared progress state, owned by `Rc<RefCell<_>>`.
/// Renders a single status line on stderr.
pub struct ProgressState {
    pub phase: ProgressPhase,
    pub title: String,
    // Open phase
    pub op: String,
    pub op_percent: f32,
    // Download phase
    pub percent: f64,
    pub current_bytes: u64,
    pub total_bytes: u64,
    pub speed_bps: u64,
    // Install phase
    pub install_steps_done: u64,
    pub install_total_steps: u64,
    pub install_action: String,
    // Shared
    pub errors: Vec<String>,
    cancel_flag: Option<&'static AtomicBool>,
}

impl ProgressState {
    pub fn new(title: &str) -> Self {
        Self {
            phase: ProgressPhase::Opening,
            title: title.to_string(),
            op: String::new(),
            op_percent: 0.0,
            percent: 0.0,
            current_bytes: 0,
            total_bytes: 0,
            speed_bps: 0,
            install_steps_done: 0,
            install_total_steps: 0,
            install_action: String::new(),
            errors: Vec::new(),
            cancel_flag: None,
        }
    }

    /// Treat `flag` becoming true as a cancellation request (e.g. from SIGINT)
    pub fn with_cancel_flag(mut self, flag: &'static AtomicBool) -> Self {
        self.cancel_flag = Some(flag);
        self
    }

    pub fn shared(self) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(self))
    }

    pub fn cancelled(&self) -> bool {
        self.cancel_flag.is_some_and(|f| f.load(Ordering::Relaxed))
    }

    /// Text of the status line for the current phase
    pub fn status_line(&self) -> String {
        match self.phase {
            ProgressPhase::Opening => format!("{}: {} {:.0}%", self.title, self.op, self.op_percent),
            ProgressPhase::Downloading => {
                let speed = if self.speed_bps > 0 {
                    format!("  {}/s", size_str(self.speed_bps))
                } else {
                    String::new()
                };
                format!(
                    "{}: downloading {:.0}%  {} / {}{speed}",
                    self.title,
                    self.percent,
                    size_str(self.current_bytes),
                    size_str(self.total_bytes),
                )
            }
            ProgressPhase::Installing => format!(
                "{}: step {} / {}  {}",
                self.title, self.install_steps_done, self.install_total_steps, self.install_action
            ),
            ProgressPhase::Done => format!("{}: complete", self.title),
        }
    }

    fn draw(&self) {
        let mut err = io::stderr().lock();
        // Terminal output is best effort
        drop(write!(err, "\r\x1b[2K{}", self.status_line()));
        drop(err.flush());
    }

    fn finish_line(&mut self) {
        self.phase = ProgressPhase::Done;
        drop(writeln!(io::stderr(), "\r\x1b[2K{}", self.status_line()));
    }
}

pub struct TermOpProgress {
    state: Rc<RefCell<ProgressState>>,
}

impl TermOpProgress {
    pub fn new(state: Rc<RefCell<ProgressState>>) -> Self {
        Self { state }
    }
}

impl OpProgress for TermOpProgress {
    fn update(&mut self, op: &str, percent: f32) {
        let mut state = self.state.borrow_mut();
        state.phase = ProgressPhase::Opening;
        if state.op != op {
            state.op = op.to_string();
        }
        state.op_percent = percent;
        state.draw();
    }

    fn done(&mut self) {
        self.state.borrow_mut().finish_line();
    }
}

pub struct TermAcquireStatus {
    state: Rc<RefCell<ProgressState>>,
}

impl TermAcquireStatus {
    pub fn new(state: Rc<RefCell<ProgressState>>) -> Self {
        Self { state }
    }
}

impl AcquireStatus for TermAcquireStatus {
    fn start(&mut self) {
        let mut state = self.state.borrow_mut();
        state.phase = ProgressPhase::Downloading;
        state.draw();
    }

    fn fail(&mut self, desc: &str, error: &str) {
        if error.is_empty() {
            return;
        }
        let mut state = self.state.borrow_mut();
        state.errors.push(format!("{desc}: {error}"));
        drop(writeln!(io::stderr(), "\r\x1b[2KE: {desc}: {error}"));
        state.draw();
    }

    fn pulse(&mut self, pulse: &FetchPulse) -> bool {
        let mut state = self.state.borrow_mut();
        state.percent = pulse.percent;
        state.current_bytes = pulse.current_bytes;
        state.total_bytes = pulse.total_bytes;
        state.speed_bps = pulse.speed_bps;
        state.draw();
        !state.cancelled()
    }

    fn stop(&mut self) {
        // Phase transition handled by the install side
    }

    fn cancelled(&self) -> bool {
        self.state.borrow().cancelled()
    }
}

pub struct TermInstallProgress {
    state: Rc<RefCell<ProgressState>>,
}

impl TermInstallProgress {
    pub fn new(state: Rc<RefCell<ProgressState>>) -> Self {
        Self { state }
    }

    pub fn finish(&mut self) {
        self.state.borrow_mut().finish_line();
    }
}

impl InstallProgress for TermInstallProgress {
    fn status_changed(&mut self, pkgname: &str, steps_done: u64, total_steps: u64, action: &str) {
        let mut state = self.state.borrow_mut();
        state.phase = ProgressPhase::Installing;
        state.install_steps_done = steps_done;
        state.install_total_steps = total_steps;
        state.install_action = if pkgname.is_empty() {
            action.to_string()
        } else {
            format!("{action} {pkgname}")
        };
        state.draw();
    }

    fn error(&mut self, pkgname: &str, error: &str) {
        let mut state = self.state.borrow_mut();
        state.errors.push(format!("{pkgname}: {error}"));
        drop(writeln!(io::stderr(), "\r\x1b[2KE: {pkgname}: {error}"));
        state.draw();
    }
}

/// Asks on stdin, or answers yes when `assume_yes` is set
pub struct TermDialog {
    pub assume_yes: bool,
}

impl UserDialog for TermDialog {
    fn confirm(&mut self, title: &str, message: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        eprintln!("\n{title}\n{message} [y/N] ");
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    }
}
