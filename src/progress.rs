//! Progress reporting for the disambiguation phases.
//!
//! Interactive runs get one indicatif bar per phase (backbone load, batch
//! matching); long unattended runs (cron, nohup) set log-only mode, which
//! hides the bars and emits plain line-oriented progress suitable for
//! tailing.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Global flag for log-only mode (set from args in main)
pub static LOG_ONLY: AtomicBool = AtomicBool::new(false);

pub fn set_log_only(value: bool) {
    LOG_ONLY.store(value, Ordering::Relaxed);
}

pub fn is_log_only() -> bool {
    LOG_ONLY.load(Ordering::Relaxed)
}

/// Format duration in human-readable format
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        format!("{:.1}m", secs / 60.0)
    }
}

/// A bar for one named phase. Hidden in log-only mode; pair with
/// [`log_progress`] there.
pub fn phase_bar(phase: &str, len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if is_log_only() {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    } else {
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, ETA: {eta})")
                .unwrap()
                .progress_chars("=> "),
        );
    }
    pb.set_message(phase.to_string());
    pb
}

/// Close out a phase bar with a summary line. The summary still reaches
/// stderr in log-only mode, where the bar itself is hidden.
pub fn finish_phase(pb: &ProgressBar, summary: String) {
    if is_log_only() {
        pb.finish_and_clear();
        eprintln!("{}", summary);
    } else {
        pb.finish_with_message(summary);
    }
}

/// Log progress at a fixed interval for tail-friendly output. No-op when
/// progress bars are visible.
pub fn log_progress(phase: &str, current: u64, total: u64, interval: u64) {
    if is_log_only() && total > 0 && (current % interval == 0 || current == total) {
        let pct = 100.0 * current as f64 / total as f64;
        eprintln!("[{}] {}/{} ({:.1}%)", phase, current, total, pct);
    }
}
