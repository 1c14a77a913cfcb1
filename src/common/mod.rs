//! Common functionality.

use std::borrow::Cow;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

pub mod io;

/// Commonly used command line arguments.
#[derive(Parser, Debug)]
pub struct Args {
    /// Verbosity of the program
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            verbose: Verbosity::new(0, 0),
        }
    }
}

/// Helper to print the current memory resident set size via `tracing`.
#[cfg(target_os = "linux")]
pub fn trace_rss_now() {
    let rss = procfs::process::Process::myself()
        .and_then(|me| me.stat())
        .map(|stat| stat.rss * procfs::page_size());
    match rss {
        Ok(rss) => tracing::debug!(
            "RSS now: {:.2}",
            byte_unit::Byte::from_u64(rss).get_appropriate_unit(byte_unit::UnitType::Binary)
        ),
        Err(e) => tracing::debug!("could not determine RSS: {}", e),
    }
}

/// Helper to print the current memory resident set size via `tracing`.
#[cfg(not(target_os = "linux"))]
pub fn trace_rss_now() {
    tracing::trace!("RSS tracing is only available on Linux");
}

/// Return the version of the `varstat-worker` crate and `x.y.z` in tests.
pub fn worker_version() -> &'static str {
    if cfg!(test) {
        "x.y.z"
    } else {
        env!("CARGO_PKG_VERSION")
    }
}

/// Normalize a chromosome label into its ordering key.
///
/// Purely numeric single-digit labels are left-padded to two digits so that
/// lexicographic sorting puts `02` before `10`.  Everything else, including
/// `chr1`, `X` or `MT`, is returned unchanged.  The function is idempotent.
pub fn pad_chrom(chrom: &str) -> Cow<'_, str> {
    if chrom.len() == 1 && chrom.bytes().all(|b| b.is_ascii_digit()) {
        Cow::Owned(format!("0{}", chrom))
    } else {
        Cow::Borrowed(chrom)
    }
}

/// Render a number for display, integral values without a fractional part.
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Truncate `value` to at most `max_chars` characters, appending `marker` if cut.
///
/// This is lossy and only used to bound the size of persisted display tables.
pub fn truncate_with(value: &str, max_chars: usize, marker: &str) -> String {
    if value.chars().count() > max_chars {
        let mut result: String = value.chars().take(max_chars).collect();
        result.push_str(marker);
        result
    } else {
        value.to_owned()
    }
}
