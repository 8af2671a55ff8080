//! File sink and source contracts.
//!
//! Collectors hand merged events to a [`FileWriter`], offline tools pull
//! them back through a [`FileReader`]. The crate ships a native binary
//! format implementing both, plus an in-memory writer.
//!
//! [`FileWriter`]: trait.FileWriter.html
//! [`FileReader`]: trait.FileReader.html

mod memory;
mod native;

pub use memory::MemoryWriter;
pub use native::{Compression, FileHeader, NativeReader, NativeWriter, NATIVE_EXTENSION};

use chrono::{DateTime, Utc};

use crate::{Event, Result};

/// Default file name pattern: creation time, then zero-padded run number.
pub const DEFAULT_PATTERN: &str = "$12D_run$6R$X";

/// Sink for the merged event stream.
pub trait FileWriter: Send {
    /// Prepares the writer for a new run, usually opening a new file.
    fn start_run(&mut self, run_n: u32) -> Result<()>;
    fn write_event(&mut self, event: &Event) -> Result<()>;
    /// Number of bytes written in the current run.
    fn file_bytes(&self) -> u64;
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Source of previously written events.
pub trait FileReader {
    /// Returns the next event, or `None` at the end of the file.
    fn next_event(&mut self) -> Result<Option<Event>>;
}

/// Expands a file name pattern.
///
/// * `$<n>R` run number zero-padded to `n` digits, `$R` unpadded
/// * `$<n>D` time as `yymmddHHMMSS`, truncated to `n` characters
/// * `$X` file extension, including the dot
/// * `$$` literal dollar sign
pub fn expand_pattern(pattern: &str, run_n: u32, extension: &str, time: DateTime<Utc>) -> String {
    let mut out = String::new();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let mut width = String::new();
        while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            width.push(*d);
            chars.next();
        }
        let width: usize = width.parse().unwrap_or(0);
        match chars.next() {
            Some('R') => out.push_str(&format!("{:0width$}", run_n, width = width)),
            Some('D') => {
                let stamp = time.format("%y%m%d%H%M%S").to_string();
                let n = if width == 0 { stamp.len() } else { width.min(stamp.len()) };
                out.push_str(&stamp[..n]);
            }
            Some('X') => out.push_str(extension),
            Some('$') => out.push('$'),
            Some(other) => {
                warn!("unknown file pattern directive: ${}", other);
                out.push('$');
                out.push(other);
            }
            None => out.push('$'),
        }
    }
    out
}

#[test]
fn pattern_expansion() {
    use chrono::TimeZone;
    let time = Utc.ymd(2021, 3, 14).and_hms(15, 9, 26);
    assert_eq!(
        expand_pattern("run$6R$X", 42, ".raw", time),
        "run000042.raw"
    );
    assert_eq!(
        expand_pattern(DEFAULT_PATTERN, 7, ".raw", time),
        "210314150926_run000007.raw"
    );
    assert_eq!(expand_pattern("$6D-$R-$$", 3, "", time), "210314-3-$");
}
