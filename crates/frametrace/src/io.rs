//! Destinations for `print()` output.
//!
//! `print` is the most common graph break, so traced programs print from
//! the interpreter running rewritten code rather than from a graph. Every sink
//! receives whole lines: the arguments of one call joined by single spaces.

use std::io::{self, Write as _};

use crate::error::RunResult;

/// Receives one line per `print()` call.
pub trait PrintWriter {
    /// `line` has no trailing newline.
    fn print_line(&mut self, line: &str) -> RunResult<()>;
}

/// Writes to the process's stdout through a line buffer.
///
/// Lines are written whole so they do not interleave with log records on
/// stderr. Buffered text is written out on [`flush`](Self::flush) and on drop.
#[derive(Debug, Default)]
pub struct StdPrint {
    pending: Vec<u8>,
}

/// Flush once this many bytes are buffered.
const STDOUT_HIGH_WATER: usize = 8 * 1024;

impl StdPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut stdout = io::stdout().lock();
        // a closed stdout drops output rather than failing the program
        let _ = stdout.write_all(&self.pending).and_then(|()| stdout.flush());
        self.pending.clear();
    }
}

impl PrintWriter for StdPrint {
    fn print_line(&mut self, line: &str) -> RunResult<()> {
        self.pending.extend_from_slice(line.as_bytes());
        self.pending.push(b'\n');
        if self.pending.len() >= STDOUT_HIGH_WATER {
            self.flush();
        }
        Ok(())
    }
}

impl Drop for StdPrint {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Keeps everything printed, for comparing plain and traced runs.
#[derive(Debug, Default)]
pub struct CollectStringPrint {
    lines: Vec<String>,
}

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Printed text, one `\n`-terminated line per call.
    #[must_use]
    pub fn output(&self) -> String {
        self.lines.iter().fold(String::new(), |mut out, line| {
            out.push_str(line);
            out.push('\n');
            out
        })
    }

    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl PrintWriter for CollectStringPrint {
    fn print_line(&mut self, line: &str) -> RunResult<()> {
        self.lines.push(line.to_owned());
        Ok(())
    }
}

/// Discards output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn print_line(&mut self, _line: &str) -> RunResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn collected_lines_are_newline_terminated() {
        let mut out = CollectStringPrint::new();
        out.print_line("a 1").unwrap();
        out.print_line("").unwrap();
        assert_eq!(out.output(), "a 1\n\n");
        assert_eq!(out.lines().len(), 2);
    }
}
