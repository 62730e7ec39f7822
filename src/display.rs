//! Console output: banner, startup line, per-poll progress and the final
//! result line. Diagnostics go through `tracing`; this is the script-facing
//! channel and stays silent in quiet mode except for errors.

use crate::process::ProcessRecord;
use chrono::{DateTime, Local};
use std::io::{IsTerminal, Stderr, Stdout, Write};

const RESET: &str = "\x1b[0m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const WHITE: &str = "\x1b[97m";
const GRAY: &str = "\x1b[90m";

/// How much the console prints. Quiet and verbose are exclusive, so the
/// "both" combination is not representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Errors only.
    Quiet,
    /// Banner and startup line.
    #[default]
    Normal,
    /// Everything, including per-poll process detail and the completion line.
    Verbose,
}

impl Verbosity {
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        match (verbose, quiet) {
            (_, true) => Verbosity::Quiet,
            (true, false) => Verbosity::Verbose,
            (false, false) => Verbosity::Normal,
        }
    }
}

/// Write-only display sink over an output and an error stream.
pub struct Console<O: Write, E: Write> {
    out: O,
    err: E,
    verbosity: Verbosity,
    color: bool,
    err_color: bool,
}

impl Console<Stdout, Stderr> {
    /// Console over the process's stdout/stderr. Each stream is colored only
    /// when it is a terminal and `NO_COLOR` is unset.
    pub fn stdio(verbosity: Verbosity) -> Self {
        let allowed = std::env::var_os("NO_COLOR").is_none();
        Console::new(
            std::io::stdout(),
            std::io::stderr(),
            verbosity,
            allowed && std::io::stdout().is_terminal(),
        )
        .with_error_color(allowed && std::io::stderr().is_terminal())
    }
}

impl<O: Write, E: Write> Console<O, E> {
    pub fn new(out: O, err: E, verbosity: Verbosity, color: bool) -> Self {
        Self {
            out,
            err,
            verbosity,
            color,
            err_color: color,
        }
    }

    /// Override coloring for the error stream alone.
    pub fn with_error_color(mut self, color: bool) -> Self {
        self.err_color = color;
        self
    }

    fn paint(&self, color: &'static str, text: &str) -> String {
        paint(self.color, color, text)
    }

    fn line(&mut self, text: &str) {
        if let Err(e) = writeln!(self.out, "{text}") {
            tracing::debug!(error = %e, "failed to write to console");
        }
    }

    /// Program name and version.
    pub fn banner(&mut self) {
        if self.verbosity == Verbosity::Quiet {
            return;
        }
        self.line(&format!("sqlwaitfor v{}", env!("CARGO_PKG_VERSION")));
        self.line("");
    }

    /// Announce the monitor's own session ID once the connection is up.
    pub fn started(&mut self, own_session_id: i32) {
        if self.verbosity == Verbosity::Quiet {
            return;
        }
        self.line(&format!(
            "SPID {own_session_id} is monitoring SQL Server processes (^C cancels)..."
        ));
    }

    /// Progress report for a poll that still found active processes.
    pub fn waiting(&mut self, live: &[&ProcessRecord], relevant: usize, at: DateTime<Local>) {
        if self.verbosity != Verbosity::Verbose {
            return;
        }

        let header = self.paint(
            YELLOW,
            &format!(
                "*** [WAIT] {}/{} queries active at {}",
                live.len(),
                relevant,
                at.format("%Y-%m-%d %H:%M:%S")
            ),
        );
        self.line(&header);

        for record in live {
            let detail = self.paint(WHITE, &process_line(record));
            self.line(&detail);
            if !record.command_text.is_empty() {
                let command = self.paint(GRAY, &record.command_text);
                self.line(&command);
            }
        }
        self.line("");
    }

    /// Completion line, printed when nothing watched is active any more.
    pub fn finished(&mut self) {
        if self.verbosity != Verbosity::Verbose {
            return;
        }
        let text = self.paint(GREEN, "*** [FINISH] No active queries found!");
        self.line(&text);
    }

    /// Runtime error, always written to the error stream.
    pub fn error(&mut self, error: &dyn std::fmt::Display) {
        let text = paint(self.err_color, RED, &format!("*** [ERROR] {error}"));
        if let Err(e) = writeln!(self.err, "{text}") {
            tracing::debug!(error = %e, "failed to write to error stream");
        }
    }

    #[cfg(test)]
    pub fn into_parts(self) -> (O, E) {
        (self.out, self.err)
    }
}

fn paint(enabled: bool, color: &'static str, text: &str) -> String {
    if enabled {
        format!("{color}{text}{RESET}")
    } else {
        text.to_string()
    }
}

/// One-line summary of a live process.
fn process_line(record: &ProcessRecord) -> String {
    let mut line = format!(
        "SPID {} -> State: {}, CPU: {}, I/O: {}, Memory: {}, Database: {}",
        record.session_id,
        record.display_status(),
        record.cpu_time_ms,
        record.physical_io,
        record.memory_pages,
        record.database_name
    );
    if record.blocked_by != 0 {
        line.push_str(&format!(", Blocked by: {}", record.blocked_by));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn console(verbosity: Verbosity) -> Console<Vec<u8>, Vec<u8>> {
        Console::new(Vec::new(), Vec::new(), verbosity, false)
    }

    fn output(console: Console<Vec<u8>, Vec<u8>>) -> (String, String) {
        let (out, err) = console.into_parts();
        (
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    fn live_record() -> ProcessRecord {
        ProcessRecord {
            session_id: 13,
            status: "RUNNING".to_string(),
            cpu_time_ms: 250,
            physical_io: 40,
            memory_pages: 3,
            database_name: "warehouse".to_string(),
            command_text: "EXEC dbo.load_facts".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_verbosity_from_flags() {
        assert_eq!(Verbosity::from_flags(false, false), Verbosity::Normal);
        assert_eq!(Verbosity::from_flags(true, false), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flags(false, true), Verbosity::Quiet);
    }

    #[test]
    fn test_normal_prints_banner_and_startup_only() {
        let mut c = console(Verbosity::Normal);
        c.banner();
        c.started(5);
        c.waiting(&[&live_record()], 2, Local::now());
        c.finished();
        let (out, err) = output(c);
        assert!(out.starts_with("sqlwaitfor v"));
        assert!(out.contains("SPID 5 is monitoring SQL Server processes"));
        assert!(!out.contains("[WAIT]"));
        assert!(!out.contains("[FINISH]"));
        assert!(err.is_empty());
    }

    #[test]
    fn test_quiet_prints_nothing_but_errors() {
        let mut c = console(Verbosity::Quiet);
        c.banner();
        c.started(5);
        c.waiting(&[&live_record()], 1, Local::now());
        c.finished();
        c.error(&"query failed: timeout");
        let (out, err) = output(c);
        assert!(out.is_empty());
        assert_eq!(err, "*** [ERROR] query failed: timeout\n");
    }

    #[test]
    fn test_verbose_progress_report() {
        let mut c = console(Verbosity::Verbose);
        let at = Local.with_ymd_and_hms(2024, 3, 1, 14, 5, 9).unwrap();
        c.waiting(&[&live_record()], 2, at);
        let (out, _) = output(c);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines[0],
            "*** [WAIT] 1/2 queries active at 2024-03-01 14:05:09"
        );
        assert_eq!(
            lines[1],
            "SPID 13 -> State: running, CPU: 250, I/O: 40, Memory: 3, Database: warehouse"
        );
        assert_eq!(lines[2], "EXEC dbo.load_facts");
        assert_eq!(lines[3], "");
    }

    #[test]
    fn test_verbose_reports_blocking_session() {
        let record = ProcessRecord {
            blocked_by: 61,
            command_text: String::new(),
            ..live_record()
        };
        let mut c = console(Verbosity::Verbose);
        c.waiting(&[&record], 1, Local::now());
        let (out, _) = output(c);
        assert!(out.contains("Database: warehouse, Blocked by: 61\n"));
        // No command line for an empty statement
        assert_eq!(out.lines().count(), 3);
    }

    #[test]
    fn test_verbose_finish_line() {
        let mut c = console(Verbosity::Verbose);
        c.finished();
        let (out, _) = output(c);
        assert_eq!(out, "*** [FINISH] No active queries found!\n");
    }

    #[test]
    fn test_color_wraps_status_lines() {
        let mut c = Console::new(Vec::new(), Vec::new(), Verbosity::Verbose, true);
        c.finished();
        c.error(&"boom");
        let (out, err) = c.into_parts();
        let out = String::from_utf8(out).unwrap();
        let err = String::from_utf8(err).unwrap();
        assert!(out.starts_with(GREEN));
        assert!(out.trim_end().ends_with(RESET));
        assert!(err.starts_with(RED));
    }

    #[test]
    fn test_error_stream_color_is_independent() {
        let mut c =
            Console::new(Vec::new(), Vec::new(), Verbosity::Verbose, true).with_error_color(false);
        c.finished();
        c.error(&"boom");
        let (out, err) = output(c);
        assert!(out.starts_with(GREEN));
        assert_eq!(err, "*** [ERROR] boom\n");
    }
}
