//! Process records: one row of the server's process table, decoded with
//! silent defaults so transient nulls in the metadata views never fail a poll.

use crate::db::{Row, Value};

/// Status the server reports for a connection with no work in flight.
const SLEEPING: &str = "sleeping";

/// A snapshot of one server-side process at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessRecord {
    pub session_id: i32,
    pub execution_context_id: i32,
    pub login_name: String,
    pub host_name: String,
    pub program_name: String,
    /// Free-form server status (`sleeping`, `running`, `suspended`, `runnable`, ...).
    pub status: String,
    pub last_wait_type: String,
    /// Session holding the lock this process waits on; 0 when not blocked.
    pub blocked_by: i32,
    pub cpu_time_ms: u64,
    pub physical_io: u64,
    pub memory_pages: u64,
    pub open_transactions: u64,
    /// Empty when the process has no current database.
    pub database_name: String,
    pub command_text: String,
}

impl ProcessRecord {
    /// Decode a record from a row of the process query.
    ///
    /// Every column goes through a value-or-default decoder: a missing column,
    /// a NULL, or a value of the wrong type becomes `0` or `""`.
    pub fn from_row(row: &Row) -> Self {
        Self {
            session_id: int_column(row, "spid"),
            execution_context_id: int_column(row, "ecid"),
            login_name: text_column(row, "loginame"),
            host_name: text_column(row, "hostname"),
            program_name: text_column(row, "program_name"),
            status: text_column(row, "status"),
            last_wait_type: text_column(row, "lastwaittype"),
            blocked_by: int_column(row, "blocked"),
            cpu_time_ms: count_column(row, "cpu"),
            physical_io: count_column(row, "physical_io"),
            memory_pages: count_column(row, "memusage"),
            open_transactions: count_column(row, "open_tran"),
            database_name: text_column(row, "dbname"),
            command_text: text_column(row, "text"),
        }
    }

    /// A process is active unless the server reports it as sleeping.
    pub fn is_active(&self) -> bool {
        !self.status.eq_ignore_ascii_case(SLEEPING)
    }

    /// Status normalized for display.
    pub fn display_status(&self) -> String {
        self.status.to_lowercase()
    }
}

impl std::fmt::Display for ProcessRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "process-{}", self.session_id)
    }
}

/// Integer column that must fit an `i32`; anything else decodes as 0.
pub fn int_column(row: &Row, name: &str) -> i32 {
    row.get(name)
        .and_then(Value::as_i64)
        .and_then(|v| i32::try_from(v).ok())
        .unwrap_or(0)
}

/// Non-negative counter column; negative or unreadable values decode as 0.
pub fn count_column(row: &Row, name: &str) -> u64 {
    row.get(name)
        .and_then(Value::as_i64)
        .and_then(|v| u64::try_from(v).ok())
        .unwrap_or(0)
}

/// Text column, trimmed of surrounding whitespace; non-text values decode as "".
pub fn text_column(row: &Row, name: &str) -> String {
    row.get(name)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}
