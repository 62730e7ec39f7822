use crate::process::ProcessRecord;

/// Process query. Only execution context 0 is kept so each session appears
/// once per snapshot; parallel worker contexts come and go with the session.
/// `CROSS APPLY` drops rows without a statement handle, which covers both idle
/// connections and the server's own background tasks.
const PROCESS_QUERY: &str = "SELECT p.spid, p.ecid, p.status, p.loginame, p.hostname, p.program_name, \
    p.blocked, p.lastwaittype, p.cpu, p.physical_io, p.memusage, p.open_tran, \
    d.name AS dbname, q.text \
    FROM sys.sysprocesses p \
    LEFT JOIN sys.databases d ON d.database_id = p.dbid \
    CROSS APPLY sys.dm_exec_sql_text(p.sql_handle) AS q \
    WHERE p.ecid = 0";

const LOGIN_FILTER: &str = " AND p.loginame = @P1";

const OWN_SESSION_QUERY: &str = "SELECT @@SPID";

/// A single column value, reduced to the shapes the process query produces.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl Value {
    /// Integer payload, or `None` for anything that is not an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Text payload, or `None` for anything that is not text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// One result row: column names paired with their values, in query order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new<S: Into<String>>(columns: Vec<(S, Value)>) -> Self {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        }
    }

    /// Look up a column by name (case-insensitive, as SQL Server names are).
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }
}

/// Errors surfaced by a database session.
#[derive(Debug)]
pub enum DbError {
    /// Could not open or authenticate the connection.
    Connect {
        addr: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A query failed after the connection was established.
    Query {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A single-value query returned no row, or a value of the wrong type.
    EmptyResult { query: &'static str },
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::Connect { addr, source } => {
                write!(f, "failed to connect to {}: {}", addr, source)
            }
            DbError::Query { source } => write!(f, "query failed: {}", source),
            DbError::EmptyResult { query } => {
                write!(f, "query returned no usable value: {}", query)
            }
        }
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DbError::Connect { source, .. } => Some(source.as_ref()),
            DbError::Query { source } => Some(source.as_ref()),
            DbError::EmptyResult { .. } => None,
        }
    }
}

/// An open, authenticated database session.
///
/// The monitor only needs to run row and scalar queries over one
/// connection, serially, and close it exactly once when it is done.
#[allow(async_fn_in_trait)]
pub trait DbSession {
    /// Run a query with positional string parameters (`@P1`, `@P2`, ...)
    /// and collect the first result set.
    async fn query_rows(&mut self, sql: &str, params: &[&str]) -> Result<Vec<Row>, DbError>;

    /// Run a query and return the first column of the first row, if any.
    async fn query_scalar(&mut self, sql: &str) -> Result<Option<Value>, DbError>;

    /// Close the connection.
    async fn close(self) -> Result<(), DbError>
    where
        Self: Sized;
}

/// Fetch a full process snapshot, optionally restricted to one login.
///
/// The login filter is an exact match applied by the server. Records come
/// back in whatever order the server yields them.
pub async fn fetch_processes<S: DbSession>(
    session: &mut S,
    login: Option<&str>,
) -> Result<Vec<ProcessRecord>, DbError> {
    let rows = match login {
        Some(login) => {
            let sql = format!("{PROCESS_QUERY}{LOGIN_FILTER}");
            session.query_rows(&sql, &[login]).await?
        }
        None => session.query_rows(PROCESS_QUERY, &[]).await?,
    };

    Ok(rows.iter().map(ProcessRecord::from_row).collect())
}

/// Session ID of the connection the monitor itself is using.
pub async fn own_session_id<S: DbSession>(session: &mut S) -> Result<i32, DbError> {
    session
        .query_scalar(OWN_SESSION_QUERY)
        .await?
        .and_then(|value| value.as_i64())
        .and_then(|id| i32::try_from(id).ok())
        .ok_or(DbError::EmptyResult {
            query: OWN_SESSION_QUERY,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{row, ScriptedSession};

    #[tokio::test]
    async fn test_fetch_without_login_runs_unfiltered_query() {
        let mut session = ScriptedSession::new(5).with_snapshot(vec![
            row(5, "running"),
            row(12, "sleeping"),
            row(13, "running"),
        ]);

        let procs = fetch_processes(&mut session, None).await.unwrap();

        assert_eq!(procs.len(), 3);
        let queries = session.queries();
        let (sql, params) = &queries[0];
        assert!(!sql.contains("@P1"));
        assert!(params.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_with_login_binds_parameter() {
        let mut session = ScriptedSession::new(7).with_snapshot(vec![row(30, "running")]);

        let procs = fetch_processes(&mut session, Some("svc_etl")).await.unwrap();

        assert_eq!(procs.len(), 1);
        let queries = session.queries();
        let (sql, params) = &queries[0];
        assert!(sql.ends_with("AND p.loginame = @P1"));
        assert_eq!(params, &vec!["svc_etl".to_string()]);
    }

    #[test]
    fn test_process_query_skips_sessions_without_statement() {
        assert!(PROCESS_QUERY.contains("CROSS APPLY sys.dm_exec_sql_text(p.sql_handle)"));
        assert!(!PROCESS_QUERY.contains("OUTER APPLY"));
        assert!(PROCESS_QUERY.ends_with("WHERE p.ecid = 0"));
    }

    #[tokio::test]
    async fn test_fetch_trims_strings_and_defaults_nulls() {
        let raw = Row::new(vec![
            ("spid", Value::Int(40)),
            ("status", Value::Text("  suspended ".into())),
            ("physical_io", Value::Null),
            ("text", Value::Text("  SELECT 1  ".into())),
        ]);
        let mut session = ScriptedSession::new(1).with_snapshot(vec![raw]);

        let procs = fetch_processes(&mut session, None).await.unwrap();

        assert_eq!(procs[0].status, "suspended");
        assert_eq!(procs[0].command_text, "SELECT 1");
        assert_eq!(procs[0].physical_io, 0);
    }

    #[tokio::test]
    async fn test_fetch_propagates_query_error() {
        let mut session = ScriptedSession::new(7).with_failure("connection reset by peer");

        let err = fetch_processes(&mut session, Some("svc_etl"))
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Query { .. }));
        assert!(err.to_string().contains("connection reset by peer"));
    }

    #[tokio::test]
    async fn test_own_session_id() {
        let mut session = ScriptedSession::new(57);
        assert_eq!(own_session_id(&mut session).await.unwrap(), 57);
    }

    #[tokio::test]
    async fn test_own_session_id_rejects_missing_value() {
        let mut session = ScriptedSession::new(57).with_own_session_value(None);
        let err = own_session_id(&mut session).await.unwrap_err();
        assert!(matches!(err, DbError::EmptyResult { .. }));
    }

    #[tokio::test]
    async fn test_own_session_id_rejects_non_integer() {
        let mut session =
            ScriptedSession::new(57).with_own_session_value(Some(Value::Text("57".into())));
        let err = own_session_id(&mut session).await.unwrap_err();
        assert!(err.to_string().contains("SELECT @@SPID"));
    }

    #[test]
    fn test_row_lookup_ignores_case() {
        let row = Row::new(vec![("SPID", Value::Int(3))]);
        assert_eq!(row.get("spid"), Some(&Value::Int(3)));
        assert_eq!(row.get("ecid"), None);
    }

    #[test]
    fn test_connect_error_display_and_source() {
        use std::error::Error;
        let err = DbError::Connect {
            addr: "db01:1433".to_string(),
            source: "login failed for user 'etl'".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to connect to db01:1433: login failed for user 'etl'"
        );
        assert!(err.source().is_some());
    }
}
