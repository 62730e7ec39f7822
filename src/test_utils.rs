//! Scripted in-memory database session for exercising the fetcher and the
//! monitor loop without a server.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::db::{DbError, DbSession, Row, Value};

/// What the scripted server does on the next process fetch.
enum Step {
    Snapshot(Vec<Row>),
    Fail(String),
}

/// Everything the session saw, shared so tests can inspect it after `close`.
#[derive(Debug, Default)]
pub struct SessionLog {
    pub queries: Vec<(String, Vec<String>)>,
    pub fetches: usize,
    pub closes: usize,
}

pub struct ScriptedSession {
    own_session: Option<Value>,
    steps: VecDeque<Step>,
    log: Rc<RefCell<SessionLog>>,
}

impl ScriptedSession {
    pub fn new(own_session_id: i32) -> Self {
        Self {
            own_session: Some(Value::Int(i64::from(own_session_id))),
            steps: VecDeque::new(),
            log: Rc::new(RefCell::new(SessionLog::default())),
        }
    }

    /// Queue a snapshot for the next fetch.
    pub fn with_snapshot(mut self, rows: Vec<Row>) -> Self {
        self.steps.push_back(Step::Snapshot(rows));
        self
    }

    /// Queue a query failure for the next fetch.
    pub fn with_failure(mut self, message: &str) -> Self {
        self.steps.push_back(Step::Fail(message.to_string()));
        self
    }

    pub fn with_own_session_value(mut self, value: Option<Value>) -> Self {
        self.own_session = value;
        self
    }

    pub fn log(&self) -> Rc<RefCell<SessionLog>> {
        Rc::clone(&self.log)
    }

    pub fn queries(&self) -> Vec<(String, Vec<String>)> {
        self.log.borrow().queries.clone()
    }
}

impl DbSession for ScriptedSession {
    async fn query_rows(&mut self, sql: &str, params: &[&str]) -> Result<Vec<Row>, DbError> {
        {
            let mut log = self.log.borrow_mut();
            log.queries.push((
                sql.to_string(),
                params.iter().map(|p| p.to_string()).collect(),
            ));
            log.fetches += 1;
        }

        match self.steps.pop_front() {
            Some(Step::Snapshot(rows)) => Ok(rows),
            Some(Step::Fail(message)) => Err(DbError::Query {
                source: message.into(),
            }),
            None => Err(DbError::Query {
                source: "scripted session has no more snapshots".into(),
            }),
        }
    }

    async fn query_scalar(&mut self, sql: &str) -> Result<Option<Value>, DbError> {
        self.log
            .borrow_mut()
            .queries
            .push((sql.to_string(), Vec::new()));
        Ok(self.own_session.clone())
    }

    async fn close(self) -> Result<(), DbError> {
        self.log.borrow_mut().closes += 1;
        Ok(())
    }
}

/// Minimal process row: session ID and status.
pub fn row(spid: i32, status: &str) -> Row {
    Row::new(vec![
        ("spid", Value::Int(i64::from(spid))),
        ("ecid", Value::Int(0)),
        ("status", Value::Text(status.to_string())),
    ])
}
