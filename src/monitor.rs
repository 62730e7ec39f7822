//! The polling loop: fetch a snapshot, narrow it to the watched processes,
//! and keep waiting until none of them are active.
//!
//! Every poll is an independent full snapshot; nothing is carried over
//! from the previous one except the loop's own bookkeeping.

use crate::db::{self, DbError, DbSession};
use crate::display::Console;
use crate::process::ProcessRecord;
use std::collections::BTreeSet;
use std::future::Future;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Which processes to wait for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// Explicit session IDs (distinct, positive).
    Sessions(BTreeSet<i32>),
    /// Every session belonging to one login, matched exactly by the server.
    Login(String),
}

impl WatchTarget {
    /// Login to pass to the server-side filter, if any.
    pub fn login_filter(&self) -> Option<&str> {
        match self {
            WatchTarget::Sessions(_) => None,
            WatchTarget::Login(login) => Some(login),
        }
    }

    fn matches(&self, record: &ProcessRecord) -> bool {
        match self {
            WatchTarget::Sessions(ids) => ids.contains(&record.session_id),
            // Already narrowed by the server
            WatchTarget::Login(_) => true,
        }
    }
}

/// Loop state. `DoneIdle` and `DoneError` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Polling,
    DoneIdle,
    DoneError,
}

/// How a monitoring session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing watched is active any more.
    Idle,
    /// Stopped by a shutdown signal.
    Interrupted,
}

/// Classification of one snapshot.
#[derive(Debug)]
pub struct Assessment<'a> {
    /// Records matching the target, excluding the monitor's own session.
    pub relevant: Vec<&'a ProcessRecord>,
    /// Relevant records that are active.
    pub live: Vec<&'a ProcessRecord>,
}

impl Assessment<'_> {
    /// Nothing left to wait for. An empty relevant set counts as idle.
    pub fn is_idle(&self) -> bool {
        self.live.is_empty()
    }
}

/// Narrow a snapshot to the watched processes and pick out the active ones.
pub fn assess<'a>(
    snapshot: &'a [ProcessRecord],
    target: &WatchTarget,
    own_session_id: i32,
) -> Assessment<'a> {
    let relevant: Vec<&ProcessRecord> = snapshot
        .iter()
        .filter(|record| record.session_id != own_session_id && target.matches(record))
        .collect();
    let live = relevant
        .iter()
        .copied()
        .filter(|record| record.is_active())
        .collect();
    Assessment { relevant, live }
}

/// Polling loop over one database session.
pub struct Monitor {
    target: WatchTarget,
    interval: Duration,
    own_session_id: i32,
    state: MonitorState,
    polls: u64,
}

impl Monitor {
    pub fn new(target: WatchTarget, interval: Duration, own_session_id: i32) -> Self {
        Self {
            target,
            interval,
            own_session_id,
            state: MonitorState::Polling,
            polls: 0,
        }
    }

    /// Look up the session's own ID and announce it, then return a monitor
    /// ready to poll.
    pub async fn start<S, O, E>(
        session: &mut S,
        target: WatchTarget,
        interval: Duration,
        console: &mut Console<O, E>,
    ) -> Result<Self, DbError>
    where
        S: DbSession,
        O: Write,
        E: Write,
    {
        let own_session_id = db::own_session_id(session).await?;
        info!(own_session_id, ?target, "monitoring started");
        console.started(own_session_id);
        Ok(Self::new(target, interval, own_session_id))
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }

    /// Fetch and classify one snapshot, updating the state.
    ///
    /// Returns the number of live processes; zero means the loop is done.
    async fn poll<S, O, E>(
        &mut self,
        session: &mut S,
        console: &mut Console<O, E>,
    ) -> Result<usize, DbError>
    where
        S: DbSession,
        O: Write,
        E: Write,
    {
        let snapshot = match db::fetch_processes(session, self.target.login_filter()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.state = MonitorState::DoneError;
                return Err(e);
            }
        };
        self.polls += 1;

        let assessment = assess(&snapshot, &self.target, self.own_session_id);
        debug!(
            poll = self.polls,
            total = snapshot.len(),
            relevant = assessment.relevant.len(),
            live = assessment.live.len(),
            "polled process list"
        );

        for record in &assessment.live {
            trace!(
                session_id = record.session_id,
                ecid = record.execution_context_id,
                login = %record.login_name,
                host = %record.host_name,
                program = %record.program_name,
                wait_type = %record.last_wait_type,
                open_transactions = record.open_transactions,
                "live process"
            );
        }

        if assessment.is_idle() {
            self.state = MonitorState::DoneIdle;
            console.finished();
        } else {
            console.waiting(
                &assessment.live,
                assessment.relevant.len(),
                chrono::Local::now(),
            );
        }
        Ok(assessment.live.len())
    }

    /// Poll until nothing watched is active, sleeping between polls.
    ///
    /// A fetch error ends the loop immediately; there is no retry.
    pub async fn run<S, O, E>(
        &mut self,
        session: &mut S,
        console: &mut Console<O, E>,
    ) -> Result<(), DbError>
    where
        S: DbSession,
        O: Write,
        E: Write,
    {
        while self.poll(session, console).await? > 0 {
            tokio::time::sleep(self.interval).await;
        }
        info!(polls = self.polls, "no active processes remain");
        Ok(())
    }
}

/// Run a full monitoring session and close the database session on every
/// exit path: completion, fetch error, or `shutdown` resolving.
pub async fn watch<S, O, E, F>(
    mut session: S,
    target: WatchTarget,
    interval: Duration,
    console: &mut Console<O, E>,
    shutdown: F,
) -> Result<Outcome, DbError>
where
    S: DbSession,
    O: Write,
    E: Write,
    F: Future<Output = ()>,
{
    let result = tokio::select! {
        result = async {
            let mut monitor = Monitor::start(&mut session, target, interval, console).await?;
            monitor.run(&mut session, console).await?;
            debug!(state = ?monitor.state(), polls = monitor.polls(), "monitor finished");
            Ok::<_, DbError>(Outcome::Idle)
        } => result,
        () = shutdown => {
            info!("shutdown requested, stopping monitor");
            Ok(Outcome::Interrupted)
        }
    };

    if let Err(e) = session.close().await {
        warn!(error = %e, "failed to close database session");
    }
    result
}
