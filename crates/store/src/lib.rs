//! Sift store: search sessions and the async driver that feeds them
//! commands and publishes snapshots.

#![forbid(unsafe_code)]

mod session;

pub use session::{SearchSession, SessionState};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use arc_swap::ArcSwap;
use sift_core::SearchConfig;
use sift_facets::FilterSetAction;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetQuery(String),
    Apply(FilterSetAction),
}

/// FIFO of pending commands. A query directly following another query
/// replaces it; actions keep their position between queries.
pub struct Coalescer {
    queue: VecDeque<Command>,
    collapsed: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { queue: VecDeque::with_capacity(cap), collapsed: 0 }
    }

    pub fn len(&self) -> usize { self.queue.len() }
    pub fn is_empty(&self) -> bool { self.queue.is_empty() }
    /// Queries replaced before they ran.
    pub fn collapsed(&self) -> u64 { self.collapsed }

    pub fn push(&mut self, cmd: Command) {
        if matches!((&cmd, self.queue.back()), (Command::SetQuery(_), Some(Command::SetQuery(_)))) {
            self.queue.pop_back();
            self.collapsed += 1;
        }
        self.queue.push_back(cmd);
    }

    pub fn drain_ready(&mut self) -> Vec<Command> { self.queue.drain(..).collect() }
}

/// Handle for readers to access the current state and subscribe to swaps.
#[derive(Clone)]
pub struct SessionHandle {
    snap: Arc<ArcSwap<SessionState>>,
    epoch_rx: watch::Receiver<u64>,
}

impl SessionHandle {
    pub fn current(&self) -> Arc<SessionState> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

fn run_batch(session: &mut SearchSession, batch: Vec<Command>) {
    for cmd in batch {
        match cmd {
            Command::SetQuery(text) => { session.set_query(&text); }
            Command::Apply(action) => { session.apply_action(&action); }
        }
    }
}

/// Spawn a loop owning `session`: commands are coalesced, applied in batches,
/// and each resulting state is swapped in for readers. Must be called from
/// within a tokio runtime. The loop drains and exits once every sender is
/// dropped.
///
/// The driver debounces: queries sent back to back within one tick run as
/// the last of them only, so selections carry forward from the state before
/// the run rather than through each intermediate query. Call
/// [`SearchSession::set_query`] directly when every step must apply.
pub fn spawn_session(session: SearchSession, cap: usize) -> (mpsc::Sender<Command>, SessionHandle) {
    let (tx, mut rx) = mpsc::channel::<Command>(cap.max(1));
    let initial = session.state();
    let (epoch_tx, epoch_rx) = watch::channel(initial.epoch);
    let snap = Arc::new(ArcSwap::new(initial));
    let snap_clone = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut session = session;
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(8));
        let publish = |session: &mut SearchSession, coalescer: &mut Coalescer| {
            let batch = coalescer.drain_ready();
            if batch.is_empty() { return; }
            run_batch(session, batch);
            let next = session.state();
            let epoch = next.epoch;
            snap_clone.store(next);
            let _ = epoch_tx.send(epoch);
        };
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(cmd) => coalescer.push(cmd),
                        None => {
                            debug!("command channel closed; draining and exiting session loop");
                            publish(&mut session, &mut coalescer);
                            break;
                        }
                    }
                }
                _ = ticker.tick() => publish(&mut session, &mut coalescer),
            }
        }
        info!(collapsed = coalescer.collapsed(), "session loop stopped");
    });

    (tx, SessionHandle { snap, epoch_rx })
}

/// Build the index for `records` on a blocking worker and open a session on it.
pub async fn build_session<R>(records: Vec<R>, config: SearchConfig<R>) -> anyhow::Result<SearchSession>
where
    R: Send + 'static,
{
    let started = Instant::now();
    let n = records.len();
    let session = tokio::task::spawn_blocking(move || SearchSession::new(&records, &config))
        .await
        .context("index build task failed")?
        .context("building search index")?;
    info!(records = n, took_ms = %started.elapsed().as_millis(), "search session ready");
    Ok(session)
}
