mod conflict;
mod error;
mod memberships;
mod reconcile;
mod reservations;
mod sessions;
mod store;
#[cfg(test)]
mod tests;

pub use conflict::{find_busy_slots, find_conflicts};
pub use error::{EngineError, ErrorKind};
pub use store::{SharedMembership, SharedReservation, SharedSession, Store};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::directory::Directory;
use crate::limits::MAX_ACTOR_LEN;
use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Blocks for one append, then drains whatever else is already
/// queued and commits the whole batch with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mark = wal.offset();
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // The whole batch fails together; cut it back out so no partial record
    // sits in front of the next one.
    if let Err(e) = &result {
        tracing::error!("journal batch of {} failed: {e}", batch.len());
        if let Err(e) = wal.truncate_to(mark) {
            tracing::error!("failed to roll journal back to byte {mark}: {e}");
        }
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Engine ───────────────────────────────────────────────

/// Sessions, reservations and memberships, with the counter bookkeeping that
/// ties them together.
pub struct Engine {
    pub(super) store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) directory: Arc<dyn Directory>,
    /// Serializes double-booking checks per user.
    pub(super) user_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Mutations hold this shared; compaction and the reconciler hold it
    /// exclusively. Never acquired twice on one call path.
    pub(super) write_gate: RwLock<()>,
    /// Makes every counter and suspension append fail.
    #[cfg(test)]
    pub(super) fail_secondary_writes: std::sync::atomic::AtomicBool,
}

impl Engine {
    /// Replay the journal at `wal_path` and start its writer task. Must be
    /// called from within a tokio runtime.
    pub fn new(wal_path: PathBuf, directory: Arc<dyn Directory>) -> io::Result<Self> {
        let replayed = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path, replayed.valid_len)?;
        let count = replayed.events.len();
        let store = Store::from_events(replayed.events);
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        tracing::debug!("replayed {count} events from {}", wal_path.display());
        Ok(Self {
            store,
            wal_tx,
            directory,
            user_locks: DashMap::new(),
            write_gate: RwLock::new(()),
            #[cfg(test)]
            fail_secondary_writes: std::sync::atomic::AtomicBool::new(false),
        })
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        #[cfg(test)]
        if self
            .fail_secondary_writes
            .load(std::sync::atomic::Ordering::SeqCst)
            && matches!(
                event,
                Event::RegisteredCountSet { .. }
                    | Event::ReservationsUsedSet { .. }
                    | Event::SuspensionOpened { .. }
                    | Event::SuspensionClosed { .. }
            )
        {
            return Err(EngineError::WalError("injected append failure".into()));
        }
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Rewrite the WAL with the minimal event set for the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let mut events = Vec::new();
        for s in self.store.all_sessions() {
            events.push(Event::SessionCreated {
                session: s.read().await.clone(),
            });
        }
        for m in self.store.all_memberships() {
            events.push(Event::MembershipCreated {
                membership: m.read().await.clone(),
            });
        }
        for suspension in self.store.all_suspensions() {
            events.push(Event::SuspensionOpened { suspension });
        }
        for r in self.store.all_reservations() {
            events.push(Event::ReservationCreated {
                reservation: r.read().await.clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    // ── Shared validation ────────────────────────────────

    pub(super) async fn ensure_exists(&self, entity: Entity, id: Ulid) -> Result<(), EngineError> {
        if self.directory.exists(entity, id).await? {
            Ok(())
        } else {
            Err(EngineError::not_found(entity, id))
        }
    }

    pub(super) fn user_lock(&self, user_id: Ulid) -> Arc<Mutex<()>> {
        self.user_locks.entry(user_id).or_default().value().clone()
    }
}

/// The "updated by" identity is mandatory on every mutation that records one.
pub(super) fn require_actor(actor: &str) -> Result<(), EngineError> {
    if actor.trim().is_empty() {
        return Err(EngineError::Validation("updated_by is required".into()));
    }
    if actor.len() > MAX_ACTOR_LEN {
        return Err(EngineError::LimitExceeded("updated_by too long"));
    }
    Ok(())
}

pub(super) fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

/// `current + delta`, floored at zero.
pub(super) fn apply_delta(current: u32, delta: i64) -> u32 {
    (i64::from(current) + delta).clamp(0, i64::from(u32::MAX)) as u32
}
