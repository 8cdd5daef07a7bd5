mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use error::{EngineError, Entity};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};

use crate::model::*;
use crate::wal::Wal;

pub type SharedChairState = Arc<RwLock<ChairState>>;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

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
    #[cfg(test)]
    FailNextFlush,
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            commit_batch(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    commit_batch(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(ref e) = result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        // Every caller in the batch is told it failed, so none of it may reach replay.
        if let Err(e) = wal.discard_pending() {
            tracing::error!("could not truncate WAL after failed batch: {e}");
        }
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        #[cfg(test)]
        WalCommand::FailNextFlush => wal.fail_next_flush(),
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// One beach store: catalog, chairs with their reservations, and the WAL behind them.
///
/// Every operation takes `&self`; there is no ambient session state. Chair-level
/// mutations serialize on the chair's write lock, catalog mutations on `catalog_lock`.
pub struct Engine {
    pub(super) locations: DashMap<LocationId, LocationInfo>,
    pub(super) chairs: DashMap<ChairKey, SharedChairState>,
    /// Location → chair ids, for availability scans.
    pub(super) location_chairs: DashMap<LocationId, Vec<ChairId>>,
    pub(super) services: DashMap<ServiceId, ServiceInfo>,
    pub(super) blackouts: DashMap<BlackoutId, BlackoutInfo>,
    /// Reverse lookup: reservation id → chair.
    pub(super) reservation_index: DashMap<ReservationId, ChairKey>,
    pub(super) next_reservation_id: AtomicU64,
    pub(super) catalog_lock: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    lock_timeout: Duration,
}

/// Apply a chair-scoped event. Caller holds the chair lock.
fn apply_to_chair(
    cs: &mut ChairState,
    event: &Event,
    index: &DashMap<ReservationId, ChairKey>,
) {
    match event {
        Event::ServiceLinked { service_id, .. } => {
            cs.services.insert(*service_id);
        }
        Event::ReservationCreated { id, user_id, key, span } => {
            cs.insert_reservation(Reservation {
                id: *id,
                user_id: *user_id,
                key: *key,
                span: *span,
            });
            index.insert(*id, *key);
        }
        Event::ServicesAttached { reservation_id, user_id, rows, .. } => {
            cs.service_attachments
                .extend(rows.iter().map(|(row_id, service_id)| ServiceAttachment {
                    row_id: *row_id,
                    reservation_id: *reservation_id,
                    user_id: *user_id,
                    service_id: *service_id,
                }));
        }
        Event::DrinkAttached {
            row_id,
            reservation_id,
            user_id,
            service_id,
            quantity,
            ..
        } => {
            cs.drink_attachments.push(DrinkAttachment {
                row_id: *row_id,
                reservation_id: *reservation_id,
                user_id: *user_id,
                service_id: *service_id,
                quantity: *quantity,
            });
        }
        Event::UsageRecorded { hours, .. } => {
            cs.usage.visits += 1;
            cs.usage.hours += *hours;
        }
        Event::UsageRestored { usage, .. } => {
            cs.usage = *usage;
        }
        // Catalog events are handled at the DashMap level, not here
        Event::LocationCreated { .. }
        | Event::ChairCreated { .. }
        | Event::ServiceCreated { .. }
        | Event::BlackoutAdded { .. } => {}
    }
}

/// Chair targeted by a chair-scoped event.
fn event_chair(event: &Event) -> Option<ChairKey> {
    match event {
        Event::ServiceLinked { key, .. }
        | Event::ReservationCreated { key, .. }
        | Event::ServicesAttached { key, .. }
        | Event::DrinkAttached { key, .. }
        | Event::UsageRecorded { key, .. }
        | Event::UsageRestored { key, .. } => Some(*key),
        Event::LocationCreated { .. }
        | Event::ChairCreated { .. }
        | Event::ServiceCreated { .. }
        | Event::BlackoutAdded { .. } => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, lock_timeout: Duration) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            locations: DashMap::new(),
            chairs: DashMap::new(),
            location_chairs: DashMap::new(),
            services: DashMap::new(),
            blackouts: DashMap::new(),
            reservation_index: DashMap::new(),
            next_reservation_id: AtomicU64::new(1),
            catalog_lock: Mutex::new(()),
            wal_tx,
            lock_timeout,
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds instantly. Never use blocking_write here: this may run inside
        // an async context (lazy store creation).
        let mut max_reservation_id = 0;
        for event in &events {
            if let Event::ReservationCreated { id, .. } = event {
                max_reservation_id = max_reservation_id.max(*id);
            }
            match event_chair(event) {
                Some(key) => {
                    if let Some(entry) = engine.chairs.get(&key) {
                        let cs = entry.value().clone();
                        drop(entry);
                        if let Ok(mut guard) = cs.try_write() {
                            apply_to_chair(&mut guard, event, &engine.reservation_index);
                        }
                    }
                }
                None => engine.apply_catalog(event),
            }
        }
        engine
            .next_reservation_id
            .store(max_reservation_id + 1, Ordering::SeqCst);
        tracing::debug!(
            "replayed {} events from {}",
            events.len(),
            wal_path.display()
        );

        Ok(engine)
    }

    /// Apply a catalog event to the DashMap-level indexes.
    fn apply_catalog(&self, event: &Event) {
        match event {
            Event::LocationCreated { id, name } => {
                self.locations.insert(*id, LocationInfo { id: *id, name: name.clone() });
            }
            Event::ChairCreated { key, name } => {
                let cs = ChairState::new(*key, name.clone());
                self.chairs.insert(*key, Arc::new(RwLock::new(cs)));
                self.location_chairs
                    .entry(key.location_id)
                    .or_default()
                    .push(key.chair_id);
            }
            Event::ServiceCreated { id, price_cents, paid, kind } => {
                self.services.insert(
                    *id,
                    ServiceInfo {
                        id: *id,
                        price_cents: *price_cents,
                        paid: *paid,
                        kind: *kind,
                    },
                );
            }
            Event::BlackoutAdded { id, name, span } => {
                self.blackouts.insert(
                    *id,
                    BlackoutInfo {
                        id: *id,
                        name: name.clone(),
                        start: span.start,
                        end: span.end,
                    },
                );
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StorageFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageFailure(e.to_string()))
    }

    pub fn get_chair(&self, key: &ChairKey) -> Option<SharedChairState> {
        self.chairs.get(key).map(|e| e.value().clone())
    }

    pub fn chair_for_reservation(&self, id: ReservationId) -> Option<ChairKey> {
        self.reservation_index.get(&id).map(|e| *e.value())
    }

    /// WAL-append then apply. Nothing is applied if the append fails, so a
    /// storage failure leaves the chair exactly as it was.
    pub(super) async fn persist_and_apply(
        &self,
        cs: &mut ChairState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_chair(cs, event, &self.reservation_index);
        Ok(())
    }

    /// WAL-append then apply for catalog events. Caller holds `catalog_lock`.
    pub(super) async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_catalog(event);
        Ok(())
    }

    /// Acquire a chair's write lock, giving up after the configured timeout.
    pub(super) async fn lock_chair(
        &self,
        key: &ChairKey,
    ) -> Result<OwnedRwLockWriteGuard<ChairState>, EngineError> {
        let cs = self
            .get_chair(key)
            .ok_or(EngineError::NotFound(Entity::Chair(*key)))?;
        tokio::time::timeout(self.lock_timeout, cs.write_owned())
            .await
            .map_err(|_| {
                tracing::warn!("lock wait on {key} exceeded {:?}", self.lock_timeout);
                EngineError::Timeout(*key)
            })
    }

    /// Lookup reservation → chair, acquire the chair's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: ReservationId,
    ) -> Result<(ChairKey, OwnedRwLockWriteGuard<ChairState>), EngineError> {
        let key = self
            .chair_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(Entity::Reservation(reservation_id)))?;
        let guard = self.lock_chair(&key).await?;
        Ok((key, guard))
    }
}
