use std::sync::atomic::Ordering;

use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_name, validate_span};
use super::{Engine, EngineError, Entity, WalCommand};

impl Engine {
    // ── Catalog provisioning ─────────────────────────────────

    pub async fn create_location(&self, id: LocationId, name: String) -> Result<(), EngineError> {
        validate_name(&name)?;
        let _catalog = self.catalog_lock.lock().await;
        if self.locations.len() >= MAX_LOCATIONS {
            return Err(EngineError::LimitExceeded("too many locations"));
        }
        if self.locations.contains_key(&id) {
            return Err(EngineError::AlreadyExists(Entity::Location(id)));
        }
        self.persist_catalog(&Event::LocationCreated { id, name }).await
    }

    pub async fn create_chair(&self, key: ChairKey, name: Option<String>) -> Result<(), EngineError> {
        if let Some(ref n) = name {
            validate_name(n)?;
        }
        let _catalog = self.catalog_lock.lock().await;
        if !self.locations.contains_key(&key.location_id) {
            return Err(EngineError::NotFound(Entity::Location(key.location_id)));
        }
        if self.chairs.contains_key(&key) {
            return Err(EngineError::AlreadyExists(Entity::Chair(key)));
        }
        let at_location = self
            .location_chairs
            .get(&key.location_id)
            .map_or(0, |e| e.value().len());
        if at_location >= MAX_CHAIRS_PER_LOCATION {
            return Err(EngineError::LimitExceeded("too many chairs at location"));
        }
        self.persist_catalog(&Event::ChairCreated { key, name }).await
    }

    pub async fn create_service(
        &self,
        id: ServiceId,
        price_cents: i64,
        paid: bool,
        kind: ServiceKind,
    ) -> Result<(), EngineError> {
        if price_cents < 0 {
            return Err(EngineError::InvalidRange("price must not be negative"));
        }
        if price_cents > MAX_PRICE_CENTS {
            return Err(EngineError::LimitExceeded("price too large"));
        }
        let _catalog = self.catalog_lock.lock().await;
        if self.services.len() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if self.services.contains_key(&id) {
            return Err(EngineError::AlreadyExists(Entity::Service(id)));
        }
        let event = Event::ServiceCreated { id, price_cents, paid, kind };
        self.persist_catalog(&event).await
    }

    /// Offer a service at a chair. Linking twice is a no-op.
    pub async fn link_service(&self, key: ChairKey, service_id: ServiceId) -> Result<(), EngineError> {
        if !self.services.contains_key(&service_id) {
            return Err(EngineError::NotFound(Entity::Service(service_id)));
        }
        let mut guard = self.lock_chair(&key).await?;
        if guard.services.contains(&service_id) {
            return Ok(());
        }
        let event = Event::ServiceLinked { key, service_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn add_blackout(
        &self,
        id: BlackoutId,
        name: Option<String>,
        span: Span,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        if let Some(ref n) = name {
            validate_name(n)?;
        }
        let _catalog = self.catalog_lock.lock().await;
        if self.blackouts.len() >= MAX_BLACKOUTS {
            return Err(EngineError::LimitExceeded("too many tournaments"));
        }
        if self.blackouts.contains_key(&id) {
            return Err(EngineError::AlreadyExists(Entity::Blackout(id)));
        }
        self.persist_catalog(&Event::BlackoutAdded { id, name, span }).await
    }

    // ── Reservation transaction ──────────────────────────────

    /// Reserve a chair for `span`.
    ///
    /// The tournament check runs first and never blocks. The availability check
    /// is then repeated under the chair's write lock, so of two overlapping
    /// requests for the same chair exactly one commits; the other gets
    /// `Conflict`. The lock guard is dropped on every return path, and a WAL
    /// failure leaves no reservation behind.
    pub async fn reserve(
        &self,
        user_id: UserId,
        key: ChairKey,
        span: Span,
    ) -> Result<Reserved, EngineError> {
        validate_span(&span)?;
        if !self.locations.contains_key(&key.location_id) {
            return Err(EngineError::NotFound(Entity::Location(key.location_id)));
        }

        let blackouts = self.blackouts_overlapping(&span);
        if !blackouts.is_empty() {
            tracing::info!(
                "reservation request on {key} overlaps {} tournament(s)",
                blackouts.len()
            );
        }

        let mut guard = self.lock_chair(&key).await?;
        if guard.row_count() >= MAX_ROWS_PER_CHAIR {
            return Err(EngineError::LimitExceeded("too many rows on chair"));
        }

        if let Err(e) = check_no_conflict(&guard, &span) {
            metrics::counter!(crate::observability::RESERVATIONS_CONFLICTED_TOTAL).increment(1);
            tracing::debug!("reservation rejected: {e}");
            return Err(e);
        }

        let id = self.next_reservation_id.fetch_add(1, Ordering::SeqCst);
        let event = Event::ReservationCreated { id, user_id, key, span };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::RESERVATIONS_COMMITTED_TOTAL).increment(1);
        tracing::debug!("reservation {id} committed on {key} for user {user_id}");

        let reservation = ReservationInfo::from(&Reservation { id, user_id, key, span });
        Ok(Reserved { reservation, blackouts })
    }

    // ── Attachments ──────────────────────────────────────────

    /// Attach one row per service id to a reservation, all or nothing.
    ///
    /// Services must exist in the catalog but need not be linked to the chair.
    /// Repeated ids produce repeated rows. Returns the new row ids in order.
    pub async fn attach_services(
        &self,
        key: ChairKey,
        user_id: UserId,
        reservation_id: ReservationId,
        service_ids: &[ServiceId],
    ) -> Result<Vec<Ulid>, EngineError> {
        if service_ids.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        for service_id in service_ids {
            if !self.services.contains_key(service_id) {
                return Err(EngineError::NotFound(Entity::Service(*service_id)));
            }
        }

        let mut guard = self.lock_chair(&key).await?;
        match guard.reservation(reservation_id) {
            Some(r) if r.user_id == user_id => {}
            _ => return Err(EngineError::NotFound(Entity::Reservation(reservation_id))),
        }
        if service_ids.is_empty() {
            return Ok(Vec::new());
        }
        if guard.row_count() + service_ids.len() > MAX_ROWS_PER_CHAIR {
            return Err(EngineError::LimitExceeded("too many rows on chair"));
        }

        let rows: Vec<(Ulid, ServiceId)> = service_ids.iter().map(|s| (Ulid::new(), *s)).collect();
        let row_ids = rows.iter().map(|(row_id, _)| *row_id).collect();
        let event = Event::ServicesAttached {
            key,
            reservation_id,
            user_id,
            rows,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(row_ids)
    }

    /// Append a drink row. Quantities are never merged with earlier rows.
    pub async fn attach_drink(
        &self,
        user_id: UserId,
        reservation_id: ReservationId,
        service_id: ServiceId,
        quantity: i64,
    ) -> Result<Ulid, EngineError> {
        if quantity <= 0 {
            return Err(EngineError::InvalidRange("quantity must be positive"));
        }
        if quantity > MAX_DRINK_QUANTITY {
            return Err(EngineError::LimitExceeded("quantity too large"));
        }
        match self.services.get(&service_id) {
            Some(s) if s.kind == ServiceKind::Drink => {}
            _ => return Err(EngineError::NotFound(Entity::Service(service_id))),
        }

        let (key, mut guard) = self.resolve_reservation_write(reservation_id).await?;
        match guard.reservation(reservation_id) {
            Some(r) if r.user_id == user_id => {}
            _ => return Err(EngineError::NotFound(Entity::Reservation(reservation_id))),
        }
        if guard.row_count() >= MAX_ROWS_PER_CHAIR {
            return Err(EngineError::LimitExceeded("too many rows on chair"));
        }

        let row_id = Ulid::new();
        let event = Event::DrinkAttached {
            row_id,
            key,
            reservation_id,
            user_id,
            service_id,
            // bounded by MAX_DRINK_QUANTITY above
            quantity: quantity as u32,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(row_id)
    }

    // ── Usage ────────────────────────────────────────────────

    /// Count one visit and `hours` of use against the reservation's chair.
    ///
    /// Runs under the chair's write lock, so concurrent recordings never lose an
    /// increment.
    pub async fn record_usage(
        &self,
        reservation_id: ReservationId,
        hours: f64,
    ) -> Result<UsageStats, EngineError> {
        if !hours.is_finite() || hours < 0.0 {
            return Err(EngineError::InvalidRange("hours must be a non-negative number"));
        }
        let (key, mut guard) = self.resolve_reservation_write(reservation_id).await?;
        let event = Event::UsageRecorded { key, reservation_id, hours };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::debug!("usage recorded for reservation {reservation_id} on {key}: {hours}h");
        Ok(guard.usage)
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Holds the catalog lock and a read lock on every chair until the writer has
    /// swapped files, so no mutation can land in the old file after its snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let mut events = Vec::new();

        let mut locations: Vec<LocationInfo> =
            self.locations.iter().map(|e| e.value().clone()).collect();
        locations.sort_by_key(|l| l.id);
        events.extend(locations.into_iter().map(|l| Event::LocationCreated { id: l.id, name: l.name }));

        let mut services: Vec<ServiceInfo> =
            self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        events.extend(services.into_iter().map(|s| Event::ServiceCreated {
            id: s.id,
            price_cents: s.price_cents,
            paid: s.paid,
            kind: s.kind,
        }));

        let mut blackouts: Vec<BlackoutInfo> =
            self.blackouts.iter().map(|e| e.value().clone()).collect();
        blackouts.sort_by_key(|b| b.id);
        events.extend(blackouts.into_iter().map(|b| Event::BlackoutAdded {
            id: b.id,
            name: b.name,
            span: Span::new(b.start, b.end),
        }));

        let mut keys: Vec<ChairKey> = self.chairs.iter().map(|e| *e.key()).collect();
        keys.sort();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(cs) = self.get_chair(&key) {
                guards.push(cs.read_owned().await);
            }
        }

        for cs in &guards {
            let key = cs.key;
            events.push(Event::ChairCreated { key, name: cs.name.clone() });
            for service_id in &cs.services {
                events.push(Event::ServiceLinked { key, service_id: *service_id });
            }
            for r in &cs.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    user_id: r.user_id,
                    key,
                    span: r.span,
                });
            }
            // Consecutive rows of one reservation and user fold back into one batch.
            let mut batches: Vec<((ReservationId, UserId), Vec<(Ulid, ServiceId)>)> = Vec::new();
            for a in &cs.service_attachments {
                let owner = (a.reservation_id, a.user_id);
                match batches.last_mut() {
                    Some((last, rows)) if *last == owner => rows.push((a.row_id, a.service_id)),
                    _ => batches.push((owner, vec![(a.row_id, a.service_id)])),
                }
            }
            for ((reservation_id, user_id), rows) in batches {
                events.push(Event::ServicesAttached { key, reservation_id, user_id, rows });
            }
            for d in &cs.drink_attachments {
                events.push(Event::DrinkAttached {
                    row_id: d.row_id,
                    key,
                    reservation_id: d.reservation_id,
                    user_id: d.user_id,
                    service_id: d.service_id,
                    quantity: d.quantity,
                });
            }
            if cs.usage != UsageStats::default() {
                events.push(Event::UsageRestored { key, usage: cs.usage });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StorageFailure("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::StorageFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageFailure(e.to_string()));
        drop(guards);
        result
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

    /// Make the next WAL batch fail after writing part of itself.
    #[cfg(test)]
    pub(super) async fn fail_next_wal_flush(&self) {
        let _ = self.wal_tx.send(WalCommand::FailNextFlush).await;
    }
}
