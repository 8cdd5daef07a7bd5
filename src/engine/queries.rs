use std::collections::BTreeSet;

use crate::model::*;

use super::{Engine, EngineError, Entity};

const CHARGE_OVERFLOW: EngineError = EngineError::LimitExceeded("charge total out of range");

fn sum_cents<'a>(mut lines: impl Iterator<Item = &'a ChargeLine>) -> Result<i64, EngineError> {
    lines.try_fold(0i64, |acc, l| acc.checked_add(l.total_cents).ok_or(CHARGE_OVERFLOW))
}

impl Engine {
    pub fn list_locations(&self) -> Vec<LocationInfo> {
        let mut locations: Vec<LocationInfo> =
            self.locations.iter().map(|e| e.value().clone()).collect();
        locations.sort_by_key(|l| l.id);
        locations
    }

    pub async fn list_chairs(&self, location_id: LocationId) -> Result<Vec<ChairInfo>, EngineError> {
        if !self.locations.contains_key(&location_id) {
            return Err(EngineError::NotFound(Entity::Location(location_id)));
        }
        let mut ids = self
            .location_chairs
            .get(&location_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.sort_unstable();

        let mut chairs = Vec::with_capacity(ids.len());
        for chair_id in ids {
            if let Some(cs) = self.get_chair(&ChairKey::new(location_id, chair_id)) {
                let guard = cs.read().await;
                chairs.push(ChairInfo {
                    location_id,
                    chair_id,
                    name: guard.name.clone(),
                });
            }
        }
        Ok(chairs)
    }

    pub fn list_services(&self) -> Vec<ServiceInfo> {
        let mut services: Vec<ServiceInfo> =
            self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        services
    }

    pub fn list_blackouts(&self) -> Vec<BlackoutInfo> {
        let mut blackouts: Vec<BlackoutInfo> =
            self.blackouts.iter().map(|e| e.value().clone()).collect();
        blackouts.sort_by_key(|b| b.id);
        blackouts
    }

    /// Services offered at a chair.
    pub async fn chair_services(&self, key: ChairKey) -> Result<Vec<ServiceInfo>, EngineError> {
        let cs = self
            .get_chair(&key)
            .ok_or(EngineError::NotFound(Entity::Chair(key)))?;
        let linked = cs.read().await.services.clone();
        Ok(linked
            .into_iter()
            .filter_map(|id| self.services.get(&id).map(|e| e.value().clone()))
            .collect())
    }

    pub async fn get_reservation(&self, id: ReservationId) -> Result<ReservationInfo, EngineError> {
        let key = self
            .chair_for_reservation(id)
            .ok_or(EngineError::NotFound(Entity::Reservation(id)))?;
        let cs = self
            .get_chair(&key)
            .ok_or(EngineError::NotFound(Entity::Chair(key)))?;
        let guard = cs.read().await;
        guard
            .reservation(id)
            .map(ReservationInfo::from)
            .ok_or(EngineError::NotFound(Entity::Reservation(id)))
    }

    pub async fn list_reservations(&self, key: ChairKey) -> Result<Vec<ReservationInfo>, EngineError> {
        let cs = self
            .get_chair(&key)
            .ok_or(EngineError::NotFound(Entity::Chair(key)))?;
        let guard = cs.read().await;
        Ok(guard.reservations.iter().map(ReservationInfo::from).collect())
    }

    /// True iff `at` falls within the reservation's closed window.
    ///
    /// Always read from the live chair state.
    pub async fn is_within_usage_window(
        &self,
        reservation_id: ReservationId,
        at: Ms,
    ) -> Result<bool, EngineError> {
        let r = self.get_reservation(reservation_id).await?;
        Ok(Span::new(r.start, r.end).contains_instant(at))
    }

    /// Distinct service ids attached to a reservation.
    pub async fn list_attached_services(
        &self,
        reservation_id: ReservationId,
    ) -> Result<BTreeSet<ServiceId>, EngineError> {
        Ok(self
            .service_attachments(reservation_id)
            .await?
            .into_iter()
            .map(|a| a.service_id)
            .collect())
    }

    /// Every service row of a reservation, duplicates included, in insertion order.
    pub async fn service_attachments(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Vec<ServiceAttachmentInfo>, EngineError> {
        let (key, cs) = self.reservation_chair(reservation_id)?;
        let guard = cs.read().await;
        Ok(guard
            .service_attachments
            .iter()
            .filter(|a| a.reservation_id == reservation_id)
            .map(|a| ServiceAttachmentInfo {
                row_id: a.row_id,
                reservation_id,
                location_id: key.location_id,
                chair_id: key.chair_id,
                service_id: a.service_id,
                user_id: a.user_id,
            })
            .collect())
    }

    pub async fn drink_attachments(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Vec<DrinkAttachmentInfo>, EngineError> {
        let (_, cs) = self.reservation_chair(reservation_id)?;
        let guard = cs.read().await;
        Ok(guard
            .drink_attachments
            .iter()
            .filter(|d| d.reservation_id == reservation_id)
            .map(|d| DrinkAttachmentInfo {
                row_id: d.row_id,
                reservation_id,
                user_id: d.user_id,
                service_id: d.service_id,
                quantity: d.quantity,
            })
            .collect())
    }

    /// Services offered at the reservation's chair that are not attached yet.
    pub async fn unbooked_services(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Vec<ServiceInfo>, EngineError> {
        let (_, cs) = self.reservation_chair(reservation_id)?;
        let guard = cs.read().await;
        let booked: BTreeSet<ServiceId> = guard
            .service_attachments
            .iter()
            .filter(|a| a.reservation_id == reservation_id)
            .map(|a| a.service_id)
            .collect();
        Ok(guard
            .services
            .iter()
            .filter(|id| !booked.contains(id))
            .filter_map(|id| self.services.get(id).map(|e| e.value().clone()))
            .collect())
    }

    /// Price lines for every attached service and drink row.
    pub async fn charges(&self, reservation_id: ReservationId) -> Result<Charges, EngineError> {
        let (_, cs) = self.reservation_chair(reservation_id)?;
        let rows: Vec<(ServiceId, u32)> = {
            let guard = cs.read().await;
            guard
                .service_attachments
                .iter()
                .filter(|a| a.reservation_id == reservation_id)
                .map(|a| (a.service_id, 1))
                .chain(
                    guard
                        .drink_attachments
                        .iter()
                        .filter(|d| d.reservation_id == reservation_id)
                        .map(|d| (d.service_id, d.quantity)),
                )
                .collect()
        };

        let mut lines = Vec::with_capacity(rows.len());
        for (service_id, quantity) in rows {
            let offering = self
                .services
                .get(&service_id)
                .map(|e| e.value().clone())
                .ok_or(EngineError::NotFound(Entity::Service(service_id)))?;
            let total_cents = offering
                .price_cents
                .checked_mul(i64::from(quantity))
                .ok_or(CHARGE_OVERFLOW)?;
            lines.push(ChargeLine {
                service_id,
                kind: offering.kind,
                paid: offering.paid,
                quantity,
                unit_price_cents: offering.price_cents,
                total_cents,
            });
        }

        let total_cents = sum_cents(lines.iter())?;
        let outstanding_cents = sum_cents(lines.iter().filter(|l| !l.paid))?;
        Ok(Charges {
            reservation_id,
            lines,
            total_cents,
            outstanding_cents,
        })
    }

    pub async fn usage_stats(&self, key: ChairKey) -> Result<UsageInfo, EngineError> {
        let cs = self
            .get_chair(&key)
            .ok_or(EngineError::NotFound(Entity::Chair(key)))?;
        let usage = cs.read().await.usage;
        Ok(UsageInfo {
            location_id: key.location_id,
            chair_id: key.chair_id,
            visits: usage.visits,
            hours: usage.hours,
        })
    }

    fn reservation_chair(
        &self,
        reservation_id: ReservationId,
    ) -> Result<(ChairKey, super::SharedChairState), EngineError> {
        let key = self
            .chair_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(Entity::Reservation(reservation_id)))?;
        let cs = self
            .get_chair(&key)
            .ok_or(EngineError::NotFound(Entity::Chair(key)))?;
        Ok((key, cs))
    }
}
