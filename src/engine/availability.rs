use crate::limits::*;
use crate::model::*;

use super::conflict::{first_conflict, validate_span};
use super::{Engine, EngineError, Entity};

// ── Availability ──────────────────────────────────────────────────
//
// Reads here are point-in-time snapshots. Each chair is read-locked only while
// it is being checked, so the result can be stale by the time a caller acts on
// it; `reserve` always rechecks under the write lock.

fn validate_query(span: &Span) -> Result<(), EngineError> {
    validate_span(span)?;
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    /// Chairs at `location_id` with no reservation overlapping `span`, by chair id.
    pub async fn list_available(
        &self,
        location_id: LocationId,
        span: Span,
    ) -> Result<Vec<ChairInfo>, EngineError> {
        validate_query(&span)?;
        if !self.locations.contains_key(&location_id) {
            return Err(EngineError::NotFound(Entity::Location(location_id)));
        }

        let mut chair_ids = self
            .location_chairs
            .get(&location_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        chair_ids.sort_unstable();

        let mut free = Vec::new();
        for chair_id in chair_ids {
            let key = ChairKey::new(location_id, chair_id);
            let Some(cs) = self.get_chair(&key) else { continue };
            let guard = cs.read().await;
            if first_conflict(&guard, &span).is_none() {
                free.push(ChairInfo {
                    location_id,
                    chair_id,
                    name: guard.name.clone(),
                });
            }
        }
        Ok(free)
    }

    /// Single-chair availability check.
    pub async fn is_available(&self, key: ChairKey, span: Span) -> Result<bool, EngineError> {
        validate_query(&span)?;
        let cs = self
            .get_chair(&key)
            .ok_or(EngineError::NotFound(Entity::Chair(key)))?;
        let guard = cs.read().await;
        Ok(first_conflict(&guard, &span).is_none())
    }

    /// Tournaments overlapping `span`, by id. Advisory only.
    pub fn blackouts_overlapping(&self, span: &Span) -> Vec<BlackoutInfo> {
        let mut hits: Vec<BlackoutInfo> = self
            .blackouts
            .iter()
            .filter(|e| e.value().span().overlaps(span))
            .map(|e| e.value().clone())
            .collect();
        hits.sort_by_key(|b| b.id);
        hits
    }

    pub fn has_blackout_conflict(&self, span: &Span) -> bool {
        self.blackouts.iter().any(|e| e.value().span().overlaps(span))
    }
}
