use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub type LocationId = u32;
pub type ChairId = u32;
pub type ServiceId = u32;
pub type BlackoutId = u32;
pub type UserId = u64;
pub type ReservationId = u64;

pub const DAY_MS: Ms = 86_400_000;

/// Interval overlap with inclusive bounds on both sides.
///
/// Two ranges that merely touch at an endpoint overlap.
pub fn overlaps(existing_begin: Ms, existing_end: Ms, requested_begin: Ms, requested_end: Ms) -> bool {
    let within = |t: Ms, lo: Ms, hi: Ms| lo <= t && t <= hi;
    within(requested_begin, existing_begin, existing_end)
        || within(requested_end, existing_begin, existing_end)
        || within(existing_begin, requested_begin, requested_end)
        || within(existing_end, requested_begin, requested_end)
}

/// Parse a `YYYY-MM-DD` date as midnight UTC.
pub fn date_to_ms(s: &str) -> Result<Ms, chrono::ParseError> {
    let date = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")?;
    Ok(date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp_millis())
}

/// Closed interval `[start, end]`.
///
/// Construction does not validate ordering; the engine rejects `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn is_ordered(&self) -> bool {
        self.start <= self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t <= self.end
    }
}

/// Chair ids are only unique within a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChairKey {
    pub location_id: LocationId,
    pub chair_id: ChairId,
}

impl ChairKey {
    pub fn new(location_id: LocationId, chair_id: ChairId) -> Self {
        Self { location_id, chair_id }
    }
}

impl fmt::Display for ChairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chair {} at location {}", self.chair_id, self.location_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Physical add-on (parasol, towel, ...), billed once per attachment.
    Addon,
    /// Metered drink, billed per unit.
    Drink,
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "addon" | "service" => Ok(ServiceKind::Addon),
            "drink" => Ok(ServiceKind::Drink),
            other => Err(format!("unknown service kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub user_id: UserId,
    pub key: ChairKey,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAttachment {
    pub row_id: Ulid,
    pub reservation_id: ReservationId,
    pub user_id: UserId,
    pub service_id: ServiceId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrinkAttachment {
    pub row_id: Ulid,
    pub reservation_id: ReservationId,
    pub user_id: UserId,
    pub service_id: ServiceId,
    pub quantity: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub visits: u64,
    pub hours: f64,
}

#[derive(Debug, Clone)]
pub struct ChairState {
    pub key: ChairKey,
    pub name: Option<String>,
    /// Service offerings linked to this chair.
    pub services: BTreeSet<ServiceId>,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
    pub service_attachments: Vec<ServiceAttachment>,
    pub drink_attachments: Vec<DrinkAttachment>,
    pub usage: UsageStats,
}

impl ChairState {
    pub fn new(key: ChairKey, name: Option<String>) -> Self {
        Self {
            key,
            name,
            services: BTreeSet::new(),
            reservations: Vec::new(),
            service_attachments: Vec::new(),
            drink_attachments: Vec::new(),
            usage: UsageStats::default(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Reservations whose closed span overlaps the query, boundary touches included.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        // Everything at index >= right_bound starts after query.end.
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start <= query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end >= query.start)
    }

    pub fn row_count(&self) -> usize {
        self.reservations.len() + self.service_attachments.len() + self.drink_attachments.len()
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    LocationCreated {
        id: LocationId,
        name: String,
    },
    ChairCreated {
        key: ChairKey,
        name: Option<String>,
    },
    ServiceCreated {
        id: ServiceId,
        price_cents: i64,
        paid: bool,
        kind: ServiceKind,
    },
    ServiceLinked {
        key: ChairKey,
        service_id: ServiceId,
    },
    BlackoutAdded {
        id: BlackoutId,
        name: Option<String>,
        span: Span,
    },
    ReservationCreated {
        id: ReservationId,
        user_id: UserId,
        key: ChairKey,
        span: Span,
    },
    /// One batch of service rows, written and replayed as a unit.
    ServicesAttached {
        key: ChairKey,
        reservation_id: ReservationId,
        user_id: UserId,
        rows: Vec<(Ulid, ServiceId)>,
    },
    DrinkAttached {
        row_id: Ulid,
        key: ChairKey,
        reservation_id: ReservationId,
        user_id: UserId,
        service_id: ServiceId,
        quantity: u32,
    },
    UsageRecorded {
        key: ChairKey,
        reservation_id: ReservationId,
        hours: f64,
    },
    /// Absolute counters, only emitted by compaction.
    UsageRestored {
        key: ChairKey,
        usage: UsageStats,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationInfo {
    pub id: LocationId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChairInfo {
    pub location_id: LocationId,
    pub chair_id: ChairId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub id: ServiceId,
    pub price_cents: i64,
    pub paid: bool,
    pub kind: ServiceKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlackoutInfo {
    pub id: BlackoutId,
    pub name: Option<String>,
    pub start: Ms,
    pub end: Ms,
}

impl BlackoutInfo {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationInfo {
    pub id: ReservationId,
    pub user_id: UserId,
    pub location_id: LocationId,
    pub chair_id: ChairId,
    pub start: Ms,
    pub end: Ms,
}

impl From<&Reservation> for ReservationInfo {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id,
            user_id: r.user_id,
            location_id: r.key.location_id,
            chair_id: r.key.chair_id,
            start: r.span.start,
            end: r.span.end,
        }
    }
}

/// Outcome of a committed reservation. Overlapping tournaments are advisory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reserved {
    pub reservation: ReservationInfo,
    pub blackouts: Vec<BlackoutInfo>,
}

impl Reserved {
    pub fn has_blackout_warning(&self) -> bool {
        !self.blackouts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceAttachmentInfo {
    pub row_id: Ulid,
    pub reservation_id: ReservationId,
    pub location_id: LocationId,
    pub chair_id: ChairId,
    pub service_id: ServiceId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrinkAttachmentInfo {
    pub row_id: Ulid,
    pub reservation_id: ReservationId,
    pub user_id: UserId,
    pub service_id: ServiceId,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageInfo {
    pub location_id: LocationId,
    pub chair_id: ChairId,
    pub visits: u64,
    pub hours: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChargeLine {
    pub service_id: ServiceId,
    pub kind: ServiceKind,
    pub paid: bool,
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub total_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Charges {
    pub reservation_id: ReservationId,
    pub lines: Vec<ChargeLine>,
    pub total_cents: i64,
    /// Sum of lines whose service is not flagged as paid.
    pub outstanding_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowCheck {
    pub reservation_id: ReservationId,
    pub check_date: Ms,
    pub allowed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub location_id: LocationId,
    pub chair_id: ChairId,
    pub available: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(id: ReservationId, start: Ms, end: Ms) -> Reservation {
        Reservation {
            id,
            user_id: 7,
            key: ChairKey::new(1, 5),
            span: Span::new(start, end),
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(200)); // closed
        assert!(!s.contains_instant(201));
        assert!(!s.contains_instant(99));
        assert!(Span::new(5, 5).is_ordered());
        assert!(!Span::new(6, 5).is_ordered());
    }

    #[test]
    fn span_overlap_touching_counts() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        let d = Span::new(201, 300);
        assert!(a.overlaps(&b));
        assert!(a.overlaps(&c)); // boundary touch
        assert!(!a.overlaps(&d));
    }

    #[test]
    fn overlap_containment_both_ways() {
        assert!(overlaps(0, 1000, 100, 200));
        assert!(overlaps(100, 200, 0, 1000));
        assert!(overlaps(10, 10, 10, 10));
    }

    #[test]
    fn overlap_is_symmetric() {
        let points = [0, 1, 5, 9, 10, 11, 20];
        for &a0 in &points {
            for &a1 in points.iter().filter(|&&p| p >= a0) {
                for &b0 in &points {
                    for &b1 in points.iter().filter(|&&p| p >= b0) {
                        assert_eq!(
                            overlaps(a0, a1, b0, b1),
                            overlaps(b0, b1, a0, a1),
                            "[{a0},{a1}] vs [{b0},{b1}]"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn date_parsing() {
        assert_eq!(date_to_ms("1970-01-01").unwrap(), 0);
        assert_eq!(date_to_ms("1970-01-02").unwrap(), DAY_MS);
        assert_eq!(
            date_to_ms("2024-07-03").unwrap() - date_to_ms("2024-07-01").unwrap(),
            2 * DAY_MS
        );
        assert!(date_to_ms("2024-13-01").is_err());
        assert!(date_to_ms("03.07.2024").is_err());
    }

    #[test]
    fn service_kind_parse() {
        assert_eq!("drink".parse::<ServiceKind>().unwrap(), ServiceKind::Drink);
        assert_eq!("ADDON".parse::<ServiceKind>().unwrap(), ServiceKind::Addon);
        assert!("sunscreen".parse::<ServiceKind>().is_err());
    }

    #[test]
    fn reservations_stay_sorted() {
        let mut cs = ChairState::new(ChairKey::new(1, 5), None);
        cs.insert_reservation(reservation(1, 300, 400));
        cs.insert_reservation(reservation(2, 100, 200));
        cs.insert_reservation(reservation(3, 200, 250));
        let starts: Vec<Ms> = cs.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
        assert_eq!(cs.reservation(3).unwrap().span, Span::new(200, 250));
        assert!(cs.reservation(99).is_none());
    }

    #[test]
    fn overlapping_includes_boundary_touch() {
        let mut cs = ChairState::new(ChairKey::new(1, 5), None);
        cs.insert_reservation(reservation(1, 100, 200));
        let hits: Vec<_> = cs.overlapping(&Span::new(200, 300)).collect();
        assert_eq!(hits.len(), 1);
        let hits: Vec<_> = cs.overlapping(&Span::new(0, 100)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(cs.overlapping(&Span::new(201, 300)).count(), 0);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut cs = ChairState::new(ChairKey::new(1, 5), None);
        cs.insert_reservation(reservation(1, 100, 200));
        cs.insert_reservation(reservation(2, 450, 600));
        cs.insert_reservation(reservation(3, 1000, 1100));
        let hits: Vec<_> = cs.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 2);
    }

    #[test]
    fn overlapping_long_reservation_spanning_query() {
        let mut cs = ChairState::new(ChairKey::new(1, 5), None);
        cs.insert_reservation(reservation(1, 0, 10_000));
        assert_eq!(cs.overlapping(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ServicesAttached {
            key: ChairKey::new(1, 5),
            reservation_id: 42,
            user_id: 9,
            rows: vec![(Ulid::new(), 3), (Ulid::new(), 3)],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
