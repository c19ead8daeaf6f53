use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::permission::{self, PermissionCode};
use crate::role::Role;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Canonical half-open interval intersection: `[cs, ce)` and `[es, ee)` share
/// at least one instant. Touching boundaries do not overlap.
pub fn overlaps(candidate_start: Ms, candidate_end: Ms, existing_start: Ms, existing_end: Ms) -> bool {
    candidate_start < existing_end && candidate_end > existing_start
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Stays ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StayStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl StayStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            StayStatus::Pending => "pending",
            StayStatus::Confirmed => "confirmed",
            StayStatus::InProgress => "in-progress",
            StayStatus::Completed => "completed",
            StayStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<StayStatus> {
        match s {
            "pending" => Some(StayStatus::Pending),
            "confirmed" => Some(StayStatus::Confirmed),
            "in-progress" => Some(StayStatus::InProgress),
            "completed" => Some(StayStatus::Completed),
            "cancelled" => Some(StayStatus::Cancelled),
            _ => None,
        }
    }

    /// Statuses that occupy the room and take part in overlap checks.
    pub const fn is_active(self) -> bool {
        matches!(self, StayStatus::Confirmed | StayStatus::InProgress)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, StayStatus::Completed | StayStatus::Cancelled)
    }

    pub const fn can_transition_to(self, next: StayStatus) -> bool {
        use StayStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, InProgress)
                | (Confirmed, Cancelled)
                | (InProgress, Completed)
        )
    }

    /// Statuses a stay may be created in. `InProgress` is a walk-in.
    pub const fn is_initial(self) -> bool {
        matches!(self, StayStatus::Pending | StayStatus::Confirmed | StayStatus::InProgress)
    }
}

impl fmt::Display for StayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stay {
    pub id: Ulid,
    pub client_id: Ulid,
    pub room_id: Ulid,
    pub span: Span,
    pub status: StayStatus,
    pub notes: Option<String>,
    pub checked_in_at: Option<Ms>,
    pub checked_out_at: Option<Ms>,
    pub created_by: Ulid,
    pub created_at: Ms,
    pub deleted: bool,
}

impl Stay {
    pub fn scope(&self) -> ScopeKey {
        ScopeKey::Room(self.room_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStay {
    pub id: Ulid,
    pub client_id: Ulid,
    pub room_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: StayStatus,
    pub notes: Option<String>,
}

/// The only stay fields a caller may change. `None` leaves a field as is;
/// `notes: Some(None)` clears the notes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StayUpdate {
    pub room_id: Option<Ulid>,
    pub client_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub status: Option<StayStatus>,
    pub notes: Option<Option<String>>,
}

impl StayUpdate {
    pub fn is_empty(&self) -> bool {
        *self == StayUpdate::default()
    }
}

// ── Price periods ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Room,
    Food,
}

impl EntityType {
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityType::Room => "Room",
            EntityType::Food => "Food",
        }
    }

    pub fn parse(s: &str) -> Option<EntityType> {
        match s {
            "Room" => Some(EntityType::Room),
            "Food" => Some(EntityType::Food),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePeriod {
    pub id: Ulid,
    pub entity_type: EntityType,
    pub entity_id: Ulid,
    pub span: Span,
    /// Minor currency units.
    pub new_price: i64,
    pub created_by: Ulid,
    pub created_at: Ms,
    pub deleted: bool,
}

impl PricePeriod {
    pub fn scope(&self) -> ScopeKey {
        ScopeKey::Priced(self.entity_type, self.entity_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPricePeriod {
    pub id: Ulid,
    pub entity_type: EntityType,
    pub entity_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub new_price: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PricePeriodUpdate {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub new_price: Option<i64>,
}

// ── Overlap scopes ───────────────────────────────────────────────

/// Identity within which two dated records are compared. A room's stays and
/// a room's price periods are separate scopes, as are Room and Food periods
/// sharing an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKey {
    Room(Ulid),
    Priced(EntityType, Ulid),
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Room(id) => write!(f, "room {id}"),
            ScopeKey::Priced(t, id) => write!(f, "{t} {id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalKind {
    Stay(StayStatus),
    PricePeriod,
}

/// Index entry for one non-deleted dated record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

impl Interval {
    pub fn for_stay(stay: &Stay) -> Option<Interval> {
        (!stay.deleted).then_some(Interval {
            id: stay.id,
            span: stay.span,
            kind: IntervalKind::Stay(stay.status),
        })
    }

    pub fn for_price_period(period: &PricePeriod) -> Option<Interval> {
        (!period.deleted).then_some(Interval {
            id: period.id,
            span: period.span,
            kind: IntervalKind::PricePeriod,
        })
    }

    /// Whether this record counts toward overlap conflicts.
    pub fn qualifies(&self) -> bool {
        match self.kind {
            IntervalKind::Stay(status) => status.is_active(),
            IntervalKind::PricePeriod => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScopeState {
    pub key: ScopeKey,
    /// Non-deleted records of this scope, sorted by `span.start`.
    pub intervals: Vec<Interval>,
}

impl ScopeState {
    pub fn new(key: ScopeKey) -> Self {
        Self {
            key,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Replace whatever is indexed under `id` with `interval`.
    pub fn sync(&mut self, id: Ulid, interval: Option<Interval>) {
        self.remove_interval(id);
        if let Some(interval) = interval {
            self.insert_interval(interval);
        }
    }

    /// Intervals whose span overlaps the query window.
    /// Binary search skips intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }
}

// ── Users and invitations ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    /// Raw role name. Names outside the role table rank nowhere and are
    /// denied every role comparison.
    pub role: String,
    /// Only consulted for non-admin roles. Missing and empty mean the same.
    #[serde(default)]
    pub permissions: BTreeSet<PermissionCode>,
    pub hotel_id: Option<Ulid>,
    pub invited_by: Option<Ulid>,
    pub blocked: bool,
    pub deleted: bool,
    pub created_at: Ms,
}

impl User {
    pub fn role(&self) -> Option<Role> {
        Role::parse(&self.role)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin.as_str()
    }

    pub fn is_active(&self) -> bool {
        !self.blocked && !self.deleted
    }

    pub fn permission_list(&self) -> Vec<PermissionCode> {
        self.permissions.iter().copied().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub permissions: Vec<PermissionCode>,
    pub hotel_id: Option<Ulid>,
    pub invited_by: Option<Ulid>,
}

/// Profile fields a user may edit. Role, permissions and the blocked flag
/// have dedicated operations with stricter checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub hotel_id: Option<Option<Ulid>>,
}

/// Every column an `UPDATE users` may touch, split by the operation that
/// authorizes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPatch {
    pub profile: UserUpdate,
    pub role: Option<String>,
    pub permissions: Option<Vec<PermissionCode>>,
    pub blocked: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvitationState {
    Pending,
    Accepted { user_id: Ulid },
    Revoked,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: Ulid,
    pub email: String,
    pub role: Role,
    pub hotel_id: Option<Ulid>,
    pub invited_by: Ulid,
    pub created_at: Ms,
    pub expires_at: Ms,
    pub state: InvitationState,
}

impl Invitation {
    pub fn is_pending(&self, now: Ms) -> bool {
        self.state == InvitationState::Pending && self.expires_at > now
    }

    pub fn state_label(&self) -> &'static str {
        match self.state {
            InvitationState::Pending => "pending",
            InvitationState::Accepted { .. } => "accepted",
            InvitationState::Revoked => "revoked",
            InvitationState::Expired => "expired",
        }
    }
}

// ── Invoices and audit ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Ulid,
    pub stay_id: Ulid,
    /// Minor currency units. Created at zero; totals are computed elsewhere.
    pub amount: i64,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    Success,
    Denied,
}

impl AuditOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Denied => "denied",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Ulid,
    pub at: Ms,
    pub user_id: Ulid,
    pub method: String,
    pub route: String,
    pub outcome: AuditOutcome,
    /// Codes the request needed; empty for role-rank denials.
    pub required: Vec<PermissionCode>,
    /// Codes the user actually held.
    pub actual: Vec<PermissionCode>,
    pub detail: Option<String>,
    pub hidden: bool,
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserCreated {
        user: User,
    },
    UserProfileUpdated {
        id: Ulid,
        name: String,
        email: String,
        hotel_id: Option<Ulid>,
    },
    RoleAssigned {
        id: Ulid,
        role: String,
    },
    PermissionsSet {
        id: Ulid,
        permissions: BTreeSet<PermissionCode>,
    },
    UserBlocked {
        id: Ulid,
        blocked: bool,
    },
    UserDeleted {
        id: Ulid,
    },
    InvitationCreated {
        invitation: Invitation,
    },
    InvitationStateChanged {
        id: Ulid,
        state: InvitationState,
    },
    StayCreated {
        stay: Stay,
    },
    StayUpdated {
        id: Ulid,
        room_id: Ulid,
        client_id: Ulid,
        span: Span,
        notes: Option<String>,
    },
    StayStatusChanged {
        id: Ulid,
        status: StayStatus,
        at: Ms,
    },
    StayDeleted {
        id: Ulid,
    },
    PricePeriodCreated {
        period: PricePeriod,
    },
    PricePeriodUpdated {
        id: Ulid,
        span: Span,
        new_price: i64,
    },
    PricePeriodDeleted {
        id: Ulid,
    },
    InvoiceCreated {
        invoice: Invoice,
    },
    AuditRecorded {
        entry: AuditEntry,
    },
    AuditHidden {
        id: Ulid,
    },
}

pub(crate) fn first_unknown_permission(codes: &[PermissionCode]) -> Option<PermissionCode> {
    codes.iter().copied().find(|c| !permission::is_known(*c))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Ms = 86_400_000;
    /// 2024-01-01T00:00:00Z
    const JAN_1: Ms = 1_704_067_200_000;

    fn jan(day: i64) -> Ms {
        JAN_1 + (day - 1) * DAY
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn overlap_predicate() {
        // existing [Jan 10, Jan 15)
        assert!(overlaps(jan(14), jan(20), jan(10), jan(15)));
        assert!(!overlaps(jan(15), jan(20), jan(10), jan(15))); // touching
        assert!(!overlaps(jan(1), jan(10), jan(10), jan(15))); // touching on the left
        assert!(overlaps(jan(11), jan(12), jan(10), jan(15))); // contained
        assert!(overlaps(jan(1), jan(30), jan(10), jan(15))); // containing
        assert!(overlaps(jan(10), jan(15), jan(10), jan(15))); // identical
    }

    #[test]
    fn overlap_is_symmetric() {
        let spans = [(0, 10), (5, 15), (10, 20), (0, 30), (29, 30)];
        for (a0, a1) in spans {
            for (b0, b1) in spans {
                assert_eq!(overlaps(a0, a1, b0, b1), overlaps(b0, b1, a0, a1));
            }
        }
    }

    #[test]
    fn status_machine() {
        use StayStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(InProgress));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(InProgress.can_transition_to(Completed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Cancelled));
        assert!(!InProgress.can_transition_to(Pending));
        for next in [Pending, Confirmed, InProgress, Completed, Cancelled] {
            assert!(!Completed.can_transition_to(next));
            assert!(!Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn only_confirmed_and_in_progress_are_active() {
        use StayStatus::*;
        assert!(!Pending.is_active());
        assert!(Confirmed.is_active());
        assert!(InProgress.is_active());
        assert!(!Completed.is_active());
        assert!(!Cancelled.is_active());
    }

    #[test]
    fn status_names_parse() {
        for s in ["pending", "confirmed", "in-progress", "completed", "cancelled"] {
            assert_eq!(StayStatus::parse(s).map(StayStatus::as_str), Some(s));
        }
        assert_eq!(StayStatus::parse("in_progress"), None);
    }

    #[test]
    fn deleted_records_are_not_indexed() {
        let stay = Stay {
            id: Ulid::new(),
            client_id: Ulid::new(),
            room_id: Ulid::new(),
            span: Span::new(0, 10),
            status: StayStatus::Confirmed,
            notes: None,
            checked_in_at: None,
            checked_out_at: None,
            created_by: Ulid::new(),
            created_at: 0,
            deleted: true,
        };
        assert!(Interval::for_stay(&stay).is_none());
    }

    #[test]
    fn scopes_distinguish_entity_types() {
        let id = Ulid::new();
        assert_ne!(ScopeKey::Priced(EntityType::Room, id), ScopeKey::Priced(EntityType::Food, id));
        assert_ne!(ScopeKey::Room(id), ScopeKey::Priced(EntityType::Room, id));
    }

    #[test]
    fn scope_sync_replaces_entry() {
        let mut scope = ScopeState::new(ScopeKey::Room(Ulid::new()));
        let id = Ulid::new();
        let first = Interval { id, span: Span::new(100, 200), kind: IntervalKind::PricePeriod };
        scope.sync(id, Some(first));
        let moved = Interval { id, span: Span::new(500, 600), kind: IntervalKind::PricePeriod };
        scope.sync(id, Some(moved));
        assert_eq!(scope.intervals, vec![moved]);
        scope.sync(id, None);
        assert!(scope.intervals.is_empty());
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut scope = ScopeState::new(ScopeKey::Room(Ulid::new()));
        for (s, e) in [(100, 200), (450, 600), (1000, 1100)] {
            scope.insert_interval(Interval {
                id: Ulid::new(),
                span: Span::new(s, e),
                kind: IntervalKind::Stay(StayStatus::Confirmed),
            });
        }
        let hits: Vec<_> = scope.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut scope = ScopeState::new(ScopeKey::Room(Ulid::new()));
        scope.insert_interval(Interval {
            id: Ulid::new(),
            span: Span::new(100, 200),
            kind: IntervalKind::PricePeriod,
        });
        assert_eq!(scope.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(scope.overlapping(&Span::new(0, 100)).count(), 0);
        assert_eq!(scope.overlapping(&Span::new(199, 300)).count(), 1);
    }

    #[test]
    fn interval_ordering() {
        let mut scope = ScopeState::new(ScopeKey::Room(Ulid::new()));
        for start in [300, 100, 200] {
            scope.insert_interval(Interval {
                id: Ulid::new(),
                span: Span::new(start, start + 50),
                kind: IntervalKind::PricePeriod,
            });
        }
        let starts: Vec<_> = scope.intervals.iter().map(|i| i.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn unknown_codes_detected() {
        assert_eq!(first_unknown_permission(&[8001, 8004]), None);
        assert_eq!(first_unknown_permission(&[8001, 9999]), Some(9999));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::RoleAssigned {
            id: Ulid::new(),
            role: "hotelManager".into(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
