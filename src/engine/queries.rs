use ulid::Ulid;

use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError};

/// Filter for price-period listings. Both fields must match when set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PricePeriodFilter {
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<Ulid>,
}

impl Engine {
    /// Non-deleted stays, optionally for one room, ordered by start.
    pub fn list_stays(&self, room_id: Option<Ulid>) -> Vec<Stay> {
        let mut stays: Vec<Stay> = self
            .stays
            .iter()
            .filter(|s| !s.deleted && room_id.is_none_or(|r| s.room_id == r))
            .map(|s| s.value().clone())
            .collect();
        stays.sort_by_key(|s| (s.span.start, s.id));
        stays
    }

    pub fn get_stay(&self, id: Ulid) -> Result<Stay, EngineError> {
        self.live_stay(&id)
    }

    pub fn list_price_periods(&self, filter: PricePeriodFilter) -> Vec<PricePeriod> {
        let mut periods: Vec<PricePeriod> = self
            .price_periods
            .iter()
            .filter(|p| {
                !p.deleted
                    && filter.entity_type.is_none_or(|t| p.entity_type == t)
                    && filter.entity_id.is_none_or(|id| p.entity_id == id)
            })
            .map(|p| p.value().clone())
            .collect();
        periods.sort_by_key(|p| (p.entity_type, p.entity_id, p.span.start));
        periods
    }

    pub fn get_price_period(&self, id: Ulid) -> Result<PricePeriod, EngineError> {
        self.live_price_period(&id)
    }

    /// The price in force for an entity at instant `at`: the period covering
    /// it, if any. Periods of one entity never overlap, so there is at most one.
    pub async fn effective_price(
        &self,
        entity_type: EntityType,
        entity_id: Ulid,
        at: Ms,
    ) -> Option<PricePeriod> {
        let state = self
            .scopes
            .get(&ScopeKey::Priced(entity_type, entity_id))
            .map(|e| e.value().clone())?;
        let guard = state.read().await;
        let id = guard
            .intervals
            .iter()
            .find(|i| i.span.contains_instant(at))
            .map(|i| i.id)?;
        drop(guard);
        self.live_price_period(&id).ok()
    }

    pub fn list_invoices(&self, stay_id: Option<Ulid>) -> Vec<Invoice> {
        let mut invoices: Vec<Invoice> = self
            .invoices
            .iter()
            .filter(|i| stay_id.is_none_or(|s| i.stay_id == s))
            .map(|i| i.value().clone())
            .collect();
        invoices.sort_by_key(|i| i.id);
        invoices
    }

    /// Non-deleted users, ordered by id.
    pub fn list_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self
            .users
            .iter()
            .filter(|u| !u.deleted)
            .map(|u| u.value().clone())
            .collect();
        users.sort_by_key(|u| u.id);
        users
    }

    /// All invitations, ordered by id. Lapsed ones the reaper has not reached
    /// yet are reported as expired.
    pub fn list_invitations(&self) -> Vec<Invitation> {
        let now = now_ms();
        let mut invitations: Vec<Invitation> = self
            .invitations
            .iter()
            .map(|i| {
                let mut inv = i.value().clone();
                if inv.state == InvitationState::Pending && !inv.is_pending(now) {
                    inv.state = InvitationState::Expired;
                }
                inv
            })
            .collect();
        invitations.sort_by_key(|i| i.id);
        invitations
    }

    /// Visible log entries, oldest first.
    pub fn list_audit(&self) -> Vec<AuditEntry> {
        let mut entries: Vec<AuditEntry> = self
            .audit
            .iter()
            .filter(|e| !e.hidden)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }
}
