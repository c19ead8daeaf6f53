use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, checked_span, now_ms};
use super::{Engine, EngineError};

impl Engine {
    /// Price periods for the same entity never overlap, whatever their price.
    pub async fn create_price_period(
        &self,
        created_by: Ulid,
        new: NewPricePeriod,
    ) -> Result<PricePeriod, EngineError> {
        let span = checked_span(new.start, new.end)?;
        if new.new_price < 0 {
            return Err(EngineError::Validation("price must not be negative"));
        }

        let _claim =
            self.claim_new_id(new.id, |id| self.price_periods.contains_key(id), "price period")?;
        let key = ScopeKey::Priced(new.entity_type, new.entity_id);
        let scope = self.scope(key);
        let mut guard = scope.write().await;
        if guard.intervals.len() >= MAX_RECORDS_PER_SCOPE {
            return Err(EngineError::LimitExceeded("too many price periods on entity"));
        }
        check_no_conflict(&guard, &span, None)?;

        let period = PricePeriod {
            id: new.id,
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            span,
            new_price: new.new_price,
            created_by,
            created_at: now_ms(),
            deleted: false,
        };
        self.persist(&[Event::PricePeriodCreated { period: period.clone() }]).await?;
        guard.sync(period.id, Interval::for_price_period(&period));
        Ok(period)
    }

    /// Re-date or re-price a period. The entity a period prices is fixed, so
    /// only its own scope is locked.
    pub async fn update_price_period(
        &self,
        id: Ulid,
        update: PricePeriodUpdate,
    ) -> Result<PricePeriod, EngineError> {
        let key = self.live_price_period(&id)?.scope();
        let scope = self.scope(key);
        let mut guard = scope.write().await;
        let current = self.live_price_period(&id)?;

        let span = if update.start.is_some() || update.end.is_some() {
            checked_span(
                update.start.unwrap_or(current.span.start),
                update.end.unwrap_or(current.span.end),
            )?
        } else {
            current.span
        };
        let new_price = update.new_price.unwrap_or(current.new_price);
        if new_price < 0 {
            return Err(EngineError::Validation("price must not be negative"));
        }
        if span == current.span && new_price == current.new_price {
            return Ok(current);
        }
        check_no_conflict(&guard, &span, Some(id))?;

        self.persist(&[Event::PricePeriodUpdated { id, span, new_price }]).await?;
        let updated = self.live_price_period(&id)?;
        guard.sync(id, Interval::for_price_period(&updated));
        Ok(updated)
    }

    pub async fn delete_price_period(&self, id: Ulid) -> Result<PricePeriod, EngineError> {
        let key = self.live_price_period(&id)?.scope();
        let scope = self.scope(key);
        let mut guard = scope.write().await;
        let current = self.live_price_period(&id)?;

        self.persist(&[Event::PricePeriodDeleted { id }]).await?;
        guard.remove_interval(id);
        let mut deleted = current;
        deleted.deleted = true;
        Ok(deleted)
    }

    pub(super) fn live_price_period(&self, id: &Ulid) -> Result<PricePeriod, EngineError> {
        self.price_periods
            .get(id)
            .filter(|p| !p.deleted)
            .map(|p| p.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }
}
