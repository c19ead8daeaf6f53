use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, checked_span, now_ms};
use super::{Engine, EngineError};

fn validate_notes(notes: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = notes
        && n.len() > MAX_NOTES_LEN {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
    Ok(())
}

impl Engine {
    pub async fn create_stay(&self, created_by: Ulid, new: NewStay) -> Result<Stay, EngineError> {
        let span = checked_span(new.start, new.end)?;
        if !new.status.is_initial() {
            return Err(EngineError::InvalidTransition {
                from: StayStatus::Pending,
                to: new.status,
            });
        }
        validate_notes(&new.notes)?;

        let _claim = self.claim_new_id(new.id, |id| self.stays.contains_key(id), "stay")?;
        let key = ScopeKey::Room(new.room_id);
        let scope = self.scope(key);
        let mut guard = scope.write().await;
        if guard.intervals.len() >= MAX_RECORDS_PER_SCOPE {
            return Err(EngineError::LimitExceeded("too many stays on room"));
        }
        if new.status.is_active() {
            check_no_conflict(&guard, &span, None)?;
        }

        let now = now_ms();
        let stay = Stay {
            id: new.id,
            client_id: new.client_id,
            room_id: new.room_id,
            span,
            status: new.status,
            notes: new.notes,
            checked_in_at: (new.status == StayStatus::InProgress).then_some(now),
            checked_out_at: None,
            created_by,
            created_at: now,
            deleted: false,
        };
        self.persist(&[Event::StayCreated { stay: stay.clone() }]).await?;
        guard.sync(stay.id, Interval::for_stay(&stay));
        Ok(stay)
    }

    /// Apply an allow-listed update. Completed stays reject every update,
    /// including an empty one. Whenever the resulting stay is active it is
    /// re-checked against its (possibly new) room, excluding itself.
    ///
    /// Returns the updated stay and the invoice opened when the update
    /// completed it.
    pub async fn update_stay(
        &self,
        id: Ulid,
        update: StayUpdate,
    ) -> Result<(Stay, Option<Invoice>), EngineError> {
        validate_notes(update.notes.as_ref().unwrap_or(&None))?;

        // The room may change under us between the snapshot and the lock;
        // retry until the locked scopes match the stay's room.
        let (current, mut guards) = loop {
            let snapshot = self.live_stay(&id)?;
            let target_room = update.room_id.unwrap_or(snapshot.room_id);
            let guards = self
                .lock_scopes(&[ScopeKey::Room(snapshot.room_id), ScopeKey::Room(target_room)])
                .await;
            let current = self.live_stay(&id)?;
            if current.room_id == snapshot.room_id {
                break (current, guards);
            }
        };

        if current.status == StayStatus::Completed {
            return Err(EngineError::StayCompleted(id));
        }
        if update.is_empty() {
            return Ok((current, None));
        }

        let next_status = update.status.unwrap_or(current.status);
        if next_status != current.status && !current.status.can_transition_to(next_status) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: next_status,
            });
        }

        let span = if update.start.is_some() || update.end.is_some() {
            checked_span(
                update.start.unwrap_or(current.span.start),
                update.end.unwrap_or(current.span.end),
            )?
        } else {
            current.span
        };
        let room_id = update.room_id.unwrap_or(current.room_id);
        let client_id = update.client_id.unwrap_or(current.client_id);
        let notes = update.notes.clone().unwrap_or_else(|| current.notes.clone());
        let target_key = ScopeKey::Room(room_id);

        if next_status.is_active() {
            let target = guards
                .iter()
                .find(|g| g.key == target_key)
                .ok_or(EngineError::NotFound(room_id))?;
            check_no_conflict(target, &span, Some(id))?;
        }

        let now = now_ms();
        let mut events = Vec::new();
        if room_id != current.room_id
            || client_id != current.client_id
            || span != current.span
            || notes != current.notes
        {
            events.push(Event::StayUpdated { id, room_id, client_id, span, notes });
        }
        if next_status != current.status {
            events.push(Event::StayStatusChanged { id, status: next_status, at: now });
        }
        let invoice = (next_status == StayStatus::Completed).then(|| Invoice {
            id: Ulid::new(),
            stay_id: id,
            amount: 0,
            created_at: now,
        });
        if let Some(invoice) = &invoice {
            events.push(Event::InvoiceCreated { invoice: invoice.clone() });
        }
        let committed = self.persist(&events).await;
        self.resync_stay(&mut guards, id);
        committed?;

        let updated = self.live_stay(&id)?;
        Ok((updated, invoice))
    }

    /// Soft delete. The stay leaves its room's index and never conflicts
    /// again. Completed stays are locked like any other update.
    pub async fn delete_stay(&self, id: Ulid) -> Result<Stay, EngineError> {
        let (current, mut guard) = loop {
            let snapshot = self.live_stay(&id)?;
            let guard = self.scope(snapshot.scope()).write_owned().await;
            let current = self.live_stay(&id)?;
            if current.room_id == snapshot.room_id {
                break (current, guard);
            }
        };
        if current.status == StayStatus::Completed {
            return Err(EngineError::StayCompleted(id));
        }
        self.persist(&[Event::StayDeleted { id }]).await?;
        guard.remove_interval(id);
        let mut deleted = current;
        deleted.deleted = true;
        Ok(deleted)
    }

    pub(super) fn live_stay(&self, id: &Ulid) -> Result<Stay, EngineError> {
        self.stays
            .get(id)
            .filter(|s| !s.deleted)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }
}
