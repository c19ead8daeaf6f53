mod conflict;
mod directory;
mod error;
mod pricing;
mod queries;
mod stays;

pub use conflict::{find_conflict, validate_range};
pub use error::EngineError;
pub use queries::PricePeriodFilter;

pub(crate) use conflict::now_ms;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedScopeState = Arc<RwLock<ScopeState>>;

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

/// Background task that owns the WAL and batches appends for group commit:
/// block on the first append, drain whatever else is queued, then pay for a
/// single fsync and answer every sender with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so a half-written batch never leaks
    // into the next one.
    let flushed = wal.flush_sync();
    appended.and(flushed)
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Back-office state: the user directory, dated records with their
/// per-scope overlap indexes, invoices and the audit trail.
///
/// Every mutation appends its events to the WAL before applying them. Stay
/// and price-period mutations hold the write lock of each scope they touch
/// from the overlap check until the index is updated, so two writers can
/// never both pass the check for overlapping ranges.
pub struct Engine {
    pub(super) scopes: DashMap<ScopeKey, SharedScopeState>,
    pub(super) stays: DashMap<Ulid, Stay>,
    pub(super) price_periods: DashMap<Ulid, PricePeriod>,
    pub(super) invoices: DashMap<Ulid, Invoice>,
    pub(super) users: DashMap<Ulid, User>,
    /// Lowercased e-mail → id, live (non-deleted) users only.
    pub(super) emails: DashMap<String, Ulid>,
    pub(super) invitations: DashMap<Ulid, Invitation>,
    pub(super) audit: DashMap<Ulid, AuditEntry>,
    /// Serializes directory writes that check e-mail uniqueness.
    pub(super) directory_lock: tokio::sync::Mutex<()>,
    /// Ids of stays and price periods whose creation is in flight. Creates
    /// for different scopes hold different locks, so id uniqueness is
    /// claimed here instead.
    creating: DashMap<Ulid, ()>,
    /// Held shared by every commit and exclusively while a compaction
    /// snapshot is taken and swapped in.
    commit_lock: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub(super) invitation_ttl_ms: Ms,
    /// Appends left before the writer starts failing. Test-only fault
    /// injection for interrupted multi-event commits.
    #[cfg(test)]
    pub(super) appends_until_failure: std::sync::atomic::AtomicUsize,
}

/// Claim on a record id for the duration of its creation. Released on drop,
/// by which point a successful create has put the record in its map.
pub(super) struct CreateClaim<'a> {
    creating: &'a DashMap<Ulid, ()>,
    id: Ulid,
}

impl Drop for CreateClaim<'_> {
    fn drop(&mut self) {
        self.creating.remove(&self.id);
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, invitation_ttl_ms: Ms) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            scopes: DashMap::new(),
            stays: DashMap::new(),
            price_periods: DashMap::new(),
            invoices: DashMap::new(),
            users: DashMap::new(),
            emails: DashMap::new(),
            invitations: DashMap::new(),
            audit: DashMap::new(),
            directory_lock: tokio::sync::Mutex::new(()),
            creating: DashMap::new(),
            commit_lock: RwLock::new(()),
            wal_tx,
            invitation_ttl_ms,
            #[cfg(test)]
            appends_until_failure: std::sync::atomic::AtomicUsize::new(usize::MAX),
        };

        for event in &events {
            engine.apply_record(event);
        }
        engine.rebuild_indexes();
        if !events.is_empty() {
            info!(
                "replayed {} events: {} users, {} stays, {} price periods",
                events.len(),
                engine.users.len(),
                engine.stays.len(),
                engine.price_periods.len()
            );
        }
        Ok(engine)
    }

    /// Apply an event to the record maps. Scope indexes are maintained by the
    /// caller, which holds the scope write guards.
    fn apply_record(&self, event: &Event) {
        match event {
            Event::UserCreated { user } => {
                if !user.deleted {
                    self.emails.insert(user.email.to_lowercase(), user.id);
                }
                self.users.insert(user.id, user.clone());
            }
            Event::UserProfileUpdated { id, name, email, hotel_id } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    if user.email.to_lowercase() != email.to_lowercase() {
                        self.emails.remove(&user.email.to_lowercase());
                        self.emails.insert(email.to_lowercase(), *id);
                    }
                    user.name = name.clone();
                    user.email = email.clone();
                    user.hotel_id = *hotel_id;
                }
            }
            Event::RoleAssigned { id, role } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    user.role = role.clone();
                }
            }
            Event::PermissionsSet { id, permissions } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    user.permissions = permissions.clone();
                }
            }
            Event::UserBlocked { id, blocked } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    user.blocked = *blocked;
                }
            }
            Event::UserDeleted { id } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    user.deleted = true;
                    self.emails.remove(&user.email.to_lowercase());
                }
            }
            Event::InvitationCreated { invitation } => {
                self.invitations.insert(invitation.id, invitation.clone());
            }
            Event::InvitationStateChanged { id, state } => {
                if let Some(mut inv) = self.invitations.get_mut(id) {
                    inv.state = state.clone();
                }
            }
            Event::StayCreated { stay } => {
                self.stays.insert(stay.id, stay.clone());
            }
            Event::StayUpdated { id, room_id, client_id, span, notes } => {
                if let Some(mut stay) = self.stays.get_mut(id) {
                    stay.room_id = *room_id;
                    stay.client_id = *client_id;
                    stay.span = *span;
                    stay.notes = notes.clone();
                }
            }
            Event::StayStatusChanged { id, status, at } => {
                if let Some(mut stay) = self.stays.get_mut(id) {
                    stay.status = *status;
                    match status {
                        StayStatus::InProgress => stay.checked_in_at = Some(*at),
                        StayStatus::Completed => stay.checked_out_at = Some(*at),
                        _ => {}
                    }
                }
            }
            Event::StayDeleted { id } => {
                if let Some(mut stay) = self.stays.get_mut(id) {
                    stay.deleted = true;
                }
            }
            Event::PricePeriodCreated { period } => {
                self.price_periods.insert(period.id, period.clone());
            }
            Event::PricePeriodUpdated { id, span, new_price } => {
                if let Some(mut period) = self.price_periods.get_mut(id) {
                    period.span = *span;
                    period.new_price = *new_price;
                }
            }
            Event::PricePeriodDeleted { id } => {
                if let Some(mut period) = self.price_periods.get_mut(id) {
                    period.deleted = true;
                }
            }
            Event::InvoiceCreated { invoice } => {
                self.invoices.insert(invoice.id, invoice.clone());
            }
            Event::AuditRecorded { entry } => {
                self.audit.insert(entry.id, entry.clone());
            }
            Event::AuditHidden { id } => {
                if let Some(mut entry) = self.audit.get_mut(id) {
                    entry.hidden = true;
                }
            }
        }
    }

    /// Rebuild every scope index from the record maps. Only called during
    /// startup, before any lock is shared.
    fn rebuild_indexes(&self) {
        let mut states: HashMap<ScopeKey, ScopeState> = HashMap::new();
        let stays = self
            .stays
            .iter()
            .filter_map(|e| Interval::for_stay(e.value()).map(|i| (e.value().scope(), i)));
        let periods = self
            .price_periods
            .iter()
            .filter_map(|e| Interval::for_price_period(e.value()).map(|i| (e.value().scope(), i)));
        let entries: Vec<(ScopeKey, Interval)> = stays.chain(periods).collect();
        for (key, interval) in entries {
            states
                .entry(key)
                .or_insert_with(|| ScopeState::new(key))
                .insert_interval(interval);
        }
        self.scopes.clear();
        for (key, state) in states {
            self.scopes.insert(key, Arc::new(RwLock::new(state)));
        }
    }

    /// Claim `id` for a create. Fails if a record with that id exists or
    /// another create of it is in flight, whichever scope it targets.
    pub(super) fn claim_new_id(
        &self,
        id: Ulid,
        exists: impl FnOnce(&Ulid) -> bool,
        what: &str,
    ) -> Result<CreateClaim<'_>, EngineError> {
        match self.creating.entry(id) {
            Entry::Occupied(_) => {
                return Err(EngineError::AlreadyExists(format!("{what} {id}")));
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        let claim = CreateClaim {
            creating: &self.creating,
            id,
        };
        if exists(&id) {
            return Err(EngineError::AlreadyExists(format!("{what} {id}")));
        }
        Ok(claim)
    }

    /// Bring each held room index in line with the stay's current record.
    /// Used after a partially committed mutation, where the maps hold every
    /// event that reached the WAL.
    pub(super) fn resync_stay(&self, guards: &mut [OwnedRwLockWriteGuard<ScopeState>], id: Ulid) {
        let stay = self.stays.get(&id).map(|s| s.value().clone());
        for guard in guards.iter_mut() {
            match &stay {
                Some(stay) if stay.scope() == guard.key => guard.sync(id, Interval::for_stay(stay)),
                _ => {
                    guard.remove_interval(id);
                }
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            let left = self.appends_until_failure.load(Ordering::SeqCst);
            if left == 0 {
                return Err(EngineError::WalError("injected WAL failure".into()));
            }
            if left != usize::MAX {
                self.appends_until_failure.store(left - 1, Ordering::SeqCst);
            }
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

    /// Append each event to the WAL, then apply it. Stops at the first WAL
    /// failure; events already applied stay applied, matching the log.
    /// Callers holding scope guards must resync them on error.
    pub(super) async fn persist(&self, events: &[Event]) -> Result<(), EngineError> {
        let _commit = self.commit_lock.read().await;
        for event in events {
            self.wal_append(event).await?;
            self.apply_record(event);
        }
        Ok(())
    }

    /// Get or create the shared index for a scope.
    pub(super) fn scope(&self, key: ScopeKey) -> SharedScopeState {
        self.scopes
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(ScopeState::new(key))))
            .value()
            .clone()
    }

    /// Acquire write locks on every distinct key, in sorted order so that
    /// two multi-scope writers cannot deadlock.
    pub(super) async fn lock_scopes(
        &self,
        keys: &[ScopeKey],
    ) -> Vec<OwnedRwLockWriteGuard<ScopeState>> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.scope(key).write_owned().await);
        }
        guards
    }

    /// Look up the qualifying record overlapping `[start, end)` in `scope`,
    /// ignoring `exclude`.
    pub async fn find_conflict(
        &self,
        scope: ScopeKey,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Option<Interval>, EngineError> {
        if !validate_range(start, end) {
            return Err(EngineError::InvalidRange { start, end });
        }
        let Some(state) = self.scopes.get(&scope).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let guard = state.read().await;
        Ok(find_conflict(&guard, &Span::new(start, end), exclude).copied())
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Soft-deleted records are kept.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_lock.write().await;

        let mut events = Vec::new();
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(|user| Event::UserCreated { user }));

        let mut invitations: Vec<Invitation> =
            self.invitations.iter().map(|e| e.value().clone()).collect();
        invitations.sort_by_key(|i| i.id);
        events.extend(invitations.into_iter().map(|invitation| Event::InvitationCreated { invitation }));

        for entry in self.stays.iter() {
            events.push(Event::StayCreated { stay: entry.value().clone() });
        }
        for entry in self.price_periods.iter() {
            events.push(Event::PricePeriodCreated { period: entry.value().clone() });
        }
        for entry in self.invoices.iter() {
            events.push(Event::InvoiceCreated { invoice: entry.value().clone() });
        }
        let mut audit: Vec<AuditEntry> = self.audit.iter().map(|e| e.value().clone()).collect();
        audit.sort_by_key(|a| a.id);
        events.extend(audit.into_iter().map(|entry| Event::AuditRecorded { entry }));

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
}
