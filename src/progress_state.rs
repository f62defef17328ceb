//! The progression store.
//!
//! [`ProgressionStore`] owns the star tally and badge collection for one
//! user/device. It loads them from an injected [`KeyValueStorage`] once,
//! applies every mutation under a single lock, and writes the affected keys
//! back before the mutation returns.
//!
//! Writes are read-modify-write inside one storage transaction: the stored
//! records are re-read, the changes not yet persisted are folded in as
//! deltas, and the merged result becomes the in-memory state. Two stores on
//! the same environment (another process, or a handle left behind by a hot
//! restart) therefore add up instead of overwriting each other.
//!
//! ```rust
//! use kindpath_progress::local_storage::MemoryStorage;
//! use kindpath_progress::progress_state::ProgressionStore;
//!
//! let store = ProgressionStore::load(MemoryStorage::new(), "kindpath_");
//! store.add_stars(30, Some("arabic"))?;
//! store.add_stars(10, None)?;
//!
//! assert_eq!(store.total_stars(), 40);
//! assert_eq!(store.stars_for("math"), 10);
//! assert!(store.unlock_badge("first_steps", "First Steps", "👣")?);
//! assert!(!store.unlock_badge("first_steps", "First Steps", "👣")?);
//! # Ok::<(), kindpath_progress::app_response::AppResponse>(())
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use log::{debug, info, warn};

use crate::app_response::AppResponse;
use crate::local_storage::KeyValueStorage;
use crate::progress_model::{
    Badge, ProgressSnapshot, RankInfo, SubjectStarTally, BADGES_KEY, DEFAULT_SUBJECT,
    LEGACY_STARS_KEY, SUBJECT_STARS_KEY,
};
use crate::rank::{level_for, rank_info_for, total_of};

/// Callback invoked with a fresh snapshot after every applied mutation.
pub type Listener = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Default)]
struct ProgressState {
    subject_stars: SubjectStarTally,
    badges: Vec<Badge>,
    revision: u64,
    // applied in memory, not yet in storage
    pending_stars: SubjectStarTally,
    pending_badges: Vec<Badge>,
}

impl ProgressState {
    fn has_pending(&self) -> bool {
        !self.pending_stars.is_empty() || !self.pending_badges.is_empty()
    }

    /// The tally as storage last confirmed it.
    fn confirmed_stars(&self) -> SubjectStarTally {
        let mut tally = self.subject_stars.clone();
        for (subject, delta) in &self.pending_stars {
            if let Some(stars) = tally.get_mut(subject) {
                *stars = stars.saturating_sub(*delta);
            }
        }
        tally
    }

    fn confirmed_badges(&self) -> Vec<Badge> {
        self.badges
            .iter()
            .filter(|b| !self.pending_badges.iter().any(|p| p.id == b.id))
            .cloned()
            .collect()
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let total_stars = total_of(&self.subject_stars);
        ProgressSnapshot {
            revision: self.revision,
            subject_stars: self.subject_stars.clone(),
            total_stars,
            level: level_for(total_stars),
            rank: rank_info_for(total_stars),
            badges: self.badges.clone(),
        }
    }
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, Listener)>,
}

/// Outcome of [`ProgressionStore::unlock_badge_outcome`].
#[derive(Debug, Clone, PartialEq)]
pub struct BadgeUnlock {
    /// `true` when this call added the badge.
    pub unlocked: bool,
    /// Set when the badge is unlocked in memory but could not be written.
    /// The next mutation or flush retries the write.
    pub write_error: Option<AppResponse>,
}

pub struct ProgressionStore<S: KeyValueStorage> {
    storage: S,
    key_prefix: String,
    state: Mutex<ProgressState>,
    listeners: Mutex<Listeners>,
}

impl<S: KeyValueStorage> ProgressionStore<S> {
    /// Loads progression state from `storage`.
    ///
    /// Never fails: unreadable or malformed records are logged and treated as
    /// absent. When only the legacy scalar total exists it is migrated to
    /// `{ "math": total }` and written back immediately, so the migration
    /// runs at most once.
    pub fn load(storage: S, key_prefix: impl Into<String>) -> Self {
        let store = Self {
            storage,
            key_prefix: key_prefix.into(),
            state: Mutex::new(ProgressState::default()),
            listeners: Mutex::new(Listeners::default()),
        };

        let mut state = ProgressState {
            badges: store.load_badges(),
            ..ProgressState::default()
        };

        match store.load_subject_stars() {
            Some(tally) => state.subject_stars = tally,
            None => {
                if let Some(legacy_total) = store.load_legacy_total() {
                    info!("Migrating legacy star total {legacy_total} to subject '{DEFAULT_SUBJECT}'");
                    state
                        .subject_stars
                        .insert(DEFAULT_SUBJECT.to_string(), legacy_total);
                    if let Err(e) = store.migrate_legacy(&mut state) {
                        warn!("Migrated tally not persisted yet: {e}");
                        state.pending_stars = state.subject_stars.clone();
                    }
                }
            }
        }

        debug!(
            "Loaded progress: {} subject(s), {} badge(s)",
            state.subject_stars.len(),
            state.badges.len()
        );
        *store.lock_state() = state;
        store
    }

    /// Awards `amount` stars to `subject_id` (`"math"` when `None`).
    ///
    /// The in-memory tally is updated before persistence is attempted. On a
    /// write failure the updated tally stays in effect, the error is
    /// returned, and the next mutation or [`flush`](Self::flush) retries it.
    pub fn add_stars(&self, amount: u64, subject_id: Option<&str>) -> Result<(), AppResponse> {
        let subject = subject_id.unwrap_or(DEFAULT_SUBJECT);
        if subject.trim().is_empty() {
            return Err(AppResponse::ValidationError(
                "Subject id cannot be empty".to_string(),
            ));
        }

        let (snapshot, persisted) = {
            let mut state = self.lock_state();
            let current = state.subject_stars.get(subject).copied().unwrap_or(0);
            let updated = current.checked_add(amount).ok_or_else(|| {
                AppResponse::ValidationError(format!(
                    "Adding {amount} stars to '{subject}' overflows the tally"
                ))
            })?;

            state.subject_stars.insert(subject.to_string(), updated);
            let pending = state.pending_stars.entry(subject.to_string()).or_insert(0);
            *pending = pending.saturating_add(amount);
            state.revision += 1;
            debug!("Added {amount} star(s) to '{subject}' (now {updated})");

            let persisted = self.persist(&mut state);
            (state.snapshot(), persisted)
        };

        self.notify(&snapshot);
        persisted
    }

    /// Unlocks a badge. Returns `false` when a badge with this id already
    /// exists, in which case nothing changes.
    ///
    /// A `DatabaseError` means the badge *is* unlocked in memory but was not
    /// written; [`unlock_badge_outcome`](Self::unlock_badge_outcome) reports
    /// both facts at once.
    pub fn unlock_badge(
        &self,
        badge_id: &str,
        badge_name: &str,
        badge_icon: &str,
    ) -> Result<bool, AppResponse> {
        let outcome = self.unlock_badge_outcome(badge_id, badge_name, badge_icon)?;
        match outcome.write_error {
            Some(e) => Err(e),
            None => Ok(outcome.unlocked),
        }
    }

    /// Unlocks a badge and reports whether it was added and whether it was
    /// written. Only validation failures are returned as `Err`.
    pub fn unlock_badge_outcome(
        &self,
        badge_id: &str,
        badge_name: &str,
        badge_icon: &str,
    ) -> Result<BadgeUnlock, AppResponse> {
        if badge_id.trim().is_empty() {
            return Err(AppResponse::ValidationError(
                "Badge id cannot be empty".to_string(),
            ));
        }

        let badge = Badge {
            id: badge_id.to_string(),
            name: badge_name.to_string(),
            icon: badge_icon.to_string(),
            date: Utc::now(),
        };

        let (snapshot, outcome) = {
            let mut state = self.lock_state();
            if state.badges.iter().any(|b| b.id == badge_id) {
                return Ok(BadgeUnlock {
                    unlocked: false,
                    write_error: None,
                });
            }

            state.badges.push(badge.clone());
            state.pending_badges.push(badge.clone());
            state.revision += 1;

            let outcome = match self.persist(&mut state) {
                // a badge already stored under this id by another writer wins
                Ok(()) => BadgeUnlock {
                    unlocked: state.badges.contains(&badge),
                    write_error: None,
                },
                Err(e) => BadgeUnlock {
                    unlocked: true,
                    write_error: Some(e),
                },
            };
            if outcome.unlocked {
                info!("Badge unlocked: {badge_id}");
            } else {
                debug!("Badge '{badge_id}' was already stored by another writer");
            }
            (state.snapshot(), outcome)
        };

        self.notify(&snapshot);
        Ok(outcome)
    }

    /// Retries writing any keys whose last write failed.
    pub fn flush(&self) -> Result<(), AppResponse> {
        let mut state = self.lock_state();
        self.persist(&mut state)
    }

    pub fn has_pending_writes(&self) -> bool {
        self.lock_state().has_pending()
    }

    pub fn total_stars(&self) -> u64 {
        total_of(&self.lock_state().subject_stars)
    }

    pub fn level(&self) -> u64 {
        level_for(self.total_stars())
    }

    pub fn rank_info(&self) -> RankInfo {
        rank_info_for(self.total_stars())
    }

    pub fn subject_stars(&self) -> SubjectStarTally {
        self.lock_state().subject_stars.clone()
    }

    pub fn stars_for(&self, subject_id: &str) -> u64 {
        self.lock_state()
            .subject_stars
            .get(subject_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn badges(&self) -> Vec<Badge> {
        self.lock_state().badges.clone()
    }

    pub fn has_badge(&self, badge_id: &str) -> bool {
        self.lock_state().badges.iter().any(|b| b.id == badge_id)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock_state().snapshot()
    }

    /// Registers a listener called after every applied mutation.
    ///
    /// Listeners run after the store lock is released and may call back into
    /// the store. Concurrent mutations can deliver snapshots out of order;
    /// compare [`ProgressSnapshot::revision`] to keep the newest.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ProgressSnapshot) + Send + Sync + 'static,
    {
        let mut listeners = self.lock_listeners();
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.entries.len();
        listeners.entries.retain(|(entry_id, _)| *entry_id != id);
        listeners.entries.len() != before
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.key_prefix, suffix)
    }

    fn lock_state(&self) -> MutexGuard<'_, ProgressState> {
        // field updates within a mutation cannot panic halfway, so a poisoned state is still whole
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, snapshot: &ProgressSnapshot) {
        let listeners: Vec<Listener> = self
            .lock_listeners()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }

    /// Folds the pending changes into the stored records in one storage
    /// transaction and adopts the merged records as the in-memory state.
    /// Must be called with the state lock held.
    fn persist(&self, state: &mut ProgressState) -> Result<(), AppResponse> {
        if !state.has_pending() {
            return Ok(());
        }

        let stars_key = self.key(SUBJECT_STARS_KEY);
        let legacy_key = self.key(LEGACY_STARS_KEY);
        let badges_key = self.key(BADGES_KEY);
        let keys = [stars_key.clone(), badges_key.clone()];

        let mut merged = None;
        let result = self.storage.update(&keys, &mut |stored: &[Option<String>]| {
            let stored_stars = stored.first().and_then(|raw| raw.as_deref()).and_then(parse_tally);
            let stored_badges = stored.get(1).and_then(|raw| raw.as_deref()).and_then(parse_badges);
            let mut entries = Vec::with_capacity(3);

            let tally = if state.pending_stars.is_empty() {
                stored_stars.unwrap_or_else(|| state.subject_stars.clone())
            } else {
                let base = stored_stars.unwrap_or_else(|| state.confirmed_stars());
                let tally = merge_stars(base, &state.pending_stars);
                entries.push((stars_key.clone(), serde_json::to_string(&tally)?));
                entries.push((legacy_key.clone(), total_of(&tally).to_string()));
                tally
            };

            let badges = if state.pending_badges.is_empty() {
                stored_badges.unwrap_or_else(|| state.badges.clone())
            } else {
                let base = stored_badges.unwrap_or_else(|| state.confirmed_badges());
                let badges = merge_badges(base, &state.pending_badges);
                entries.push((badges_key.clone(), serde_json::to_string(&badges)?));
                badges
            };

            merged = Some((tally, badges));
            Ok(entries)
        });

        match result {
            Ok(()) => {
                if let Some((tally, badges)) = merged {
                    state.subject_stars = tally;
                    state.badges = badges;
                }
                state.pending_stars.clear();
                state.pending_badges.clear();
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Failed to persist progress ({} subject(s), {} badge(s) pending): {e}",
                    state.pending_stars.len(),
                    state.pending_badges.len()
                );
                Err(AppResponse::DatabaseError(format!(
                    "Progress kept in memory but not persisted: {e}"
                )))
            }
        }
    }

    /// Writes the migrated tally unless another writer stored one since it was loaded.
    fn migrate_legacy(&self, state: &mut ProgressState) -> Result<(), AppResponse> {
        let stars_key = self.key(SUBJECT_STARS_KEY);
        let legacy_key = self.key(LEGACY_STARS_KEY);

        let mut adopted = None;
        self.storage.update(&[stars_key.clone()], &mut |stored: &[Option<String>]| {
            if let Some(tally) = stored.first().and_then(|raw| raw.as_deref()).and_then(parse_tally) {
                adopted = Some(tally);
                return Ok(Vec::new());
            }
            Ok(vec![
                (stars_key.clone(), serde_json::to_string(&state.subject_stars)?),
                (legacy_key.clone(), total_of(&state.subject_stars).to_string()),
            ])
        })?;

        if let Some(tally) = adopted {
            debug!("Subject tally already stored, legacy migration skipped");
            state.subject_stars = tally;
        }
        Ok(())
    }

    fn read_key(&self, suffix: &str) -> Option<String> {
        let key = self.key(suffix);
        match self.storage.get(&key) {
            Ok(value) => value,
            Err(e) => {
                warn!("Could not read '{key}', treating as absent: {e}");
                None
            }
        }
    }

    fn load_subject_stars(&self) -> Option<SubjectStarTally> {
        parse_tally(&self.read_key(SUBJECT_STARS_KEY)?)
    }

    fn load_legacy_total(&self) -> Option<u64> {
        let raw = self.read_key(LEGACY_STARS_KEY)?;
        let parsed = parse_legacy_total(&raw);
        if parsed.is_none() {
            warn!("Malformed legacy star total ignored: {raw:?}");
        }
        parsed
    }

    fn load_badges(&self) -> Vec<Badge> {
        self.read_key(BADGES_KEY)
            .and_then(|raw| parse_badges(&raw))
            .unwrap_or_default()
    }
}

fn parse_tally(raw: &str) -> Option<SubjectStarTally> {
    match serde_json::from_str::<SubjectStarTally>(raw) {
        Ok(tally) => Some(tally),
        Err(e) => {
            warn!("Malformed subject star record ignored: {e}");
            None
        }
    }
}

fn parse_badges(raw: &str) -> Option<Vec<Badge>> {
    match serde_json::from_str::<Vec<Badge>>(raw) {
        Ok(badges) => Some(badges),
        Err(e) => {
            warn!("Malformed badge record ignored: {e}");
            None
        }
    }
}

fn merge_stars(mut base: SubjectStarTally, pending: &SubjectStarTally) -> SubjectStarTally {
    for (subject, delta) in pending {
        let stars = base.entry(subject.clone()).or_insert(0);
        *stars = stars.saturating_add(*delta);
    }
    base
}

/// Appends pending badges whose id is not stored yet, keeping unlock order.
fn merge_badges(mut base: Vec<Badge>, pending: &[Badge]) -> Vec<Badge> {
    for badge in pending {
        if !base.iter().any(|b| b.id == badge.id) {
            base.push(badge.clone());
        }
    }
    base
}

/// Reads the legacy scalar, stored as plain text (`"120"`) or a JSON number.
/// Like `parseInt`, only the leading digits count (`"12.9"` and `"12abc"` are
/// 12, `"1e3"` is 1). Negative values and text without leading digits are
/// rejected.
fn parse_legacy_total(raw: &str) -> Option<u64> {
    let trimmed = raw.trim().trim_matches('"').trim_start();
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let digits_end = unsigned
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(unsigned.len());
    if digits_end == 0 {
        return None;
    }
    unsigned[..digits_end].parse::<u64>().ok()
}

#[cfg(test)]
mod parse_tests {
    use super::parse_legacy_total;

    #[test]
    fn legacy_total_formats() {
        assert_eq!(parse_legacy_total("120"), Some(120));
        assert_eq!(parse_legacy_total(" 42\n"), Some(42));
        assert_eq!(parse_legacy_total("\"75\""), Some(75));
        assert_eq!(parse_legacy_total("12.9"), Some(12));
        assert_eq!(parse_legacy_total("0"), Some(0));
        assert_eq!(parse_legacy_total("+8"), Some(8));
        assert_eq!(parse_legacy_total("-5"), None);
        assert_eq!(parse_legacy_total("NaN"), None);
        assert_eq!(parse_legacy_total("lots"), None);
        assert_eq!(parse_legacy_total(""), None);
    }

    #[test]
    fn legacy_total_reads_leading_digits_only() {
        assert_eq!(parse_legacy_total("1e3"), Some(1));
        assert_eq!(parse_legacy_total("12abc"), Some(12));
        assert_eq!(parse_legacy_total("7 stars"), Some(7));
        assert_eq!(parse_legacy_total(".5"), None);
        assert_eq!(parse_legacy_total("e3"), None);
    }
}
