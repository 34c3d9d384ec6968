//! Per-identity and global spend ledger with atomic reservations.
//!
//! Every admitted request reserves its estimated cost before it runs and
//! reconciles the actual cost afterwards. The check and the reservation
//! happen inside one critical section per identity, so concurrent requests
//! from the same caller can never jointly overshoot a limit.
//!
//! Lock order is always identity shard, then global ledger.
//!
//! Outstanding reservations are bounded. When the bound is hit the oldest
//! one is settled at its estimate, and reservations whose month has closed
//! are swept when the month turns over, so an unreported request can pin
//! its identity's entry only for a limited time.

use crate::LedgerError;
use chrono::{DateTime, Datelike, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use tollgate_config::BudgetConfig;
use tollgate_core::shard::DEFAULT_SHARDS;
use tollgate_core::{BudgetLimit, BudgetRejection, CapabilityRecord, Identity, ReservationId, ShardedLru};
use tracing::{debug, warn};

/// Runtime settings for a [`CostTracker`].
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// UTC hour at which daily counters roll over.
    pub reset_hour_utc: u8,
    /// 0 = unlimited
    pub global_daily_limit: f64,
    /// 0 = unlimited
    pub global_monthly_limit: f64,
    pub max_tracked_identities: usize,
    /// Reservations held at once before the oldest is settled. Never more
    /// than `max_tracked_identities`, since each one pins an entry.
    pub max_pending_reservations: usize,
    pub shards: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self::from_config(&BudgetConfig::default())
    }
}

impl LedgerSettings {
    pub fn from_config(config: &BudgetConfig) -> Self {
        Self {
            reset_hour_utc: config.reset_hour_utc,
            global_daily_limit: config.global_daily_limit_usd,
            global_monthly_limit: config.global_monthly_limit_usd,
            max_tracked_identities: config.max_tracked_identities,
            max_pending_reservations: config.max_pending_reservations,
            shards: DEFAULT_SHARDS,
        }
    }
}

/// Day and month identifiers for the budget period containing an instant.
///
/// `day` counts days since the Unix epoch after shifting the clock back by
/// the reset hour; `month` is `year * 12 + month0` of the same shifted clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodMarkers {
    pub day: i64,
    pub month: i32,
}

impl PeriodMarkers {
    pub fn at(now: DateTime<Utc>, reset_hour_utc: u8) -> Self {
        let shifted = now - Duration::hours(i64::from(reset_hour_utc));
        Self {
            day: shifted.timestamp().div_euclid(86_400),
            month: shifted.year() * 12 + shifted.month0() as i32,
        }
    }
}

/// Latest period markers any ledger operation has seen.
#[derive(Debug, Default)]
struct PeriodClock {
    day: AtomicI64,
    month: AtomicI32,
}

impl PeriodClock {
    /// Move forward to `to`. Returns true when the month marker advanced.
    fn advance(&self, to: PeriodMarkers) -> bool {
        self.day.fetch_max(to.day, Ordering::AcqRel);
        self.month.fetch_max(to.month, Ordering::AcqRel) < to.month
    }

    fn current(&self) -> PeriodMarkers {
        PeriodMarkers {
            day: self.day.load(Ordering::Acquire),
            month: self.month.load(Ordering::Acquire),
        }
    }
}

/// One ledger row. Used for identities and for the global total.
#[derive(Debug, Clone, Default, PartialEq)]
struct LedgerEntry {
    daily_spent: f64,
    monthly_spent: f64,
    daily_reserved: f64,
    monthly_reserved: f64,
    periods: PeriodMarkers,
    /// Outstanding reservations; a non-zero count pins the entry in memory.
    pending: u32,
}

impl LedgerEntry {
    /// Advance period markers. Never moves backwards.
    fn roll(&mut self, now: PeriodMarkers) {
        if now.day > self.periods.day {
            self.daily_spent = 0.0;
            self.daily_reserved = 0.0;
            self.periods.day = now.day;
        }
        if now.month > self.periods.month {
            self.monthly_spent = 0.0;
            self.monthly_reserved = 0.0;
            self.periods.month = now.month;
        }
    }

    fn daily_committed(&self) -> f64 {
        self.daily_spent + self.daily_reserved
    }

    fn monthly_committed(&self) -> f64 {
        self.monthly_spent + self.monthly_reserved
    }

    fn check(&self, estimate: f64, daily_cap: f64, monthly_cap: f64, scope: Scope) -> Result<(), BudgetRejection> {
        let (daily, monthly) = match scope {
            Scope::Identity => (BudgetLimit::IdentityDaily, BudgetLimit::IdentityMonthly),
            Scope::Global => (BudgetLimit::GlobalDaily, BudgetLimit::GlobalMonthly),
        };
        exceeds(daily, self.daily_committed(), estimate, daily_cap)?;
        exceeds(monthly, self.monthly_committed(), estimate, monthly_cap)
    }

    fn reserve(&mut self, amount: f64) {
        self.daily_reserved += amount;
        self.monthly_reserved += amount;
        self.pending += 1;
    }

    /// Settle one reservation made under `made_in`, period by period.
    fn settle(&mut self, amount: f64, actual: f64, made_in: PeriodMarkers) {
        if self.periods.day == made_in.day {
            self.daily_reserved = (self.daily_reserved - amount).max(0.0);
            self.daily_spent += actual;
        }
        if self.periods.month == made_in.month {
            self.monthly_reserved = (self.monthly_reserved - amount).max(0.0);
            self.monthly_spent += actual;
        }
        self.pending = self.pending.saturating_sub(1);
    }

    /// Fold a persisted row into this one.
    fn merge(&mut self, persisted: &PersistedEntry) {
        if persisted.day == self.periods.day {
            self.daily_spent = self.daily_spent.max(persisted.daily_spent);
        } else if persisted.day > self.periods.day {
            self.periods.day = persisted.day;
            self.daily_spent = persisted.daily_spent;
            self.daily_reserved = 0.0;
        }
        if persisted.month == self.periods.month {
            self.monthly_spent = self.monthly_spent.max(persisted.monthly_spent);
        } else if persisted.month > self.periods.month {
            self.periods.month = persisted.month;
            self.monthly_spent = persisted.monthly_spent;
            self.monthly_reserved = 0.0;
        }
    }

    fn persisted(&self) -> PersistedEntry {
        PersistedEntry {
            daily_spent: self.daily_spent,
            monthly_spent: self.monthly_spent,
            day: self.periods.day,
            month: self.periods.month,
        }
    }

    /// Usage as of `now` without mutating stored markers.
    fn view(&self, now: PeriodMarkers, daily_limit: f64, monthly_limit: f64) -> (PeriodUsage, PeriodUsage) {
        let current_day = now.day <= self.periods.day;
        let current_month = now.month <= self.periods.month;
        let daily = PeriodUsage {
            spent: if current_day { self.daily_spent } else { 0.0 },
            reserved: if current_day { self.daily_reserved } else { 0.0 },
            limit: daily_limit,
        };
        let monthly = PeriodUsage {
            spent: if current_month { self.monthly_spent } else { 0.0 },
            reserved: if current_month { self.monthly_reserved } else { 0.0 },
            limit: monthly_limit,
        };
        (daily, monthly)
    }
}

#[derive(Clone, Copy)]
enum Scope {
    Identity,
    Global,
}

fn exceeds(limit: BudgetLimit, committed: f64, estimate: f64, cap: f64) -> Result<(), BudgetRejection> {
    if cap > 0.0 && committed + estimate > cap {
        Err(BudgetRejection {
            limit,
            spent: committed,
            cap,
        })
    } else {
        Ok(())
    }
}

/// Entries with outstanding reservations are pinned. Otherwise entries
/// holding no spend in a live period go first, current-day spend last.
fn eviction_rank(entry: &LedgerEntry, now: PeriodMarkers) -> Option<u8> {
    if entry.pending > 0 {
        return None;
    }
    let live_month = entry.periods.month >= now.month && entry.monthly_spent > 0.0;
    let live_day = entry.periods.day >= now.day && entry.daily_spent > 0.0;
    Some(u8::from(live_month) + u8::from(live_day))
}

/// How an admitted request is priced once its usage is known.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceBasis {
    pub model: String,
    /// Blended tier rate used when the model has no price entry.
    pub tier_cost_per_1k: f64,
}

/// A provisional debit awaiting reconciliation.
#[derive(Debug, Clone)]
struct Reservation {
    key: String,
    amount: f64,
    identity_periods: PeriodMarkers,
    global_periods: PeriodMarkers,
    charged_at: DateTime<Utc>,
    basis: Option<PriceBasis>,
}

/// Spend in one period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeriodUsage {
    pub spent: f64,
    pub reserved: f64,
    /// 0 = unlimited
    pub limit: f64,
}

impl PeriodUsage {
    /// `None` when the period is unlimited.
    pub fn remaining(&self) -> Option<f64> {
        (self.limit > 0.0).then(|| (self.limit - self.spent - self.reserved).max(0.0))
    }
}

/// Point-in-time usage for one identity or the global ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub key: String,
    pub daily: PeriodUsage,
    pub monthly: PeriodUsage,
}

/// One persisted ledger row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub daily_spent: f64,
    pub monthly_spent: f64,
    pub day: i64,
    pub month: i32,
}

/// On-disk ledger format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub saved_at: Option<DateTime<Utc>>,
    pub reset_hour_utc: u8,
    pub global: PersistedEntry,
    pub identities: BTreeMap<String, PersistedEntry>,
}

/// Thread-safe cost ledger.
pub struct CostTracker {
    settings: LedgerSettings,
    entries: ShardedLru<String, LedgerEntry>,
    global: Mutex<LedgerEntry>,
    pending: ShardedLru<ReservationId, Reservation>,
    clock: Arc<PeriodClock>,
    dirty: AtomicBool,
}

impl std::fmt::Debug for CostTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostTracker")
            .field("reset_hour_utc", &self.settings.reset_hour_utc)
            .field("identities", &self.entries.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl CostTracker {
    pub fn new(settings: LedgerSettings) -> Self {
        let shards = settings.shards;
        let clock = Arc::new(PeriodClock::default());
        let ranked_by = Arc::clone(&clock);
        Self {
            entries: ShardedLru::new(settings.max_tracked_identities, shards)
                .with_eviction_rank(move |entry: &LedgerEntry| eviction_rank(entry, ranked_by.current())),
            global: Mutex::new(LedgerEntry::default()),
            pending: ShardedLru::new(settings.max_pending_reservations, shards)
                .with_eviction_rank(|_: &Reservation| None),
            clock,
            dirty: AtomicBool::new(false),
            settings,
        }
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    fn periods(&self, now: DateTime<Utc>) -> PeriodMarkers {
        PeriodMarkers::at(now, self.settings.reset_hour_utc)
    }

    /// Atomically check all four limits and reserve `estimate`.
    pub fn reserve(
        &self,
        identity: &Identity,
        caps: &CapabilityRecord,
        estimate: f64,
    ) -> Result<ReservationId, BudgetRejection> {
        self.reserve_inner(identity, caps, estimate, None, Utc::now())
    }

    /// Like [`reserve`](Self::reserve), remembering how to price the usage
    /// reported against the reservation later.
    pub fn reserve_priced(
        &self,
        identity: &Identity,
        caps: &CapabilityRecord,
        estimate: f64,
        basis: PriceBasis,
    ) -> Result<ReservationId, BudgetRejection> {
        self.reserve_inner(identity, caps, estimate, Some(basis), Utc::now())
    }

    pub fn reserve_at(
        &self,
        identity: &Identity,
        caps: &CapabilityRecord,
        estimate: f64,
        now: DateTime<Utc>,
    ) -> Result<ReservationId, BudgetRejection> {
        self.reserve_inner(identity, caps, estimate, None, now)
    }

    fn reserve_inner(
        &self,
        identity: &Identity,
        caps: &CapabilityRecord,
        estimate: f64,
        basis: Option<PriceBasis>,
        now: DateTime<Utc>,
    ) -> Result<ReservationId, BudgetRejection> {
        let estimate = sanitize(estimate);
        let periods = self.observe(now);
        self.make_room(now);
        let key = identity.key();

        let (identity_periods, global_periods) =
            self.entries.with_entry(&key, LedgerEntry::default, |entry| {
                entry.roll(periods);
                entry.check(estimate, caps.cost_budget_daily, caps.cost_budget_monthly, Scope::Identity)?;

                let mut global = self.global.lock();
                global.roll(periods);
                global.check(
                    estimate,
                    self.settings.global_daily_limit,
                    self.settings.global_monthly_limit,
                    Scope::Global,
                )?;

                entry.reserve(estimate);
                global.reserve(estimate);
                Ok::<_, BudgetRejection>((entry.periods, global.periods))
            })?;

        let id = ReservationId::new();
        self.pending.insert(
            id,
            Reservation {
                key,
                amount: estimate,
                identity_periods,
                global_periods,
                charged_at: now,
                basis,
            },
        );
        self.dirty.store(true, Ordering::Release);
        debug!(identity = %identity, reservation = %id, estimate, "Reserved budget");
        Ok(id)
    }

    /// Replace a reservation with the actual cost.
    ///
    /// Returns the recorded cost, or `None` for an unknown (or already
    /// reconciled) reservation.
    pub fn reconcile(&self, id: &ReservationId, actual_cost: f64) -> Option<f64> {
        self.reconcile_at(id, actual_cost, Utc::now())
    }

    pub fn reconcile_at(&self, id: &ReservationId, actual_cost: f64, now: DateTime<Utc>) -> Option<f64> {
        let Some(reservation) = self.pending.remove(id) else {
            warn!(reservation = %id, "Reconcile for unknown reservation ignored");
            return None;
        };
        let actual = sanitize(actual_cost);
        self.settle(&reservation, actual, now);
        debug!(
            reservation = %id,
            estimated = reservation.amount,
            actual,
            "Reconciled reservation"
        );
        Some(actual)
    }

    /// Period markers for `now`, sweeping first if a new month opened.
    fn observe(&self, now: DateTime<Utc>) -> PeriodMarkers {
        let periods = self.periods(now);
        if self.clock.advance(periods) {
            self.sweep_at(now);
        }
        periods
    }

    fn settle(&self, reservation: &Reservation, actual: f64, now: DateTime<Utc>) {
        let periods = self.observe(now);

        self.entries.with_entry(&reservation.key, LedgerEntry::default, |entry| {
            entry.roll(periods);
            entry.settle(reservation.amount, actual, reservation.identity_periods);

            let mut global = self.global.lock();
            global.roll(periods);
            global.settle(reservation.amount, actual, reservation.global_periods);
        });
        self.dirty.store(true, Ordering::Release);
    }

    fn pending_limit(&self) -> usize {
        self.settings
            .max_pending_reservations
            .min(self.settings.max_tracked_identities)
            .max(1)
    }

    /// Settle the oldest reservations at their estimate until there is room
    /// for one more.
    fn make_room(&self, now: DateTime<Utc>) {
        while self.pending.len() >= self.pending_limit() {
            let Some((id, reservation)) = self.pending.remove_min_by(|r| r.charged_at) else {
                break;
            };
            warn!(
                reservation = %id,
                identity = %reservation.key,
                estimate = reservation.amount,
                charged_at = %reservation.charged_at,
                "Too many unreported reservations, settling oldest at its estimate"
            );
            self.settle(&reservation, reservation.amount, now);
        }
    }

    /// Drop reservations whose month has closed. Their periods no longer
    /// count toward any limit, so this only unpins their ledger entries.
    ///
    /// Runs on its own whenever a ledger operation opens a new month.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let month = self.periods(now).month;
        let expired = self.pending.remove_where(|r| r.identity_periods.month < month);
        for (id, reservation) in &expired {
            debug!(reservation = %id, identity = %reservation.key, "Swept reservation from a closed month");
            self.settle(reservation, reservation.amount, now);
        }
        expired.len()
    }

    /// How the usage for `id` should be priced, if it is still outstanding
    /// and was reserved with a basis.
    pub fn price_basis(&self, id: &ReservationId) -> Option<PriceBasis> {
        self.pending.with_existing(id, |r| r.basis.clone()).flatten()
    }

    /// Drop a reservation without charging anything.
    pub fn release(&self, id: &ReservationId) -> bool {
        self.reconcile(id, 0.0).is_some()
    }

    /// Usage for one identity against its resolved budgets.
    pub fn usage(&self, identity: &Identity, caps: &CapabilityRecord) -> UsageSnapshot {
        self.usage_at(identity, caps, Utc::now())
    }

    pub fn usage_at(&self, identity: &Identity, caps: &CapabilityRecord, now: DateTime<Utc>) -> UsageSnapshot {
        let key = identity.key();
        self.usage_by_key(&key, caps.cost_budget_daily, caps.cost_budget_monthly, now)
    }

    /// Usage for a raw ledger key (`channel:caller_id`).
    pub fn usage_by_key(&self, key: &str, daily_limit: f64, monthly_limit: f64, now: DateTime<Utc>) -> UsageSnapshot {
        let periods = self.periods(now);
        let (daily, monthly) = self
            .entries
            .with_existing(&key.to_string(), |e| e.view(periods, daily_limit, monthly_limit))
            .unwrap_or_else(|| LedgerEntry::default().view(periods, daily_limit, monthly_limit));
        UsageSnapshot {
            key: key.to_string(),
            daily,
            monthly,
        }
    }

    pub fn global_usage(&self) -> UsageSnapshot {
        self.global_usage_at(Utc::now())
    }

    pub fn global_usage_at(&self, now: DateTime<Utc>) -> UsageSnapshot {
        let periods = self.periods(now);
        let (daily, monthly) = self.global.lock().view(
            periods,
            self.settings.global_daily_limit,
            self.settings.global_monthly_limit,
        );
        UsageSnapshot {
            key: "global".into(),
            daily,
            monthly,
        }
    }

    /// Keys of every tracked identity, sorted.
    pub fn identities(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.snapshot().into_iter().map(|(k, _)| k).collect();
        keys.sort();
        keys
    }

    /// Outstanding reservation count.
    pub fn pending_reservations(&self) -> usize {
        self.pending.len()
    }

    /// Whether anything changed since the last [`take_dirty`](Self::take_dirty).
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clear the dirty flag, returning its previous value.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Capture spent amounts for persistence. Reservations are not persisted.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let identities = self
            .entries
            .snapshot()
            .into_iter()
            .map(|(k, e)| (k, e.persisted()))
            .collect();
        LedgerSnapshot {
            saved_at: Some(Utc::now()),
            reset_hour_utc: self.settings.reset_hour_utc,
            global: self.global.lock().persisted(),
            identities,
        }
    }

    /// Fold a persisted snapshot into the live ledger.
    ///
    /// Same period: the higher spend wins. Newer persisted period: replaces
    /// the in-memory one. Older persisted period: discarded.
    pub fn merge(&self, snapshot: &LedgerSnapshot) -> Result<(), LedgerError> {
        if snapshot.reset_hour_utc != self.settings.reset_hour_utc {
            return Err(LedgerError::Incompatible(format!(
                "ledger was written with reset hour {}, configured {}",
                snapshot.reset_hour_utc, self.settings.reset_hour_utc
            )));
        }
        for (key, persisted) in &snapshot.identities {
            self.entries
                .with_entry(key, LedgerEntry::default, |entry| entry.merge(persisted));
        }
        self.global.lock().merge(&snapshot.global);
        debug!(identities = snapshot.identities.len(), "Merged persisted ledger");
        Ok(())
    }
}

/// Costs are non-negative and finite.
fn sanitize(cost: f64) -> f64 {
    if cost.is_finite() { cost.max(0.0) } else { 0.0 }
}
