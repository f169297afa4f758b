//! Per-device state, keyed by I²C bus number.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU16, AtomicU32, Ordering},
        Arc,
    },
};

use ddcio_common::{constants::MaxMaxTries, OperationClass, Status};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::{
    dsa::{
        CachedRecord, DsaGeneration, DsaState, FixedMultiplier, Outcome, ResultsTable,
        SleepController,
    },
    options::{validate_multiplier, CoreOptions, DsaOptions, OptionsError},
};

mod token;
pub use token::{CrossDeviceLock, ExclusiveGuard, SharedGuard};

/// Number of histogram slots: fatal, exhausted, and one per possible successful attempt.
pub const TRY_SLOTS: usize = MaxMaxTries as usize + 2;

/// Where a retry loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryOutcome {
    Fatal,
    Exhausted,
    /// Succeeded on the given 1-based attempt.
    Succeeded(u16),
}

impl TryOutcome {
    #[inline]
    pub fn slot(self) -> usize {
        match self {
            Self::Fatal => 0,
            Self::Exhausted => 1,
            Self::Succeeded(attempt) => (attempt as usize + 1).clamp(2, TRY_SLOTS - 1),
        }
    }
}

/// Outcome counts of the retry loops of one operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryHistogram {
    slots: [u32; TRY_SLOTS],
}

impl Default for TryHistogram {
    fn default() -> Self {
        Self { slots: [0; TRY_SLOTS] }
    }
}

impl TryHistogram {
    pub fn record(&mut self, outcome: TryOutcome) {
        self.slots[outcome.slot()] += 1;
    }

    #[inline]
    pub fn slot(&self, index: usize) -> u32 {
        self.slots.get(index).copied().unwrap_or(0)
    }

    #[inline]
    pub fn slots(&self) -> &[u32; TRY_SLOTS] {
        &self.slots
    }

    pub fn fatal(&self) -> u32 {
        self.slots[0]
    }

    pub fn exhausted(&self) -> u32 {
        self.slots[1]
    }

    /// Number of loops that succeeded on `attempt`.
    pub fn succeeded_on(&self, attempt: u16) -> u32 {
        self.slot(attempt as usize + 1)
    }

    pub fn total(&self) -> u32 {
        self.slots.iter().sum()
    }

    pub fn clear(&mut self) {
        self.slots = [0; TRY_SLOTS];
    }
}

/// Current maxtries of one class, and the lowest and highest it has ever been set to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxtriesRange {
    pub current: u16,
    pub lowest: u16,
    pub highest: u16,
}

impl MaxtriesRange {
    fn new(current: u16) -> Self {
        let current = clamp_maxtries(current);
        Self { current, lowest: current, highest: current }
    }

    fn set(&mut self, n: u16) -> u16 {
        self.current = clamp_maxtries(n);
        self.lowest = self.lowest.min(self.current);
        self.highest = self.highest.max(self.current);
        self.current
    }
}

#[inline]
fn clamp_maxtries(n: u16) -> u16 {
    n.clamp(1, MaxMaxTries)
}

/// Fold of [`MaxtriesRange`] over every device, for consistency checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalMaxtriesAccumulator {
    pub class: OperationClass,
    pub max_highest_maxtries: u16,
    pub min_lowest_maxtries: u16,
}

impl GlobalMaxtriesAccumulator {
    fn new(class: OperationClass) -> Self {
        Self { class, max_highest_maxtries: 0, min_lowest_maxtries: MaxMaxTries }
    }

    fn observe(&mut self, range: &MaxtriesRange) {
        self.max_highest_maxtries = self.max_highest_maxtries.max(range.highest);
        self.min_lowest_maxtries = self.min_lowest_maxtries.min(range.lowest);
    }
}

#[derive(Debug)]
struct DeviceData {
    description: String,
    maxtries: [MaxtriesRange; OperationClass::COUNT],
    try_stats: [TryHistogram; OperationClass::COUNT],
    static_multiplier: f32,
    multiplier_ct: u16,
    dsa: DsaState,
    initial_multiplier: f32,
    final_successful_multiplier: Option<f32>,
    defined: bool,
}

/// One device in the store. Cheap to clone through `Arc`; every accessor takes the
/// cross-device token in shared mode, then the device mutex.
#[derive(Debug)]
pub struct DeviceEntry {
    busno: u32,
    token: Arc<CrossDeviceLock>,
    data: Mutex<DeviceData>,
    /// `f32` bits of the multiplier pacing should use.
    adjusted: AtomicU32,
}

impl DeviceEntry {
    fn new(
        busno: u32,
        token: Arc<CrossDeviceLock>,
        maxtries: [u16; OperationClass::COUNT],
        static_multiplier: f32,
        dsa: DsaState,
        defined: bool,
    ) -> Self {
        let multiplier = dsa.adjusted_sleep_multiplier();
        let data = DeviceData {
            description: format!("i2c-{busno}"),
            maxtries: maxtries.map(MaxtriesRange::new),
            try_stats: Default::default(),
            static_multiplier,
            multiplier_ct: 1,
            dsa,
            initial_multiplier: multiplier,
            final_successful_multiplier: None,
            defined,
        };
        Self { busno, token, data: Mutex::new(data), adjusted: AtomicU32::new(multiplier.to_bits()) }
    }

    #[inline]
    pub fn busno(&self) -> u32 {
        self.busno
    }

    fn with<R>(&self, f: impl FnOnce(&mut DeviceData) -> R) -> R {
        let _guard = self.token.shared();
        let mut data = self.data.lock();
        f(&mut data)
    }

    fn publish(&self, data: &DeviceData) {
        self.adjusted.store(data.dsa.adjusted_sleep_multiplier().to_bits(), Ordering::Relaxed);
    }

    pub fn description(&self) -> String {
        self.with(|d| d.description.clone())
    }

    pub fn set_description(&self, description: impl Into<String>) {
        let description = description.into();
        self.with(|d| d.description = description);
    }

    /// False for entries restored from the stats cache that no caller has opened yet.
    pub fn is_defined(&self) -> bool {
        self.with(|d| d.defined)
    }

    fn mark_defined(&self) {
        self.with(|d| d.defined = true);
    }

    pub fn maxtries(&self, class: OperationClass) -> u16 {
        self.with(|d| d.maxtries[class.index()].current)
    }

    pub fn maxtries_range(&self, class: OperationClass) -> MaxtriesRange {
        self.with(|d| d.maxtries[class.index()])
    }

    /// Sets maxtries for `class`, clamped to `1..=MaxMaxTries`. Returns the value applied.
    pub fn set_maxtries(&self, class: OperationClass, n: u16) -> u16 {
        let applied = self.with(|d| d.maxtries[class.index()].set(n));
        if applied != n {
            warn!(busno = self.busno, %class, requested = n, applied, "maxtries clamped");
        }
        applied
    }

    pub fn static_multiplier(&self) -> f32 {
        self.with(|d| d.static_multiplier)
    }

    /// Sets the operator multiplier for this device and restarts its DSA history from it.
    pub fn set_static_multiplier(&self, multiplier: f32) -> Result<(), OptionsError> {
        let multiplier = validate_multiplier(multiplier)?;
        self.with(|d| {
            d.static_multiplier = multiplier;
            d.dsa.reset(Some(multiplier));
            self.publish(d);
        });
        Ok(())
    }

    /// Integer amplifier applied to every sleep.
    pub fn multiplier_ct(&self) -> u16 {
        self.with(|d| d.multiplier_ct)
    }

    pub fn set_multiplier_ct(&self, ct: u16) {
        self.with(|d| d.multiplier_ct = ct);
    }

    /// Grows the multiplier count by one, up to `max`. Returns the new count.
    pub fn bump_multiplier_ct(&self, max: u16) -> u16 {
        self.with(|d| {
            d.multiplier_ct = d.multiplier_ct.saturating_add(1).min(max.max(1));
            d.multiplier_ct
        })
    }

    /// The multiplier pacing should apply. Never blocks.
    #[inline]
    pub fn adjusted_multiplier(&self) -> f32 {
        f32::from_bits(self.adjusted.load(Ordering::Relaxed))
    }

    /// The adjusted multiplier when the entry was created.
    pub fn initial_multiplier(&self) -> f32 {
        self.with(|d| d.initial_multiplier)
    }

    /// The multiplier in effect during the most recent successful loop.
    pub fn final_successful_multiplier(&self) -> Option<f32> {
        self.with(|d| d.final_successful_multiplier)
    }

    pub fn record_try(&self, class: OperationClass, outcome: TryOutcome) {
        self.with(|d| d.try_stats[class.index()].record(outcome));
    }

    pub fn try_stats(&self, class: OperationClass) -> TryHistogram {
        self.with(|d| d.try_stats[class.index()])
    }

    pub fn reset_try_stats(&self) {
        self.with(|d| d.try_stats.iter_mut().for_each(TryHistogram::clear));
    }

    pub fn note_retryable_failure(&self, status: Status, remaining_tries: u16) {
        self.with(|d| {
            d.dsa.note_retryable_failure(status, remaining_tries);
            self.publish(d);
        });
    }

    /// Feeds the final outcome of one retry loop to the controller. Returns `true` if the
    /// controller changed the device's multiplier.
    pub fn record_final(&self, outcome: Outcome, attempts: u16, null_adjustment: bool) -> bool {
        self.with(|d| {
            if outcome == Outcome::Succeeded {
                d.final_successful_multiplier = Some(d.dsa.adjusted_sleep_multiplier());
            }
            let changed = d.dsa.record_final(outcome, attempts, null_adjustment);
            self.publish(d);
            changed
        })
    }

    /// Forgets the controller history. See [`SleepController::reset`].
    pub fn reset_dsa(&self, seed_multiplier: Option<f32>) {
        self.with(|d| {
            d.dsa.reset(seed_multiplier);
            self.publish(d);
        });
    }

    pub fn dsa_generation(&self) -> DsaGeneration {
        self.with(|d| d.dsa.generation())
    }

    /// Runs `f` on the device's controller state.
    pub fn inspect_dsa<R>(&self, f: impl FnOnce(&DsaState) -> R) -> R {
        self.with(|d| f(&d.dsa))
    }

    /// The record the stats cache should hold for this device, if its generation persists.
    pub fn dsa_record(&self) -> Option<CachedRecord> {
        self.with(|d| d.dsa.as_results_table().map(ResultsTable::to_cached))
    }

    /// Compares the EDID check byte of the connected monitor with the one cached for this bus.
    /// A mismatch means a different monitor is attached: the restored history is dropped.
    /// Returns `false` on mismatch.
    pub fn verify_edid(&self, check_byte: u8) -> bool {
        self.with(|d| {
            let seed = d.static_multiplier;
            let Some(table) = d.dsa.as_results_table_mut() else { return true };
            let matches = match table.edid_check_byte() {
                Some(cached) if cached != check_byte => {
                    info!(busno = self.busno, cached, check_byte, "monitor changed, dropping DSA history");
                    table.reset(Some(seed));
                    false
                }
                _ => true,
            };
            table.set_edid_check_byte(Some(check_byte));
            self.publish(d);
            matches
        })
    }
}

/// Registry of every device the process has touched.
#[derive(Debug)]
pub struct DeviceStore {
    devices: RwLock<FxHashMap<u32, Arc<DeviceEntry>>>,
    token: Arc<CrossDeviceLock>,
    default_maxtries: [AtomicU16; OperationClass::COUNT],
    sleep_multiplier: f32,
    dsa: DsaOptions,
}

impl DeviceStore {
    pub fn new(opts: &CoreOptions) -> Self {
        Self {
            devices: RwLock::new(FxHashMap::default()),
            token: Arc::new(CrossDeviceLock::new(opts.store.quiescence)),
            default_maxtries: opts.retry.maxtries.map(|n| AtomicU16::new(clamp_maxtries(n))),
            sleep_multiplier: validate_multiplier(opts.pacing.sleep_multiplier).unwrap_or(1.0),
            dsa: opts.dsa.clone(),
        }
    }

    #[inline]
    pub fn token(&self) -> &CrossDeviceLock {
        &self.token
    }

    pub fn dsa_generation(&self) -> DsaGeneration {
        self.dsa.generation
    }

    pub fn default_maxtries(&self, class: OperationClass) -> u16 {
        self.default_maxtries[class.index()].load(Ordering::Relaxed)
    }

    #[allow(deprecated)]
    fn new_controller(&self, busno: u32) -> DsaState {
        use crate::dsa::LegacyState;

        match self.dsa.generation {
            DsaGeneration::Disabled => {
                DsaState::Disabled(FixedMultiplier::new(self.sleep_multiplier))
            }
            DsaGeneration::Legacy => DsaState::Legacy(LegacyState::new(self.sleep_multiplier)),
            DsaGeneration::Dsa2 => DsaState::Dsa2(ResultsTable::new(
                busno,
                &self.dsa,
                self.dsa.resolved_initial_step(self.sleep_multiplier),
            )),
        }
    }

    fn insert(&self, busno: u32, dsa: DsaState, defined: bool) -> Arc<DeviceEntry> {
        let maxtries = OperationClass::ALL.map(|c| self.default_maxtries(c));
        Arc::new(DeviceEntry::new(
            busno,
            Arc::clone(&self.token),
            maxtries,
            self.sleep_multiplier,
            dsa,
            defined,
        ))
    }

    pub fn get(&self, busno: u32) -> Option<Arc<DeviceEntry>> {
        let _guard = self.token.shared();
        self.devices.read().get(&busno).cloned()
    }

    /// Looks up the entry for `busno`, creating it on first use.
    pub fn get_or_create(&self, busno: u32) -> Arc<DeviceEntry> {
        let entry = {
            let _guard = self.token.shared();
            let existing = self.devices.read().get(&busno).cloned();
            match existing {
                Some(entry) => entry,
                None => {
                    let mut devices = self.devices.write();
                    Arc::clone(devices.entry(busno).or_insert_with(|| {
                        debug!(busno, "new device entry");
                        self.insert(busno, self.new_controller(busno), true)
                    }))
                }
            }
        };
        entry.mark_defined();
        entry
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every device in unspecified order while holding the cross-device token. The
    /// visitor may call any [`DeviceEntry`] accessor.
    pub fn apply_all(&self, mut f: impl FnMut(&DeviceEntry)) {
        let _guard = self.token.exclusive();
        let entries: Vec<_> = self.devices.read().values().cloned().collect();
        for entry in &entries {
            f(entry);
        }
    }

    /// Like [`apply_all`](Self::apply_all), in ascending bus order.
    pub fn apply_all_sorted(&self, mut f: impl FnMut(&DeviceEntry)) {
        let _guard = self.token.exclusive();
        let entries: BTreeMap<_, _> =
            self.devices.read().iter().map(|(k, v)| (*k, Arc::clone(v))).collect();
        for entry in entries.values() {
            f(entry);
        }
    }

    /// Folds the maxtries ranges of every device, starting from the process default.
    pub fn maxtries_range(&self, class: OperationClass) -> GlobalMaxtriesAccumulator {
        let mut acc = GlobalMaxtriesAccumulator::new(class);
        acc.observe(&MaxtriesRange::new(self.default_maxtries(class)));
        self.apply_all(|entry| acc.observe(&entry.maxtries_range(class)));
        acc
    }

    /// Sets maxtries for `class` on every device and as the default for new ones.
    pub fn set_all_maxtries(&self, class: OperationClass, n: u16) -> u16 {
        let applied = clamp_maxtries(n);
        self.default_maxtries[class.index()].store(applied, Ordering::Relaxed);
        self.apply_all(|entry| {
            entry.set_maxtries(class, applied);
        });
        applied
    }

    pub fn reset_all_try_stats(&self) {
        self.apply_all(DeviceEntry::reset_try_stats);
    }

    /// Pre-populates the store from cached DSA records. Records for buses already present, or
    /// when the store does not run the generation that persists, are ignored. Returns the
    /// number of entries created.
    pub fn load_cached(&self, records: &[CachedRecord]) -> usize {
        if self.dsa.generation != DsaGeneration::Dsa2 {
            return 0;
        }

        let _guard = self.token.exclusive();
        let mut devices = self.devices.write();
        let mut loaded = 0;
        for record in records {
            devices.entry(record.busno).or_insert_with(|| {
                loaded += 1;
                let table = ResultsTable::from_cached(&self.dsa, record);
                self.insert(record.busno, DsaState::Dsa2(table), false)
            });
        }
        loaded
    }

    /// Records for the stats cache, in ascending bus order.
    pub fn dsa_records(&self) -> Vec<CachedRecord> {
        let mut records = Vec::new();
        self.apply_all_sorted(|entry| records.extend(entry.dsa_record()));
        records
    }
}
