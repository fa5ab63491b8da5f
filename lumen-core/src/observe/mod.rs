//! The observation engine: per-observation state, attribute-driven
//! scheduling and cancellation.
//!
//! Observations are keyed by their 8-byte token. Attributes are never
//! cached beyond one evaluation — every decision resolves them on demand
//! through the [`AttrStore`] (request attrs → exact path → ancestors →
//! account defaults), so a later Write-Attributes affects live
//! observations immediately.

use crate::attr::{AttrSet, AttrStore};
use crate::dm::{ChangeKind, DataModel};
use crate::flat_map::FlatMap;
use crate::path::Path;
use crate::value::Value;
use lumen_coap::{ContentFormat, Token};
use smallvec::SmallVec;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// RFC 7641 section 4.5: force a confirmable notification when none went
/// out for a day.
const CONFIRMABLE_EVERY_MS: i64 = 24 * 60 * 60 * 1000;

/// The Observe option wraps at 2^24.
const OBSERVE_SEQ_MASK: u32 = 0x00ff_ffff;

/// Behavior switches for the deviations kept behind options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObserveConfig {
    /// Cancel an observation whose confirmable notification exhausted its
    /// retransmissions (RFC 7641 behavior; off by default).
    pub cancel_on_notify_timeout: bool,
    /// Ignore RST received for a non-confirmable notification instead of
    /// cancelling (upstream deviation; off by default).
    pub keep_on_non_rst: bool,
}

/// One live observation.
#[derive(Debug)]
pub struct Observation {
    pub token: Token,
    pub ssid: u16,
    pub paths: SmallVec<[Path; 1]>,
    pub composite: bool,
    /// Content format the notifications are encoded in.
    pub format: ContentFormat,
    /// Attributes carried in the Observe request itself.
    pub request_attrs: AttrSet,
    /// Observe option value of the last emitted notification.
    seq: u32,
    /// A value trigger fired; the notification may still be gated by pmin.
    pending: bool,
    /// An exchange is currently carrying a notification for this token.
    in_flight: bool,
    /// Earliest instant the next notification may go out.
    pmin_gate: Option<Instant>,
    /// Latest instant by which a notification must go out.
    pmax_deadline: Option<Instant>,
    /// Last reported numeric value per path (bool as 0/1), the baseline
    /// for gt/lt/st/edge evaluation.
    last_reported: SmallVec<[Option<f64>; 1]>,
    /// Wall time of the last confirmable notification.
    last_con_ms: i64,
}

impl Observation {
    pub fn seq(&self) -> u32 {
        self.seq
    }
}

/// Values handed back when a notification is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyJob {
    pub token: Token,
    pub confirmable: bool,
    pub seq: u32,
}

#[derive(Default)]
pub struct ObservationEngine {
    config: ObserveConfig,
    observations: FlatMap<Token, Observation>,
}

impl ObservationEngine {
    pub fn new(config: ObserveConfig) -> ObservationEngine {
        ObservationEngine {
            config,
            observations: FlatMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn get(&self, token: &Token) -> Option<&Observation> {
        self.observations.get(token)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.observations.values()
    }

    /// Registers an observation created from an Observe/Observe-Composite
    /// request. `initial` are the samples served in the initial response;
    /// they become the trigger baselines. Returns the Observe option value
    /// for that response.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        token: Token,
        ssid: u16,
        paths: SmallVec<[Path; 1]>,
        composite: bool,
        format: ContentFormat,
        request_attrs: AttrSet,
        initial: &[(Path, Option<f64>)],
        store: &AttrStore,
        defaults: &AttrSet,
        now: Instant,
        now_ms: i64,
    ) -> u32 {
        let last_reported = paths
            .iter()
            .map(|path| {
                initial
                    .iter()
                    .find(|(sample_path, _)| sample_path.starts_with(path))
                    .and_then(|(_, numeric)| *numeric)
            })
            .collect();
        let mut obs = Observation {
            token,
            ssid,
            paths,
            composite,
            format,
            request_attrs,
            seq: 0,
            pending: false,
            in_flight: false,
            pmin_gate: None,
            pmax_deadline: None,
            last_reported,
            last_con_ms: now_ms,
        };
        let attrs = self.combined_attrs(&obs, store, defaults);
        arm_deadlines(&mut obs, &attrs, now);
        debug!(token = %obs.token, paths = obs.paths.len(), "observation created");
        self.observations.insert(token, obs);
        0
    }

    pub fn cancel(&mut self, token: &Token) -> Option<Observation> {
        let removed = self.observations.remove(token);
        if removed.is_some() {
            debug!(%token, "observation cancelled");
        }
        removed
    }

    /// Deregistration and shutdown drop every observation.
    pub fn cancel_all(&mut self) {
        self.observations.clear();
    }

    /// RST received for a notification; `confirmable` tells which kind the
    /// notification was.
    pub fn on_reset(&mut self, token: &Token, confirmable: bool) {
        if !confirmable && self.config.keep_on_non_rst {
            trace!(%token, "RST for non-confirmable notify ignored by configuration");
            return;
        }
        self.cancel(token);
    }

    /// A confirmable notification ran out of retransmissions.
    pub fn on_notify_timeout(&mut self, token: &Token) {
        if self.config.cancel_on_notify_timeout {
            self.cancel(token);
        } else if let Some(obs) = self.observations.get_mut(token) {
            obs.in_flight = false;
        }
    }

    /// The application or a server write changed the data model.
    pub fn data_model_changed(
        &mut self,
        changed: &Path,
        kind: ChangeKind,
        dm: &mut DataModel,
        store: &AttrStore,
        defaults: &AttrSet,
        now: Instant,
    ) {
        match kind {
            ChangeKind::Added => {}
            ChangeKind::Removed => {
                // Observed path disappeared: the observation is dropped
                // without a final 4.04.
                self.observations.retain(|token, obs| {
                    let gone = obs.paths.iter().any(|p| p.starts_with(changed));
                    if gone {
                        debug!(%token, removed = %changed, "observed path deleted, dropping observation");
                    }
                    !gone
                });
            }
            ChangeKind::ValueChanged => {
                let tokens: Vec<Token> = self
                    .observations
                    .iter()
                    .filter(|(_, obs)| obs.paths.iter().any(|p| p.intersects(changed)))
                    .map(|(token, _)| *token)
                    .collect();
                for token in tokens {
                    self.evaluate_triggers(&token, changed, dm, store, defaults, now);
                }
            }
        }
    }

    fn evaluate_triggers(
        &mut self,
        token: &Token,
        changed: &Path,
        dm: &mut DataModel,
        store: &AttrStore,
        defaults: &AttrSet,
        now: Instant,
    ) {
        let Some(obs) = self.observations.get(token) else {
            return;
        };
        let mut fired = false;
        for (idx, path) in obs.paths.iter().enumerate() {
            if !path.intersects(changed) {
                continue;
            }
            let attrs = store.resolve(path, Some(&obs.request_attrs), defaults);
            let current = read_numeric(dm, path);
            let baseline = obs.last_reported.get(idx).copied().flatten();
            if triggers_fire(&attrs, baseline, current) {
                fired = true;
                break;
            }
        }
        if fired {
            if let Some(obs) = self.observations.get_mut(token) {
                obs.pending = true;
                // The send may still be gated behind pmin.
                let deferred = obs.pmin_gate.is_some_and(|gate| gate > now);
                trace!(%token, deferred, "value trigger fired");
            }
        }
    }

    /// Combined scheduling attributes of a (possibly composite)
    /// observation: the strictest pmin/pmax over its paths, `con` if any
    /// path resolves it true.
    fn combined_attrs(&self, obs: &Observation, store: &AttrStore, defaults: &AttrSet) -> AttrSet {
        let mut combined = AttrSet::default();
        for path in &obs.paths {
            let attrs = store.resolve(path, Some(&obs.request_attrs), defaults);
            combined.pmin = match (combined.pmin, attrs.pmin) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            combined.pmax = match (combined.pmax, attrs.pmax) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            if attrs.con == Some(true) {
                combined.con = Some(true);
            }
        }
        combined
    }

    /// Picks the notification that is due now, earliest deadline first.
    pub fn due(
        &mut self,
        store: &AttrStore,
        defaults: &AttrSet,
        now: Instant,
        now_ms: i64,
    ) -> Option<NotifyJob> {
        let mut best: Option<(Instant, Token)> = None;
        for (token, obs) in self.observations.iter() {
            if obs.in_flight {
                continue;
            }
            if let Some(due_at) = observation_due_at(obs, now) {
                if due_at <= now && best.is_none_or(|(b, _)| due_at < b) {
                    best = Some((due_at, *token));
                }
            }
        }
        let (_, token) = best?;
        let (confirmable, seq) = {
            let combined = {
                let obs = self.observations.get(&token)?;
                self.combined_attrs(obs, store, defaults)
            };
            let obs = self.observations.get_mut(&token)?;
            let forced = now_ms - obs.last_con_ms >= CONFIRMABLE_EVERY_MS;
            let confirmable = combined.con == Some(true) || forced;
            obs.in_flight = true;
            obs.seq = obs.seq.wrapping_add(1) & OBSERVE_SEQ_MASK;
            (confirmable, obs.seq)
        };
        Some(NotifyJob {
            token,
            confirmable,
            seq,
        })
    }

    /// Records a notification handed to the exchange engine; re-arms the
    /// deadlines and updates the trigger baselines.
    pub fn mark_sent(
        &mut self,
        token: &Token,
        reported: &[(Path, Option<f64>)],
        confirmable: bool,
        store: &AttrStore,
        defaults: &AttrSet,
        now: Instant,
        now_ms: i64,
    ) {
        let combined = {
            let Some(obs) = self.observations.get(token) else {
                return;
            };
            self.combined_attrs(obs, store, defaults)
        };
        let Some(obs) = self.observations.get_mut(token) else {
            return;
        };
        obs.pending = false;
        for (idx, path) in obs.paths.iter().enumerate() {
            let numeric = reported
                .iter()
                .find(|(p, _)| p.starts_with(path))
                .and_then(|(_, n)| *n);
            if let Some(slot) = obs.last_reported.get_mut(idx) {
                if numeric.is_some() {
                    *slot = numeric;
                }
            }
        }
        if confirmable {
            obs.last_con_ms = now_ms;
        }
        arm_deadlines(obs, &combined, now);
    }

    /// The notification exchange for `token` concluded.
    pub fn notify_done(&mut self, token: &Token) {
        if let Some(obs) = self.observations.get_mut(token) {
            obs.in_flight = false;
        }
    }

    /// Earliest instant any observation needs service.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        for obs in self.observations.values() {
            if obs.in_flight {
                continue;
            }
            if let Some(due) = observation_due_at(obs, now) {
                next = Some(next.map_or(due, |n| n.min(due)));
            }
        }
        next
    }

    /// Does any observation have a pmax deadline within `horizon`? Queue
    /// mode must not start when one does.
    pub fn pmax_within(&self, now: Instant, horizon: Duration) -> bool {
        self.observations
            .values()
            .any(|obs| obs.pmax_deadline.is_some_and(|d| d <= now + horizon))
    }

    /// Re-registers a persisted observation (deadlines restart from
    /// `now`).
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        &mut self,
        token: Token,
        ssid: u16,
        paths: SmallVec<[Path; 1]>,
        composite: bool,
        format: ContentFormat,
        request_attrs: AttrSet,
        seq: u32,
        store: &AttrStore,
        defaults: &AttrSet,
        now: Instant,
        now_ms: i64,
    ) {
        let count = paths.len();
        let mut obs = Observation {
            token,
            ssid,
            paths,
            composite,
            format,
            request_attrs,
            seq,
            pending: false,
            in_flight: false,
            pmin_gate: None,
            pmax_deadline: None,
            last_reported: std::iter::repeat_n(None, count).collect(),
            last_con_ms: now_ms,
        };
        let attrs = self.combined_attrs(&obs, store, defaults);
        arm_deadlines(&mut obs, &attrs, now);
        self.observations.insert(token, obs);
    }
}

/// When the observation needs service: its pmax deadline, or its pmin
/// gate (immediately, if no gate) while a trigger is pending.
fn observation_due_at(obs: &Observation, now: Instant) -> Option<Instant> {
    let pending_at = if obs.pending {
        // A pending trigger fires as soon as the pmin gate allows.
        Some(obs.pmin_gate.unwrap_or(now))
    } else {
        None
    };
    match (pending_at, obs.pmax_deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn arm_deadlines(obs: &mut Observation, attrs: &AttrSet, now: Instant) {
    obs.pmin_gate = attrs
        .pmin
        .filter(|pmin| *pmin > 0)
        .map(|pmin| now + Duration::from_secs(u64::from(pmin)));
    // pmax == 0 disables periodic notifications.
    obs.pmax_deadline = attrs
        .pmax
        .filter(|pmax| *pmax > 0)
        .map(|pmax| now + Duration::from_secs(u64::from(pmax)));
}

fn read_numeric(dm: &mut DataModel, path: &Path) -> Option<f64> {
    let samples = dm.read(path).ok()?;
    let sample = samples.first()?;
    numeric_of(&sample.value)
}

pub(crate) fn numeric_of(value: &Value) -> Option<f64> {
    value
        .numeric()
        .or_else(|| value.as_bool().map(|b| if b { 1.0 } else { 0.0 }))
}

/// gt/lt crossings, st step and edge transitions; with no trigger
/// attributes set, any signalled change fires.
fn triggers_fire(attrs: &AttrSet, baseline: Option<f64>, current: Option<f64>) -> bool {
    if !attrs.has_value_triggers() {
        return true;
    }
    let (Some(prev), Some(next)) = (baseline, current) else {
        // No baseline to compare against: treat as a plain change.
        return true;
    };
    if let Some(gt) = attrs.gt {
        if (prev <= gt) != (next <= gt) {
            return true;
        }
    }
    if let Some(lt) = attrs.lt {
        if (prev <= lt) != (next <= lt) {
            return true;
        }
    }
    if let Some(st) = attrs.st {
        if (next - prev).abs() >= st {
            return true;
        }
    }
    if let Some(edge) = attrs.edge {
        let rising = prev == 0.0 && next != 0.0;
        let falling = prev != 0.0 && next == 0.0;
        if (edge && rising) || (!edge && falling) {
            return true;
        }
    }
    false
}
