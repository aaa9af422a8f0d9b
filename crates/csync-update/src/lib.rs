//! Field-level diffing of matched record pairs and the buckets that carry the result.

use std::fmt::Write as _;

use csync_core::{
    Authority, CoreError, Fields, Kind, RecordRef, Side, SyncHandle, Value,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "csync-update";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error("a sync update needs at least one record")]
    InvalidUpdate,
    #[error("deltas for {subject} have not been computed; call update() first")]
    NotComputed { subject: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Identical,
    Updating,
    /// Static field differs; the authority would have picked a side.
    Loser,
    /// Static field differs and neither side can be preferred.
    Tie,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delta {
    pub handle: String,
    pub old_m_value: Option<Value>,
    pub old_s_value: Option<Value>,
    pub new_value: Option<Value>,
    pub winner: Option<Side>,
    pub reason: Reason,
}

impl Delta {
    pub fn old_value(&self, side: Side) -> Option<&Value> {
        match side {
            Side::Master => self.old_m_value.as_ref(),
            Side::Slave => self.old_s_value.as_ref(),
        }
    }
}

/// A static field that differs between a matched pair; needs manual review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityConflict {
    pub handle: String,
    pub master_key: Option<String>,
    pub slave_key: Option<String>,
    pub master_value: Option<Value>,
    pub slave_value: Option<Value>,
}

#[derive(Debug, Clone)]
struct Computed {
    handles: Vec<SyncHandle>,
    deltas: Vec<Delta>,
}

/// Diff of one matched pair (or one unmatched record).
#[derive(Debug, Clone)]
pub struct SyncUpdate {
    old_m_object: Option<RecordRef>,
    old_s_object: Option<RecordRef>,
    m_extra: Fields,
    s_extra: Fields,
    computed: Option<Computed>,
    m_updated: bool,
    s_updated: bool,
    important_static: bool,
}

impl SyncUpdate {
    pub fn new(m_object: Option<RecordRef>, s_object: Option<RecordRef>) -> Result<Self, UpdateError> {
        if m_object.is_none() && s_object.is_none() {
            return Err(UpdateError::InvalidUpdate);
        }
        Ok(Self {
            old_m_object: m_object,
            old_s_object: s_object,
            m_extra: Fields::new(),
            s_extra: Fields::new(),
            computed: None,
            m_updated: false,
            s_updated: false,
            important_static: true,
        })
    }

    pub fn old_m_object(&self) -> Option<&RecordRef> {
        self.old_m_object.as_ref()
    }

    pub fn old_s_object(&self) -> Option<&RecordRef> {
        self.old_s_object.as_ref()
    }

    pub fn object(&self, side: Side) -> Option<&RecordRef> {
        match side {
            Side::Master => self.old_m_object.as_ref(),
            Side::Slave => self.old_s_object.as_ref(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.old_m_object
            .as_ref()
            .or(self.old_s_object.as_ref())
            .map(|r| r.kind())
            .unwrap_or(Kind::Product)
    }

    /// Log-friendly identity of the pair.
    pub fn subject(&self) -> String {
        let describe = |r: Option<&RecordRef>| r.map(|r| r.identifier()).unwrap_or_else(|| "-".into());
        format!(
            "{} master={} slave={}",
            self.kind(),
            describe(self.old_m_object.as_ref()),
            describe(self.old_s_object.as_ref())
        )
    }

    /// Overlay derived fields on one side. Recomputes deltas if they exist.
    pub fn set_extra(&mut self, side: Side, extra: Fields) {
        match side {
            Side::Master => self.m_extra = extra,
            Side::Slave => self.s_extra = extra,
        }
        if let Some(computed) = self.computed.take() {
            self.update(&computed.handles);
        }
    }

    pub fn extra(&self, side: Side) -> &Fields {
        match side {
            Side::Master => &self.m_extra,
            Side::Slave => &self.s_extra,
        }
    }

    fn value(&self, side: Side, handle: &str) -> Option<Value> {
        let record = self.object(side)?;
        self.extra(side)
            .get(handle)
            .or_else(|| record.get(handle))
            .filter(|v| !v.is_blank())
            .cloned()
    }

    fn preferred_side(&self, authority: Authority) -> Option<Side> {
        match authority {
            Authority::MasterWins => Some(Side::Master),
            Authority::LatestWins => {
                let m = self.old_m_object.as_ref().and_then(|r| r.modified());
                let s = self.old_s_object.as_ref().and_then(|r| r.modified());
                match (m, s) {
                    (Some(m), Some(s)) if m > s => Some(Side::Master),
                    (Some(m), Some(s)) if s > m => Some(Side::Slave),
                    _ => None,
                }
            }
        }
    }

    /// Compute one delta per handle. Repeat calls replace earlier results.
    pub fn update(&mut self, handles: &[SyncHandle]) {
        let paired = self.old_m_object.is_some() && self.old_s_object.is_some();
        let mut deltas = Vec::with_capacity(handles.len());
        let mut m_updated = false;
        let mut s_updated = false;
        let mut important_static = true;

        for rule in handles {
            let old_m_value = self.value(Side::Master, &rule.handle);
            let old_s_value = self.value(Side::Slave, &rule.handle);
            let mut delta = Delta {
                handle: rule.handle.clone(),
                old_m_value,
                old_s_value,
                new_value: None,
                winner: None,
                reason: Reason::Identical,
            };

            if rule
                .comparator
                .equal(delta.old_m_value.as_ref(), delta.old_s_value.as_ref())
            {
                deltas.push(delta);
                continue;
            }

            let preferred = self.preferred_side(rule.effective_authority());
            if rule.is_static && paired {
                // identity fields are only reported, never written
                important_static = false;
                delta.winner = preferred;
                delta.reason = if preferred.is_some() { Reason::Loser } else { Reason::Tie };
                deltas.push(delta);
                continue;
            }

            let winner = if !paired {
                if self.old_m_object.is_some() {
                    Side::Master
                } else {
                    Side::Slave
                }
            } else {
                preferred.unwrap_or(Side::Master)
            };
            let loser = winner.other();
            delta.new_value = match delta.old_value(winner) {
                Some(value) => Some(value.clone()),
                None => delta.old_value(loser).map(Value::cleared),
            };
            delta.winner = Some(winner);
            delta.reason = Reason::Updating;
            match loser {
                Side::Master => m_updated = true,
                Side::Slave => s_updated = true,
            }
            deltas.push(delta);
        }

        self.m_updated = m_updated;
        self.s_updated = s_updated;
        self.important_static = important_static;
        self.computed = Some(Computed {
            handles: handles.to_vec(),
            deltas,
        });
    }

    pub fn is_computed(&self) -> bool {
        self.computed.is_some()
    }

    fn computed(&self) -> Result<&Computed, UpdateError> {
        self.computed.as_ref().ok_or_else(|| UpdateError::NotComputed {
            subject: self.subject(),
        })
    }

    pub fn deltas(&self) -> Result<&[Delta], UpdateError> {
        Ok(&self.computed()?.deltas)
    }

    pub fn m_updated(&self) -> bool {
        self.m_updated
    }

    pub fn s_updated(&self) -> bool {
        self.s_updated
    }

    pub fn important_static(&self) -> bool {
        self.important_static
    }

    /// Changes to write to `target`, keyed by the target's native field names.
    pub fn updates_for(&self, target: Side) -> Result<Fields, UpdateError> {
        let computed = self.computed()?;
        let mut out = Fields::new();
        for (rule, delta) in computed.handles.iter().zip(&computed.deltas) {
            if delta.reason != Reason::Updating || delta.winner != Some(target.other()) {
                continue;
            }
            if !rule.writable_on(target) {
                continue;
            }
            if let Some(value) = &delta.new_value {
                out.insert(rule.native_key(target).to_string(), value.clone());
            }
        }
        Ok(out)
    }

    pub fn get_master_updates(&self) -> Result<Fields, UpdateError> {
        self.updates_for(Side::Master)
    }

    pub fn get_slave_updates(&self) -> Result<Fields, UpdateError> {
        self.updates_for(Side::Slave)
    }

    /// Slave updates restricted to handles flagged `track_delta`.
    pub fn tracked_slave_changes(&self) -> Result<Vec<&Delta>, UpdateError> {
        let computed = self.computed()?;
        Ok(computed
            .handles
            .iter()
            .zip(&computed.deltas)
            .filter(|(rule, delta)| {
                rule.track_delta && delta.reason == Reason::Updating && delta.winner == Some(Side::Master)
            })
            .map(|(_, delta)| delta)
            .collect())
    }

    pub fn identity_conflicts(&self) -> Vec<IdentityConflict> {
        let Some(computed) = &self.computed else {
            return Vec::new();
        };
        computed
            .deltas
            .iter()
            .filter(|d| matches!(d.reason, Reason::Loser | Reason::Tie))
            .map(|d| IdentityConflict {
                handle: d.handle.clone(),
                master_key: self.old_m_object.as_ref().map(|r| r.key().to_string()),
                slave_key: self.old_s_object.as_ref().map(|r| r.key().to_string()),
                master_value: d.old_m_value.clone(),
                slave_value: d.old_s_value.clone(),
            })
            .collect()
    }

    /// Primary key used to address the record on `side`.
    pub fn pkey(&self, side: Side) -> Option<String> {
        let record = self.object(side)?;
        match side {
            Side::Master => Some(record.key().to_string()),
            Side::Slave => record.remote_id().map(ToString::to_string),
        }
    }

    pub fn tabulate(&self) -> String {
        let mut out = format!("{}\n", self.subject());
        let Some(computed) = &self.computed else {
            out.push_str("  (not computed)\n");
            return out;
        };
        let render = |v: &Option<Value>| v.as_ref().map(Value::render).unwrap_or_else(|| "-".into());
        for delta in computed.deltas.iter().filter(|d| d.reason != Reason::Identical) {
            let winner = delta.winner.map(|s| s.as_str()).unwrap_or("-");
            let _ = writeln!(
                out,
                "  {:<16} master={:<24} slave={:<24} winner={:<6} reason={:?}",
                delta.handle,
                render(&delta.old_m_value),
                render(&delta.old_s_value),
                winner,
                delta.reason
            );
        }
        out
    }

    pub fn report(&self) -> UpdateReport {
        UpdateReport {
            kind: self.kind(),
            master_key: self.old_m_object.as_ref().map(|r| r.key().to_string()),
            slave_key: self.old_s_object.as_ref().map(|r| r.key().to_string()),
            m_updated: self.m_updated,
            s_updated: self.s_updated,
            important_static: self.important_static,
            deltas: self
                .computed
                .as_ref()
                .map(|c| {
                    c.deltas
                        .iter()
                        .filter(|d| d.reason != Reason::Identical)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub kind: Kind,
    pub master_key: Option<String>,
    pub slave_key: Option<String>,
    pub m_updated: bool,
    pub s_updated: bool,
    pub important_static: bool,
    pub deltas: Vec<Delta>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateSummary {
    pub master: usize,
    pub slave: usize,
    pub problematic: usize,
    pub new_slaves: usize,
    pub new_masters: usize,
    pub delta_slave: usize,
}

/// Pending updates bucketed by disposition.
#[derive(Debug, Clone, Default)]
pub struct UpdateNamespace {
    pub master: Vec<SyncUpdate>,
    pub slave: Vec<SyncUpdate>,
    pub problematic: Vec<SyncUpdate>,
    pub new_slaves: Vec<SyncUpdate>,
    pub new_masters: Vec<SyncUpdate>,
    /// Informational copies of slave updates touching tracked fields.
    pub delta_slave: Vec<SyncUpdate>,
}

impl UpdateNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a computed update of a matched pair.
    pub fn enqueue(&mut self, update: SyncUpdate) -> Result<(), UpdateError> {
        let slave_changes = update.get_slave_updates()?;
        let master_changes = update.get_master_updates()?;

        if !update.important_static() {
            for conflict in update.identity_conflicts() {
                warn!(
                    handle = %conflict.handle,
                    master = ?conflict.master_key,
                    slave = ?conflict.slave_key,
                    "identity conflict routed to problematic"
                );
            }
            self.problematic.push(update);
            return Ok(());
        }

        if !update.tracked_slave_changes()?.is_empty() {
            self.delta_slave.push(update.clone());
        }
        match (master_changes.is_empty(), slave_changes.is_empty()) {
            (true, true) => debug!(subject = %update.subject(), "in sync"),
            (true, false) => self.slave.push(update),
            (false, true) => self.master.push(update),
            (false, false) => {
                self.master.push(update.clone());
                self.slave.push(update);
            }
        }
        Ok(())
    }

    pub fn extend(&mut self, other: UpdateNamespace) {
        self.master.extend(other.master);
        self.slave.extend(other.slave);
        self.problematic.extend(other.problematic);
        self.new_slaves.extend(other.new_slaves);
        self.new_masters.extend(other.new_masters);
        self.delta_slave.extend(other.delta_slave);
    }

    pub fn summary(&self) -> UpdateSummary {
        UpdateSummary {
            master: self.master.len(),
            slave: self.slave.len(),
            problematic: self.problematic.len(),
            new_slaves: self.new_slaves.len(),
            new_masters: self.new_masters.len(),
            delta_slave: self.delta_slave.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary() == UpdateSummary::default()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApplyError {
    #[error("transport failure at {endpoint} (status {status:?}): {message}")]
    Transport {
        endpoint: String,
        status: Option<u16>,
        message: String,
    },
    #[error("{key} cannot be created before its parent {parent}")]
    ParentUnavailable { key: String, parent: String },
    #[error("{subject} has no primary key on the {side} side")]
    MissingPrimaryKey { subject: String, side: Side },
    #[error("create response for {subject} carried no id")]
    MissingRemoteId { subject: String },
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error(transparent)]
    Stamp(#[from] CoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct Success {
    pub update: SyncUpdate,
    pub side: Side,
    pub action: Action,
    pub remote_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Failure {
    pub update: SyncUpdate,
    pub side: Side,
    pub action: Action,
    pub error: ApplyError,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub side: Side,
    pub action: Action,
    pub subject: String,
    pub error: String,
    pub detail: String,
}

impl Failure {
    pub fn report(&self) -> FailureReport {
        FailureReport {
            side: self.side,
            action: self.action,
            subject: self.update.subject(),
            error: self.error.to_string(),
            detail: self.update.tabulate(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResultsSummary {
    pub successes: usize,
    pub fails_master: usize,
    pub fails_slave: usize,
}

/// Outcome of applying an `UpdateNamespace`.
#[derive(Debug, Clone, Default)]
pub struct ResultsNamespace {
    pub successes: Vec<Success>,
    pub fails_master: Vec<Failure>,
    pub fails_slave: Vec<Failure>,
}

impl ResultsNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, update: SyncUpdate, side: Side, action: Action, remote_id: Option<String>) {
        self.successes.push(Success {
            update,
            side,
            action,
            remote_id,
        });
    }

    pub fn record_failure(&mut self, update: SyncUpdate, side: Side, action: Action, error: ApplyError) {
        let failure = Failure {
            update,
            side,
            action,
            error,
        };
        match side {
            Side::Master => self.fails_master.push(failure),
            Side::Slave => self.fails_slave.push(failure),
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.fails_master.is_empty() || !self.fails_slave.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &Failure> {
        self.fails_master.iter().chain(self.fails_slave.iter())
    }

    pub fn extend(&mut self, other: ResultsNamespace) {
        self.successes.extend(other.successes);
        self.fails_master.extend(other.fails_master);
        self.fails_slave.extend(other.fails_slave);
    }

    pub fn summary(&self) -> ResultsSummary {
        ResultsSummary {
            successes: self.successes.len(),
            fails_master: self.fails_master.len(),
            fails_slave: self.fails_slave.len(),
        }
    }
}
