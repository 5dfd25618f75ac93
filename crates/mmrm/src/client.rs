//! Registry of known clock sources and their live state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use derive_more::Display;
use error_stack::{report, Result};
use serde::{Deserialize, Serialize};

use crate::backend::NotificationSink;
use crate::config::ClientConfig;
use crate::cost_model::CostModel;
use crate::level::VoltageLevel;
use crate::MmrmError;

/// Stable identifier of a clock source: a `(domain, local_id)` pair.
#[derive(
    Debug,
    Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[display("{domain}:{local_id}")]
#[serde(rename_all = "camelCase")]
pub struct ClockSourceId {
    pub domain: u32,
    pub local_id: u32,
}

impl ClockSourceId {
    pub const fn new(domain: u32, local_id: u32) -> Self {
        Self { domain, local_id }
    }

    /// Both halves combined into one lookup key.
    pub const fn key(self) -> u64 {
        ((self.domain as u64) << 32) | self.local_id as u64
    }
}

/// Urgency of a client's requests. Only `High` may throttle others.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// Whether a clock source may be registered more than once.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationPolicy {
    /// A second registration of the key fails.
    #[default]
    Exclusive,
    /// Registrations share one entry and are reference counted.
    Shared,
}

/// Everything a client supplies when it registers.
#[derive(Clone)]
pub struct ClientDescriptor {
    pub id: ClockSourceId,
    pub priority: Priority,
    pub user_data: u64,
    pub notifier: Option<Arc<dyn NotificationSink>>,
    pub policy: RegistrationPolicy,
}

impl ClientDescriptor {
    pub fn new(id: ClockSourceId) -> Self {
        Self {
            id,
            priority: Priority::default(),
            user_data: 0,
            notifier: None,
            policy: RegistrationPolicy::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_user_data(mut self, user_data: u64) -> Self {
        self.user_data = user_data;
        self
    }

    pub fn with_notifier(mut self, notifier: impl NotificationSink + 'static) -> Self {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    pub fn with_policy(mut self, policy: RegistrationPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl fmt::Debug for ClientDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientDescriptor")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("user_data", &self.user_data)
            .field("notifier", &self.notifier.is_some())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Opaque reference to a registered client.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("client#{index}/{uid}")]
pub struct ClientHandle {
    index: usize,
    uid: u64,
}

pub(crate) struct Registration {
    pub(crate) uid: u64,
    pub(crate) priority: Priority,
    pub(crate) policy: RegistrationPolicy,
    pub(crate) reference_count: u32,
    pub(crate) notifier: Option<Arc<dyn NotificationSink>>,
    pub(crate) user_data: u64,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("uid", &self.uid)
            .field("priority", &self.priority)
            .field("policy", &self.policy)
            .field("reference_count", &self.reference_count)
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

/// One clock source and its live state.
#[derive(Debug)]
pub struct ClientEntry {
    pub(crate) id: ClockSourceId,
    pub(crate) name: String,
    pub(crate) cost: CostModel,
    pub(crate) hw_blocks: Vec<u32>,
    pub(crate) registration: Option<Registration>,
    pub(crate) active_rate: u64,
    pub(crate) active_level: VoltageLevel,
    pub(crate) num_hw_blocks: u32,
    pub(crate) reserve_only: bool,
}

impl ClientEntry {
    pub fn new(config: &ClientConfig, cost: CostModel) -> Self {
        Self {
            id: config.id,
            name: config.name.clone(),
            cost,
            hw_blocks: config.hw_blocks.clone(),
            registration: None,
            active_rate: 0,
            active_level: VoltageLevel::LOWEST,
            num_hw_blocks: 0,
            reserve_only: false,
        }
    }

    pub fn id(&self) -> ClockSourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cost(&self) -> &CostModel {
        &self.cost
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.is_registered() && self.active_rate > 0
    }

    pub fn priority(&self) -> Priority {
        self.registration
            .as_ref()
            .map(|r| r.priority)
            .unwrap_or_default()
    }

    pub fn supports_hw_blocks(&self, count: u32) -> bool {
        self.hw_blocks.contains(&count)
    }

    /// Current drawn by this client while the rail runs at `column`.
    pub fn contribution_ma(&self, column: VoltageLevel) -> u64 {
        if !self.is_active() {
            return 0;
        }
        self.cost.current_ma(self.active_level, column) * u64::from(self.num_hw_blocks)
    }

    pub(crate) fn notifier(&self) -> Option<&Arc<dyn NotificationSink>> {
        self.registration.as_ref().and_then(|r| r.notifier.as_ref())
    }

    pub(crate) fn user_data(&self) -> u64 {
        self.registration.as_ref().map_or(0, |r| r.user_data)
    }

    fn reset(&mut self) {
        self.registration = None;
        self.active_rate = 0;
        self.active_level = VoltageLevel::LOWEST;
        self.num_hw_blocks = 0;
        self.reserve_only = false;
    }
}

/// Exclusive owner of every [`ClientEntry`].
#[derive(Debug)]
pub(crate) struct ClientTable {
    entries: Vec<ClientEntry>,
    by_id: HashMap<ClockSourceId, usize>,
    next_uid: u64,
}

impl ClientTable {
    pub(crate) fn new(entries: Vec<ClientEntry>) -> Self {
        let by_id = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.id, index))
            .collect();
        Self {
            entries,
            by_id,
            next_uid: 1,
        }
    }

    pub(crate) fn index_of(&self, id: ClockSourceId) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    pub(crate) fn register(&mut self, desc: ClientDescriptor) -> Result<ClientHandle, MmrmError> {
        let index = self
            .index_of(desc.id)
            .ok_or_else(|| {
                report!(MmrmError::UnknownClientKey).attach_printable(format!("client: {}", desc.id))
            })?;
        let entry = &mut self.entries[index];

        if let Some(existing) = entry.registration.as_mut() {
            let shareable = existing.policy == RegistrationPolicy::Shared
                && desc.policy == RegistrationPolicy::Shared;
            if !shareable {
                return Err(report!(MmrmError::NoFreeRegistrationSlot)
                    .attach_printable(format!("client: {}", desc.id))
                    .attach_printable(format!("existing policy: {}", existing.policy)));
            }
            existing.reference_count += 1;
            return Ok(ClientHandle {
                index,
                uid: existing.uid,
            });
        }

        let uid = self.next_uid;
        self.next_uid += 1;
        entry.registration = Some(Registration {
            uid,
            priority: desc.priority,
            policy: desc.policy,
            reference_count: 1,
            notifier: desc.notifier,
            user_data: desc.user_data,
        });
        Ok(ClientHandle { index, uid })
    }

    pub(crate) fn resolve(&self, handle: ClientHandle) -> Result<usize, MmrmError> {
        let live = self
            .entries
            .get(handle.index)
            .and_then(|entry| entry.registration.as_ref())
            .is_some_and(|r| r.uid == handle.uid);
        if live {
            Ok(handle.index)
        } else {
            Err(report!(MmrmError::InvalidHandle).attach_printable(format!("handle: {handle}")))
        }
    }

    /// Drops one reference; returns the remaining reference count.
    ///
    /// The entry returns to the unregistered state when the count reaches zero.
    pub(crate) fn release(&mut self, handle: ClientHandle) -> Result<u32, MmrmError> {
        let index = self.resolve(handle)?;
        let entry = &mut self.entries[index];
        let remaining = match entry.registration.as_mut() {
            Some(registration) => {
                registration.reference_count = registration.reference_count.saturating_sub(1);
                registration.reference_count
            }
            None => 0,
        };
        if remaining == 0 {
            entry.reset();
        }
        Ok(remaining)
    }

    pub(crate) fn entry(&self, index: usize) -> &ClientEntry {
        &self.entries[index]
    }

    pub(crate) fn entry_mut(&mut self, index: usize) -> &mut ClientEntry {
        &mut self.entries[index]
    }

    pub(crate) fn entries(&self) -> &[ClientEntry] {
        &self.entries
    }

    /// Active clients other than `skip`.
    pub(crate) fn others(&self, skip: usize) -> impl Iterator<Item = &ClientEntry> {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(index, entry)| *index != skip && entry.is_active())
            .map(|(_, entry)| entry)
    }

    /// Sum of every active contribution at `column`, leaving out `skip`.
    pub(crate) fn aggregate_at(&self, column: VoltageLevel, skip: Option<usize>) -> u64 {
        self.entries
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index) != skip)
            .map(|(_, entry)| entry.contribution_ma(column))
            .sum()
    }

    pub(crate) fn highest_active_level(&self) -> Option<VoltageLevel> {
        self.entries
            .iter()
            .filter(|entry| entry.is_active())
            .map(|entry| entry.active_level)
            .max()
    }
}
