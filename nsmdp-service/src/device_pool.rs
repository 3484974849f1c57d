// Copyright 2026 The nsmdp Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;

use nsmdp_error::{Code, Error, make_err};
use nsmdp_proto::v1beta1::Device;

/// Prefix of every generated slot id.
pub const SLOT_ID_PREFIX: &str = "slot-";

/// Health of a slot as reported to the node agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotHealth {
    Healthy,
    Unhealthy,
}

impl SlotHealth {
    /// Wire spelling used by the device plugin API.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "Healthy",
            Self::Unhealthy => "Unhealthy",
        }
    }
}

/// A virtual attachment point advertised as a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub id: String,
    pub health: SlotHealth,
    // Creation order, used to keep snapshots stable.
    seq: u64,
}

impl Slot {
    pub const fn seq(&self) -> u64 {
        self.seq
    }
}

impl From<&Slot> for Device {
    fn from(slot: &Slot) -> Self {
        Self {
            id: slot.id.clone(),
            health: slot.health.as_str().to_string(),
            topology: None,
        }
    }
}

/// In-memory model of available and allocated slots.
///
/// Every slot id lives in exactly one of the two maps. The pool only grows:
/// slots are created by [`DevicePool::top_up`] and never released.
#[derive(Debug)]
pub struct DevicePool {
    buffer_size: usize,
    next_seq: u64,
    available: HashMap<String, Slot>,
    allocated: HashMap<String, Slot>,
}

impl DevicePool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            next_seq: 0,
            available: HashMap::with_capacity(buffer_size),
            allocated: HashMap::new(),
        }
    }

    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Creates healthy slots with fresh sequential ids until at least
    /// `buffer_size` are available, then returns every slot in creation order.
    pub fn top_up(&mut self) -> Vec<Slot> {
        while self.available.len() < self.buffer_size {
            let seq = self.next_seq;
            self.next_seq += 1;
            let id = format!("{SLOT_ID_PREFIX}{seq}");
            self.available.insert(
                id.clone(),
                Slot {
                    id,
                    health: SlotHealth::Healthy,
                    seq,
                },
            );
        }
        self.snapshot()
    }

    /// Moves `id` from available to allocated. Returns `false` when the slot
    /// was already allocated, in which case nothing changes.
    pub fn allocate(&mut self, id: &str) -> Result<bool, Error> {
        if self.allocated.contains_key(id) {
            return Ok(false);
        }
        let slot = self
            .available
            .remove(id)
            .ok_or_else(|| make_err!(Code::NotFound, "Device id {id} not found"))?;
        self.allocated.insert(slot.id.clone(), slot);
        Ok(true)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.available.contains_key(id) || self.allocated.contains_key(id)
    }

    pub fn is_allocated(&self, id: &str) -> bool {
        self.allocated.contains_key(id)
    }

    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    pub fn allocated_len(&self) -> usize {
        self.allocated.len()
    }

    pub fn len(&self) -> usize {
        self.available.len() + self.allocated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of available slots in creation order.
    pub fn available_ids(&self) -> Vec<String> {
        sorted_ids(&self.available)
    }

    /// Ids of allocated slots in creation order.
    pub fn allocated_ids(&self) -> Vec<String> {
        sorted_ids(&self.allocated)
    }

    /// Every slot, available and allocated, in creation order.
    pub fn snapshot(&self) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self
            .available
            .values()
            .chain(self.allocated.values())
            .cloned()
            .collect();
        slots.sort_unstable_by_key(Slot::seq);
        slots
    }
}

fn sorted_ids(slots: &HashMap<String, Slot>) -> Vec<String> {
    let mut entries: Vec<&Slot> = slots.values().collect();
    entries.sort_unstable_by_key(|slot| slot.seq);
    entries.into_iter().map(|slot| slot.id.clone()).collect()
}
