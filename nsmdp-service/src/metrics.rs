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

use nsmdp_util::metrics_utils::Counter;
use tracing::{Level, event};

/// Counters shared between the RPC handlers and the lifecycle controller.
#[derive(Debug, Default)]
pub struct DevicePluginMetrics {
    /// Allocate calls received.
    pub allocate_calls: Counter,
    /// Slot ids marked allocated.
    pub allocated_slots: Counter,
    /// Allocate calls rejected because of an unknown slot id.
    pub unknown_slot_failures: Counter,
    /// Slot directory entries that could not be cleaned.
    pub cleanup_failures: Counter,
    /// Snapshots pushed after a top-up.
    pub broadcasts: Counter,
    pub subscribers_opened: Counter,
    pub subscribers_closed: Counter,
    /// Successful registrations with the node agent.
    pub registrations: Counter,
    pub registration_failures: Counter,
    /// Restarts of the plugin server, not counting the first start.
    pub restarts: Counter,
}

impl DevicePluginMetrics {
    pub fn log_summary(&self) {
        event!(
            Level::INFO,
            allocate_calls = self.allocate_calls.get(),
            allocated_slots = self.allocated_slots.get(),
            unknown_slot_failures = self.unknown_slot_failures.get(),
            cleanup_failures = self.cleanup_failures.get(),
            broadcasts = self.broadcasts.get(),
            subscribers_opened = self.subscribers_opened.get(),
            subscribers_closed = self.subscribers_closed.get(),
            registrations = self.registrations.get(),
            registration_failures = self.registration_failures.get(),
            restarts = self.restarts.get(),
            "Device plugin metrics"
        );
    }
}
