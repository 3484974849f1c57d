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

use nsmdp_proto::v1beta1::ListAndWatchResponse;
use tokio::sync::mpsc;

pub type SubscriberId = u64;

/// Open `ListAndWatch` calls and the channels feeding them.
///
/// Each subscriber gets its own unbounded channel, so a slow reader never
/// holds up the others. A send to a subscriber whose stream has already gone
/// away is ignored; the stream removes itself when it is dropped.
#[derive(Debug, Default)]
pub struct WatchBroadcaster {
    next_id: SubscriberId,
    subscribers: HashMap<SubscriberId, mpsc::UnboundedSender<ListAndWatchResponse>>,
}

impl WatchBroadcaster {
    /// Adds a subscriber and queues `initial` for it alone.
    pub fn subscribe(
        &mut self,
        initial: ListAndWatchResponse,
    ) -> (SubscriberId, mpsc::UnboundedReceiver<ListAndWatchResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        // `rx` is still held here, so the send cannot fail.
        drop(tx.send(initial));
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Queues `snapshot` for every subscriber. Returns how many accepted it.
    pub fn broadcast(&self, snapshot: &ListAndWatchResponse) -> usize {
        self.subscribers
            .values()
            .filter(|tx| tx.send(snapshot.clone()).is_ok())
            .count()
    }

    /// Drops every subscriber channel, which ends their streams once drained.
    pub fn close_all(&mut self) -> usize {
        let closed = self.subscribers.len();
        self.subscribers.clear();
        closed
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
