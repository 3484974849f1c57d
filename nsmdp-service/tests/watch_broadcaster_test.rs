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

use nsmdp_proto::v1beta1::{Device, ListAndWatchResponse};
use nsmdp_service::watch_broadcaster::WatchBroadcaster;
use pretty_assertions::assert_eq;

fn snapshot(size: usize) -> ListAndWatchResponse {
    ListAndWatchResponse {
        devices: (0..size)
            .map(|n| Device {
                id: format!("slot-{n}"),
                health: "Healthy".to_string(),
                topology: None,
            })
            .collect(),
    }
}

#[test]
fn initial_snapshot_goes_to_new_subscriber_only() {
    let mut broadcaster = WatchBroadcaster::default();
    let (_, mut first) = broadcaster.subscribe(snapshot(1));
    let (_, mut second) = broadcaster.subscribe(snapshot(2));

    assert_eq!(first.try_recv().unwrap(), snapshot(1));
    assert!(first.try_recv().is_err());
    assert_eq!(second.try_recv().unwrap(), snapshot(2));
    assert_eq!(broadcaster.len(), 2);
}

#[test]
fn broadcast_reaches_every_subscriber() {
    let mut broadcaster = WatchBroadcaster::default();
    let mut receivers: Vec<_> = (0..4)
        .map(|_| broadcaster.subscribe(snapshot(1)).1)
        .collect();

    assert_eq!(broadcaster.broadcast(&snapshot(3)), 4);

    for rx in &mut receivers {
        assert_eq!(rx.try_recv().unwrap(), snapshot(1));
        assert_eq!(rx.try_recv().unwrap(), snapshot(3));
        assert!(rx.try_recv().is_err());
    }
}

#[test]
fn broadcast_tolerates_gone_subscribers() {
    let mut broadcaster = WatchBroadcaster::default();
    let (_, gone) = broadcaster.subscribe(snapshot(1));
    let (_, mut alive) = broadcaster.subscribe(snapshot(1));
    drop(gone);

    assert_eq!(broadcaster.broadcast(&snapshot(2)), 1);
    assert_eq!(alive.try_recv().unwrap(), snapshot(1));
    assert_eq!(alive.try_recv().unwrap(), snapshot(2));
}

#[test]
fn unsubscribe_stops_delivery() {
    let mut broadcaster = WatchBroadcaster::default();
    let (id, mut rx) = broadcaster.subscribe(snapshot(1));

    assert!(broadcaster.unsubscribe(id));
    assert!(!broadcaster.unsubscribe(id));
    assert_eq!(broadcaster.broadcast(&snapshot(2)), 0);

    assert_eq!(rx.try_recv().unwrap(), snapshot(1));
    assert!(rx.try_recv().is_err());
    assert!(broadcaster.is_empty());
}

#[test]
fn close_all_ends_streams() {
    let mut broadcaster = WatchBroadcaster::default();
    let (_, mut rx) = broadcaster.subscribe(snapshot(1));
    broadcaster.broadcast(&snapshot(2));

    assert_eq!(broadcaster.close_all(), 1);

    assert_eq!(rx.try_recv().unwrap(), snapshot(1));
    assert_eq!(rx.try_recv().unwrap(), snapshot(2));
    assert_eq!(
        rx.try_recv(),
        Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
    );
}
