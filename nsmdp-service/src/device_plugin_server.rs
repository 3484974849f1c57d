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

use core::pin::Pin;
use std::path::Path;
use std::sync::Arc;

use futures::Stream;
use futures::stream::unfold;
use nsmdp_config::device_plugin::DevicePluginConfig;
use nsmdp_error::{Code, Error, ResultExt, make_err};
use nsmdp_proto::v1beta1::device_plugin_server::{DevicePlugin, DevicePluginServer as Server};
use nsmdp_proto::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse,
    ContainerPreferredAllocationRequest, ContainerPreferredAllocationResponse, DevicePluginOptions,
    Empty, ListAndWatchResponse, PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse,
};
use nsmdp_util::fs_util::{clean_directory, create_dir_all};
use nsmdp_util::serial_executor::SerialExecutor;
use tonic::{Request, Response, Status};
use tracing::{Level, event, instrument};

use crate::device_pool::{DevicePool, Slot};
use crate::metrics::DevicePluginMetrics;
use crate::slot_resources::SlotLayout;
use crate::watch_broadcaster::{SubscriberId, WatchBroadcaster};

pub type ListAndWatchStream =
    Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send + 'static>>;

/// Everything mutated by the RPC handlers. Only ever touched from the
/// executor's worker.
#[derive(Debug)]
pub struct DevicePluginState {
    pub pool: DevicePool,
    pub watchers: WatchBroadcaster,
}

impl DevicePluginState {
    /// Refills the pool and pushes the resulting snapshot to every watcher.
    /// Returns the snapshot size.
    fn top_up_and_broadcast(&mut self) -> usize {
        let snapshot = to_list_and_watch_response(&self.pool.top_up());
        let delivered = self.watchers.broadcast(&snapshot);
        event!(
            Level::DEBUG,
            devices = snapshot.devices.len(),
            delivered,
            "Broadcast pool snapshot"
        );
        snapshot.devices.len()
    }
}

fn to_list_and_watch_response(slots: &[Slot]) -> ListAndWatchResponse {
    ListAndWatchResponse {
        devices: slots.iter().map(Into::into).collect(),
    }
}

/// Point-in-time view of the pool, mostly for tests and logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSummary {
    pub available: Vec<String>,
    pub allocated: Vec<String>,
    pub subscribers: usize,
}

/// Implements `v1beta1.DevicePlugin` on top of a [`DevicePool`].
///
/// Cloning is cheap and every clone shares the same pool, so the lifecycle
/// controller can hand a fresh clone to each server it starts while slot ids
/// stay stable across restarts.
#[derive(Debug, Clone)]
pub struct DevicePluginService {
    executor: SerialExecutor<DevicePluginState>,
    layout: SlotLayout,
    metrics: Arc<DevicePluginMetrics>,
}

impl DevicePluginService {
    /// Creates the service with an already topped-up pool. Must be called
    /// from within a tokio runtime.
    pub fn new(config: &DevicePluginConfig, metrics: Arc<DevicePluginMetrics>) -> Self {
        let identity_socket_dir = (!config.insecure).then(|| config.identity_socket_dir.clone());
        let mut pool = DevicePool::new(config.buffer_size);
        pool.top_up();
        Self {
            executor: SerialExecutor::new(DevicePluginState {
                pool,
                watchers: WatchBroadcaster::default(),
            }),
            layout: SlotLayout::new(&config.base_dir, identity_socket_dir),
            metrics,
        }
    }

    pub fn into_service(self) -> Server<Self> {
        Server::new(self)
    }

    pub const fn metrics(&self) -> &Arc<DevicePluginMetrics> {
        &self.metrics
    }

    pub const fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    pub async fn pool_summary(&self) -> Result<PoolSummary, Error> {
        self.executor
            .exec_and_wait(|state| PoolSummary {
                available: state.pool.available_ids(),
                allocated: state.pool.allocated_ids(),
                subscribers: state.watchers.len(),
            })
            .await
            .err_tip(|| "In DevicePluginService::pool_summary")
    }

    /// Ends every open `ListAndWatch` stream. Returns how many were closed.
    pub async fn close_subscribers(&self) -> Result<usize, Error> {
        self.executor
            .exec_and_wait(|state| state.watchers.close_all())
            .await
            .err_tip(|| "In DevicePluginService::close_subscribers")
    }

    async fn top_up_and_broadcast(&self) -> Result<usize, Error> {
        let devices = self
            .executor
            .exec_and_wait(DevicePluginState::top_up_and_broadcast)
            .await
            .err_tip(|| "While topping up the device pool")?;
        self.metrics.broadcasts.inc();
        Ok(devices)
    }

    async fn ensure_known(&self, id: &str) -> Result<(), Error> {
        let slot_id = id.to_string();
        let known = self
            .executor
            .exec_and_wait(move |state| state.pool.contains(&slot_id))
            .await?;
        if !known {
            self.metrics.unknown_slot_failures.inc();
            return Err(make_err!(Code::NotFound, "Device id {id} not found"));
        }
        Ok(())
    }

    /// Clears whatever a previous workload left in the slot's host directory
    /// and makes sure the directory exists. Failures are only counted.
    async fn prepare_slot_dir(&self, id: &str) {
        let dir = self.layout.host_slot_dir(id);
        let dir = Path::new(&dir);
        let failures = clean_directory(dir).await;
        if failures > 0 {
            self.metrics
                .cleanup_failures
                .add(u64::try_from(failures).unwrap_or(u64::MAX));
        }
        if let Err(err) = create_dir_all(dir).await {
            event!(Level::WARN, ?err, ?dir, "Failed to create slot directory");
            self.metrics.cleanup_failures.inc();
        }
    }

    fn mark_allocated(&self, id: &str) -> Result<(), Error> {
        let slot_id = id.to_string();
        let metrics = self.metrics.clone();
        self.executor.exec(move |state| match state.pool.allocate(&slot_id) {
            Ok(true) => metrics.allocated_slots.inc(),
            Ok(false) => event!(Level::DEBUG, %slot_id, "Slot was already allocated"),
            Err(err) => event!(Level::ERROR, ?err, %slot_id, "Failed to mark slot allocated"),
        })
    }

    /// Provisions every requested slot in order. Stops at the first unknown
    /// id; slots marked before it stay allocated. `marked` counts how many
    /// slots were handed to the pool.
    async fn allocate_all(
        &self,
        request: &AllocateRequest,
        marked: &mut usize,
    ) -> Result<Vec<ContainerAllocateResponse>, Error> {
        let mut container_responses = Vec::with_capacity(request.container_requests.len());
        for container_request in &request.container_requests {
            let mut container_response: Option<ContainerAllocateResponse> = None;
            for id in &container_request.devices_ids {
                self.ensure_known(id).await?;
                self.prepare_slot_dir(id).await;
                match container_response.as_mut() {
                    None => container_response = Some(self.layout.container_response(id)),
                    Some(response) => response.mounts.push(self.layout.slot_mount(id)),
                }
                self.mark_allocated(id)?;
                *marked += 1;
            }
            container_responses.push(container_response.unwrap_or_default());
        }
        Ok(container_responses)
    }

    async fn inner_list_and_watch(&self) -> Result<Response<ListAndWatchStream>, Error> {
        let (id, rx) = self
            .executor
            .exec_and_wait(|state| {
                let initial = to_list_and_watch_response(&state.pool.snapshot());
                state.watchers.subscribe(initial)
            })
            .await
            .err_tip(|| "While subscribing to pool updates")?;
        self.metrics.subscribers_opened.inc();
        let guard = SubscriberGuard {
            id,
            executor: self.executor.clone(),
            metrics: self.metrics.clone(),
        };

        Ok(Response::new(Box::pin(unfold(
            (rx, guard),
            move |(mut rx, guard)| async move {
                if let Some(snapshot) = rx.recv().await {
                    return Some((Ok(snapshot), (rx, guard)));
                }
                event!(
                    Level::DEBUG,
                    subscriber = guard.id,
                    "Pool update channel was closed, ending ListAndWatch stream",
                );
                None
            },
        ))))
    }

    async fn inner_allocate(
        &self,
        request: AllocateRequest,
    ) -> Result<Response<AllocateResponse>, Error> {
        self.metrics.allocate_calls.inc();
        let mut marked = 0;
        let result = self.allocate_all(&request, &mut marked).await;
        if marked > 0 {
            // Runs after the batch's marks, so the snapshot already includes them.
            self.top_up_and_broadcast().await?;
        }
        let container_responses = result.err_tip(|| "In DevicePluginService::inner_allocate")?;
        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    fn inner_get_preferred_allocation(
        request: PreferredAllocationRequest,
    ) -> Response<PreferredAllocationResponse> {
        Response::new(PreferredAllocationResponse {
            container_responses: request
                .container_requests
                .into_iter()
                .map(preferred_allocation)
                .collect(),
        })
    }
}

/// Must-include ids first, then available ids in the order given, capped at
/// the requested size. Must-include ids are never dropped.
fn preferred_allocation(
    request: ContainerPreferredAllocationRequest,
) -> ContainerPreferredAllocationResponse {
    let size = usize::try_from(request.allocation_size).unwrap_or(0);
    let mut device_ids: Vec<String> = Vec::with_capacity(size);
    for id in request.must_include_device_ids {
        if !device_ids.contains(&id) {
            device_ids.push(id);
        }
    }
    for id in request.available_device_ids {
        if device_ids.len() >= size {
            break;
        }
        if !device_ids.contains(&id) {
            device_ids.push(id);
        }
    }
    ContainerPreferredAllocationResponse { device_ids }
}

/// Removes its subscriber from the broadcaster when the stream is dropped.
#[derive(Debug)]
struct SubscriberGuard {
    id: SubscriberId,
    executor: SerialExecutor<DevicePluginState>,
    metrics: Arc<DevicePluginMetrics>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let id = self.id;
        let unsubscribe = self.executor.exec(move |state| {
            state.watchers.unsubscribe(id);
        });
        if let Err(err) = unsubscribe {
            // Executor is gone during teardown, nothing left to clean.
            event!(Level::DEBUG, ?err, subscriber = id, "Skipping unsubscribe");
        }
        self.metrics.subscribers_closed.inc();
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    type ListAndWatchStream = ListAndWatchStream;

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(
        err,
        ret(level = Level::DEBUG),
        level = Level::DEBUG,
        skip_all,
    )]
    async fn get_device_plugin_options(
        &self,
        _grpc_request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(DevicePluginOptions::default()))
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(err, level = Level::ERROR, skip_all)]
    async fn list_and_watch(
        &self,
        _grpc_request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        let resp = self.inner_list_and_watch().await.map_err(Into::into);
        if resp.is_ok() {
            event!(Level::DEBUG, return = "Ok(<stream>)");
        }
        resp
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(
        err,
        ret(level = Level::DEBUG),
        level = Level::INFO,
        skip_all,
        fields(request = ?grpc_request.get_ref())
    )]
    async fn get_preferred_allocation(
        &self,
        grpc_request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        Ok(Self::inner_get_preferred_allocation(grpc_request.into_inner()))
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(
        err,
        ret(level = Level::INFO),
        level = Level::ERROR,
        skip_all,
        fields(request = ?grpc_request.get_ref())
    )]
    async fn allocate(
        &self,
        grpc_request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        self.inner_allocate(grpc_request.into_inner())
            .await
            .map_err(Into::into)
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(
        err,
        ret(level = Level::DEBUG),
        level = Level::DEBUG,
        skip_all,
    )]
    async fn pre_start_container(
        &self,
        _grpc_request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
