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

use core::time::Duration;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod utils {
    pub(crate) mod mock_kubelet;
    pub(crate) mod mock_registration_client;
}

use futures::StreamExt;
use nsmdp_config::device_plugin::DevicePluginConfig;
use nsmdp_error::{Code, Error, ResultExt, make_err};
use nsmdp_macro::nsmdp_test;
use nsmdp_proto::v1beta1::device_plugin_client::DevicePluginClient;
use nsmdp_proto::v1beta1::registration_client::RegistrationClient;
use nsmdp_proto::v1beta1::registration_server::RegistrationServer;
use nsmdp_proto::v1beta1::{
    AllocateRequest, ContainerAllocateRequest, DevicePluginOptions, Empty, RegisterRequest,
};
use nsmdp_service::device_plugin_server::DevicePluginService;
use nsmdp_service::lifecycle::{
    LifecycleController, LifecycleEvent, LifecycleState, ServableComponent,
    watch_registration_socket,
};
use nsmdp_service::metrics::DevicePluginMetrics;
use nsmdp_service::registration_client::DEVICE_PLUGIN_API_VERSION;
use nsmdp_util::fs_util::create_dir_all;
use nsmdp_util::spawn;
use nsmdp_util::unix_socket::connect_unix_channel;
use pretty_assertions::assert_eq;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tonic::service::RoutesBuilder;
use tonic::transport::Channel;
use tonic::{Response, Status};
use utils::mock_kubelet::{MockKubelet, MockKubeletServer};
use utils::mock_registration_client::MockRegistrationClient;

const PLUGIN_SOCKET: &str = "nsmdp-test.sock";
const KUBELET_SOCKET: &str = "kubelet.sock";
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Get temporary path from either `TEST_TMPDIR` or best effort temp directory if
/// not set.
fn make_temp_path(data: &str) -> PathBuf {
    PathBuf::from(format!(
        "{}/{}/{}",
        env::var("TEST_TMPDIR").unwrap_or_else(|_| env::temp_dir().to_str().unwrap().to_string()),
        rand::rng().random::<u64>(),
        data
    ))
}

fn make_config(plugin_dir: &Path) -> DevicePluginConfig {
    DevicePluginConfig {
        name: "lifecycle-test".to_string(),
        base_dir: plugin_dir.join("nsm-base").to_string_lossy().to_string(),
        insecure: true,
        buffer_size: 3,
        listen_endpoint: plugin_dir.join(PLUGIN_SOCKET).to_string_lossy().to_string(),
        registration_socket: plugin_dir.join(KUBELET_SOCKET).to_string_lossy().to_string(),
        plugin_dir: plugin_dir.to_string_lossy().to_string(),
        registration_timeout_ms: 2000,
        restart_delay_ms: 10,
        ..DevicePluginConfig::default()
    }
}

fn make_mock_controller(
    config: &DevicePluginConfig,
    client: &MockRegistrationClient,
) -> (LifecycleController<MockRegistrationClient>, Arc<DevicePluginMetrics>) {
    let metrics = Arc::new(DevicePluginMetrics::default());
    let service = DevicePluginService::new(config, metrics.clone());
    let client = client.clone();
    let controller = LifecycleController::new_with_connection_factory_and_sleep_fn(
        config,
        service,
        Box::new(move || {
            let client = client.clone();
            Box::pin(async move { Ok(client) })
        }),
        Box::new(move |_| Box::pin(async move { /* No sleep */ })),
    );
    (controller, metrics)
}

async fn wait_for_state(
    state: &mut watch::Receiver<LifecycleState>,
    expected: LifecycleState,
) -> Result<(), Error> {
    tokio::time::timeout(WAIT_TIMEOUT, state.wait_for(|s| *s == expected))
        .await?
        .map_err(|e| make_err!(Code::Internal, "State channel closed: {e}"))?;
    Ok(())
}

async fn dial_plugin(config: &DevicePluginConfig) -> Result<DevicePluginClient<Channel>, Error> {
    let channel = connect_unix_channel(Path::new(&config.listen_endpoint), WAIT_TIMEOUT).await?;
    Ok(DevicePluginClient::new(channel))
}

#[nsmdp_test]
async fn registers_once_per_restart_event() -> Result<(), Error> {
    let plugin_dir = make_temp_path("plugins");
    create_dir_all(&plugin_dir).await?;
    let config = make_config(&plugin_dir);
    let client = MockRegistrationClient::new();
    let (controller, metrics) = make_mock_controller(&config, &client);
    let mut state = controller.watch_state();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let run = spawn!("lifecycle_test_run", controller.run(events_rx));

    let request = client.expect_register(Ok(Response::new(Empty {}))).await;
    assert_eq!(
        request,
        RegisterRequest {
            version: DEVICE_PLUGIN_API_VERSION.to_string(),
            endpoint: PLUGIN_SOCKET.to_string(),
            resource_name: "networkservicemesh.io/socket".to_string(),
            options: Some(DevicePluginOptions::default()),
        }
    );
    wait_for_state(&mut state, LifecycleState::Registered).await?;

    events_tx
        .send(LifecycleEvent::RegistrationSocketCreated)
        .map_err(|_| make_err!(Code::Internal, "Controller stopped early"))?;
    let request = client.expect_register(Ok(Response::new(Empty {}))).await;
    assert_eq!(request.endpoint, PLUGIN_SOCKET);
    wait_for_state(&mut state, LifecycleState::Registered).await?;

    // The listener was rebuilt and serves again.
    let options = dial_plugin(&config)
        .await?
        .get_device_plugin_options(Empty {})
        .await?
        .into_inner();
    assert_eq!(options, DevicePluginOptions::default());

    events_tx
        .send(LifecycleEvent::Shutdown)
        .map_err(|_| make_err!(Code::Internal, "Controller stopped early"))?;
    tokio::time::timeout(WAIT_TIMEOUT, run).await???;

    assert!(!client.has_pending_register().await);
    assert_eq!(metrics.registrations.get(), 2);
    assert_eq!(metrics.restarts.get(), 1);
    assert_eq!(metrics.registration_failures.get(), 0);
    Ok(())
}

#[nsmdp_test]
async fn reload_signal_restarts() -> Result<(), Error> {
    let plugin_dir = make_temp_path("plugins");
    create_dir_all(&plugin_dir).await?;
    let config = make_config(&plugin_dir);
    let client = MockRegistrationClient::new();
    let (controller, metrics) = make_mock_controller(&config, &client);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let run = spawn!("lifecycle_test_run", controller.run(events_rx));

    client.expect_register(Ok(Response::new(Empty {}))).await;
    events_tx
        .send(LifecycleEvent::Reload)
        .map_err(|_| make_err!(Code::Internal, "Controller stopped early"))?;
    client.expect_register(Ok(Response::new(Empty {}))).await;

    drop(events_tx);
    tokio::time::timeout(WAIT_TIMEOUT, run).await???;
    assert_eq!(metrics.restarts.get(), 1);
    assert_eq!(metrics.registrations.get(), 2);
    Ok(())
}

#[nsmdp_test]
async fn registration_failure_is_retried() -> Result<(), Error> {
    let plugin_dir = make_temp_path("plugins");
    create_dir_all(&plugin_dir).await?;
    let config = make_config(&plugin_dir);
    let client = MockRegistrationClient::new();
    let (controller, metrics) = make_mock_controller(&config, &client);
    let mut state = controller.watch_state();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let run = spawn!("lifecycle_test_run", controller.run(events_rx));

    client
        .expect_register(Err(Status::unavailable("kubelet restarting")))
        .await;
    client.expect_register(Ok(Response::new(Empty {}))).await;
    wait_for_state(&mut state, LifecycleState::Registered).await?;

    assert_eq!(metrics.registration_failures.get(), 1);
    assert_eq!(metrics.registrations.get(), 1);

    events_tx
        .send(LifecycleEvent::Shutdown)
        .map_err(|_| make_err!(Code::Internal, "Controller stopped early"))?;
    tokio::time::timeout(WAIT_TIMEOUT, run).await???;
    Ok(())
}

#[nsmdp_test]
async fn shutdown_while_retrying_stops_the_loop() -> Result<(), Error> {
    let plugin_dir = make_temp_path("plugins");
    create_dir_all(&plugin_dir).await?;
    let config = make_config(&plugin_dir);
    let client = MockRegistrationClient::new();
    let metrics = Arc::new(DevicePluginMetrics::default());
    let service = DevicePluginService::new(&config, metrics.clone());
    let factory_client = client.clone();
    let controller = LifecycleController::new_with_connection_factory_and_sleep_fn(
        &config,
        service,
        Box::new(move || {
            let client = factory_client.clone();
            Box::pin(async move { Ok(client) })
        }),
        // Never wakes up, only an event can end the retry wait.
        Box::new(move |_| Box::pin(futures::future::pending())),
    );
    let mut state = controller.watch_state();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let run = spawn!("lifecycle_test_run", controller.run(events_rx));

    client
        .expect_register(Err(Status::unavailable("kubelet restarting")))
        .await;
    wait_for_state(&mut state, LifecycleState::Restarting).await?;
    events_tx
        .send(LifecycleEvent::Shutdown)
        .map_err(|_| make_err!(Code::Internal, "Controller stopped early"))?;
    tokio::time::timeout(WAIT_TIMEOUT, run).await???;

    assert_eq!(*state.borrow(), LifecycleState::Stopped);
    assert_eq!(metrics.registrations.get(), 0);
    Ok(())
}

#[nsmdp_test]
async fn watcher_reports_registration_socket_creation() -> Result<(), Error> {
    let plugin_dir = make_temp_path("plugins");
    create_dir_all(&plugin_dir).await?;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let _watcher =
        watch_registration_socket(&plugin_dir, &plugin_dir.join(KUBELET_SOCKET), events_tx)?;

    tokio::fs::write(plugin_dir.join("other-plugin.sock"), b"").await?;
    tokio::fs::write(plugin_dir.join(KUBELET_SOCKET), b"").await?;

    let event = tokio::time::timeout(WAIT_TIMEOUT, events_rx.recv())
        .await?
        .err_tip(|| "Watcher stopped")?;
    assert_eq!(event, LifecycleEvent::RegistrationSocketCreated);
    Ok(())
}

#[nsmdp_test]
async fn end_to_end_with_mock_kubelet() -> Result<(), Error> {
    let plugin_dir = make_temp_path("plugins");
    create_dir_all(&plugin_dir).await?;
    let config = make_config(&plugin_dir);
    let mut kubelet = MockKubeletServer::start(&plugin_dir, KUBELET_SOCKET)?;

    let metrics = Arc::new(DevicePluginMetrics::default());
    let service = DevicePluginService::new(&config, metrics.clone());
    let controller = LifecycleController::new(&config, service);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let _watcher = watch_registration_socket(
        Path::new(&config.plugin_dir),
        Path::new(&config.registration_socket),
        events_tx.clone(),
    )?;
    let run = spawn!("lifecycle_test_run", controller.run(events_rx));

    let (request, mut plugin) = kubelet.accept_registration().await?;
    assert_eq!(request.endpoint, PLUGIN_SOCKET);
    assert_eq!(request.version, "v1beta1");

    let mut stream = plugin.list_and_watch(Empty {}).await?.into_inner();
    let initial = stream
        .next()
        .await
        .err_tip(|| "ListAndWatch ended early")??;
    assert_eq!(initial.devices.len(), 3);

    plugin
        .allocate(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: vec![initial.devices[0].id.clone()],
            }],
        })
        .await?;
    let update = stream
        .next()
        .await
        .err_tip(|| "ListAndWatch ended early")??;
    assert_eq!(update.devices.len(), 4);

    events_tx
        .send(LifecycleEvent::Shutdown)
        .map_err(|_| make_err!(Code::Internal, "Controller stopped early"))?;
    tokio::time::timeout(WAIT_TIMEOUT, run).await???;

    // Server stop ends the stream.
    let tail = tokio::time::timeout(WAIT_TIMEOUT, stream.next()).await?;
    assert!(!matches!(tail, Some(Ok(_))));
    assert_eq!(metrics.registrations.get(), 1);
    Ok(())
}

#[derive(Debug)]
struct RegistrationComponent {
    kubelet: MockKubelet,
}

impl ServableComponent for RegistrationComponent {
    fn register(&self, routes: &mut RoutesBuilder) {
        routes.add_service(RegistrationServer::new(self.kubelet.clone()));
    }
}

#[nsmdp_test]
async fn extra_components_are_served_on_plugin_socket() -> Result<(), Error> {
    let plugin_dir = make_temp_path("plugins");
    create_dir_all(&plugin_dir).await?;
    let config = make_config(&plugin_dir);
    let client = MockRegistrationClient::new();
    let (mut controller, _metrics) = make_mock_controller(&config, &client);
    let (kubelet, mut component_requests) = MockKubelet::new();
    controller.add_component(Arc::new(RegistrationComponent { kubelet }));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let run = spawn!("lifecycle_test_run", controller.run(events_rx));

    client.expect_register(Ok(Response::new(Empty {}))).await;

    let channel = connect_unix_channel(Path::new(&config.listen_endpoint), WAIT_TIMEOUT).await?;
    RegistrationClient::new(channel)
        .register(RegisterRequest {
            version: "v1beta1".to_string(),
            endpoint: "component.sock".to_string(),
            resource_name: "example.com/component".to_string(),
            options: None,
        })
        .await?;
    let received = component_requests
        .recv()
        .await
        .err_tip(|| "Component did not receive the call")?;
    assert_eq!(received.endpoint, "component.sock");

    events_tx
        .send(LifecycleEvent::Shutdown)
        .map_err(|_| make_err!(Code::Internal, "Controller stopped early"))?;
    tokio::time::timeout(WAIT_TIMEOUT, run).await???;
    Ok(())
}
