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
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use nsmdp_config::device_plugin::DevicePluginConfig;
use nsmdp_error::{Code, Error, ResultExt, make_err};
use nsmdp_util::spawn;
use nsmdp_util::task::JoinHandleDropGuard;
use nsmdp_util::unix_socket::bind_unix_listener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, oneshot, watch};
use tonic::service::RoutesBuilder;
use tonic::transport::Server;
use tracing::{Level, event};

use crate::device_plugin_server::DevicePluginService;
use crate::registration_client::{
    RegistrationClientTrait, RegistrationClientWrapper, connect_registration_client,
    make_register_request, register,
};

/// How long a stopping server may take to drain before it is aborted.
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A gRPC component that wants to be served on the plugin's socket next to
/// the device plugin API.
pub trait ServableComponent: Send + Sync {
    fn register(&self, routes: &mut RoutesBuilder);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    /// Serving on the listen endpoint, not yet registered.
    Listening,
    Registered,
    /// Waiting to start again after a trigger or a failed start.
    Restarting,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The node agent recreated its registration socket.
    RegistrationSocketCreated,
    /// Operator asked for a reload (SIGHUP).
    Reload,
    Shutdown,
}

pub type RegistrationClientFactory<T> =
    Box<dyn Fn() -> BoxFuture<'static, Result<T, Error>> + Send + Sync>;

pub type SleepFn = Box<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

struct RunningServer {
    shutdown_tx: oneshot::Sender<()>,
    server: JoinHandleDropGuard<Result<(), Error>>,
}

/// Owns the serve/register/restart loop of the device plugin.
///
/// Start removes a stale socket, binds the listen endpoint, serves the device
/// plugin API in the background and registers with the node agent. Every
/// restart event tears the server down and runs start again; failed starts
/// are retried after `restart_delay`. Restarts never overlap because only
/// [`LifecycleController::run`] drives them.
pub struct LifecycleController<T: RegistrationClientTrait + 'static> {
    listen_endpoint: PathBuf,
    resource_name: String,
    registration_timeout: Duration,
    restart_delay: Duration,
    service: DevicePluginService,
    components: Vec<Arc<dyn ServableComponent>>,
    connection_factory: RegistrationClientFactory<T>,
    sleep_fn: SleepFn,
    state_tx: watch::Sender<LifecycleState>,
    running: Option<RunningServer>,
}

impl<T: RegistrationClientTrait + 'static> core::fmt::Debug for LifecycleController<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("listen_endpoint", &self.listen_endpoint)
            .field("resource_name", &self.resource_name)
            .field("state", &*self.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl LifecycleController<RegistrationClientWrapper> {
    pub fn new(config: &DevicePluginConfig, service: DevicePluginService) -> Self {
        let registration_socket = PathBuf::from(&config.registration_socket);
        let timeout = config.registration_timeout();
        Self::new_with_connection_factory_and_sleep_fn(
            config,
            service,
            Box::new(move || {
                let registration_socket = registration_socket.clone();
                Box::pin(async move {
                    connect_registration_client(&registration_socket, timeout).await
                })
            }),
            Box::new(|duration| Box::pin(tokio::time::sleep(duration))),
        )
    }
}

impl<T: RegistrationClientTrait + 'static> LifecycleController<T> {
    pub fn new_with_connection_factory_and_sleep_fn(
        config: &DevicePluginConfig,
        service: DevicePluginService,
        connection_factory: RegistrationClientFactory<T>,
        sleep_fn: SleepFn,
    ) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Stopped);
        Self {
            listen_endpoint: PathBuf::from(&config.listen_endpoint),
            resource_name: config.resource_name.clone(),
            registration_timeout: config.registration_timeout(),
            restart_delay: config.restart_delay(),
            service,
            components: Vec::new(),
            connection_factory,
            sleep_fn,
            state_tx,
            running: None,
        }
    }

    /// Serves `component` on the plugin's socket from the next start on.
    pub fn add_component(&mut self, component: Arc<dyn ServableComponent>) {
        self.components.push(component);
    }

    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            event!(Level::DEBUG, ?previous, ?state, "Lifecycle state changed");
        }
    }

    /// Runs until a [`LifecycleEvent::Shutdown`] arrives or every event
    /// sender is gone, then stops the server.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
    ) -> Result<(), Error> {
        let metrics = self.service.metrics().clone();
        let mut first_start = true;
        loop {
            if !first_start {
                metrics.restarts.inc();
            }
            first_start = false;
            self.stop().await;

            if let Err(err) = self.start().await {
                event!(
                    Level::ERROR,
                    ?err,
                    delay = ?self.restart_delay,
                    "Failed to start device plugin, retrying"
                );
                self.set_state(LifecycleState::Restarting);
                tokio::select! {
                    () = (self.sleep_fn)(self.restart_delay) => continue,
                    lifecycle_event = events.recv() => match lifecycle_event {
                        Some(LifecycleEvent::Shutdown) | None => break,
                        Some(lifecycle_event) => {
                            event!(Level::INFO, ?lifecycle_event, "Restarting device plugin");
                            continue;
                        }
                    },
                }
            }

            match events.recv().await {
                Some(LifecycleEvent::Shutdown) | None => break,
                Some(lifecycle_event) => {
                    event!(Level::INFO, ?lifecycle_event, "Restarting device plugin");
                    self.set_state(LifecycleState::Restarting);
                }
            }
        }

        event!(Level::INFO, "Shutting down device plugin");
        self.set_state(LifecycleState::ShuttingDown);
        self.stop().await;
        self.set_state(LifecycleState::Stopped);
        metrics.log_summary();
        Ok(())
    }

    async fn start(&mut self) -> Result<(), Error> {
        let incoming = bind_unix_listener(&self.listen_endpoint)
            .err_tip(|| "While starting the device plugin server")?;

        let mut routes = RoutesBuilder::default();
        routes.add_service(self.service.clone().into_service());
        for component in &self.components {
            component.register(&mut routes);
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let listen_endpoint = self.listen_endpoint.clone();
        let server = spawn!("device_plugin_server", async move {
            Server::builder()
                .add_routes(routes.routes())
                .serve_with_incoming_shutdown(incoming, async move {
                    if shutdown_rx.await.is_err() {
                        event!(Level::DEBUG, "Shutdown sender dropped, stopping server");
                    }
                })
                .await
                .err_tip(|| {
                    format!(
                        "Device plugin server on {} failed",
                        listen_endpoint.display()
                    )
                })
        });
        self.running = Some(RunningServer {
            shutdown_tx,
            server,
        });
        self.set_state(LifecycleState::Listening);
        event!(
            Level::INFO,
            listen_endpoint = ?self.listen_endpoint,
            "Device plugin listening"
        );

        let metrics = self.service.metrics().clone();
        match self.register().await {
            Ok(()) => metrics.registrations.inc(),
            Err(err) => {
                metrics.registration_failures.inc();
                return Err(err);
            }
        }
        self.set_state(LifecycleState::Registered);
        Ok(())
    }

    async fn register(&self) -> Result<(), Error> {
        let mut client = (self.connection_factory)()
            .await
            .err_tip(|| "While connecting to the node agent")?;
        let request = make_register_request(&self.listen_endpoint, &self.resource_name)?;
        register(&mut client, request, self.registration_timeout).await
    }

    async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        if running.shutdown_tx.send(()).is_err() {
            event!(Level::DEBUG, "Device plugin server already exited");
        }
        match self.service.close_subscribers().await {
            Ok(closed) => event!(Level::DEBUG, closed, "Closed ListAndWatch streams"),
            Err(err) => event!(Level::WARN, ?err, "Failed to close ListAndWatch streams"),
        }
        match tokio::time::timeout(SERVER_STOP_TIMEOUT, running.server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => event!(Level::WARN, ?err, "Device plugin server failed"),
            Ok(Err(err)) => event!(Level::WARN, ?err, "Device plugin server task failed"),
            Err(_) => event!(
                Level::WARN,
                timeout = ?SERVER_STOP_TIMEOUT,
                "Device plugin server did not stop in time, aborting"
            ),
        }
        self.set_state(LifecycleState::Stopped);
    }
}

/// Watches `plugin_dir` and sends [`LifecycleEvent::RegistrationSocketCreated`]
/// whenever a file named like `registration_socket` is created in it.
///
/// The watcher stops when the returned handle is dropped. Watch errors are
/// logged and otherwise ignored.
pub fn watch_registration_socket(
    plugin_dir: &Path,
    registration_socket: &Path,
    events: mpsc::UnboundedSender<LifecycleEvent>,
) -> Result<RecommendedWatcher, Error> {
    let socket_name = registration_socket
        .file_name()
        .map(ToOwned::to_owned)
        .err_tip_with_code(|_| {
            (
                Code::InvalidArgument,
                format!(
                    "Registration socket {} has no file name",
                    registration_socket.display()
                ),
            )
        })?;
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(fs_event) => {
            let created = matches!(fs_event.kind, EventKind::Create(_))
                && fs_event
                    .paths
                    .iter()
                    .any(|path| path.file_name() == Some(socket_name.as_os_str()));
            if created {
                event!(Level::INFO, paths = ?fs_event.paths, "Registration socket created");
                if events.send(LifecycleEvent::RegistrationSocketCreated).is_err() {
                    event!(Level::DEBUG, "Lifecycle loop is gone, dropping event");
                }
            }
        }
        Err(err) => event!(Level::WARN, ?err, "Filesystem watcher error"),
    })
    .map_err(|e| make_err!(Code::Internal, "Failed to create filesystem watcher: {e}"))?;
    watcher
        .watch(plugin_dir, RecursiveMode::NonRecursive)
        .map_err(|e| {
            make_err!(
                Code::Internal,
                "Failed to watch {}: {e}",
                plugin_dir.display()
            )
        })?;
    Ok(watcher)
}

/// Turns SIGHUP into [`LifecycleEvent::Reload`] and SIGINT, SIGTERM or SIGQUIT
/// into [`LifecycleEvent::Shutdown`]. Must be called within a tokio runtime.
pub fn forward_signals(
    events: mpsc::UnboundedSender<LifecycleEvent>,
) -> Result<JoinHandleDropGuard<()>, Error> {
    let mut hangup = signal(SignalKind::hangup()).err_tip(|| "Failed to listen to SIGHUP")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).err_tip(|| "Failed to listen to SIGINT")?;
    let mut terminate =
        signal(SignalKind::terminate()).err_tip(|| "Failed to listen to SIGTERM")?;
    let mut quit = signal(SignalKind::quit()).err_tip(|| "Failed to listen to SIGQUIT")?;
    Ok(spawn!("signal_forwarder", async move {
        loop {
            let (name, lifecycle_event) = tokio::select! {
                _ = hangup.recv() => ("SIGHUP", LifecycleEvent::Reload),
                _ = interrupt.recv() => ("SIGINT", LifecycleEvent::Shutdown),
                _ = terminate.recv() => ("SIGTERM", LifecycleEvent::Shutdown),
                _ = quit.recv() => ("SIGQUIT", LifecycleEvent::Shutdown),
            };
            event!(Level::WARN, signal = name, ?lifecycle_event, "Received signal");
            if events.send(lifecycle_event).is_err() {
                return;
            }
        }
    }))
}
