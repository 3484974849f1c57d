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

use nsmdp_error::{Error, ResultExt};
use nsmdp_proto::v1beta1::device_plugin_client::DevicePluginClient;
use nsmdp_proto::v1beta1::registration_server::{Registration, RegistrationServer};
use nsmdp_proto::v1beta1::{Empty, RegisterRequest};
use nsmdp_util::spawn;
use nsmdp_util::task::JoinHandleDropGuard;
use nsmdp_util::unix_socket::{bind_unix_listener, connect_unix_channel};
use tokio::sync::mpsc;
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status};

/// Registration service standing in for the node agent. Every request is
/// forwarded to the test.
#[derive(Clone, Debug)]
pub struct MockKubelet {
    tx: mpsc::UnboundedSender<RegisterRequest>,
}

impl MockKubelet {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RegisterRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[tonic::async_trait]
impl Registration for MockKubelet {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.tx
            .send(request.into_inner())
            .map_err(|_| Status::internal("Test dropped the request receiver"))?;
        Ok(Response::new(Empty {}))
    }
}

/// A mock node agent serving the registration API on a unix socket.
#[derive(Debug)]
pub struct MockKubeletServer {
    pub plugin_dir: PathBuf,
    pub requests: mpsc::UnboundedReceiver<RegisterRequest>,
    _server: JoinHandleDropGuard<()>,
}

impl MockKubeletServer {
    pub fn start(plugin_dir: &Path, socket_name: &str) -> Result<Self, Error> {
        let (kubelet, requests) = MockKubelet::new();
        let incoming = bind_unix_listener(&plugin_dir.join(socket_name))?;
        let server = spawn!("mock_kubelet", async move {
            Server::builder()
                .add_service(RegistrationServer::new(kubelet))
                .serve_with_incoming(incoming)
                .await
                .expect("Mock kubelet server failed");
        });
        Ok(Self {
            plugin_dir: plugin_dir.to_path_buf(),
            requests,
            _server: server,
        })
    }

    /// Waits for the next registration and dials the plugin back on the
    /// endpoint it announced, the way kubelet does.
    pub async fn accept_registration(
        &mut self,
    ) -> Result<(RegisterRequest, DevicePluginClient<Channel>), Error> {
        let request = tokio::time::timeout(Duration::from_secs(10), self.requests.recv())
            .await?
            .err_tip(|| "Mock kubelet request channel closed")?;
        let channel = connect_unix_channel(
            &self.plugin_dir.join(&request.endpoint),
            Duration::from_secs(5),
        )
        .await?;
        Ok((request, DevicePluginClient::new(channel)))
    }
}
