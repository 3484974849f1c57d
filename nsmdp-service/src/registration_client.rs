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

use core::future::Future;
use core::time::Duration;
use std::path::Path;

use nsmdp_error::{Code, Error, ResultExt, make_err};
use nsmdp_proto::v1beta1::registration_client::RegistrationClient;
use nsmdp_proto::v1beta1::{DevicePluginOptions, Empty, RegisterRequest};
use nsmdp_util::unix_socket::connect_unix_channel;
use tonic::transport::Channel;
use tonic::{Response, Status};
use tracing::{Level, event};

/// Version of the device plugin API this plugin speaks.
pub const DEVICE_PLUGIN_API_VERSION: &str = "v1beta1";

/// This is used in order to allow unit tests to intercept these calls. This should always match
/// the API of `RegistrationClient` defined in the `api.proto` file.
pub trait RegistrationClientTrait: Clone + Sync + Send + Sized + Unpin {
    fn register(
        &mut self,
        request: RegisterRequest,
    ) -> impl Future<Output = Result<Response<Empty>, Status>> + Send;
}

#[derive(Clone, Debug)]
pub struct RegistrationClientWrapper {
    inner: RegistrationClient<Channel>,
}

impl From<RegistrationClient<Channel>> for RegistrationClientWrapper {
    fn from(other: RegistrationClient<Channel>) -> Self {
        Self { inner: other }
    }
}

impl RegistrationClientTrait for RegistrationClientWrapper {
    async fn register(&mut self, request: RegisterRequest) -> Result<Response<Empty>, Status> {
        self.inner.register(request).await
    }
}

/// Dials the node agent's registration socket.
pub async fn connect_registration_client(
    registration_socket: &Path,
    timeout: Duration,
) -> Result<RegistrationClientWrapper, Error> {
    let channel = connect_unix_channel(registration_socket, timeout)
        .await
        .err_tip(|| "While dialing the registration service")?;
    Ok(RegistrationClient::new(channel).into())
}

/// Builds the request announcing `listen_endpoint` for `resource_name`.
///
/// The node agent expects the socket's file name relative to its plugin
/// directory, not a full path.
pub fn make_register_request(
    listen_endpoint: &Path,
    resource_name: &str,
) -> Result<RegisterRequest, Error> {
    let endpoint = listen_endpoint
        .file_name()
        .and_then(|name| name.to_str())
        .err_tip_with_code(|_| {
            (
                Code::InvalidArgument,
                format!(
                    "Listen endpoint {} has no usable file name",
                    listen_endpoint.display()
                ),
            )
        })?;
    Ok(RegisterRequest {
        version: DEVICE_PLUGIN_API_VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(DevicePluginOptions::default()),
    })
}

/// Sends `request` and waits at most `timeout` for the answer.
pub async fn register<T: RegistrationClientTrait>(
    client: &mut T,
    request: RegisterRequest,
    timeout: Duration,
) -> Result<(), Error> {
    let endpoint = request.endpoint.clone();
    let resource_name = request.resource_name.clone();
    tokio::time::timeout(timeout, client.register(request))
        .await
        .map_err(|_| {
            make_err!(
                Code::DeadlineExceeded,
                "Registration of {resource_name} timed out after {timeout:?}"
            )
        })?
        .err_tip(|| format!("Node agent rejected registration of {resource_name}"))?;
    event!(
        Level::INFO,
        %endpoint,
        %resource_name,
        "Registered with node agent"
    );
    Ok(())
}
