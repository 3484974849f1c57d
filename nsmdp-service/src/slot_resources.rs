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

use nsmdp_proto::v1beta1::{ContainerAllocateResponse, Mount};

/// Env variable naming the manager's server socket inside the workload.
pub const NSM_SERVER_SOCKET_ENV: &str = "NSM_SERVER_SOCKET";
/// Env variable naming the slot's private client socket inside the workload.
pub const NSM_CLIENT_SOCKET_ENV: &str = "NSM_CLIENT_SOCKET";

pub const NSM_SERVER_SOCKET: &str = "nsm.server.io.sock";
pub const NSM_CLIENT_SOCKET: &str = "nsm.client.io.sock";

const SERVER_DIR: &str = "nsm";
const CLIENT_DIR: &str = "client";

/// Where a slot's resources live on the host and inside the workload.
///
/// Host and container paths share the same `base_dir`; the workload sees its
/// private directory under `client/` while the host keeps it at the top level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLayout {
    base_dir: String,
    identity_socket_dir: Option<String>,
}

impl SlotLayout {
    /// `identity_socket_dir` is mounted read-only into every workload when set.
    pub fn new(base_dir: &str, identity_socket_dir: Option<String>) -> Self {
        let trimmed = base_dir.trim_end_matches('/');
        Self {
            base_dir: trimmed.to_string(),
            identity_socket_dir,
        }
    }

    pub fn host_server_dir(&self) -> String {
        format!("{}/{SERVER_DIR}/", self.base_dir)
    }

    pub fn container_server_dir(&self) -> String {
        format!("{}/{SERVER_DIR}/", self.base_dir)
    }

    pub fn host_slot_dir(&self, id: &str) -> String {
        format!("{}/{id}/", self.base_dir)
    }

    pub fn container_slot_dir(&self, id: &str) -> String {
        format!("{}/{CLIENT_DIR}/{id}/", self.base_dir)
    }

    pub fn server_socket(&self) -> String {
        format!("{}{NSM_SERVER_SOCKET}", self.container_server_dir())
    }

    pub fn client_socket(&self, id: &str) -> String {
        format!("{}{NSM_CLIENT_SOCKET}", self.container_slot_dir(id))
    }

    /// Mount exposing the slot's private host directory to the workload.
    pub fn slot_mount(&self, id: &str) -> Mount {
        Mount {
            container_path: self.container_slot_dir(id),
            host_path: self.host_slot_dir(id),
            read_only: false,
        }
    }

    /// Mounts and environment handed to the workload that receives `id`.
    pub fn container_response(&self, id: &str) -> ContainerAllocateResponse {
        let mut mounts = vec![
            Mount {
                container_path: self.container_server_dir(),
                host_path: self.host_server_dir(),
                read_only: false,
            },
            self.slot_mount(id),
        ];
        if let Some(identity_socket_dir) = &self.identity_socket_dir {
            mounts.push(Mount {
                container_path: identity_socket_dir.clone(),
                host_path: identity_socket_dir.clone(),
                read_only: true,
            });
        }
        let envs = HashMap::from([
            (NSM_SERVER_SOCKET_ENV.to_string(), self.server_socket()),
            (NSM_CLIENT_SOCKET_ENV.to_string(), self.client_socket(id)),
        ]);
        ContainerAllocateResponse {
            envs,
            mounts,
            ..Default::default()
        }
    }
}
