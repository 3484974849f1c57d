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

use nsmdp_error::{Error, ResultExt, error_if};
use serde::Deserialize;

use crate::serde_utils::{
    convert_bool_with_shellexpand, convert_numeric_with_shellexpand,
    convert_string_with_shellexpand, expand_or, parse_bool,
};

/// Number of unallocated slots the plugin keeps advertised by default.
pub const DEFAULT_BUFFER_SIZE: usize = 30;

/// Directory kubelet scans for device plugin sockets.
pub const DEFAULT_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins/";

/// Socket the plugin serves the device plugin API on.
pub const DEFAULT_LISTEN_ENDPOINT: &str =
    "/var/lib/kubelet/device-plugins/networkservicemesh.io.sock";

/// Socket of kubelet's registration service.
pub const DEFAULT_REGISTRATION_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

/// Host directory holding the workload identity agent socket.
pub const DEFAULT_IDENTITY_SOCKET_DIR: &str = "/run/spire/sockets";

/// Extended resource name advertised to kubelet.
pub const DEFAULT_RESOURCE_NAME: &str = "networkservicemesh.io/socket";

pub const DEFAULT_REGISTRATION_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_RESTART_DELAY_MS: u64 = 500;

fn default_name() -> String {
    expand_or("${NSM_NAME:-Unnamed}", "Unnamed".to_string())
}

fn default_base_dir() -> String {
    expand_or("${NSM_BASE_DIR:-./}", "./".to_string())
}

fn default_insecure() -> bool {
    shellexpand::env("${NSM_INSECURE:-true}")
        .ok()
        .and_then(|value| parse_bool(&value))
        .unwrap_or(true)
}

const fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_listen_endpoint() -> String {
    DEFAULT_LISTEN_ENDPOINT.to_string()
}

fn default_registration_socket() -> String {
    DEFAULT_REGISTRATION_SOCKET.to_string()
}

fn default_plugin_dir() -> String {
    DEFAULT_PLUGIN_DIR.to_string()
}

fn default_identity_socket_dir() -> String {
    DEFAULT_IDENTITY_SOCKET_DIR.to_string()
}

fn default_resource_name() -> String {
    DEFAULT_RESOURCE_NAME.to_string()
}

const fn default_registration_timeout_ms() -> u64 {
    DEFAULT_REGISTRATION_TIMEOUT_MS
}

const fn default_restart_delay_ms() -> u64 {
    DEFAULT_RESTART_DELAY_MS
}

/// Configuration of the device plugin.
///
/// Every field is optional. String, numeric and boolean values may reference
/// environment variables with shell syntax, e.g. `"${NSM_BASE_DIR:-/tmp}"`.
/// Without a configuration file, [`DevicePluginConfig::default`] is used,
/// which honors `NSM_NAME`, `NSM_BASE_DIR` and `NSM_INSECURE`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DevicePluginConfig {
    /// Name of this plugin instance. Only used in log output.
    ///
    /// Default: `${NSM_NAME:-Unnamed}`
    #[serde(
        default = "default_name",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub name: String,

    /// Root of the per-slot directories shared with workloads. The server
    /// socket lives in `<base_dir>/nsm/` and every slot gets `<base_dir>/<id>/`.
    ///
    /// Default: `${NSM_BASE_DIR:-./}`
    #[serde(
        default = "default_base_dir",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub base_dir: String,

    /// When false, every allocation also mounts the identity socket
    /// directory read-only into the container.
    ///
    /// Default: `${NSM_INSECURE:-true}`
    #[serde(
        default = "default_insecure",
        deserialize_with = "convert_bool_with_shellexpand"
    )]
    pub insecure: bool,

    /// Number of unallocated slots kept advertised at all times.
    ///
    /// Default: 30
    #[serde(
        default = "default_buffer_size",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub buffer_size: usize,

    /// Unix socket the device plugin API is served on.
    #[serde(
        default = "default_listen_endpoint",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub listen_endpoint: String,

    /// Unix socket of kubelet's registration service.
    #[serde(
        default = "default_registration_socket",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub registration_socket: String,

    /// Directory watched for the registration socket being recreated.
    #[serde(
        default = "default_plugin_dir",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub plugin_dir: String,

    /// Host directory mounted at the same path when `insecure` is false.
    #[serde(
        default = "default_identity_socket_dir",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub identity_socket_dir: String,

    /// Extended resource name announced when registering.
    #[serde(
        default = "default_resource_name",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub resource_name: String,

    /// Upper bound for dialing kubelet and completing registration.
    ///
    /// Default: 5000
    #[serde(
        default = "default_registration_timeout_ms",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub registration_timeout_ms: u64,

    /// Pause between a failed start attempt and the next one.
    ///
    /// Default: 500
    #[serde(
        default = "default_restart_delay_ms",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub restart_delay_ms: u64,
}

impl Default for DevicePluginConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            base_dir: default_base_dir(),
            insecure: default_insecure(),
            buffer_size: default_buffer_size(),
            listen_endpoint: default_listen_endpoint(),
            registration_socket: default_registration_socket(),
            plugin_dir: default_plugin_dir(),
            identity_socket_dir: default_identity_socket_dir(),
            resource_name: default_resource_name(),
            registration_timeout_ms: default_registration_timeout_ms(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

impl DevicePluginConfig {
    /// Parses and validates a JSON5 document.
    pub fn from_json5(json5: &str) -> Result<Self, Error> {
        let config: Self =
            serde_json5::from_str(json5).err_tip(|| "Could not parse device plugin config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        error_if!(self.buffer_size == 0, "buffer_size must be greater than zero");
        error_if!(self.base_dir.is_empty(), "base_dir must not be empty");
        error_if!(
            self.listen_endpoint.is_empty(),
            "listen_endpoint must not be empty"
        );
        error_if!(
            self.registration_socket.is_empty(),
            "registration_socket must not be empty"
        );
        error_if!(
            self.resource_name.is_empty(),
            "resource_name must not be empty"
        );
        Ok(())
    }

    pub const fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub const fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Every non-boolean setting as an `NSM_<KEY>` environment assignment, in
    /// declaration order.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            ("NSM_NAME", self.name.clone()),
            ("NSM_BASE_DIR", self.base_dir.clone()),
            ("NSM_BUFFER_SIZE", self.buffer_size.to_string()),
            ("NSM_LISTEN_ENDPOINT", self.listen_endpoint.clone()),
            ("NSM_REGISTRATION_SOCKET", self.registration_socket.clone()),
            ("NSM_PLUGIN_DIR", self.plugin_dir.clone()),
            ("NSM_IDENTITY_SOCKET_DIR", self.identity_socket_dir.clone()),
            ("NSM_RESOURCE_NAME", self.resource_name.clone()),
            (
                "NSM_REGISTRATION_TIMEOUT_MS",
                self.registration_timeout_ms.to_string(),
            ),
            ("NSM_RESTART_DELAY_MS", self.restart_delay_ms.to_string()),
        ]
    }
}
