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

use std::env;

use nsmdp_config::device_plugin::{
    DEFAULT_BUFFER_SIZE, DEFAULT_LISTEN_ENDPOINT, DEFAULT_RESOURCE_NAME, DevicePluginConfig,
};
use nsmdp_config::serde_utils::{
    convert_bool_with_shellexpand, convert_numeric_with_shellexpand, parse_bool,
};
use nsmdp_error::Code;
use pretty_assertions::assert_eq;
use serde::Deserialize;

#[derive(Deserialize)]
struct NumericEntity {
    #[serde(deserialize_with = "convert_numeric_with_shellexpand")]
    value: usize,
}

#[derive(Deserialize)]
struct BoolEntity {
    #[serde(deserialize_with = "convert_bool_with_shellexpand")]
    value: bool,
}

#[test]
fn test_numeric_from_number() {
    let deserialized: NumericEntity = serde_json5::from_str(r#"{ value: 12 }"#).unwrap();
    assert_eq!(deserialized.value, 12);
}

#[test]
fn test_numeric_from_shellexpand_default() {
    let deserialized: NumericEntity =
        serde_json5::from_str(r#"{ value: "${NSMDP_TEST_UNSET_BUFFER:-7}" }"#).unwrap();
    assert_eq!(deserialized.value, 7);
}

#[test]
fn test_numeric_rejects_negative() {
    assert!(serde_json5::from_str::<NumericEntity>(r#"{ value: -1 }"#).is_err());
}

#[test]
fn test_bool_from_literal_and_string() {
    let literal: BoolEntity = serde_json5::from_str(r#"{ value: false }"#).unwrap();
    assert!(!literal.value);
    let expanded: BoolEntity =
        serde_json5::from_str(r#"{ value: "${NSMDP_TEST_UNSET_INSECURE:-True}" }"#).unwrap();
    assert!(expanded.value);
}

#[test]
fn test_bool_rejects_garbage() {
    assert!(serde_json5::from_str::<BoolEntity>(r#"{ value: "maybe" }"#).is_err());
}

#[test]
fn test_parse_bool_spellings() {
    for truthy in ["1", "t", "T", "TRUE", "true", "True"] {
        assert_eq!(parse_bool(truthy), Some(true), "{truthy}");
    }
    for falsy in ["0", "f", "F", "FALSE", "false", "False"] {
        assert_eq!(parse_bool(falsy), Some(false), "{falsy}");
    }
    assert_eq!(parse_bool("yes"), None);
}

#[test]
fn test_empty_document_uses_defaults() {
    let config = DevicePluginConfig::from_json5("{}").unwrap();
    assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
    assert_eq!(config.listen_endpoint, DEFAULT_LISTEN_ENDPOINT);
    assert_eq!(config.resource_name, DEFAULT_RESOURCE_NAME);
    assert_eq!(config, DevicePluginConfig::default());
}

#[test]
fn test_full_document() {
    let config = DevicePluginConfig::from_json5(
        r#"{
            // Comments are allowed.
            name: "node-a",
            base_dir: "/var/lib/networkservicemesh/",
            insecure: "false",
            buffer_size: "4",
            listen_endpoint: "/tmp/plugin.sock",
            registration_socket: "/tmp/kubelet.sock",
            plugin_dir: "/tmp/",
            identity_socket_dir: "/run/identity",
            resource_name: "example.com/socket",
            registration_timeout_ms: 250,
            restart_delay_ms: 10,
        }"#,
    )
    .unwrap();
    assert_eq!(config.name, "node-a");
    assert_eq!(config.base_dir, "/var/lib/networkservicemesh/");
    assert!(!config.insecure);
    assert_eq!(config.buffer_size, 4);
    assert_eq!(config.identity_socket_dir, "/run/identity");
    assert_eq!(config.registration_timeout().as_millis(), 250);
    assert_eq!(config.restart_delay().as_millis(), 10);
}

#[test]
fn test_env_expansion_in_strings() {
    let Ok(path) = env::var("PATH") else {
        return;
    };
    let config = DevicePluginConfig::from_json5(r#"{ base_dir: "${PATH}" }"#).unwrap();
    assert_eq!(config.base_dir, path);
}

#[test]
fn test_unknown_field_rejected() {
    let err = DevicePluginConfig::from_json5(r#"{ bufer_size: 3 }"#).unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
}

#[test]
fn test_zero_buffer_rejected() {
    let err = DevicePluginConfig::from_json5(r#"{ buffer_size: 0 }"#).unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
    assert_eq!(
        err.messages,
        vec!["buffer_size must be greater than zero".to_string()]
    );
}

#[test]
fn test_env_vars_skip_booleans() {
    let config = DevicePluginConfig::from_json5(r#"{ name: "dump", buffer_size: 3 }"#).unwrap();
    let vars = config.env_vars();
    assert_eq!(vars[0], ("NSM_NAME", "dump".to_string()));
    assert!(vars.contains(&("NSM_BUFFER_SIZE", "3".to_string())));
    assert!(vars.iter().all(|(key, _)| *key != "NSM_INSECURE"));
    assert!(vars.iter().all(|(key, _)| key.starts_with("NSM_")));
}
