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
use std::path::PathBuf;

use nsmdp_error::Error;
use nsmdp_macro::nsmdp_test;
use nsmdp_util::fs_util::{clean_directory, create_dir_all, remove_stale_socket};
use pretty_assertions::assert_eq;
use rand::Rng;

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

#[nsmdp_test]
async fn clean_directory_removes_files_and_subdirectories() -> Result<(), Error> {
    let dir = make_temp_path("slot-0");
    create_dir_all(&dir.join("nested/deeper")).await?;
    tokio::fs::write(dir.join("nsm.client.io.sock"), b"stale").await?;
    tokio::fs::write(dir.join("nested/deeper/memif.sock"), b"stale").await?;

    assert_eq!(clean_directory(&dir).await, 0);

    let mut entries = tokio::fs::read_dir(&dir).await?;
    assert!(entries.next_entry().await?.is_none());
    assert!(dir.exists());
    Ok(())
}

#[nsmdp_test]
async fn clean_directory_ignores_missing_directory() -> Result<(), Error> {
    let dir = make_temp_path("does-not-exist");
    assert_eq!(clean_directory(&dir).await, 0);
    Ok(())
}

#[nsmdp_test]
async fn remove_stale_socket_is_idempotent() -> Result<(), Error> {
    let dir = make_temp_path("sockets");
    create_dir_all(&dir).await?;
    let socket = dir.join("plugin.sock");
    tokio::fs::write(&socket, b"").await?;

    remove_stale_socket(&socket)?;
    assert!(!socket.exists());
    remove_stale_socket(&socket)?;
    Ok(())
}
