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

use std::io::ErrorKind;
use std::path::Path;

use nsmdp_error::{Error, ResultExt};
use tokio::fs;
use tracing::{Level, event};

/// Removes every entry inside `dir`, leaving `dir` itself in place.
///
/// Best effort: a missing directory is not an error, and entries that cannot
/// be removed are logged and skipped. Returns how many entries failed.
pub async fn clean_directory(dir: &Path) -> usize {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return 0,
        Err(e) => {
            event!(Level::WARN, ?dir, ?e, "Failed to read directory for cleanup");
            return 1;
        }
    };
    let mut failures = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                event!(Level::WARN, ?dir, ?e, "Failed to list directory for cleanup");
                failures += 1;
                break;
            }
        };
        let path = entry.path();
        let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
        let result = if is_dir {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        if let Err(e) = result {
            event!(Level::ERROR, ?path, ?e, "Failed to remove stale entry");
            failures += 1;
        }
    }
    failures
}

/// Creates `dir` and any missing parents.
pub async fn create_dir_all(dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(dir)
        .await
        .err_tip(|| format!("Failed to create directory {}", dir.display()))
}

/// Removes a leftover socket file at `path`. A missing file is fine.
pub fn remove_stale_socket(path: &Path) -> Result<(), Error> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).err_tip(|| format!("Failed to remove stale socket {}", path.display())),
    }
}
