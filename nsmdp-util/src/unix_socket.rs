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

use hyper_util::rt::TokioIo;
use nsmdp_error::{Code, Error, ResultExt, make_err};
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::fs_util::remove_stale_socket;

// Authority is ignored, every connection goes to the socket path.
const UNIX_SOCKET_ENDPOINT: &str = "http://[::]:50051";

/// Dials a gRPC server listening on a unix socket. Fails if the connection is
/// not established within `timeout`.
pub async fn connect_unix_channel(socket_path: &Path, timeout: Duration) -> Result<Channel, Error> {
    let path: PathBuf = socket_path.to_path_buf();
    let endpoint = Endpoint::try_from(UNIX_SOCKET_ENDPOINT)
        .err_tip(|| "Failed to create unix socket endpoint")?;
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let path = path.clone();
        async move { UnixStream::connect(path).await.map(TokioIo::new) }
    }));
    tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| {
            make_err!(
                Code::DeadlineExceeded,
                "Timed out after {timeout:?} connecting to {}",
                socket_path.display()
            )
        })?
        .err_tip(|| format!("Failed to connect to {}", socket_path.display()))
}

/// Binds a fresh unix socket listener at `socket_path`, first removing any
/// stale socket file left behind by a previous run.
pub fn bind_unix_listener(socket_path: &Path) -> Result<UnixListenerStream, Error> {
    remove_stale_socket(socket_path)?;
    let listener = UnixListener::bind(socket_path)
        .err_tip(|| format!("Failed to listen on {}", socket_path.display()))?;
    Ok(UnixListenerStream::new(listener))
}
