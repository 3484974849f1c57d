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

use core::fmt;
use std::sync::Arc;

use nsmdp_error::{Code, Error, make_err};
use tokio::sync::{mpsc, oneshot};
use tracing::{Level, event};

use crate::spawn;
use crate::task::JoinHandleDropGuard;

type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Owns a piece of state and runs submitted closures against it one at a
/// time, in submission order, on a single worker task.
///
/// Submitting never blocks. Callers that need the outcome of a closure use
/// [`SerialExecutor::exec_and_wait`]; everyone else fires and forgets with
/// [`SerialExecutor::exec`]. Since only the worker ever touches the state,
/// no lock is needed around it.
///
/// The worker is aborted once the last clone of the executor is dropped.
pub struct SerialExecutor<S> {
    tx: mpsc::UnboundedSender<Job<S>>,
    _worker: Arc<JoinHandleDropGuard<()>>,
}

impl<S> Clone for SerialExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            _worker: self._worker.clone(),
        }
    }
}

impl<S> fmt::Debug for SerialExecutor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("closed", &self.tx.is_closed())
            .finish_non_exhaustive()
    }
}

impl<S: Send + 'static> SerialExecutor<S> {
    /// Spawns the worker that will own `state`. Must be called from within a
    /// tokio runtime.
    pub fn new(state: S) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job<S>>();
        let worker = spawn!("serial_executor", async move {
            let mut state = state;
            while let Some(job) = rx.recv().await {
                job(&mut state);
            }
            event!(Level::DEBUG, "Serial executor queue closed");
        });
        Self {
            tx,
            _worker: Arc::new(worker),
        }
    }

    /// Queues `job` behind everything submitted before it.
    pub fn exec<F>(&self, job: F) -> Result<(), Error>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx
            .send(Box::new(job))
            .map_err(|_| make_err!(Code::Unavailable, "Serial executor worker has stopped"))
    }

    /// Queues `job` and waits until the worker has run it.
    pub async fn exec_and_wait<F, R>(&self, job: F) -> Result<R, Error>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.exec(move |state| {
            if tx.send(job(state)).is_err() {
                // Receiver gave up waiting; the job still ran.
                event!(Level::TRACE, "Dropping result of abandoned job");
            }
        })?;
        rx.await.map_err(|_| {
            make_err!(
                Code::Internal,
                "Serial executor dropped a job before it completed"
            )
        })
    }
}
