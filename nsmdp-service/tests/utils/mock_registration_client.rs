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

use std::sync::Arc;

use async_lock::Mutex;
use nsmdp_proto::v1beta1::{Empty, RegisterRequest};
use nsmdp_service::registration_client::RegistrationClientTrait;
use tokio::sync::mpsc;
use tonic::{Response, Status};

/// Registration client whose calls are answered by the test through
/// [`MockRegistrationClient::expect_register`].
#[derive(Clone, Debug)]
pub struct MockRegistrationClient {
    rx_call: Arc<Mutex<mpsc::UnboundedReceiver<RegisterRequest>>>,
    tx_call: mpsc::UnboundedSender<RegisterRequest>,
    rx_resp: Arc<Mutex<mpsc::UnboundedReceiver<Result<Response<Empty>, Status>>>>,
    tx_resp: mpsc::UnboundedSender<Result<Response<Empty>, Status>>,
}

impl MockRegistrationClient {
    pub fn new() -> Self {
        let (tx_call, rx_call) = mpsc::unbounded_channel();
        let (tx_resp, rx_resp) = mpsc::unbounded_channel();
        Self {
            rx_call: Arc::new(Mutex::new(rx_call)),
            tx_call,
            rx_resp: Arc::new(Mutex::new(rx_resp)),
            tx_resp,
        }
    }

    /// Waits for the next `register` call, answers it with `result` and
    /// returns the request that was sent.
    pub async fn expect_register(
        &self,
        result: Result<Response<Empty>, Status>,
    ) -> RegisterRequest {
        let mut rx_call_lock = self.rx_call.lock().await;
        let req = rx_call_lock
            .recv()
            .await
            .expect("Could not receive msg in mpsc");
        self.tx_resp
            .send(result)
            .expect("Could not send request to mpsc");
        req
    }

    /// True if a `register` call arrived that nobody answered yet.
    pub async fn has_pending_register(&self) -> bool {
        !self.rx_call.lock().await.is_empty()
    }
}

impl Default for MockRegistrationClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationClientTrait for MockRegistrationClient {
    async fn register(&mut self, request: RegisterRequest) -> Result<Response<Empty>, Status> {
        self.tx_call
            .send(request)
            .expect("Could not send request to mpsc");
        let mut rx_resp_lock = self.rx_resp.lock().await;
        rx_resp_lock
            .recv()
            .await
            .expect("Could not receive msg in mpsc")
    }
}
