//! Simple request-reply KV client, one connection per call.

use std::net::SocketAddr;

use crate::client::{ClientApiStub, ClientId};
use crate::server::{
    ApiReply, ApiRequest, Command, CommandResult, RequestId, SetValueResult,
    StoredValue,
};
use crate::utils::QuorumKvError;

use tokio::time::{self, Duration};

/// Default deadline for one request-reply exchange.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// KV client talking to one coordinator replica.
pub struct KvClient {
    /// Client-facing address of the coordinator.
    server: SocketAddr,

    /// Next request ID to use.
    next_req: RequestId,

    /// Deadline of each exchange.
    timeout: Duration,
}

impl KvClient {
    /// Creates a client for the coordinator at `server`.
    pub fn new(server: SocketAddr) -> Self {
        KvClient {
            server,
            next_req: 0,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the deadline of each exchange.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Writes `value` under `key` through the coordinator. Any failure on the
    /// server side comes back as `SetValueResult::Error`.
    pub async fn set_value(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<SetValueResult, QuorumKvError> {
        match self.exchange(Command::set(key, value)).await? {
            Some(CommandResult::SetValue { result }) => Ok(result),
            Some(result) => Err(QuorumKvError::msg(format!(
                "unexpected result for set: {:?}",
                result
            ))),
            None => Ok(SetValueResult::Error),
        }
    }

    /// Reads the latest value of `key` through the coordinator. The returned
    /// value is `StoredValue::EMPTY` if no replica in the quorum has the key.
    pub async fn get_value(
        &mut self,
        key: &str,
    ) -> Result<StoredValue, QuorumKvError> {
        match self.exchange(Command::get(key)).await? {
            Some(CommandResult::GetValue { value }) => Ok(value),
            Some(result) => Err(QuorumKvError::msg(format!(
                "unexpected result for get: {:?}",
                result
            ))),
            None => Err(QuorumKvError::msg(format!(
                "get of key '{}' failed at {}",
                key, self.server
            ))),
        }
    }

    /// Sends one command over a fresh connection and waits for its reply.
    async fn exchange(
        &mut self,
        cmd: Command,
    ) -> Result<Option<CommandResult>, QuorumKvError> {
        let req_id = self.next_req;
        self.next_req += 1;
        let client_id: ClientId = rand::random();

        let exchange = async {
            let (mut send_stub, mut recv_stub) =
                ClientApiStub::new(client_id).connect(self.server).await?;
            send_stub.send_req(ApiRequest::Req { id: req_id, cmd }).await?;
            let ApiReply::Reply { id, result } = recv_stub.recv_reply().await?;
            if id != req_id {
                return Err(QuorumKvError::msg(format!(
                    "reply ID mismatch: expect {} got {}",
                    req_id, id
                )));
            }
            Ok::<_, QuorumKvError>(result)
        };

        match time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(QuorumKvError::Timeout {
                waited_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}
