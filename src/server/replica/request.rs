//! QuorumKV -- client request entrance.

use std::sync::Arc;

use super::QuorumKvNode;

use crate::client::ClientId;
use crate::server::external::ApiReplier;
use crate::server::{
    ApiReply, ApiRequest, Command, CommandResult, SetValueResult,
};

// QuorumKvNode client requests entrance
impl QuorumKvNode {
    /// Coordinates one client request and sends back the reply. Failure
    /// causes are logged by the coordinator paths and kept opaque here.
    pub(super) async fn handle_api_req(
        self: Arc<Self>,
        replier: ApiReplier,
        client: ClientId,
        req: ApiRequest,
    ) {
        let ApiRequest::Req { id, cmd } = req;

        let result = match cmd {
            Command::SetValue {
                key,
                value,
                client_id,
                request_number,
                timestamp,
            } => {
                pf_trace!(
                    self.id;
                    "set '{}' from client {} req# {} ts {}",
                    key,
                    client_id,
                    request_number,
                    timestamp
                );
                let result = match self.write(&key, value).await {
                    Ok(_) => SetValueResult::Success,
                    Err(_) => SetValueResult::Error,
                };
                Some(CommandResult::SetValue { result })
            }

            Command::GetValue { key } => self
                .read(&key)
                .await
                .ok()
                .map(|value| CommandResult::GetValue { value }),
        };

        if let Err(e) = replier
            .send_reply(ApiReply::Reply { id, result }, client)
            .await
        {
            pf_error!(self.id; "error replying to client {}: {}", client, e);
        }
    }
}
