//! Directive delivery to node agents

use std::time::Duration;

use async_trait::async_trait;
use node_api::{DirectiveAck, UpgradeDirective};
use reqwest::Client;

use crate::campaign::dispatch::{DispatchError, NodeDispatcher};
use crate::campaign::inventory::FleetNode;
use crate::errors::FleetError;
use crate::http::client::HttpClient;

impl HttpClient {
    /// Push a directive to a node agent
    pub async fn push_directive(
        &self,
        directive: &UpgradeDirective,
    ) -> Result<DirectiveAck, FleetError> {
        self.post("/directives", None, directive).await
    }
}

/// Delivers directives to each node's local API, sharing one connection pool
pub struct HttpDispatcher {
    client: Client,
}

impl HttpDispatcher {
    pub fn new(timeout: Duration) -> Result<Self, FleetError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl NodeDispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        node: &FleetNode,
        directive: &UpgradeDirective,
    ) -> Result<(), DispatchError> {
        let client = HttpClient::with_client(self.client.clone(), &node.endpoint);

        match client.push_directive(directive).await {
            Ok(ack) if ack.accepted => Ok(()),
            Ok(ack) => Err(DispatchError::Rejected(
                ack.reason.unwrap_or_else(|| "directive not accepted".to_string()),
            )),
            Err(FleetError::HttpStatus { status, body }) if (400..500).contains(&status) => {
                Err(DispatchError::Rejected(format!("HTTP {}: {}", status, body)))
            }
            Err(e) => Err(DispatchError::Unreachable(e.to_string())),
        }
    }
}
