//! Outcome reports sent to the coordinator

use async_trait::async_trait;
use control_api::ReportAck;
use node_api::OutcomeReport;
use secrecy::{ExposeSecret, SecretString};

use crate::errors::FleetError;
use crate::http::client::HttpClient;
use crate::node::reporting::OutcomeReporter;

impl HttpClient {
    /// Submit a terminal outcome report
    pub async fn submit_report(
        &self,
        token: &str,
        report: &OutcomeReport,
    ) -> Result<ReportAck, FleetError> {
        self.post("/reports", Some(token), report).await
    }
}

/// Reports outcomes to the coordinator with the node's bearer credential
pub struct HttpOutcomeReporter {
    client: HttpClient,
    token: SecretString,
}

impl HttpOutcomeReporter {
    pub fn new(client: HttpClient, token: SecretString) -> Self {
        Self { client, token }
    }
}

#[async_trait]
impl OutcomeReporter for HttpOutcomeReporter {
    async fn report(&self, report: &OutcomeReport) -> Result<(), FleetError> {
        let ack = self
            .client
            .submit_report(self.token.expose_secret(), report)
            .await
            .map_err(|e| FleetError::ReportError(e.to_string()))?;

        if ack.directive_id != report.directive_id {
            return Err(FleetError::ReportError(format!(
                "coordinator acknowledged {} instead of {}",
                ack.directive_id, report.directive_id
            )));
        }
        Ok(())
    }
}
