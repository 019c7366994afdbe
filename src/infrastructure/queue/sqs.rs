use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::config::{BehaviorVersion, Builder, Credentials, Region};
use aws_sdk_sqs::types::MessageSystemAttributeName;
use tracing::{debug, info, warn};

use super::{DeliveryToken, JobQueue, QueueMessage};

#[derive(Clone)]
pub struct SqsQueue {
    client: Client,
    queue_url: String,
    wait: Duration,
    visibility_timeout: Duration,
}

pub struct SqsSettings<'a> {
    pub queue_url: &'a str,
    pub endpoint: Option<&'a str>,
    pub region: &'a str,
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub wait: Duration,
    pub visibility_timeout: Duration,
}

impl SqsQueue {
    pub fn new(settings: SqsSettings<'_>) -> Self {
        let credentials = Credentials::new(settings.access_key, settings.secret_key, None, None, "static");

        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.to_string()))
            .credentials_provider(credentials);
        if let Some(endpoint) = settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(queue_url = settings.queue_url, "Configured SQS job queue");

        Self {
            client: Client::from_conf(builder.build()),
            queue_url: settings.queue_url.to_string(),
            wait: settings.wait,
            visibility_timeout: settings.visibility_timeout,
        }
    }
}

fn as_seconds(d: Duration) -> i32 {
    i32::try_from(d.as_secs()).unwrap_or(i32::MAX)
}

#[async_trait]
impl JobQueue for SqsQueue {
    async fn receive_next(&self) -> Result<Option<QueueMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(as_seconds(self.wait))
            .visibility_timeout(as_seconds(self.visibility_timeout))
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to receive from SQS: {}", e))?;

        let Some(message) = output.messages.unwrap_or_default().into_iter().next() else {
            return Ok(None);
        };

        let Some(receipt) = message.receipt_handle() else {
            // Without a receipt handle the message can never be deleted;
            // leave it to the broker's redrive policy.
            warn!(message_id = ?message.message_id(), "SQS message without receipt handle");
            return Ok(None);
        };

        let receive_count = message
            .attributes()
            .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|v| v.parse().ok());

        debug!(message_id = ?message.message_id(), ?receive_count, "Received SQS message");

        Ok(Some(QueueMessage {
            body: message.body().unwrap_or_default().as_bytes().to_vec(),
            token: DeliveryToken::new(receipt),
            receive_count,
        }))
    }

    async fn acknowledge(&self, token: &DeliveryToken) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(token.as_str())
            .send()
            .await
            .map_err(|e| anyhow!("Failed to delete SQS message: {}", e))?;
        Ok(())
    }

    async fn extend_visibility(&self, token: &DeliveryToken, timeout: Duration) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(token.as_str())
            .visibility_timeout(as_seconds(timeout))
            .send()
            .await
            .map_err(|e| anyhow!("Failed to extend SQS visibility: {}", e))?;
        Ok(())
    }
}
