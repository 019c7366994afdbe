use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use validator::Validate;

use crate::infrastructure::queue::{DeliveryToken, QueueMessage};

/// Body published by the web application after a video upload lands in
/// the object store.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUploaded {
    pub resource_id: Uuid,
    #[validate(length(min = 1, message = "Source key is required"))]
    pub key: String,
    #[validate(length(min = 1, message = "User id is required"))]
    pub user_id: String,
    #[validate(length(min = 1, message = "File name is required"))]
    pub file_name: String,
    #[validate(length(min = 1, message = "Content type is required"))]
    pub content_type: String,
}

#[derive(Debug, Error)]
pub enum MalformedMessage {
    #[error("message body is not valid job JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message body failed validation: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

/// One unit of work: a single uploaded video plus the handle needed to
/// acknowledge the message it came from.
#[derive(Debug, Clone)]
pub struct Job {
    pub resource_id: Uuid,
    pub source_key: String,
    pub owner_id: String,
    pub original_file_name: String,
    pub declared_content_type: String,
    pub delivery_token: DeliveryToken,
    /// Broker-reported delivery count. RabbitMQ does not report one.
    pub receive_count: Option<u32>,
}

impl Job {
    pub fn from_message(message: &QueueMessage) -> Result<Self, MalformedMessage> {
        let body: ResourceUploaded = serde_json::from_slice(&message.body)?;
        body.validate()?;

        Ok(Self {
            resource_id: body.resource_id,
            source_key: body.key,
            owner_id: body.user_id,
            original_file_name: body.file_name,
            declared_content_type: body.content_type,
            delivery_token: message.token.clone(),
            receive_count: message.receive_count,
        })
    }

    /// True only when the broker says this message was delivered before.
    pub fn is_redelivery(&self) -> bool {
        self.receive_count.is_some_and(|n| n > 1)
    }
}
