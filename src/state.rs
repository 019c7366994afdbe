use std::sync::Arc;

use anyhow::Result;

use crate::config::settings::{AppConfig, QueueBackend};
use crate::infrastructure::db::pool::{DbPool, connect_to_db};
use crate::infrastructure::queue::JobQueue;
use crate::infrastructure::queue::rabbitmq::RabbitMqQueue;
use crate::infrastructure::queue::sqs::{SqsQueue, SqsSettings};
use crate::infrastructure::storage::s3::{StorageService, StorageSettings};

/// Long-lived clients, built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: DbPool,
    pub queue: Arc<dyn JobQueue>,
    pub storage: Arc<StorageService>,
}

impl AppState {
    pub async fn connect(config: AppConfig) -> Result<Self> {
        let db = connect_to_db(&config.database_url).await?;

        let queue: Arc<dyn JobQueue> = match &config.queue {
            QueueBackend::Sqs { queue_url, endpoint } => Arc::new(SqsQueue::new(SqsSettings {
                queue_url,
                endpoint: endpoint.as_deref(),
                region: &config.aws_region,
                access_key: &config.aws_access_key,
                secret_key: &config.aws_secret_key,
                wait: config.queue_wait,
                visibility_timeout: config.visibility_timeout,
            })),
            QueueBackend::RabbitMq { url, queue_name } => Arc::new(
                RabbitMqQueue::new(url, queue_name, config.queue_wait, config.visibility_timeout).await?,
            ),
        };

        let storage = Arc::new(StorageService::new(StorageSettings {
            endpoint: config.s3_endpoint.as_deref(),
            bucket: &config.s3_bucket,
            region: &config.aws_region,
            access_key: &config.aws_access_key,
            secret_key: &config.aws_secret_key,
            signed_url_ttl: config.signed_url_ttl,
        }));

        Ok(Self {
            config,
            db,
            queue,
            storage,
        })
    }
}
