use std::str::FromStr;

use super::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvKey {
    DatabaseUrl,
    CatalogTable,
    QueueBackend,
    SqsQueueUrl,
    SqsEndpoint,
    RabbitMqUrl,
    QueueName,
    QueueWaitSeconds,
    QueueVisibilityTimeout,
    S3Endpoint,
    S3Bucket,
    AwsRegion,
    AwsAccessKey,
    AwsSecretKey,
    SignedUrlTtl,
    FfmpegPath,
    FfprobePath,
    TranscodeTimeout,
    ScratchDir,
    RollbackOnAbort,
    HealthPort,
    LogFormat,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::DatabaseUrl => "DATABASE_URL",
            EnvKey::CatalogTable => "CATALOG_TABLE",
            EnvKey::QueueBackend => "QUEUE_BACKEND",
            EnvKey::SqsQueueUrl => "SQS_QUEUE_URL",
            EnvKey::SqsEndpoint => "SQS_ENDPOINT",
            EnvKey::RabbitMqUrl => "RABBITMQ_URL",
            EnvKey::QueueName => "QUEUE_NAME",
            EnvKey::QueueWaitSeconds => "QUEUE_WAIT_SECONDS",
            EnvKey::QueueVisibilityTimeout => "QUEUE_VISIBILITY_TIMEOUT_SECONDS",
            EnvKey::S3Endpoint => "S3_ENDPOINT",
            EnvKey::S3Bucket => "S3_BUCKET",
            EnvKey::AwsRegion => "AWS_REGION",
            EnvKey::AwsAccessKey => "AWS_ACCESS_KEY_ID",
            EnvKey::AwsSecretKey => "AWS_SECRET_ACCESS_KEY",
            EnvKey::SignedUrlTtl => "SIGNED_URL_TTL_SECONDS",
            EnvKey::FfmpegPath => "FFMPEG_PATH",
            EnvKey::FfprobePath => "FFPROBE_PATH",
            EnvKey::TranscodeTimeout => "TRANSCODE_TIMEOUT_SECONDS",
            EnvKey::ScratchDir => "SCRATCH_DIR",
            EnvKey::RollbackOnAbort => "ROLLBACK_ON_ABORT",
            EnvKey::HealthPort => "HEALTH_PORT",
            EnvKey::LogFormat => "LOG_FORMAT",
        }
    }
}

/// Reads settings through a lookup function so tests never touch the
/// process environment.
pub struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    pub fn new(lookup: F) -> Self {
        Self { lookup }
    }

    /// Empty values count as unset.
    pub fn get_opt(&self, key: EnvKey) -> Option<String> {
        (self.lookup)(key.as_str())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn get(&self, key: EnvKey) -> Result<String, ConfigError> {
        self.get_opt(key).ok_or(ConfigError::Missing(key.as_str()))
    }

    pub fn get_or(&self, key: EnvKey, default: &str) -> String {
        self.get_opt(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_parsed<T>(&self, key: EnvKey, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_opt(key) {
            Some(val) => val.parse::<T>().map_err(|e| ConfigError::Invalid {
                key: key.as_str(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn reader(pairs: &[(&str, &str)]) -> EnvReader<impl Fn(&str) -> Option<String>> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvReader::new(move |k: &str| map.get(k).cloned())
    }

    #[test]
    fn blank_values_are_treated_as_unset() {
        let env = reader(&[("S3_BUCKET", "   ")]);
        assert!(matches!(
            env.get(EnvKey::S3Bucket),
            Err(ConfigError::Missing("S3_BUCKET"))
        ));
    }

    #[test]
    fn parse_failure_names_the_variable() {
        let env = reader(&[("QUEUE_WAIT_SECONDS", "soon")]);
        let err = env.get_parsed::<u64>(EnvKey::QueueWaitSeconds, 20).unwrap_err();
        assert!(err.to_string().contains("QUEUE_WAIT_SECONDS"));
    }

    #[test]
    fn parsed_default_applies_when_missing() {
        let env = reader(&[]);
        assert_eq!(env.get_parsed::<u64>(EnvKey::SignedUrlTtl, 300).unwrap(), 300);
    }
}
