use std::time::Duration;

use async_nats::connection::State;
use async_nats::jetstream::{self, consumer, stream};
use async_trait::async_trait;
use futures_util::StreamExt;
use shared::config::LogStoreConfig;
use tracing::{debug, error, info, warn};

use super::{
    DeliverPolicy, FetchBatch, LogConsumer, LogStore, LogStoreError, LogStoreResult, StoredRecord,
};

const CONSUMER_INACTIVE_THRESHOLD: Duration = Duration::from_secs(30);

/// NATS `JetStream` adapter. All conversations share one stream whose subjects
/// start with the configured prefix.
#[derive(Debug, Clone)]
pub struct JetStreamLogStore {
    client: async_nats::Client,
    context: jetstream::Context,
    stream: stream::Stream,
    stream_config: stream::Config,
    publish_timeout: Duration,
}

impl JetStreamLogStore {
    /// Connects to NATS and provisions the conversation stream.
    ///
    /// # Errors
    /// Returns [`LogStoreError::Connection`] when the server is unreachable and
    /// [`LogStoreError::Stream`] when the stream cannot be created.
    pub async fn connect(config: &LogStoreConfig) -> LogStoreResult<Self> {
        let mut options = async_nats::ConnectOptions::new()
            .name("conversation-relay")
            .retry_on_initial_connect()
            .event_callback(|event| async move {
                match event {
                    async_nats::Event::Disconnected => warn!("NATS disconnected"),
                    async_nats::Event::Connected => info!("NATS reconnected"),
                    other => debug!(event = %other, "NATS client event"),
                }
            });

        if let Some(token) = config.token.clone() {
            options = options.token(token);
        }
        if let Some(ca) = config.tls_ca_file.clone() {
            options = options.add_root_certificates(ca).require_tls(true);
        }
        if let (Some(cert), Some(key)) = (config.tls_cert_file.clone(), config.tls_key_file.clone())
        {
            options = options.add_client_certificate(cert, key).require_tls(true);
        }

        info!(url = %config.url, "connecting to NATS");
        let client = options
            .connect(&config.url)
            .await
            .map_err(|err| LogStoreError::Connection(err.to_string()))?;
        let context = jetstream::new(client.clone());

        let stream_config = stream::Config {
            name: config.stream_name.clone(),
            subjects: vec![format!("{}.>", config.subject_prefix)],
            retention: stream::RetentionPolicy::Limits,
            max_age: Duration::from_secs(config.max_age_days * 24 * 60 * 60),
            max_bytes: config.max_bytes,
            storage: stream::StorageType::File,
            num_replicas: config.replicas,
            deny_delete: true,
            deny_purge: true,
            description: Some("All conversation messages and events".to_string()),
            ..Default::default()
        };
        let stream = context
            .get_or_create_stream(stream_config.clone())
            .await
            .map_err(|err| LogStoreError::Stream(err.to_string()))?;

        info!(stream = %config.stream_name, "conversation stream ready");
        Ok(Self {
            client,
            context,
            stream,
            stream_config,
            publish_timeout: config.publish_timeout(),
        })
    }
}

#[async_trait]
impl LogStore for JetStreamLogStore {
    fn backend(&self) -> &'static str {
        "jetstream"
    }

    fn is_connected(&self) -> bool {
        matches!(self.client.connection_state(), State::Connected)
    }

    async fn ensure_stream(&self) -> LogStoreResult<()> {
        self.context
            .get_or_create_stream(self.stream_config.clone())
            .await
            .map(|_| ())
            .map_err(|err| LogStoreError::Stream(err.to_string()))
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> LogStoreResult<u64> {
        let publish = async {
            self.context
                .publish(subject.to_string(), payload.into())
                .await
                .map_err(|err| LogStoreError::Publish(err.to_string()))?
                .await
                .map_err(|err| LogStoreError::Publish(err.to_string()))
        };

        let ack = tokio::time::timeout(self.publish_timeout, publish)
            .await
            .map_err(|_| LogStoreError::Timeout(self.publish_timeout))??;
        Ok(ack.sequence)
    }

    async fn create_consumer(
        &self,
        filter: &str,
        policy: DeliverPolicy,
    ) -> LogStoreResult<Box<dyn LogConsumer>> {
        let deliver_policy = match policy {
            DeliverPolicy::All => consumer::DeliverPolicy::All,
            DeliverPolicy::ByStartSequence(start_sequence) => {
                consumer::DeliverPolicy::ByStartSequence { start_sequence }
            }
        };

        let consumer = self
            .stream
            .create_consumer(consumer::pull::Config {
                durable_name: None,
                filter_subject: filter.to_string(),
                deliver_policy,
                ack_policy: consumer::AckPolicy::None,
                inactive_threshold: CONSUMER_INACTIVE_THRESHOLD,
                ..Default::default()
            })
            .await
            .map_err(|err| LogStoreError::Consumer(err.to_string()))?;

        debug!(filter, ?policy, "created ephemeral consumer");
        Ok(Box::new(JetStreamConsumer { consumer }))
    }
}

struct JetStreamConsumer {
    consumer: consumer::Consumer<consumer::pull::Config>,
}

#[async_trait]
impl LogConsumer for JetStreamConsumer {
    async fn fetch(&mut self, max_count: usize, max_wait: Duration) -> LogStoreResult<FetchBatch> {
        let mut messages = self
            .consumer
            .batch()
            .max_messages(max_count)
            .expires(max_wait)
            .messages()
            .await
            .map_err(|err| LogStoreError::Fetch(err.to_string()))?;

        let mut batch = FetchBatch::default();
        while let Some(next) = messages.next().await {
            let message = match next {
                Ok(message) => message,
                Err(err) => {
                    error!(error = %err, "JetStream batch ended with error");
                    batch.terminal_error = Some(LogStoreError::Fetch(err.to_string()));
                    break;
                }
            };

            let sequence = match message.info() {
                Ok(info) => info.stream_sequence,
                Err(err) => {
                    warn!(error = %err, "skipping record without stream metadata");
                    continue;
                }
            };

            batch.records.push(StoredRecord {
                subject: message.message.subject.to_string(),
                sequence,
                payload: message.message.payload.to_vec(),
            });
        }

        Ok(batch)
    }
}
