use std::sync::Arc;

use shared::config::Config;
use shared::llms::CompletionProvider;

use crate::log_store::LogStore;
use crate::services::{
    ConversationRegistry, DeliveryController, DeliverySettings, MessageService, ResponseAssembler,
    StreamManager,
};

/// Shared handles used by every route.
#[derive(Debug, Clone)]
pub struct AppState {
    pub(crate) config: Arc<Config>,
    pub(crate) registry: Arc<ConversationRegistry>,
    pub(crate) streams: StreamManager,
    pub(crate) messages: Arc<MessageService>,
    pub(crate) delivery: DeliveryController,
}

impl AppState {
    /// Wires the relay components over `store`. Without a provider the relay
    /// still stores and replays messages but cannot generate replies.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn LogStore>,
        provider: Option<Arc<dyn CompletionProvider>>,
    ) -> Self {
        let registry = Arc::new(ConversationRegistry::new(config.limits.clone()));
        let streams = StreamManager::new(store, &config.log_store);
        let assembler = provider.map(|provider| {
            ResponseAssembler::new(
                provider,
                streams.clone(),
                Arc::clone(&registry),
                config.llm.default_model.clone(),
                config.llm.max_tokens,
            )
        });
        let messages = Arc::new(MessageService::new(
            Arc::clone(&registry),
            streams.clone(),
            assembler,
            config.limits.clone(),
            config.stream.history_window,
            config.stream.replay_batch_size,
        ));
        let delivery = DeliveryController::new(
            streams.clone(),
            DeliverySettings::from(&config.stream),
        );

        Self {
            config,
            registry,
            streams,
            messages,
            delivery,
        }
    }
}
