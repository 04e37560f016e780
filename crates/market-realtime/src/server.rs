//! Top-level real-time engine that ties the manager to its transport.

use std::sync::Arc;

use tracing::info;

use market_core::config::{RealtimeConfig, TransportKind};
use market_core::error::AppError;

use crate::connection::manager::ChannelConnectionManager;
use crate::metrics::RealtimeMetrics;
use crate::transport::phoenix::{PhoenixConfig, PhoenixTransport};
use crate::transport::{MemoryTransport, RealtimeTransport};

/// Central real-time engine, built once at startup.
#[derive(Clone)]
pub struct RealtimeEngine {
    /// Conversation channel manager.
    pub channels: ChannelConnectionManager,
    /// Metrics collector.
    pub metrics: Arc<RealtimeMetrics>,
}

impl std::fmt::Debug for RealtimeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeEngine")
            .field("channels", &self.channels)
            .finish()
    }
}

impl RealtimeEngine {
    /// Creates an engine on an explicit transport.
    pub fn new(
        config: &RealtimeConfig,
        transport: Arc<dyn RealtimeTransport>,
    ) -> Result<Self, AppError> {
        let metrics = Arc::new(RealtimeMetrics::new());
        let channels = ChannelConnectionManager::new(transport, config, metrics.clone())?;

        info!("Real-time engine initialized");

        Ok(Self { channels, metrics })
    }

    /// Creates an engine on the transport selected by `config`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn from_config(config: &RealtimeConfig) -> Result<Self, AppError> {
        config.validate()?;

        let transport: Arc<dyn RealtimeTransport> = match config.transport {
            TransportKind::Phoenix => {
                let phoenix = PhoenixConfig::from_realtime(config);
                info!(endpoint = %phoenix.endpoint, "Using hosted change feed");
                Arc::new(PhoenixTransport::spawn(phoenix))
            }
            TransportKind::Memory => {
                info!("Using in-memory change feed");
                Arc::new(MemoryTransport::auto_subscribing())
            }
        };

        Self::new(config, transport)
    }

    /// Closes every conversation channel and cancels pending reconnects.
    pub async fn shutdown(&self) -> Result<(), AppError> {
        info!("Shutting down real-time engine");

        self.channels.disconnect_all();

        let snapshot = self.metrics.snapshot();
        info!(
            channels_opened = snapshot.channels_opened,
            reconnects_scheduled = snapshot.reconnects_scheduled,
            messages_delivered = snapshot.messages_delivered,
            "Real-time engine shut down"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::handlers::ChannelHandlers;

    #[tokio::test]
    async fn test_from_config_memory() {
        let config = RealtimeConfig {
            transport: TransportKind::Memory,
            ..RealtimeConfig::default()
        };
        let engine = RealtimeEngine::from_config(&config).expect("engine");

        let handlers = ChannelHandlers::builder()
            .on_message(|_| {})
            .on_status_change(|_| {})
            .build()
            .expect("handlers");
        engine.channels.subscribe("conv-1", handlers).expect("subscribe");
        assert_eq!(engine.channels.active_channel_count(), 1);

        engine.shutdown().await.expect("shutdown");
        assert_eq!(engine.channels.active_channel_count(), 0);
        assert_eq!(engine.metrics.snapshot().open_channels(), 0);
    }

    #[tokio::test]
    async fn test_from_config_rejects_missing_api_key() {
        let err = RealtimeEngine::from_config(&RealtimeConfig::default()).unwrap_err();
        assert!(err.to_string().contains("api_key"));
    }
}
