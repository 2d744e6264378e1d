//! Application state and initialization
//!
//! This module manages the central application state and lifecycle.
//! All services are initialized here and made available through AppState.

use crate::config::AppConfig;
use crate::database::{create_pool, Repository};
use crate::error::Result;
use crate::notify::{HttpWebhookSender, Mailer, SmtpMailer, WebhookSender};
use crate::services::{
    AttachmentsService, Dispatcher, HeartbeatTracker, Orchestrator, SettingsService,
    SwitchService, WebhookService,
};
use crate::storage::{AttachmentStore, BlobStore};
use std::sync::Arc;

/// Central application state holding all services
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub repo: Repository,
    pub blob_store: BlobStore,
    pub settings_service: SettingsService,
    pub switch_service: SwitchService,
    pub attachments_service: AttachmentsService,
    pub heartbeat: HeartbeatTracker,
    pub webhook_service: WebhookService,
    pub orchestrator: Orchestrator,
}

impl AppState {
    /// Open the data directory with the real SMTP and HTTP collaborators
    pub async fn new(config: AppConfig) -> Result<Self> {
        let mailer: Arc<dyn Mailer> = Arc::new(SmtpMailer::new());
        let webhooks: Arc<dyn WebhookSender> = Arc::new(HttpWebhookSender::new()?);
        Self::with_collaborators(config, Dispatcher::new(mailer, webhooks)).await
    }

    /// Open the data directory with a caller-supplied dispatcher
    pub async fn with_collaborators(config: AppConfig, dispatcher: Dispatcher) -> Result<Self> {
        tracing::info!("Data directory: {:?}", config.data_dir);

        std::fs::create_dir_all(&config.data_dir)?;

        let pool = create_pool(&config.db_path()).await?;
        let repo = Repository::new(pool);

        let blob_store = BlobStore::new(config.blob_dir());
        blob_store.initialize().await?;
        let store: Arc<dyn AttachmentStore> = Arc::new(blob_store.clone());

        let settings_service = SettingsService::new(repo.clone());
        let switch_service = SwitchService::new(
            repo.clone(),
            settings_service.clone(),
            store.clone(),
            config.recovery_key.clone(),
        );
        let attachments_service = AttachmentsService::new(repo.clone(), store);
        let heartbeat = HeartbeatTracker::new(repo.clone());
        let webhook_service = WebhookService::new(repo.clone(), settings_service.clone());
        let orchestrator = Orchestrator::new(repo.clone(), dispatcher, config.recovery_key.clone())
            .with_concurrency(config.sweep_concurrency);

        tracing::info!("Application initialized successfully");

        Ok(Self {
            config,
            repo,
            blob_store,
            settings_service,
            switch_service,
            attachments_service,
            heartbeat,
            webhook_service,
            orchestrator,
        })
    }
}
