//! Command implementations over the wired-up core.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::debug;
use onboard_core::directory::{HttpDirectory, Provisioner};
use onboard_core::importer::{HttpFeed, SyncImporter};
use onboard_core::mail::{ChannelMailQueue, LoggingTransport, MailQueue};
use onboard_core::storage::LocalFileStore;
use onboard_core::twofactor::{SystemClock, TwoFactorManager};
use onboard_core::{
    ActorContext, ApprovalGrant, LifecycleEngine, ListFilter, NewRequest, OnboardConfig,
    RequestPatch, RequestStatus, RequestStore,
};

/// The wired-up application: engine, importer, and two-factor manager over
/// one store.
pub(crate) struct App {
    engine: LifecycleEngine,
    importer: SyncImporter,
    twofactor: TwoFactorManager,
    actor: ActorContext,
}

impl App {
    /// Loads configuration and wires every collaborator.
    pub(crate) fn new(config_path: &Path, actor: Option<String>) -> Result<Self> {
        let config = if config_path.exists() {
            OnboardConfig::from_file(config_path)
                .with_context(|| format!("failed to load config from {}", config_path.display()))?
        } else {
            OnboardConfig::default()
        };

        debug!(config = %config_path.display(), "configuration loaded");

        let store = RequestStore::open(&config.database.path).with_context(|| {
            format!("failed to open database at {}", config.database.path.display())
        })?;

        let mail: Arc<dyn MailQueue> =
            Arc::new(ChannelMailQueue::spawn(Box::new(LoggingTransport)));
        let directory = Arc::new(HttpDirectory::new(&config.directory));
        let provisioner = Arc::new(Provisioner::new(
            directory,
            mail.clone(),
            config.directory.origin_marker.clone(),
        ));
        let files = Arc::new(LocalFileStore::new(config.database.media_root.clone()));

        let engine = LifecycleEngine::new(store.clone(), provisioner, files);
        let importer = SyncImporter::new(store.clone(), Box::new(HttpFeed::new(&config.upstream)));
        let twofactor = TwoFactorManager::new(
            store,
            mail,
            Arc::new(SystemClock),
            Duration::from_secs(config.auth.two_factor_validity_secs),
        );

        Ok(Self {
            engine,
            importer,
            twofactor,
            actor: ActorContext {
                username: actor,
                source_ip: None,
            },
        })
    }

    pub(crate) fn list(
        &self,
        no_sync: bool,
        status: Option<&str>,
        company: Option<String>,
        email: Option<String>,
        role: Option<String>,
    ) -> Result<()> {
        if !no_sync {
            // Feed failures are logged inside; listing never depends on them.
            self.importer.sync()?;
        }
        let status = match status {
            Some(s) => Some(
                RequestStatus::parse(s)
                    .with_context(|| format!("unknown status '{s}' (expected Pending, Rejected, or Completed)"))?,
            ),
            None => None,
        };
        let filter = ListFilter {
            status,
            company_name: company,
            email,
            role,
        };
        let requests = self.engine.list(&filter)?;
        println!("{}", serde_json::to_string_pretty(&requests)?);
        Ok(())
    }

    pub(crate) fn show(&self, id: i64) -> Result<()> {
        let detail = self.engine.get(id)?;
        println!("{}", serde_json::to_string_pretty(&detail)?);
        Ok(())
    }

    pub(crate) fn create(&self, file: &Path) -> Result<()> {
        let body = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        let new: NewRequest = serde_json::from_str(&body)
            .with_context(|| format!("invalid request body in {}", file.display()))?;
        let detail = self.engine.create(&new, &self.actor)?;
        println!("{}", serde_json::to_string_pretty(&detail)?);
        Ok(())
    }

    pub(crate) fn update(&self, id: i64, file: &Path) -> Result<()> {
        let body = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        let patch: RequestPatch = serde_json::from_str(&body)
            .with_context(|| format!("invalid patch body in {}", file.display()))?;
        let detail = self.engine.update(id, &patch, &self.actor)?;
        println!("{}", serde_json::to_string_pretty(&detail)?);
        Ok(())
    }

    pub(crate) fn attach(&self, id: i64, file: &Path) -> Result<()> {
        let Some(filename) = file.file_name().and_then(|n| n.to_str()) else {
            bail!("cannot derive a file name from {}", file.display());
        };
        let bytes = std::fs::read(file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        let patch = RequestPatch {
            add_attachments: vec![onboard_core::request::NewAttachment {
                filename: filename.to_string(),
                bytes,
            }],
            ..RequestPatch::default()
        };
        let detail = self.engine.update(id, &patch, &self.actor)?;
        println!("{}", serde_json::to_string_pretty(&detail.attachments)?);
        Ok(())
    }

    pub(crate) fn detach(&self, id: i64, attachment_id: i64) -> Result<()> {
        let patch = RequestPatch {
            remove_attachments: vec![attachment_id],
            ..RequestPatch::default()
        };
        let detail = self.engine.update(id, &patch, &self.actor)?;
        println!("{}", serde_json::to_string_pretty(&detail.attachments)?);
        Ok(())
    }

    pub(crate) fn approve(
        &self,
        id: i64,
        customer_code: Option<String>,
        roles: Vec<String>,
    ) -> Result<()> {
        let grant = ApprovalGrant {
            customer_code,
            roles: if roles.is_empty() { None } else { Some(roles) },
        };
        let detail = self.engine.approve(id, &grant, &self.actor)?;
        println!("{}", serde_json::to_string_pretty(&detail)?);
        Ok(())
    }

    pub(crate) fn reject(&self, id: i64, notes: Option<&str>) -> Result<()> {
        let detail = self.engine.reject(id, notes, &self.actor)?;
        println!("{}", serde_json::to_string_pretty(&detail)?);
        Ok(())
    }

    pub(crate) fn delete(&self, id: i64) -> Result<()> {
        self.engine.soft_delete(id, &self.actor)?;
        println!("request {id} deleted (marked inactive)");
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        let report = self.importer.sync()?;
        println!(
            "fetched {} record(s): {} created, {} updated, {} skipped",
            report.fetched, report.created, report.updated, report.skipped
        );
        Ok(())
    }

    pub(crate) fn stats(&self) -> Result<()> {
        let stats = self.engine.stats()?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        Ok(())
    }

    pub(crate) fn verify(&self, username: &str, code: &str) -> Result<()> {
        self.twofactor.verify(username, code)?;
        println!("code accepted for '{username}'");
        Ok(())
    }
}
