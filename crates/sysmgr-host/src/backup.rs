// Backup/restore responder.
//
// Registers `preBackup` and `postRestore` on the service bus for the backup
// daemon. preBackup reports the launcher, quick launch and dock mode files
// that exist right now; postRestore only acknowledges, since regular files
// are put back by the backup daemon itself.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;

use sysmgr_bus::{
    methods, BusClient, BusError, BusMessage, JsonType, Method, PostRestoreResult,
    PreBackupResult, Schema, ServiceBus, ServiceHandle,
};

use crate::fs::Filesystem;
use crate::page_saver::PageStateProvider;
use crate::settings::Settings;

pub const BACKUP_DESCRIPTION: &str =
    "Backup of LunaSysMgr files for launcher, quicklaunch and dockmode";
pub const BACKUP_VERSION: &str = "1.0";

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("backup manager already initialized")]
    AlreadyInitialized,
    #[error("failed registering on service bus: {0}")]
    Register(#[source] BusError),
    #[error("failed registering with service bus category: {0}")]
    Category(#[source] BusError),
    #[error("failed attaching to service bus: {0}")]
    Attach(#[source] BusError),
    #[error("unable to get private handle to the backup service: {0}")]
    PrivateConnection(#[source] BusError),
}

/// State the bus handlers share with the manager.
struct Responder {
    fs: Arc<dyn Filesystem>,
    pages: Arc<dyn PageStateProvider>,
    launcher_cards: PathBuf,
    optional_files: [PathBuf; 3],
    backup_files: bool,
    backup_cookies: bool,
}

impl Responder {
    /// Rebuild the backup list from scratch. Insertion order, no dedup.
    fn collect_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();

        if !self.backup_files {
            tracing::info!("backup: file backup disabled, not adding files to backup list");
            return files;
        }

        tracing::info!("backup: adding files to backup list");
        files.push(self.launcher_cards.clone());
        for path in &self.optional_files {
            if self.fs.exists(path) {
                files.push(path.clone());
            }
        }

        for path in self.pages.files_for_backup() {
            if self.fs.exists(&path) {
                tracing::info!("backup: backing up signalled file: {}", path.display());
                files.push(path);
            }
        }

        files
    }

    fn pre_backup(&self) -> PreBackupResult {
        let collected = self.collect_files();

        let mut files = Vec::new();
        if self.backup_files {
            for path in collected {
                // Stricter than collection: a path must still be a regular file.
                if self.fs.is_regular_file(&path) {
                    tracing::debug!("backup: added file {} to the backup list", path.display());
                    files.push(path.to_string_lossy().into_owned());
                }
            }
        }

        PreBackupResult {
            description: BACKUP_DESCRIPTION.to_string(),
            version: BACKUP_VERSION.to_string(),
            files,
        }
    }

    fn handle_pre_backup(&self, message: BusMessage) {
        // The daemon sends incrementalKey, maxTempBytes and tempDir; none
        // of them matter for plain files.
        send_reply(message, &self.pre_backup());
    }

    fn handle_post_restore(&self, message: BusMessage) {
        tracing::info!("backup: postRestore received {}", message.payload());

        if message.payload().get("files").is_none() {
            tracing::warn!("backup: no files specified in postRestore message");
        }

        // No work needed for regular files.
        send_reply(message, &PostRestoreResult { return_value: true });
    }
}

/// Encode `result` and answer `message` with it. An unencodable result is
/// dropped unanswered, which the bus reports to the caller as an internal error.
fn send_reply(message: BusMessage, result: &impl Serialize) {
    let uri = message.uri().to_string();
    let response = match serde_json::to_value(result) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("backup: can't encode reply to {}: {}", uri, e);
            return;
        }
    };
    tracing::info!("backup: sending response to {}: {}", uri, response);
    if let Err(e) = message.reply(response) {
        tracing::warn!("backup: can't send reply to {}: {}", uri, e);
    }
}

/// Owns the backup service registration for the lifetime of the host.
pub struct BackupManager {
    responder: Arc<Responder>,
    service_name: String,
    runtime: Option<Handle>,
    service: Option<ServiceHandle>,
    client: Option<BusClient>,
}

impl BackupManager {
    pub fn new(
        settings: &Settings,
        fs: Arc<dyn Filesystem>,
        pages: Arc<dyn PageStateProvider>,
    ) -> Self {
        Self {
            responder: Arc::new(Responder {
                fs,
                pages,
                launcher_cards: settings.launcher_cards.clone(),
                optional_files: [
                    settings.first_card_launch.clone(),
                    settings.quicklaunch_user_positions.clone(),
                    settings.dock_mode_user_positions.clone(),
                ],
                backup_files: settings.backup.files,
                backup_cookies: settings.backup.cookies,
            }),
            service_name: settings.service_name.clone(),
            runtime: None,
            service: None,
            client: None,
        }
    }

    /// Register on the bus and start answering on `runtime`. May only be
    /// called once, whether or not the first call succeeded.
    pub fn init(&mut self, bus: &ServiceBus, runtime: &Handle) -> Result<(), InitError> {
        if self.runtime.is_some() {
            return Err(InitError::AlreadyInitialized);
        }
        self.runtime = Some(runtime.clone());

        let result = self.register(bus, runtime);
        if let Err(e) = &result {
            tracing::warn!("backup: {}", e);
        }
        result
    }

    fn register(&mut self, bus: &ServiceBus, runtime: &Handle) -> Result<(), InitError> {
        let service = bus
            .register_service(&self.service_name)
            .map_err(InitError::Register)?;

        let pre = self.responder.clone();
        let post = self.responder.clone();
        let table = vec![
            Method::new(methods::PRE_BACKUP, move |message| pre.handle_pre_backup(message)),
            Method::new(methods::POST_RESTORE, move |message| {
                post.handle_post_restore(message)
            })
            .with_schema(Schema::object().required("files", JsonType::Array)),
        ];
        service
            .register_category("/", table)
            .map_err(InitError::Category)?;
        service.attach(runtime).map_err(InitError::Attach)?;

        let client = service
            .private_connection()
            .map_err(InitError::PrivateConnection)?;

        tracing::info!(
            "backup: {} ready (files: {}, cookies: {})",
            self.service_name,
            self.responder.backup_files,
            self.responder.backup_cookies
        );
        self.client = Some(client);
        self.service = Some(service);
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.service.is_some()
    }

    /// Private bus connection, available once `init` has succeeded.
    pub fn client(&self) -> Option<&BusClient> {
        self.client.as_ref()
    }

    /// What a preBackup request would report right now.
    pub fn pre_backup(&self) -> PreBackupResult {
        self.responder.pre_backup()
    }

    pub fn handle_pre_backup(&self, message: BusMessage) {
        self.responder.handle_pre_backup(message)
    }

    pub fn handle_post_restore(&self, message: BusMessage) {
        self.responder.handle_post_restore(message)
    }

    /// Release the bus registration. Also runs on drop.
    pub fn shutdown(&mut self) {
        self.client = None;
        if let Some(service) = self.service.take() {
            match service.unregister() {
                Ok(()) => tracing::info!("backup: unregistered {}", self.service_name),
                Err(e) => tracing::warn!("backup: failed unregistering backup service: {}", e),
            }
        }
    }
}

impl Drop for BackupManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
