// sysmgr-host: system manager host process
//
// Owns the backup/restore responder and serves the local service bus so the
// backup daemon can ask which configuration files to archive.

pub mod backup;
pub mod daemon;
pub mod fs;
pub mod page_saver;
pub mod settings;
