//! Purpose: Hold top-level CLI command dispatch for `clickdump`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Storage is closed after every command, including failed runs.
//! Invariants: A run error takes precedence over a close error.

use super::*;
use clickdump::backup::{BackupOptions, run_backup, validate_backup_name};
use clickdump::core::naming::backup_prefix;
use clickdump::restore::{RestoreOptions, run_restore};
use tracing::warn;

pub(super) fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Dump {
            backup,
            compression,
            compression_level,
            parallelism,
            connection,
            filters,
            storage,
        } => {
            let backup = match backup {
                Some(backup) => backup,
                None => default_backup_name()?,
            };
            let client = connection.connect()?;
            let storage = storage.open()?;
            let options = BackupOptions {
                backup,
                compression: compression.into(),
                compression_level,
                parallelism,
                filters: filters.to_filters(),
            };
            let result = run_backup(&client, storage.as_ref(), &options);
            let summary = finish(storage.as_ref(), result)?;
            emit_json(json!({ "backup": summary }));
            Ok(RunOutcome::ok())
        }
        Command::Restore {
            backup,
            parallelism,
            connection,
            filters,
            storage,
        } => {
            let client = connection.connect()?;
            let storage = storage.open()?;
            let options = RestoreOptions {
                backup,
                parallelism,
                filters: filters.to_filters(),
            };
            let result = run_restore(&client, storage.as_ref(), &options);
            let summary = finish(storage.as_ref(), result)?;
            emit_json(json!({ "restore": summary }));
            Ok(RunOutcome::ok())
        }
        Command::List { backup, storage } => {
            if let Some(backup) = &backup {
                validate_backup_name(backup)?;
            }
            let storage = storage.open()?;
            let prefix = backup.as_deref().map(backup_prefix).unwrap_or_default();
            let result = storage.list_objects(&prefix, false);
            let names = finish(storage.as_ref(), result)?;
            let value = match backup {
                Some(backup) => json!({ "backup": backup, "objects": names }),
                None => {
                    let backups = names
                        .iter()
                        .filter_map(|name| name.strip_suffix('/'))
                        .collect::<Vec<_>>();
                    json!({ "backups": backups })
                }
            };
            emit_json(value);
            Ok(RunOutcome::ok())
        }
    }
}

fn finish<T>(storage: &dyn Storage, result: Result<T, Error>) -> Result<T, Error> {
    let closed = storage.close();
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), closed) => {
            if let Err(close_err) = closed {
                warn!(error = %close_err, "failed to close storage");
            }
            Err(err)
        }
    }
}
