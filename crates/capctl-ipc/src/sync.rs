//! Reconciling the two independently built registries.
//!
//! The controller's IDs are authoritative. It emits one [`SyncEntry`] per
//! non-built-in command followed by the terminating record; the helper
//! collects the bindings and swaps its whole ID table in one step when the
//! terminator arrives, so partially applied bindings are never visible.

use std::collections::HashMap;

use capctl_frame::command::{is_builtin, FIRST_DYNAMIC_ID};
use tracing::{debug, warn};

use crate::builtin::{validate_command_name, SyncEntry};
use crate::error::{IpcError, Result};
use crate::registry::{CommandRegistry, Phase, Role};

impl<C> CommandRegistry<C> {
    /// Controller: freeze the table and produce the records to send.
    ///
    /// The last record is always the terminator.
    pub fn sync_records(&mut self) -> Result<Vec<SyncEntry>> {
        if self.role != Role::Controller {
            return Err(IpcError::SyncFailed(
                "only the controller assigns command ids".to_string(),
            ));
        }
        self.phase = Phase::Final;
        self.table.is_final = true;

        let mut records: Vec<SyncEntry> = self
            .commands()
            .into_iter()
            .map(|(name, id)| SyncEntry::bind(name, id))
            .collect();
        records.push(SyncEntry::complete());
        Ok(records)
    }

    /// Helper: apply one record received from the controller.
    ///
    /// Returns `true` when the terminator completed the handshake.
    pub fn apply_sync(&mut self, entry: &SyncEntry) -> Result<bool> {
        if self.role != Role::Helper {
            return Err(IpcError::SyncFailed(format!(
                "controller received binding for '{}'",
                entry.name
            )));
        }
        if self.phase == Phase::Final {
            return Err(IpcError::SyncFailed(
                "binding received after sync completed".to_string(),
            ));
        }

        if entry.is_complete() {
            self.finish_sync();
            return Ok(true);
        }

        validate_command_name(&entry.name)?;
        if entry.id < FIRST_DYNAMIC_ID {
            return Err(IpcError::SyncFailed(format!(
                "'{}' bound to reserved id {}",
                entry.name, entry.id
            )));
        }
        if let Some(&existing) = self.pending.get(&entry.id) {
            if self.table.names[existing] != entry.name {
                return Err(IpcError::SyncFailed(format!(
                    "id {} bound to both '{}' and '{}'",
                    entry.id, self.table.names[existing], entry.name
                )));
            }
        }

        let index = match self.table.names.iter().position(|n| *n == entry.name) {
            Some(index) => index,
            None => {
                // Controller-only command: keep the binding so frames for it
                // are recognised and acknowledged.
                debug!(command = %entry.name, "no local registration for synced command");
                self.table.names.push(entry.name.clone());
                self.entries.push(crate::registry::Entry {
                    handler: None,
                    ack_handler: None,
                });
                self.table.names.len() - 1
            }
        };
        self.pending.retain(|_, &mut idx| idx != index);
        self.pending.insert(entry.id, index);
        debug!(command = %entry.name, id = entry.id, "bound command id");
        Ok(false)
    }

    fn finish_sync(&mut self) {
        let pending = std::mem::take(&mut self.pending);

        let mut by_id: HashMap<u32, usize> = HashMap::new();
        let mut by_name: HashMap<String, u32> = HashMap::new();
        for (&id, &index) in self.table.by_id.iter() {
            if is_builtin(id) {
                by_id.insert(id, index);
                by_name.insert(self.table.names[index].clone(), id);
            }
        }
        for (id, index) in pending {
            by_id.insert(id, index);
            by_name.insert(self.table.names[index].clone(), id);
        }

        for name in self.table.by_name.keys() {
            if !by_name.contains_key(name) {
                warn!(command = %name, "command unknown to controller; it cannot be used");
            }
        }

        self.table.by_id = by_id;
        self.table.by_name = by_name;
        self.table.is_final = true;
        self.phase = Phase::Final;
    }
}
