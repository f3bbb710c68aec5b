use std::collections::HashMap;
use std::fmt;

use capctl_frame::command::{builtin_name, DIE, FIRST_DYNAMIC_ID, MESSAGE, SYNC};

use crate::builtin::validate_command_name;
use crate::channel::CommandContext;
use crate::error::{IpcError, Result};

/// Which end of the channel a registry or channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Unprivileged process that owns sources and assigns command IDs.
    Controller,
    /// Privileged process performing hardware operations.
    Helper,
}

impl Role {
    /// The role on the other end of the channel.
    pub fn peer(self) -> Role {
        match self {
            Role::Controller => Role::Helper,
            Role::Helper => Role::Controller,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Controller => f.write_str("controller"),
            Role::Helper => f.write_str("helper"),
        }
    }
}

/// Command callback invoked with the process state and the received frame.
pub type Handler<C> = Box<dyn Fn(&mut C, &mut CommandContext<'_>) -> Result<()> + Send>;

/// First placeholder ID for commands an exec'd helper registers before sync.
pub const FIRST_PLACEHOLDER_ID: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Accepting registrations with authoritative IDs.
    Building,
    /// Helper has been spawned; only placeholder registrations allowed.
    Spawned,
    /// Table reconciled; no further changes.
    Final,
}

/// Name/ID bindings, separate from handlers so senders can resolve names
/// while a handler is borrowed.
#[derive(Debug, Default)]
pub struct NameTable {
    pub(crate) names: Vec<String>,
    pub(crate) by_name: HashMap<String, u32>,
    pub(crate) by_id: HashMap<u32, usize>,
    pub(crate) is_final: bool,
}

impl NameTable {
    /// Numeric ID currently bound to `name`.
    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// Name bound to `id`.
    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.by_id.get(&id).map(|&idx| self.names[idx].as_str())
    }

    /// Whether the table has been reconciled with the peer.
    pub fn is_final(&self) -> bool {
        self.is_final
    }

    pub(crate) fn index_of(&self, id: u32) -> Option<usize> {
        self.by_id.get(&id).copied()
    }
}

pub(crate) struct Entry<C> {
    pub(crate) handler: Option<Handler<C>>,
    pub(crate) ack_handler: Option<Handler<C>>,
}

/// Per-endpoint table of command names, IDs and handlers.
///
/// Built-in commands occupy IDs 1-3 on both ends. A controller registry hands
/// out IDs from 4 in registration order and becomes authoritative when it
/// emits its `SYNC` records. A helper registry is rebound to those IDs by
/// [`apply_sync`](CommandRegistry::apply_sync).
pub struct CommandRegistry<C> {
    pub(crate) role: Role,
    pub(crate) table: NameTable,
    pub(crate) entries: Vec<Entry<C>>,
    pub(crate) phase: Phase,
    pub(crate) placeholders: bool,
    pub(crate) next_id: u32,
    pub(crate) next_placeholder: u32,
    pub(crate) pending: HashMap<u32, usize>,
}

impl<C> CommandRegistry<C> {
    /// Registry for the controller side.
    pub fn controller() -> Self {
        Self::new(Role::Controller, false)
    }

    /// Registry for a helper built in the same process before spawning.
    ///
    /// Registration after [`mark_spawned`](Self::mark_spawned) fails.
    pub fn helper() -> Self {
        Self::new(Role::Helper, false)
    }

    /// Registry for a helper started by exec: every registration gets a
    /// placeholder ID until the controller's `SYNC` records arrive.
    pub fn exec_helper() -> Self {
        let mut registry = Self::new(Role::Helper, true);
        registry.phase = Phase::Spawned;
        registry
    }

    fn new(role: Role, placeholders: bool) -> Self {
        let mut registry = Self {
            role,
            table: NameTable::default(),
            entries: Vec::new(),
            phase: Phase::Building,
            placeholders,
            next_id: FIRST_DYNAMIC_ID,
            next_placeholder: FIRST_PLACEHOLDER_ID,
            pending: HashMap::new(),
        };
        for id in [DIE, MESSAGE, SYNC] {
            if let Some(name) = builtin_name(id) {
                registry.insert(name, id, None);
            }
        }
        registry
    }

    /// Register a command with a handler for frames received from the peer.
    pub fn register<F>(&mut self, name: &str, handler: F) -> Result<u32>
    where
        F: Fn(&mut C, &mut CommandContext<'_>) -> Result<()> + Send + 'static,
    {
        self.register_entry(name, Some(Box::new(handler)))
    }

    /// Register a command this end only sends.
    pub fn register_outgoing(&mut self, name: &str) -> Result<u32> {
        self.register_entry(name, None)
    }

    /// Attach a callback run when the peer acknowledges `name`.
    pub fn on_ack<F>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(&mut C, &mut CommandContext<'_>) -> Result<()> + Send + 'static,
    {
        let index = self
            .table
            .names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| IpcError::UnknownName(name.to_string()))?;
        self.entries[index].ack_handler = Some(Box::new(handler));
        Ok(())
    }

    fn register_entry(&mut self, name: &str, handler: Option<Handler<C>>) -> Result<u32> {
        validate_command_name(name)?;
        if self.table.names.iter().any(|n| n == name) {
            return Err(IpcError::DuplicateName(name.to_string()));
        }
        let id = match self.phase {
            Phase::Building => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
            Phase::Spawned if self.placeholders => {
                let id = self.next_placeholder;
                self.next_placeholder -= 1;
                id
            }
            Phase::Spawned | Phase::Final => {
                return Err(IpcError::RegisteredAfterSpawn(name.to_string()))
            }
        };
        self.insert(name, id, handler);
        Ok(id)
    }

    pub(crate) fn insert(&mut self, name: &str, id: u32, handler: Option<Handler<C>>) -> usize {
        let index = self.table.names.len();
        self.table.names.push(name.to_string());
        self.table.by_name.insert(name.to_string(), id);
        self.table.by_id.insert(id, index);
        self.entries.push(Entry {
            handler,
            ack_handler: None,
        });
        index
    }

    /// Freeze registration: the helper now exists.
    pub fn mark_spawned(&mut self) {
        if self.phase == Phase::Building {
            self.phase = Phase::Spawned;
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Name/ID bindings.
    pub fn names(&self) -> &NameTable {
        &self.table
    }

    /// Numeric ID currently bound to `name`.
    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.table.id_of(name)
    }

    /// Name bound to `id`.
    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.table.name_of(id)
    }

    /// Whether the table has been reconciled with the peer.
    pub fn is_final(&self) -> bool {
        self.phase == Phase::Final
    }

    /// Registered non-built-in commands as `(name, id)`, in ID order.
    pub fn commands(&self) -> Vec<(&str, u32)> {
        let mut out: Vec<(&str, u32)> = self
            .table
            .by_name
            .iter()
            .filter(|(_, &id)| id >= FIRST_DYNAMIC_ID)
            .map(|(name, &id)| (name.as_str(), id))
            .collect();
        out.sort_by_key(|&(_, id)| id);
        out
    }

    pub(crate) fn entry(&self, index: usize) -> &Entry<C> {
        &self.entries[index]
    }
}

impl<C> fmt::Debug for CommandRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("commands", &self.commands())
            .finish()
    }
}
