//! A process-wide mapping from string identifiers to commands.
//!
//! Routine builders reference commands by name (event markers carry only a
//! string), which keeps command trees free of owning references back into
//! application objects. Entries persist until explicitly removed or cleared.

use std::cell::RefCell;

use fxhash::FxHashMap;
use thiserror::Error;

use crate::commands::{Command, CommandHandle};

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Names are trimmed before use and must be non-empty.
    #[error("command names must be non-empty")]
    InvalidName,
}

struct Entry {
    command: CommandHandle,
    description: String,
}

/// An owned name-to-command map. Most callers use the thread-wide instance
/// through the free functions in this module instead.
#[derive(Default)]
pub struct CommandRegistry {
    entries: FxHashMap<String, Entry>,
}

impl CommandRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `command` under `name`, replacing any prior binding.
    /// Returns the shared handle under which the command will be scheduled.
    ///
    /// # Errors
    /// - [`RegistryError::InvalidName`] if `name` is empty after trimming.
    pub fn register(
        &mut self,
        name: &str,
        command: impl Into<Command>,
    ) -> Result<CommandHandle, RegistryError> {
        self.register_described(name, command, "")
    }

    /// Like [`CommandRegistry::register`], with a human-readable description.
    pub fn register_described(
        &mut self,
        name: &str,
        command: impl Into<Command>,
        description: &str,
    ) -> Result<CommandHandle, RegistryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::InvalidName);
        }
        let handle = CommandHandle::new(command.into().with_name(name));
        self.entries.insert(
            name.to_owned(),
            Entry {
                command: handle.clone(),
                description: description.to_owned(),
            },
        );
        Ok(handle)
    }

    /// The command registered under `name`.
    ///
    /// An unknown name is not an error for the caller: it yields a fresh
    /// no-op command that logs a warning when it runs.
    #[must_use]
    pub fn get(&self, name: &str) -> CommandHandle {
        let name = name.trim();
        match self.entries.get(name) {
            Some(entry) => entry.command.clone(),
            None => {
                tracing::warn!("no command registered under {name:?}");
                let name = name.to_owned();
                CommandHandle::new(
                    Command::instant(move || {
                        tracing::warn!("running no-op stand-in for unregistered command {name:?}");
                    })
                    .with_name("unregistered"),
                )
            }
        }
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name.trim())
    }

    /// Removes the binding for `name`. Returns whether one existed.
    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name.trim()).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// All registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn description(&self, name: &str) -> Option<String> {
        self.entries
            .get(name.trim())
            .map(|entry| entry.description.clone())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

thread_local! {
    static REGISTRY: RefCell<CommandRegistry> = RefCell::new(CommandRegistry::new());
}

/// Registers `command` under `name` in the thread-wide registry.
///
/// # Errors
/// - [`RegistryError::InvalidName`] if `name` is empty after trimming.
pub fn register(name: &str, command: impl Into<Command>) -> Result<CommandHandle, RegistryError> {
    REGISTRY.with(|registry| registry.borrow_mut().register(name, command))
}

/// Registers `command` with a description in the thread-wide registry.
///
/// # Errors
/// - [`RegistryError::InvalidName`] if `name` is empty after trimming.
pub fn register_described(
    name: &str,
    command: impl Into<Command>,
    description: &str,
) -> Result<CommandHandle, RegistryError> {
    REGISTRY.with(|registry| {
        registry
            .borrow_mut()
            .register_described(name, command, description)
    })
}

/// The command registered under `name`, or a logged no-op stand-in.
#[must_use]
pub fn get(name: &str) -> CommandHandle {
    REGISTRY.with(|registry| registry.borrow().get(name))
}

#[must_use]
pub fn has(name: &str) -> bool {
    REGISTRY.with(|registry| registry.borrow().has(name))
}

pub fn remove(name: &str) -> bool {
    REGISTRY.with(|registry| registry.borrow_mut().remove(name))
}

pub fn clear() {
    REGISTRY.with(|registry| registry.borrow_mut().clear());
}

#[must_use]
pub fn names() -> Vec<String> {
    REGISTRY.with(|registry| registry.borrow().names())
}

#[must_use]
pub fn description(name: &str) -> Option<String> {
    REGISTRY.with(|registry| registry.borrow().description(name))
}

#[must_use]
pub fn count() -> usize {
    REGISTRY.with(|registry| registry.borrow().count())
}
