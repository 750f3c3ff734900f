//! Arena of the queue pairs and commands used across test steps.
//!
//! Resources are registered under a string name and referenced by small
//! integer handles. Every tracked queue pair is destroyed explicitly, either
//! by [ResourceTracker::release_since] at the end of a case or by
//! [ResourceTracker::teardown].

use std::sync::Arc;

use exerciser_core::{
    generic_command::CommandBuffer,
    queue_pair::{PairState, QueuePair, QueuePairError},
    transport::{QueueKind, Transport},
};
use log::{debug, warn};
use thiserror::Error;

/// Handle of a tracked [QueuePair]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PairHandle(usize);

/// Handle of a tracked [CommandBuffer]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CommandHandle(usize);

/// The state of the tracker at some point, see [ResourceTracker::mark]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pairs: usize,
    commands: usize,
}

#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("the name {0:?} is already in use")]
    NameInUse(String),
    #[error("queue pair {0:?} does not exist")]
    UnknownPair(PairHandle),
    #[error("command {0:?} does not exist")]
    UnknownCommand(CommandHandle),
    #[error(transparent)]
    Pair(#[from] QueuePairError),
}

#[derive(Debug)]
struct Named<T> {
    name: String,
    value: T,
}

pub struct ResourceTracker {
    transport: Arc<dyn Transport>,
    pairs: Vec<Option<Named<QueuePair>>>,
    commands: Vec<Option<Named<CommandBuffer>>>,
}

impl std::fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("pairs", &self.pairs)
            .field("commands", &self.commands)
            .finish_non_exhaustive()
    }
}

impl ResourceTracker {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            pairs: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Creates and enables a queue pair called `name`
    pub fn create_pair(
        &mut self,
        name: &str,
        kind: QueueKind,
        submission_capacity: u16,
        completion_capacity: u16,
    ) -> Result<PairHandle, TrackerError> {
        if self.pair_by_name(name).is_some() {
            return Err(TrackerError::NameInUse(name.to_owned()));
        }
        let pair = QueuePair::create(
            self.transport.clone(),
            kind,
            submission_capacity,
            completion_capacity,
        )?;
        debug!("tracking queue pair {name:?}");
        self.pairs.push(Some(Named {
            name: name.to_owned(),
            value: pair,
        }));
        Ok(PairHandle(self.pairs.len() - 1))
    }

    pub fn pair_by_name(&self, name: &str) -> Option<PairHandle> {
        self.pairs
            .iter()
            .position(|p| p.as_ref().is_some_and(|p| p.name == name))
            .map(PairHandle)
    }

    pub fn pair(&mut self, handle: PairHandle) -> Result<&mut QueuePair, TrackerError> {
        self.pairs
            .get_mut(handle.0)
            .and_then(|p| p.as_mut())
            .map(|p| &mut p.value)
            .ok_or(TrackerError::UnknownPair(handle))
    }

    /// Destroys the queue pair and forgets its name
    pub fn destroy_pair(&mut self, handle: PairHandle) -> Result<(), TrackerError> {
        let mut named = self
            .pairs
            .get_mut(handle.0)
            .and_then(|p| p.take())
            .ok_or(TrackerError::UnknownPair(handle))?;
        debug!("destroy tracked queue pair {:?}", named.name);
        if named.value.state() != PairState::Destroyed {
            named.value.destroy()?;
        }
        Ok(())
    }

    /// Replaces the queue pair behind `handle` with a new pair of the same
    /// kind.
    ///
    /// The old pair is destroyed first, so this can be used to resize the
    /// admin queue. If creating the new pair fails the handle is gone.
    pub fn recreate_pair(
        &mut self,
        handle: PairHandle,
        submission_capacity: u16,
        completion_capacity: u16,
    ) -> Result<(), TrackerError> {
        let mut named = self
            .pairs
            .get_mut(handle.0)
            .and_then(|p| p.take())
            .ok_or(TrackerError::UnknownPair(handle))?;
        let kind = named.value.kind();
        if named.value.state() != PairState::Destroyed {
            named.value.destroy()?;
        }
        debug!(
            "recreate queue pair {:?}: sq {submission_capacity} cq {completion_capacity}",
            named.name
        );
        let pair = QueuePair::create(
            self.transport.clone(),
            kind,
            submission_capacity,
            completion_capacity,
        )?;
        self.pairs[handle.0] = Some(Named {
            name: named.name,
            value: pair,
        });
        Ok(())
    }

    /// Stores `command` under `name`, replacing any previous command with
    /// that name
    pub fn insert_command(&mut self, name: &str, command: CommandBuffer) -> CommandHandle {
        if let Some(handle) = self.command_by_name(name) {
            self.commands[handle.0] = Some(Named {
                name: name.to_owned(),
                value: command,
            });
            return handle;
        }
        self.commands.push(Some(Named {
            name: name.to_owned(),
            value: command,
        }));
        CommandHandle(self.commands.len() - 1)
    }

    pub fn command_by_name(&self, name: &str) -> Option<CommandHandle> {
        self.commands
            .iter()
            .position(|c| c.as_ref().is_some_and(|c| c.name == name))
            .map(CommandHandle)
    }

    pub fn command(&self, handle: CommandHandle) -> Result<&CommandBuffer, TrackerError> {
        self.commands
            .get(handle.0)
            .and_then(|c| c.as_ref())
            .map(|c| &c.value)
            .ok_or(TrackerError::UnknownCommand(handle))
    }

    pub fn command_mut(&mut self, handle: CommandHandle) -> Result<&mut CommandBuffer, TrackerError> {
        self.commands
            .get_mut(handle.0)
            .and_then(|c| c.as_mut())
            .map(|c| &mut c.value)
            .ok_or(TrackerError::UnknownCommand(handle))
    }

    /// The names and pairs that are currently tracked
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &QueuePair)> {
        self.pairs
            .iter()
            .flatten()
            .map(|p| (p.name.as_str(), &p.value))
    }

    pub fn mark(&self) -> Checkpoint {
        Checkpoint {
            pairs: self.pairs.len(),
            commands: self.commands.len(),
        }
    }

    /// Destroys every queue pair and drops every command created after
    /// `checkpoint`, newest first
    pub fn release_since(&mut self, checkpoint: Checkpoint) -> Result<(), TrackerError> {
        let mut first_error = None;
        while self.pairs.len() > checkpoint.pairs {
            let Some(named) = self.pairs.pop().flatten() else {
                continue;
            };
            let mut pair = named.value;
            if pair.state() == PairState::Destroyed {
                continue;
            }
            if let Err(err) = pair.destroy() {
                warn!("failed to destroy queue pair {:?}: {err}", named.name);
                first_error.get_or_insert(err);
            }
        }
        self.commands.truncate(checkpoint.commands);
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Destroys everything, I/O queue pairs before the admin pair
    pub fn teardown(&mut self) -> Result<(), TrackerError> {
        self.release_since(Checkpoint {
            pairs: 0,
            commands: 0,
        })
    }
}

impl Drop for ResourceTracker {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            warn!("teardown of resource tracker failed: {err}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use exerciser_core::{
        admin_commands::keep_alive,
        emulated::{EmulatedConfig, EmulatedDevice},
    };

    fn tracker() -> (Arc<EmulatedDevice>, ResourceTracker) {
        crate::test_utils::init_test_logger();
        let device = Arc::new(EmulatedDevice::new(EmulatedConfig::default()));
        let tracker = ResourceTracker::new(device.clone());
        (device, tracker)
    }

    #[test]
    fn names_are_unique() {
        let (_device, mut tracker) = tracker();
        let admin = tracker
            .create_pair("admin", QueueKind::Admin, 4, 4)
            .unwrap();
        assert_eq!(tracker.pair_by_name("admin"), Some(admin));
        assert_eq!(
            tracker.create_pair("admin", QueueKind::Admin, 4, 4),
            Err(TrackerError::NameInUse("admin".into()))
        );
    }

    #[test]
    fn release_since_checkpoint() {
        let (device, mut tracker) = tracker();
        tracker
            .create_pair("admin", QueueKind::Admin, 4, 4)
            .unwrap();
        let checkpoint = tracker.mark();

        let io = QueueKind::Io {
            interrupt_vector: None,
        };
        tracker.create_pair("io", io, 8, 8).unwrap();
        let command = tracker.insert_command("keep-alive", keep_alive().unwrap());
        assert_eq!(device.queue_count(), 2);

        tracker.release_since(checkpoint).unwrap();
        assert_eq!(device.queue_count(), 1);
        assert!(tracker.pair_by_name("io").is_none());
        assert!(tracker.command(command).is_err());
        assert!(tracker.pair_by_name("admin").is_some());

        let admin = tracker.pair_by_name("admin").unwrap();
        tracker.recreate_pair(admin, 3, 2).unwrap();
        assert_eq!(tracker.pair(admin).unwrap().submission().capacity(), 3);
        assert_eq!(device.queue_count(), 1);

        tracker.teardown().unwrap();
        assert_eq!(device.queue_count(), 0);
    }

    #[test]
    fn commands_are_replaced_by_name() {
        let (_device, mut tracker) = tracker();
        let first = tracker.insert_command("cmd", keep_alive().unwrap());
        let second = tracker.insert_command("cmd", keep_alive().unwrap());
        assert_eq!(first, second);
        tracker.command_mut(first).unwrap().set_dword(10, 7).unwrap();
        assert_eq!(tracker.command(second).unwrap().get_dword(10).unwrap(), 7);
    }
}
