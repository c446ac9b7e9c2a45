//! Commands: application-supplied payloads plus the built-in membership
//! and no-op commands.
//!
//! A command travels through the log as `(name, payload)`. Decoding an
//! entry looks the name up in the [`CommandRegistry`]; every member of a
//! cluster must register the same names or their applied state diverges.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::snapshot::StateMachine;
use crate::types::PeerInfo;

pub const JOIN_COMMAND: &str = "raft:join";
pub const LEAVE_COMMAND: &str = "raft:leave";
pub const NOP_COMMAND: &str = "raft:nop";

/// A replicated command.
///
/// `apply` runs on every server, in index order, exactly once per commit;
/// it must be deterministic.
pub trait Command: fmt::Debug + Send + Sync {
    /// Registry key; stored in the log entry.
    fn name(&self) -> &str;

    /// Payload bytes stored in the log entry.
    fn serialize(&self) -> Result<Bytes>;

    /// Executes against the state machine, returning the caller-visible
    /// result.
    fn apply(&self, ctx: &mut CommandContext<'_>) -> Result<Bytes>;
}

/// Cluster-membership mutation requested by a built-in command; collected
/// during apply and enacted by the server loop afterwards.
#[derive(Debug, Clone)]
pub(crate) enum MembershipOp {
    Add(PeerInfo),
    Remove(String),
}

/// Execution context handed to [`Command::apply`].
pub struct CommandContext<'a> {
    machine: &'a mut dyn StateMachine,
    pub(crate) membership: Vec<MembershipOp>,
}

impl<'a> CommandContext<'a> {
    pub(crate) fn new(machine: &'a mut dyn StateMachine) -> Self {
        Self {
            machine,
            membership: Vec::new(),
        }
    }

    /// The application state machine, downcast to its concrete type.
    pub fn machine<T: StateMachine>(&mut self) -> Result<&mut T> {
        self.machine
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| Error::Decode {
                cause: "state machine type mismatch".into(),
            })
    }

    pub(crate) fn add_peer(&mut self, peer: PeerInfo) {
        self.membership.push(MembershipOp::Add(peer));
    }

    pub(crate) fn remove_peer(&mut self, name: impl Into<String>) {
        self.membership.push(MembershipOp::Remove(name.into()));
    }
}

type DecodeFn = fn(&[u8]) -> Result<Box<dyn Command>>;

fn decode_json<C: Command + DeserializeOwned + 'static>(payload: &[u8]) -> Result<Box<dyn Command>> {
    Ok(Box::new(serde_json::from_slice::<C>(payload)?))
}

/// Maps command names to decoders. Join, Leave, and Nop are pre-registered.
#[derive(Clone)]
pub struct CommandRegistry {
    decoders: HashMap<String, DecodeFn>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            decoders: HashMap::new(),
        };
        registry.register::<JoinCommand>(JOIN_COMMAND);
        registry.register::<LeaveCommand>(LEAVE_COMMAND);
        registry.register::<NopCommand>(NOP_COMMAND);
        registry
    }

    /// Registers a decoder for `name`. Payloads are JSON.
    pub fn register<C: Command + DeserializeOwned + 'static>(&mut self, name: impl Into<String>) {
        self.decoders.insert(name.into(), decode_json::<C>);
    }

    pub fn decode(&self, name: &str, payload: &[u8]) -> Result<Box<dyn Command>> {
        let decode = self.decoders.get(name).ok_or_else(|| Error::Decode {
            cause: format!("unregistered command: {}", name),
        })?;
        decode(payload)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("names", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Adds a peer to the cluster once committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCommand {
    pub name: String,
    pub connection_string: String,
}

impl JoinCommand {
    pub fn new(name: impl Into<String>, connection_string: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_string: connection_string.into(),
        }
    }
}

impl Command for JoinCommand {
    fn name(&self) -> &str {
        JOIN_COMMAND
    }

    fn serialize(&self) -> Result<Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }

    fn apply(&self, ctx: &mut CommandContext<'_>) -> Result<Bytes> {
        ctx.add_peer(PeerInfo::new(&self.name, &self.connection_string));
        Ok(Bytes::new())
    }
}

/// Removes a peer from the cluster once committed. A server applying its
/// own removal stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveCommand {
    pub name: String,
}

impl LeaveCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Command for LeaveCommand {
    fn name(&self) -> &str {
        LEAVE_COMMAND
    }

    fn serialize(&self) -> Result<Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }

    fn apply(&self, ctx: &mut CommandContext<'_>) -> Result<Bytes> {
        ctx.remove_peer(&self.name);
        Ok(Bytes::new())
    }
}

/// Committed by a fresh leader so an entry of its own term exists; entries
/// from earlier terms become committable only above one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NopCommand;

impl Command for NopCommand {
    fn name(&self) -> &str {
        NOP_COMMAND
    }

    fn serialize(&self) -> Result<Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }

    fn apply(&self, _ctx: &mut CommandContext<'_>) -> Result<Bytes> {
        Ok(Bytes::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    #[derive(Debug, Default)]
    struct NullMachine;

    impl StateMachine for NullMachine {
        fn save(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn recover(&mut self, _state: &[u8]) -> Result<()> {
            Ok(())
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn builtins_are_preregistered() {
        let registry = CommandRegistry::new();
        assert!(registry.contains(JOIN_COMMAND));
        assert!(registry.contains(LEAVE_COMMAND));
        assert!(registry.contains(NOP_COMMAND));
    }

    #[test]
    fn join_roundtrip_and_apply() {
        let registry = CommandRegistry::new();
        let join = JoinCommand::new("a1b2c3d", "http://localhost:4001");
        let payload = Command::serialize(&join).unwrap();

        let decoded = registry.decode(JOIN_COMMAND, &payload).unwrap();
        let mut machine = NullMachine;
        let mut ctx = CommandContext::new(&mut machine);
        decoded.apply(&mut ctx).unwrap();

        match &ctx.membership[..] {
            [MembershipOp::Add(peer)] => {
                assert_eq!(peer.name, "a1b2c3d");
                assert_eq!(peer.connection_string, "http://localhost:4001");
            }
            other => panic!("unexpected membership ops: {:?}", other),
        }
    }

    #[test]
    fn unregistered_name_is_a_decode_error() {
        let registry = CommandRegistry::new();
        let err = registry.decode("no-such-command", b"{}").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn machine_downcast_mismatch() {
        #[derive(Debug)]
        struct OtherMachine;
        impl StateMachine for OtherMachine {
            fn save(&self) -> Result<Vec<u8>> {
                Ok(Vec::new())
            }
            fn recover(&mut self, _state: &[u8]) -> Result<()> {
                Ok(())
            }
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }

        let mut machine = OtherMachine;
        let mut ctx = CommandContext::new(&mut machine);
        assert!(ctx.machine::<NullMachine>().is_err());
        assert!(ctx.machine::<OtherMachine>().is_ok());
    }
}
