//! Message dispatch.
//!
//! A process runs in exactly one `Role`; each role registers its handler
//! table at startup. Dispatch on an unregistered code reports `NotMine`
//! rather than erroring — the same wire plumbing is shared with unrelated
//! legacy catalogs, so unknown-type is a fallthrough signal, not a failure.

use std::collections::HashMap;

use tracing::debug;

use crate::proto::{ClientId, GameMsg};

/// Which side of the protocol this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Who sent a message, as seen by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sender {
    pub client: ClientId,
    /// Administrative privilege for the current scenario session.
    pub admin: bool,
}

impl Sender {
    /// The authoritative server as a sender (client-side handlers).
    pub const SERVER: Sender = Sender {
        client: ClientId(0),
        admin: true,
    };
}

/// Dispatch outcome.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// No handler registered for this type code in this role.
    NotMine,
}

/// Handler signature: mutate `S` in response to a message.
pub type Handler<S> = fn(&mut S, Sender, GameMsg) -> anyhow::Result<()>;

/// Per-role table from message type code to handler.
pub struct HandlerTable<S> {
    role: Role,
    handlers: HashMap<u32, Handler<S>>,
}

impl<S> HandlerTable<S> {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            handlers: HashMap::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Registers a handler; a code is handled by at most one handler.
    pub fn register(&mut self, code: u32, handler: Handler<S>) {
        let prior = self.handlers.insert(code, handler);
        assert!(prior.is_none(), "duplicate handler for type code {code}");
    }

    pub fn is_registered(&self, code: u32) -> bool {
        self.handlers.contains_key(&code)
    }

    /// Looks up and runs the handler for `msg`.
    pub fn dispatch(
        &self,
        state: &mut S,
        sender: Sender,
        msg: GameMsg,
    ) -> anyhow::Result<Dispatch> {
        let code = msg.type_code();
        match self.handlers.get(&code) {
            Some(handler) => {
                handler(state, sender, msg)?;
                Ok(Dispatch::Handled)
            }
            None => {
                debug!(code, name = msg.type_name(), role = ?self.role, "message not mine");
                Ok(Dispatch::NotMine)
            }
        }
    }
}
