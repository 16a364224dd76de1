//! Command table of one integer addressed endpoint.

use crate::{Command, Message};
use std::collections::HashMap;

/// Failure returned by a handler; sent back as `error` / `error_type`.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    /// Human readable reason.
    pub message: String,
    /// Machine readable category, e.g. `SetupError`.
    pub kind: String,
}

impl HandlerError {
    /// Creates a handler failure.
    pub fn new(message: impl Into<String>, kind: impl Into<String>) -> Self {
        HandlerError {
            message: message.into(),
            kind: kind.into(),
        }
    }
}

type Handler = Box<dyn FnMut(&Message) -> Result<Option<Message>, HandlerError> + Send>;

/// An endpoint addressed by `id`, dispatching on the command of each message.
pub struct Service {
    id: u16,
    handlers: HashMap<Command, Handler>,
}

impl Service {
    /// Creates a service without handlers.
    pub fn new(id: u16) -> Self {
        Service {
            id,
            handlers: HashMap::new(),
        }
    }

    /// Service id.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Registers the handler for `command`, replacing an earlier one.
    ///
    /// A handler returns `Ok(None)` for messages that expect no reply.
    pub fn register_handler<F>(&mut self, command: Command, handler: F) -> &mut Self
    where
        F: FnMut(&Message) -> Result<Option<Message>, HandlerError> + Send + 'static,
    {
        self.handlers.insert(command, Box::new(handler));
        self
    }

    /// Whether a handler is registered for `command`.
    pub fn handles(&self, command: Command) -> bool {
        self.handlers.contains_key(&command)
    }

    /// Runs the handler for `message` and returns the reply to send, if any.
    pub fn handle_message(&mut self, message: &Message) -> Option<Message> {
        let id = self.id;
        let cmd = message.cmd();
        let handler = match message.command().and_then(|c| self.handlers.get_mut(&c)) {
            Some(handler) => handler,
            None => {
                log::warn!("service {}: unknown command {:?}", id, cmd);
                return Some(Message::error_reply(
                    cmd,
                    &format!("unknown command: {}", cmd),
                    "UnknownCommand",
                ));
            }
        };
        match handler(message) {
            Ok(Some(mut reply)) => {
                reply.set_cmd(cmd);
                Some(reply)
            }
            Ok(None) => None,
            Err(err) => {
                log::debug!("service {}: {} failed: {}", id, cmd, err.message);
                Some(Message::error_reply(cmd, &err.message, &err.kind))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn service() -> Service {
        let mut service = Service::new(0);
        service
            .register_handler(Command::Echo, |message| Ok(Some(message.clone())))
            .register_handler(Command::UncacheImg, |_| Ok(None))
            .register_handler(Command::Tag, |_| Err(HandlerError::new("no model", "SetupError")));
        service
    }

    #[test]
    fn test_dispatch() {
        let mut service = service();
        let request = Message::new(Command::Echo).with("data", 5);
        assert_eq!(service.handle_message(&request), Some(request));
        assert_eq!(service.handle_message(&Message::new(Command::UncacheImg)), None);
    }

    #[test]
    fn test_handler_error_becomes_reply() {
        let reply = service().handle_message(&Message::new(Command::Tag)).unwrap();
        assert_eq!(reply.cmd(), "tag");
        assert_eq!(reply.error(), Some(("no model", "SetupError")));
    }

    #[test]
    fn test_unknown_command() {
        let mut service = service();
        let reply = service.handle_message(&Message::with_cmd("dance")).unwrap();
        assert_eq!(reply.error().map(|e| e.1), Some("UnknownCommand"));
        let reply = service.handle_message(&Message::new(Command::Caption)).unwrap();
        assert_eq!(reply.cmd(), "caption");
        assert!(reply.error().is_some());
    }
}
