use crate::{Command, Error, Result};
use rmpv::Value;

const CMD_KEY: &str = "cmd";
const ERROR_KEY: &str = "error";
const ERROR_TYPE_KEY: &str = "error_type";

/// Field naming the image a request works on: a path, a cache key, or the
/// image bytes once the host spliced them in.
pub const IMAGE_KEY: &str = "img";

/// Decoded frame body: the command name plus the remaining map fields, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    cmd: String,
    fields: Vec<(Value, Value)>,
}

impl Message {
    /// Empty message for a known command.
    pub fn new(command: Command) -> Self {
        Message::with_cmd(command.name())
    }

    /// Empty message for an arbitrary command name.
    pub fn with_cmd(cmd: &str) -> Self {
        Message {
            cmd: cmd.to_owned(),
            fields: vec![],
        }
    }

    /// Failure reply: `{"cmd", "error", "error_type"}`.
    pub fn error_reply(cmd: &str, message: &str, kind: &str) -> Self {
        Message::with_cmd(cmd)
            .with(ERROR_KEY, message)
            .with(ERROR_TYPE_KEY, kind)
    }

    /// The `"cmd"` string.
    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    /// The command, if the name belongs to the protocol.
    pub fn command(&self) -> Option<Command> {
        Command::parse(&self.cmd)
    }

    /// Replaces the command name.
    pub fn set_cmd(&mut self, cmd: &str) {
        self.cmd = cmd.to_owned();
    }

    /// Looks up a string-keyed field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// Looks up a string-valued field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Looks up a binary field.
    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get(key) {
            Some(Value::Binary(bytes)) => Some(bytes),
            _ => None,
        }
    }

    /// Looks up an unsigned integer field.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    /// Whether the field is present.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Sets a field, replacing a previous value with the same key.
    pub fn set<V: Into<Value>>(&mut self, key: &str, value: V) {
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| k.as_str() == Some(key)) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((Value::from(key), value)),
        }
    }

    /// Builder form of [`Message::set`].
    pub fn with<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        self.set(key, value);
        self
    }

    /// Removes a field.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self
            .fields
            .iter()
            .position(|(k, _)| k.as_str() == Some(key))?;
        Some(self.fields.remove(index).1)
    }

    /// Copies every entry of a map value into this message. `Nil` adds nothing.
    /// A `"cmd"` entry in `map` is ignored.
    pub fn extend_from(&mut self, map: &Value) -> Result<()> {
        match map {
            Value::Nil => Ok(()),
            Value::Map(entries) => {
                for (key, value) in entries {
                    match key.as_str() {
                        Some(CMD_KEY) => {}
                        Some(key) => self.set(key, value.clone()),
                        None => self.fields.push((key.clone(), value.clone())),
                    }
                }
                Ok(())
            }
            _ => Err(Error::NotAMap),
        }
    }

    /// Non-cmd fields in wire order.
    pub fn fields(&self) -> &[(Value, Value)] {
        &self.fields
    }

    /// `(message, kind)` if this is a failure reply.
    pub fn error(&self) -> Option<(&str, &str)> {
        let message = self.get_str(ERROR_KEY)?;
        let kind = self.get_str(ERROR_TYPE_KEY).unwrap_or("Error");
        Some((message, kind))
    }

    /// Builds a message from a decoded map.
    pub fn from_value(value: Value) -> Result<Self> {
        let entries = match value {
            Value::Map(entries) => entries,
            _ => return Err(Error::NotAMap),
        };
        let mut cmd = None;
        let mut fields = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if key.as_str() == Some(CMD_KEY) {
                match value {
                    Value::String(s) => cmd = s.into_str(),
                    _ => return Err(Error::MissingCommand),
                }
            } else {
                fields.push((key, value));
            }
        }
        let cmd = cmd.ok_or(Error::MissingCommand)?;
        Ok(Message { cmd, fields })
    }

    /// The map value of this message, `"cmd"` first.
    pub fn into_value(self) -> Value {
        let mut entries = Vec::with_capacity(self.fields.len() + 1);
        entries.push((Value::from(CMD_KEY), Value::from(self.cmd)));
        entries.extend(self.fields);
        Value::Map(entries)
    }

    /// MessagePack encoding of the message.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        rmpv::encode::write_value(&mut buf, &self.clone().into_value())
            .map_err(|e| Error::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes a frame body. Trailing bytes are a decode error.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut rest = bytes;
        let value = rmpv::decode::read_value(&mut rest).map_err(|e| Error::Decode(e.to_string()))?;
        if !rest.is_empty() {
            return Err(Error::Decode(format!(
                "{} trailing bytes after message",
                rest.len()
            )));
        }
        Message::from_value(value)
    }
}
