//! Stand-in inference backend.
//!
//! Answers every command of the inference service with a cheap deterministic
//! result, so hosts and schedulers can be run without models. Any request may
//! carry `delay_ms` to slow the answer down and `fail` to make it fail.

use std::{thread, time::Duration};
use wire::{Capability, Command, HandlerError, Message, Service, Value, IMAGE_KEY, SERVICE_INFERENCE};

fn pause(message: &Message) {
    if let Some(ms) = message.get_u64("delay_ms") {
        thread::sleep(Duration::from_millis(ms));
    }
}

fn check(message: &Message, kind: &str) -> Result<(), HandlerError> {
    pause(message);
    match message.get("fail") {
        Some(reason) => {
            let reason = reason.as_str().map(str::to_owned).unwrap_or_else(|| reason.to_string());
            Err(HandlerError::new(reason, kind))
        }
        None => Ok(()),
    }
}

/// How a request refers to its image: the path, or its size once spliced.
fn describe(message: &Message) -> String {
    match message.get(IMAGE_KEY) {
        Some(Value::Binary(bytes)) => format!("<{} bytes>", bytes.len()),
        Some(value) => value.as_str().map(str::to_owned).unwrap_or_else(|| value.to_string()),
        None => "<no image>".to_owned(),
    }
}

fn image_len(message: &Message) -> usize {
    match message.get(IMAGE_KEY) {
        Some(Value::Binary(bytes)) => bytes.len(),
        _ => 0,
    }
}

fn reply(key: &str, value: impl Into<Value>) -> Result<Option<Message>, HandlerError> {
    Ok(Some(Message::with_cmd("").with(key, value)))
}

fn text(message: &Message) -> Result<&str, HandlerError> {
    message
        .get_str("text")
        .ok_or_else(|| HandlerError::new("missing text", "InferenceError"))
}

/// Byte offsets where each whitespace separated token of `text` ends.
fn token_borders(text: &str) -> Vec<Value> {
    let mut borders = vec![];
    let mut in_token = false;
    for (offset, c) in text.char_indices() {
        if c.is_whitespace() {
            if in_token {
                borders.push(Value::from(offset as u64));
            }
            in_token = false;
        } else {
            in_token = true;
        }
    }
    if in_token {
        borders.push(Value::from(text.len() as u64));
    }
    borders
}

/// The inference service (id 1) of the stand-in backend.
pub fn echo_service() -> Service {
    let mut service = Service::new(SERVICE_INFERENCE);
    service.register_handler(Command::Echo, |message| Ok(Some(message.clone())));
    for &capability in Capability::ALL.iter() {
        service.register_handler(Command::Setup(capability), move |message| {
            check(message, "SetupError")?;
            log::info!("loaded {} config", capability);
            reply("ok", true)
        });
    }
    service
        .register_handler(Command::Caption, |message| {
            check(message, "InferenceError")?;
            let caption = format!("an image of {}", describe(message));
            reply("captions", vec![Value::from(caption)])
        })
        .register_handler(Command::Tag, |message| {
            check(message, "InferenceError")?;
            reply(
                "tags",
                Value::Map(vec![(Value::from(describe(message)), Value::from(1.0))]),
            )
        })
        .register_handler(Command::Mask, |message| {
            check(message, "InferenceError")?;
            reply("mask", Value::Binary(vec![0; image_len(message)]))
        })
        .register_handler(Command::MaskBoxes, |message| {
            check(message, "InferenceError")?;
            let full = Value::Array(vec![0.0.into(), 0.0.into(), 1.0.into(), 1.0.into()]);
            reply("boxes", vec![full])
        })
        .register_handler(Command::EmbedText, |message| {
            check(message, "InferenceError")?;
            let text = text(message)?;
            reply("embedding", vec![Value::from(text.len() as f64)])
        })
        .register_handler(Command::EmbedImg, |message| {
            check(message, "InferenceError")?;
            reply("embedding", vec![Value::from(image_len(message) as f64)])
        })
        .register_handler(Command::ImgfileUpscale, |message| {
            check(message, "InferenceError")?;
            let img = message.get(IMAGE_KEY).cloned().unwrap_or(Value::Nil);
            reply(IMAGE_KEY, img)
        })
        .register_handler(Command::TokenCountBorders, |message| {
            check(message, "InferenceError")?;
            reply("borders", token_borders(text(message)?))
        });
    service
}
