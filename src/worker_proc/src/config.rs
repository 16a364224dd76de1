//! Which setup fields can change without restarting a worker.
//!
//! A setup config is compared with the loaded one by its identity: the config with
//! the runtime-adjustable keys of its capability removed. Only a different identity
//! forces a restart.

use wire::{Capability, Value};

/// Keys of `capability`'s setup config the worker applies per request.
pub fn runtime_keys(capability: Capability) -> &'static [&'static str] {
    match capability {
        Capability::Caption => &["sampling"],
        Capability::Tag | Capability::Mask | Capability::Embed | Capability::Upscale => &[],
    }
}

/// `config` without the runtime keys of `capability`. Non-map configs are their own
/// identity.
pub fn identity(capability: Capability, config: &Value) -> Value {
    match config {
        Value::Map(entries) => {
            let runtime = runtime_keys(capability);
            Value::Map(
                entries
                    .iter()
                    .filter(|(k, _)| k.as_str().map_or(true, |k| !runtime.contains(&k)))
                    .cloned()
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(model: &str, sampling: f64) -> Value {
        Value::Map(vec![
            (Value::from("model"), Value::from(model)),
            (Value::from("sampling"), Value::from(sampling)),
        ])
    }

    #[test]
    fn test_sampling_is_runtime_for_caption() {
        assert_eq!(
            identity(Capability::Caption, &config("base", 0.7)),
            identity(Capability::Caption, &config("base", 1.0))
        );
        assert_ne!(
            identity(Capability::Caption, &config("base", 0.7)),
            identity(Capability::Caption, &config("large", 0.7))
        );
    }

    #[test]
    fn test_other_capabilities_compare_everything() {
        assert_ne!(
            identity(Capability::Tag, &config("base", 0.7)),
            identity(Capability::Tag, &config("base", 1.0))
        );
        assert_eq!(identity(Capability::Embed, &Value::Nil), Value::Nil);
    }
}
