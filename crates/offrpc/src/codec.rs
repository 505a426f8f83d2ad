//! # Value Codec
//!
//! Moves individual values between Rust types and the text that travels in
//! `Result` and `Event` messages.
//!
//! ## Philosophy
//!
//! - **Tolerant Reads**: null or empty input produces the type's default, and
//!   malformed input is logged and produces the default. A bad payload never
//!   takes the receiving context down.
//! - **Primitives as Strings**: scalars may arrive as bare, unquoted strings
//!   (`42`, `true`, `hello`). They are converted directly rather than failing
//!   JSON parsing.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::types::TypeName;

/// The JSON codec used on both sides of the channel.
#[derive(Clone, Copy, Debug, Default)]
pub struct Codec;

impl Codec {
    pub fn new() -> Self {
        Self
    }

    /// Serializes `value` to text. Failures are logged and produce `null`.
    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> String {
        match serde_json::to_string(value) {
            Ok(text) => text,
            Err(e) => {
                warn!(type_name = std::any::type_name::<T>(), error = %e, "value could not be serialized");
                Value::Null.to_string()
            }
        }
    }

    /// Boxes `value` for an envelope parameter.
    pub fn to_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<Value> {
        Ok(serde_json::to_value(value)?)
    }

    /// Reads `text` as `T`, falling back to `T::default()` on null, empty, or
    /// malformed input.
    pub fn deserialize<T: DeserializeOwned + Default>(&self, text: &str) -> T {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return T::default();
        }
        match self.decode(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(type_name = std::any::type_name::<T>(), error = %e, "malformed value, using default");
                T::default()
            }
        }
    }

    /// Reads `text` as the runtime-named `type_name`, producing a boxed value.
    ///
    /// Primitive types that fail JSON parsing are kept as bare strings so a
    /// later `from_value` can convert them.
    pub fn deserialize_as(&self, type_name: &TypeName, text: &str) -> Value {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => value,
            Err(_) if type_name.is_primitive() => Value::String(text.to_string()),
            Err(e) => {
                warn!(%type_name, error = %e, "malformed value, using null");
                Value::Null
            }
        }
    }

    /// Strict read of `text` as `T`.
    ///
    /// Empty text is read as `null`, which succeeds for `()` and `Option`.
    pub fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return self.from_value(Value::Null);
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => self.from_value(value),
            Err(_) => self.from_value(Value::String(text.to_string())),
        }
    }

    /// Unboxes `value` as `T`, converting bare strings for primitives.
    pub fn from_value<T: DeserializeOwned>(&self, value: Value) -> Result<T> {
        match serde_json::from_value::<T>(value.clone()) {
            Ok(v) => Ok(v),
            Err(e) => match value {
                Value::String(text) => {
                    debug!(type_name = std::any::type_name::<T>(), "converting primitive from string");
                    serde_json::from_str::<T>(&text).map_err(|_| Error::Conversion {
                        expected: std::any::type_name::<T>().to_string(),
                        details: e.to_string(),
                    })
                }
                _ => Err(Error::Conversion {
                    expected: std::any::type_name::<T>().to_string(),
                    details: e.to_string(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use tracing_subscriber::Layer;
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    /// Counts warnings.
    #[derive(Clone, Default)]
    struct Warnings(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for Warnings {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn warnings_during(read: impl FnOnce()) -> usize {
        let warnings = Warnings::default();
        tracing::subscriber::with_default(tracing_subscriber::registry().with(warnings.clone()), read);
        warnings.0.load(Ordering::SeqCst)
    }

    #[test]
    fn empty_and_null_read_as_default() {
        let codec = Codec::new();
        assert_eq!(codec.deserialize::<i32>(""), 0);
        assert_eq!(codec.deserialize::<i32>("null"), 0);
        assert_eq!(codec.deserialize::<Vec<String>>("   "), Vec::<String>::new());
    }

    #[test]
    fn null_is_not_malformed() {
        let codec = Codec::new();
        let quiet = warnings_during(|| {
            assert_eq!(codec.deserialize::<u32>("null"), 0);
            assert_eq!(codec.deserialize::<String>(" null "), "");
        });
        assert_eq!(quiet, 0);
    }

    #[test]
    fn malformed_reads_as_default() {
        let codec = Codec::new();
        let warned = warnings_during(|| {
            assert_eq!(codec.deserialize::<Vec<u8>>("{not json"), Vec::<u8>::new());
        });
        assert_eq!(warned, 1);
    }

    #[test]
    fn bare_primitives_convert() {
        let codec = Codec::new();
        assert_eq!(codec.decode::<String>("hello").unwrap(), "hello");
        assert_eq!(codec.decode::<i64>("\"17\"").unwrap(), 17);
        assert!(codec.decode::<bool>("true").unwrap());
        let value = codec.deserialize_as(&TypeName::of::<String>(), "plain text");
        assert_eq!(value, Value::String("plain text".into()));
    }

    #[test]
    fn unit_decodes_from_nothing() {
        let codec = Codec::new();
        codec.decode::<()>("").unwrap();
        codec.decode::<()>("null").unwrap();
        assert_eq!(codec.decode::<Option<u8>>("").unwrap(), None);
    }

    #[test]
    fn complex_values_need_json() {
        let codec = Codec::new();
        let err = codec.decode::<Vec<u32>>("1, 2").unwrap_err();
        assert!(matches!(err, Error::Conversion { .. }));
        assert_eq!(codec.deserialize_as(&TypeName::of::<Vec<u32>>(), "1, 2"), Value::Null);
    }
}
