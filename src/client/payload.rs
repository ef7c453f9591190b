//! Publication payloads

use crate::error::ClientError;
use bytes::Bytes;
use std::any::Any;

/// Payload accepted by [`super::Client::publish`]
///
/// Text and raw bytes convert directly. [`Payload::from_any`] accepts a value
/// of arbitrary type and rejects anything that is neither, which `publish`
/// reports as an unsupported payload type.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Bytes(Bytes),
    Unsupported(&'static str),
}

impl Payload {
    pub fn from_any<T: Any>(value: T) -> Self {
        let value: Box<dyn Any> = Box::new(value);
        let value = match value.downcast::<String>() {
            Ok(text) => return Payload::Text(*text),
            Err(value) => value,
        };
        let value = match value.downcast::<&'static str>() {
            Ok(text) => return Payload::Text(text.to_string()),
            Err(value) => value,
        };
        let value = match value.downcast::<Vec<u8>>() {
            Ok(raw) => return Payload::Bytes(Bytes::from(*raw)),
            Err(value) => value,
        };
        match value.downcast::<Bytes>() {
            Ok(raw) => Payload::Bytes(*raw),
            Err(_) => Payload::Unsupported(std::any::type_name::<T>()),
        }
    }

    pub(crate) fn into_bytes(self) -> Result<Bytes, ClientError> {
        match self {
            Payload::Text(text) => Ok(Bytes::from(text)),
            Payload::Bytes(raw) => Ok(raw),
            Payload::Unsupported(kind) => Err(ClientError::unsupported_payload(kind)),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(raw: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(raw))
    }
}

impl From<&[u8]> for Payload {
    fn from(raw: &[u8]) -> Self {
        Payload::Bytes(Bytes::copy_from_slice(raw))
    }
}

impl From<Bytes> for Payload {
    fn from(raw: Bytes) -> Self {
        Payload::Bytes(raw)
    }
}
