//! Identifier generation for entries and queue instances.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use uuid::Uuid;

/// A fresh 32-character lowercase hex entry id.
pub fn entry_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A 22-character URL-safe random suffix (128 bits of entropy).
pub fn queue_suffix() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Queue instance identity: the configured name plus a random suffix.
pub fn queue_id(name: &str) -> String {
    format!("{}-{}", name, queue_suffix())
}
