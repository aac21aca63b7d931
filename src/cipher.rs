//! Keyed XOR scrambling for chat bodies, base64-wrapped so the result is
//! plain ASCII inside a JSON datagram. This is obfuscation, not
//! encryption; the relay core never looks at it.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub const DEFAULT_KEY: &str = "STUTTGART";

fn transform(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .zip(key.iter().cycle())
        .map(|(b, k)| b ^ k)
        .collect()
}

pub fn encrypt(text: &str, key: &str) -> String {
    STANDARD.encode(transform(text.as_bytes(), key.as_bytes()))
}

pub fn decrypt(token: &str, key: &str) -> Result<String> {
    let raw = STANDARD.decode(token).context("body is not base64")?;
    String::from_utf8(transform(&raw, key.as_bytes())).context("body is not utf-8 under this key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverses_with_same_key() {
        let token = encrypt("hello, room", DEFAULT_KEY);
        assert_ne!(token, "hello, room");
        assert_eq!(decrypt(&token, DEFAULT_KEY).unwrap(), "hello, room");
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decrypt("%%%", DEFAULT_KEY).is_err());
    }
}
