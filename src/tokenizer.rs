//! Tokenizer capability.

use crate::error::{GenError, Result};
use tracing::debug;

/// Vocabulary index. The model step is the authority on validity.
pub type TokenId = u32;

/// Text to token-id mapping supplied by the host.
///
/// `decode(encode(s))` is only expected to round-trip for text that
/// `decode` itself produced.
pub trait Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>>;

    fn decode(&self, tokens: &[TokenId]) -> Result<String>;

    /// Decode a single token, as shown in a probability table.
    fn decode_one(&self, token: TokenId) -> Result<String> {
        self.decode(&[token])
    }
}

impl<T: Tokenizer + ?Sized> Tokenizer for &T {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        (**self).encode(text)
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        (**self).decode(tokens)
    }

    fn decode_one(&self, token: TokenId) -> Result<String> {
        (**self).decode_one(token)
    }
}

impl<T: Tokenizer + ?Sized> Tokenizer for Box<T> {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        (**self).encode(text)
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        (**self).decode(tokens)
    }

    fn decode_one(&self, token: TokenId) -> Result<String> {
        (**self).decode_one(token)
    }
}

/// Encode a prompt, never returning an empty sequence.
///
/// Empty encodings fall back to the encoding of a single space.
pub fn encode_prompt<T: Tokenizer + ?Sized>(tokenizer: &T, text: &str) -> Result<Vec<TokenId>> {
    let tokens = tokenizer.encode(text)?;
    if !tokens.is_empty() {
        return Ok(tokens);
    }

    debug!("prompt encoded to nothing, substituting a space");
    let tokens = tokenizer.encode(" ")?;
    if tokens.is_empty() {
        return Err(GenError::Tokenizer(
            "tokenizer produced no tokens for a single space".into(),
        ));
    }
    Ok(tokens)
}
