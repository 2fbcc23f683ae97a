//! `Tokenizer` (§6 consumed interface): the external byte↔token bijection a
//! model vendor supplies. Out of scope as a *real* implementation (spec.md
//! §1 lists the tokenizer itself among the external collaborators), but the
//! core still consumes it through a trait seam — the Streaming Iterator's
//! `Token.text` field (§4.8) is decoded through it, the same way `model`
//! defines `LanguageModel` as a seam without implementing an actual network.

/// Minimal contract the core needs from a tokenizer: turn a prompt into
/// token ids, turn token ids back into text for streaming, and know which
/// id ends generation by default.
pub trait Tokenizer: Send + Sync {
    /// Encode a string into token ids. Not called anywhere in this crate
    /// today — prompts arrive pre-tokenized from the caller, per spec.md
    /// §2's data flow — but is part of the interface contract a caller may
    /// still want to invoke directly.
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Decode a run of token ids back into text. May return an empty
    /// string for sub-word continuations (spec.md §4.8).
    fn decode(&self, tokens: &[u32]) -> String;

    /// The token id that ends generation by default, when a request's
    /// `GenerationConfig::stop_tokens` doesn't override it.
    fn stop_token(&self) -> u32;
}

/// Deterministic test double: encodes/decodes tokens as whitespace-
/// separated decimal ids. Not a real bijection over natural language, but
/// stable and inspectable — mirrors `model::StubModel`'s "deterministic,
/// not realistic" design.
pub struct DecimalTokenizer {
    stop_token: u32,
}

impl DecimalTokenizer {
    pub fn new(stop_token: u32) -> Self {
        Self { stop_token }
    }
}

impl Tokenizer for DecimalTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.split_whitespace().filter_map(|w| w.parse().ok()).collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        tokens.iter().map(u32::to_string).collect::<Vec<_>>().join(" ")
    }

    fn stop_token(&self) -> u32 {
        self.stop_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_numeric_tokens() {
        let tok = DecimalTokenizer::new(0);
        let ids = tok.encode("1 2 3");
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(tok.decode(&ids), "1 2 3");
    }

    #[test]
    fn decode_of_single_token_has_no_separator() {
        let tok = DecimalTokenizer::new(0);
        assert_eq!(tok.decode(&[42]), "42");
    }
}
