use std::collections::{BTreeMap, BTreeSet};

use crate::analysis::tokenize_words;
use crate::core::error::{Error, Result};
use crate::core::types::{DocNr, IndexKind, TokenId, MAX_KEY_LENGTH};
use crate::lexicon::StagingLexicon;

pub type DocLinks = BTreeMap<String, BTreeSet<String>>;

/// A stored document as returned by fetch: the canonical text, its
/// attributes and its cross-databank links.
#[derive(Debug, Clone)]
pub struct Document {
    pub doc_nr: DocNr,
    pub text: String,
    pub attributes: BTreeMap<String, String>,
    pub links: DocLinks,
}

impl Document {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|s| s.as_str())
    }

    pub fn id(&self) -> Option<&str> {
        self.attribute("id")
    }
}

/// Token stream for one index: shared-lexicon ids after remapping, with 0
/// gaps where stop words kept positions aligned.
#[derive(Debug, Clone)]
pub struct IndexTokens {
    pub index: String,
    pub tokens: Vec<TokenId>,
}

/// A literal key for a value-style index (unique id, number, float).
#[derive(Debug, Clone)]
pub struct IndexValueEntry {
    pub index: String,
    pub kind: IndexKind,
    pub value: String,
}

/// A document under construction during batch import. Workers fill it in,
/// tokenize against their thread-local staging lexicon, and the databank
/// remaps the staged ids when the batch is flushed.
#[derive(Debug, Default, Clone)]
pub struct InputDocument {
    pub text: String,
    pub fasta: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub links: DocLinks,
    /// Raw text per named text index, tokenized by [`Self::tokenize`].
    text_fields: Vec<(String, String)>,
    pub index_values: Vec<IndexValueEntry>,
    /// Full-text token stream (staging ids until remapped).
    pub full_text_tokens: Vec<TokenId>,
    pub index_tokens: Vec<IndexTokens>,
    tokenized: bool,
}

impl InputDocument {
    pub fn new(text: impl Into<String>) -> Self {
        InputDocument { text: text.into(), ..Default::default() }
    }

    pub fn set_attribute(&mut self, name: &str, value: &str) -> Result<()> {
        if value.len() > MAX_KEY_LENGTH {
            return Err(Error::invariant(format!("attribute {name} longer than 255 bytes")));
        }
        self.attributes.insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn set_fasta(&mut self, fasta: impl Into<String>) {
        self.fasta = Some(fasta.into());
    }

    pub fn add_link(&mut self, databank: &str, id: &str) {
        self.links
            .entry(databank.to_string())
            .or_default()
            .insert(id.to_string());
    }

    /// Index a literal value: the key of a unique / number / float index.
    pub fn index_value(&mut self, index: &str, kind: IndexKind, value: &str) -> Result<()> {
        if value.len() > MAX_KEY_LENGTH {
            return Err(Error::invariant(format!("key for {index} longer than 255 bytes")));
        }
        let value = match kind {
            IndexKind::Number | IndexKind::Float => value.to_string(),
            _ => value.to_ascii_lowercase(),
        };
        self.index_values.push(IndexValueEntry {
            index: index.to_string(),
            kind,
            value,
        });
        Ok(())
    }

    /// Queue a text field for tokenization into a named character index.
    pub fn index_text(&mut self, index: &str, text: &str) {
        self.text_fields.push((index.to_string(), text.to_string()));
    }

    /// Tokenize the document text and every queued field against the
    /// worker's staging lexicon.
    pub fn tokenize(&mut self, staging: &mut StagingLexicon) {
        if self.tokenized {
            return;
        }
        self.tokenized = true;

        self.full_text_tokens = tokenize_words(&self.text)
            .into_iter()
            .map(|w| staging.store(w.as_bytes()))
            .collect();

        for (index, text) in std::mem::take(&mut self.text_fields) {
            let tokens: Vec<TokenId> = tokenize_words(&text)
                .into_iter()
                .map(|w| staging.store(w.as_bytes()))
                .collect();
            match self.index_tokens.iter_mut().find(|t| t.index == index) {
                Some(existing) => existing.tokens.extend(tokens),
                None => self.index_tokens.push(IndexTokens { index, tokens }),
            }
        }
    }

    /// Rewrite staged token ids to shared-lexicon ids. Tokens at or below
    /// the stop-word ceiling become 0 gaps so positions stay aligned.
    pub fn remap_tokens(&mut self, remap: &[TokenId], last_stop_word: TokenId) {
        let map = |t: &mut TokenId| {
            let shared = remap.get(*t as usize).copied().unwrap_or(0);
            *t = if shared <= last_stop_word { 0 } else { shared };
        };
        self.full_text_tokens.iter_mut().for_each(map);
        for field in &mut self.index_tokens {
            field.tokens.iter_mut().for_each(map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexicon::Lexicon;

    #[test]
    fn tokenize_and_remap() {
        let mut staging = StagingLexicon::new();
        let mut doc = InputDocument::new("the crambin protein the");
        doc.index_text("title", "crambin structure");
        doc.tokenize(&mut staging);

        assert_eq!(doc.full_text_tokens.len(), 4);
        // repeated word gets the same staged id
        assert_eq!(doc.full_text_tokens[0], doc.full_text_tokens[3]);

        let shared = Lexicon::new();
        let stop = shared.store(b"the");
        let remap = staging.flush_into_shared(&shared);
        doc.remap_tokens(&remap, stop);

        // "the" became a gap, positions preserved
        assert_eq!(doc.full_text_tokens[0], 0);
        assert_eq!(doc.full_text_tokens[3], 0);
        assert_eq!(doc.full_text_tokens[1], shared.lookup(b"crambin"));
        assert_eq!(doc.full_text_tokens[2], shared.lookup(b"protein"));

        let title = &doc.index_tokens[0];
        assert_eq!(title.index, "title");
        assert_eq!(title.tokens, vec![shared.lookup(b"crambin"), shared.lookup(b"structure")]);
    }

    #[test]
    fn attribute_length_is_bounded() {
        let mut doc = InputDocument::new("x");
        assert!(doc.set_attribute("id", &"y".repeat(255)).is_ok());
        assert!(doc.set_attribute("id", &"y".repeat(256)).is_err());
    }
}
