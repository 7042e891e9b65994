//! Token interning. A shared lexicon assigns dense ids under a
//! reader-writer lock; ingest workers intern into thread-local staging
//! lexicons and remap in one bounded step per batch.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::core::types::TokenId;

#[derive(Default)]
struct LexiconInner {
    ids: HashMap<Box<[u8]>, TokenId>,
    words: Vec<Box<[u8]>>,
}

impl LexiconInner {
    fn lookup(&self, word: &[u8]) -> TokenId {
        self.ids.get(word).copied().unwrap_or(0)
    }

    fn store(&mut self, word: &[u8]) -> TokenId {
        if let Some(&id) = self.ids.get(word) {
            return id;
        }
        let boxed: Box<[u8]> = word.into();
        self.words.push(boxed.clone());
        let id = self.words.len() as TokenId;
        self.ids.insert(boxed, id);
        id
    }

    fn get(&self, id: TokenId) -> Option<&[u8]> {
        if id == 0 {
            return None;
        }
        self.words.get(id as usize - 1).map(|w| w.as_ref())
    }
}

/// Shared append-only interner. Ids start at 1; 0 is the end-of-sequence
/// sentinel and the stop-word gap.
#[derive(Default)]
pub struct Lexicon {
    inner: RwLock<LexiconInner>,
}

impl Lexicon {
    pub fn new() -> Self {
        Lexicon::default()
    }

    /// Intern a word, returning its stable id.
    pub fn store(&self, word: &[u8]) -> TokenId {
        {
            let inner = self.inner.read();
            let id = inner.lookup(word);
            if id != 0 {
                return id;
            }
        }
        self.inner.write().store(word)
    }

    /// Id of a word, or 0 when absent.
    pub fn lookup(&self, word: &[u8]) -> TokenId {
        self.inner.read().lookup(word)
    }

    pub fn get_string(&self, id: TokenId) -> Option<Vec<u8>> {
        self.inner.read().get(id).map(|w| w.to_vec())
    }

    pub fn len(&self) -> usize {
        self.inner.read().words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every interned word with its id.
    pub fn for_each(&self, mut f: impl FnMut(TokenId, &[u8])) {
        let inner = self.inner.read();
        for (i, word) in inner.words.iter().enumerate() {
            f(i as TokenId + 1, word);
        }
    }
}

/// Thread-local interner used while tokenizing a batch of documents.
/// `flush_into_shared` resolves every staged word against the shared
/// lexicon: known words under the read lock, new words in one write-locked
/// pass, so exclusive time is bounded by the batch's new tokens.
#[derive(Default)]
pub struct StagingLexicon {
    inner: LexiconInner,
}

impl StagingLexicon {
    pub fn new() -> Self {
        StagingLexicon::default()
    }

    pub fn store(&mut self, word: &[u8]) -> TokenId {
        self.inner.store(word)
    }

    pub fn lookup(&self, word: &[u8]) -> TokenId {
        self.inner.lookup(word)
    }

    pub fn get_string(&self, id: TokenId) -> Option<&[u8]> {
        self.inner.get(id)
    }

    pub fn len(&self) -> usize {
        self.inner.words.len()
    }

    /// Remap table from staging ids to shared ids; index 0 maps the
    /// sentinel to itself.
    pub fn flush_into_shared(&mut self, shared: &Lexicon) -> Vec<TokenId> {
        let mut remap = vec![0 as TokenId; self.inner.words.len() + 1];

        let mut missing = Vec::new();
        {
            let inner = shared.inner.read();
            for (i, word) in self.inner.words.iter().enumerate() {
                let id = inner.lookup(word);
                if id == 0 {
                    missing.push(i);
                } else {
                    remap[i + 1] = id;
                }
            }
        }

        if !missing.is_empty() {
            let mut inner = shared.inner.write();
            for i in missing {
                remap[i + 1] = inner.store(&self.inner.words[i]);
            }
        }

        self.inner = LexiconInner::default();
        remap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_stable() {
        let lex = Lexicon::new();
        let a = lex.store(b"alpha");
        let b = lex.store(b"beta");
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(lex.store(b"alpha"), 1);
        assert_eq!(lex.lookup(b"beta"), 2);
        assert_eq!(lex.lookup(b"gamma"), 0);
        assert_eq!(lex.get_string(1).unwrap(), b"alpha");
        assert_eq!(lex.get_string(0), None);
    }

    #[test]
    fn staging_remap_preserves_words() {
        let shared = Lexicon::new();
        shared.store(b"known");

        let mut staging = StagingLexicon::new();
        let s_known = staging.store(b"known");
        let s_new = staging.store(b"fresh");
        let s_other = staging.store(b"fresher");

        let remap = staging.flush_into_shared(&shared);
        assert_eq!(remap[0], 0);
        assert_eq!(remap[s_known as usize], 1);

        for (staged, word) in [(s_new, b"fresh".as_ref()), (s_other, b"fresher".as_ref())] {
            let shared_id = remap[staged as usize];
            assert_ne!(shared_id, 0);
            assert_eq!(shared.get_string(shared_id).unwrap(), word);
        }
        assert_eq!(staging.len(), 0);
    }

    #[test]
    fn concurrent_store_is_consistent() {
        use std::sync::Arc;
        let lex = Arc::new(Lexicon::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let lex = lex.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let word = format!("word{}", (i * 7 + t) % 50);
                    let id = lex.store(word.as_bytes());
                    assert_eq!(lex.get_string(id).unwrap(), word.as_bytes());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(lex.len(), 50);
    }
}
