use crate::core::types::{CompareOp, DocNr};

/// Name of the built-in index searched when a term carries no qualifier.
pub const FULL_TEXT: &str = "full-text";

/// Parsed query tree. Parsing never touches the databank; a separate fold
/// turns the tree into an iterator tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Not(Box<Ast>),
    /// `index:term` (or a bare term against the full-text index).
    Contains { index: String, term: String },
    /// `index < value` and friends.
    Compare { index: String, op: CompareOp, value: String },
    /// `index BETWEEN lo AND hi`, bounds inclusive.
    Range { index: String, lo: String, hi: String },
    /// `index:pat?ern*`
    Pattern { index: String, pattern: String },
    /// Quoted string or punctuation-joined run: adjacent terms.
    Phrase { index: String, terms: Vec<String> },
    /// `[db/id]` cross-databank link test.
    Linked { databank: String, id: String },
    /// `#nnn`
    DocNr(DocNr),
    MatchAll,
}

impl Ast {
    pub fn and(a: Option<Ast>, b: Option<Ast>) -> Option<Ast> {
        match (a, b) {
            (Some(a), Some(b)) => Some(Ast::And(Box::new(a), Box::new(b))),
            _ => None,
        }
    }

    pub fn or(a: Option<Ast>, b: Option<Ast>) -> Option<Ast> {
        match (a, b) {
            (Some(a), Some(b)) => Some(Ast::Or(Box::new(a), Box::new(b))),
            (a, None) => a,
            (None, b) => b,
        }
    }
}
