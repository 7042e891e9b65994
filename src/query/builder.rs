use crate::core::error::Result;
use crate::databank::Databank;
use crate::search::{
    AllDocIterator, BoxedDocIterator, IntersectionIterator, NoDocIterator, NotIterator,
    SingleDocIterator, UnionIterator,
};

use super::ast::Ast;

/// Fold a parsed query tree into an iterator tree against one databank.
/// `None` means the provably-empty result.
pub fn build(ast: &Ast, db: &Databank) -> Result<Option<BoxedDocIterator>> {
    match ast {
        Ast::And(a, b) => Ok(IntersectionIterator::create(build(a, db)?, build(b, db)?)),
        Ast::Or(a, b) => UnionIterator::create(build(a, db)?, build(b, db)?),
        Ast::Not(inner) => {
            let inner = build(inner, db)?.unwrap_or_else(|| Box::new(NoDocIterator));
            Ok(Some(Box::new(NotIterator::new(inner, db.max_doc_nr()))))
        }
        Ast::Contains { index, term } => db.term_iterator(index, term),
        Ast::Compare { index, op, value } => db.compare_iterator(index, *op, value),
        Ast::Range { index, lo, hi } => db.range_iterator(index, lo, hi),
        Ast::Pattern { index, pattern } => db.pattern_iterator(index, pattern),
        Ast::Phrase { index, terms } => db.phrase_iterator(index, terms),
        Ast::Linked { databank, id } => db.linked_iterator(databank, id),
        Ast::DocNr(doc_nr) => {
            let valid = *doc_nr >= 1 && *doc_nr <= db.max_doc_nr();
            Ok(valid.then(|| Box::new(SingleDocIterator::new(*doc_nr)) as BoxedDocIterator))
        }
        Ast::MatchAll => Ok(Some(Box::new(AllDocIterator::new(db.max_doc_nr())))),
    }
}
