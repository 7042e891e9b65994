use crate::analysis::{Token, TokenKind, Tokenizer};
use crate::core::error::{Error, Result};
use crate::core::types::CompareOp;

use super::ast::{Ast, FULL_TEXT};

/// Result of parsing a query string: the boolean filter tree (if any), the
/// free-text terms for ranked scoring, and whether boolean constructs were
/// seen at all.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub ast: Option<Ast>,
    pub terms: Vec<String>,
    pub is_boolean: bool,
}

/// Recursive-descent parser over the query tokenizer.
///
/// Implicit composition between adjacent tests is intersection when the
/// caller requires all terms, union otherwise.
pub struct QueryParser<'a> {
    tokenizer: Tokenizer<'a>,
    lookahead: Token,
    implicit_intersection: bool,
    is_boolean: bool,
    terms: Vec<String>,
}

pub fn parse_query(query: &str, all_terms_required: bool) -> Result<ParsedQuery> {
    let mut parser = QueryParser::new(query, all_terms_required);
    parser.parse()
}

impl<'a> QueryParser<'a> {
    pub fn new(query: &'a str, all_terms_required: bool) -> Self {
        let mut tokenizer = Tokenizer::new(query);
        let lookahead = tokenizer.next_query_token();
        QueryParser {
            tokenizer,
            lookahead,
            implicit_intersection: all_terms_required,
            is_boolean: false,
            terms: Vec::new(),
        }
    }

    fn advance(&mut self) -> Token {
        let token = std::mem::replace(&mut self.lookahead, self.tokenizer.next_query_token());
        token
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token> {
        if self.lookahead.kind != kind {
            return Err(Error::parse(
                self.lookahead.start,
                format!("expected {kind:?} but found {:?}", self.lookahead.kind),
            ));
        }
        Ok(self.advance())
    }

    pub fn parse(mut self) -> Result<ParsedQuery> {
        if self.lookahead.kind == TokenKind::Eof {
            return Ok(ParsedQuery { ast: None, terms: Vec::new(), is_boolean: false });
        }

        let ast = self.parse_query()?;
        if self.lookahead.kind != TokenKind::Eof {
            return Err(Error::parse(
                self.lookahead.start,
                format!("unexpected {:?} after query", self.lookahead.kind),
            ));
        }
        Ok(ParsedQuery { ast, terms: self.terms, is_boolean: self.is_boolean })
    }

    fn parse_query(&mut self) -> Result<Option<Ast>> {
        let mut result = self.parse_test()?;

        loop {
            match self.lookahead.kind {
                TokenKind::Eof | TokenKind::CloseParen => break,
                TokenKind::And => {
                    self.is_boolean = true;
                    self.advance();
                    result = Ast::and(result, self.parse_test()?);
                }
                TokenKind::Or => {
                    self.is_boolean = true;
                    self.advance();
                    result = Ast::or(result, self.parse_test()?);
                }
                _ => {
                    let rhs = self.parse_test()?;
                    result = if self.implicit_intersection {
                        Ast::and(result, rhs)
                    } else {
                        Ast::or(result, rhs)
                    };
                }
            }
        }

        Ok(result)
    }

    fn parse_test(&mut self) -> Result<Option<Ast>> {
        match self.lookahead.kind {
            TokenKind::OpenBracket => {
                self.advance();
                let link = self.parse_link()?;
                self.expect(TokenKind::CloseBracket)?;
                Ok(link)
            }
            TokenKind::OpenParen => {
                self.advance();
                let inner = self.parse_query()?;
                self.expect(TokenKind::CloseParen)?;
                Ok(inner)
            }
            TokenKind::Not => {
                self.advance();
                self.is_boolean = true;
                // terms under NOT are not free terms
                let saved = self.terms.clone();
                let inner = self.parse_query()?;
                self.terms = saved;
                Ok(inner.map(|ast| Ast::Not(Box::new(ast))))
            }
            TokenKind::DocNr => {
                let token = self.advance();
                let doc_nr = token
                    .text
                    .parse::<u32>()
                    .map_err(|_| Error::parse(token.start, "invalid document number"))?;
                Ok(Some(Ast::DocNr(doc_nr)))
            }
            TokenKind::String => {
                let token = self.advance();
                let words = self.collect_string_terms(&token.text);
                Ok(Some(Ast::Phrase { index: FULL_TEXT.to_string(), terms: words }))
            }
            TokenKind::Pattern => {
                let token = self.advance();
                if token.text == "*" && self.lookahead.kind == TokenKind::Colon {
                    // "*:term" means "any index", which is the full-text
                    // lookup again
                    self.advance();
                    return self.parse_test();
                }
                if token.text == "*" {
                    return Ok(Some(Ast::MatchAll));
                }
                Ok(Some(Ast::Pattern { index: FULL_TEXT.to_string(), pattern: token.text }))
            }
            TokenKind::Word | TokenKind::Number | TokenKind::Float => {
                let token = self.advance();
                match self.lookahead.kind {
                    TokenKind::Colon | TokenKind::Equals => {
                        self.is_boolean = true;
                        self.advance();
                        self.parse_term(&token.text)
                    }
                    TokenKind::LessThan => self.parse_compare(&token.text, CompareOp::LessThan),
                    TokenKind::LessEqual => self.parse_compare(&token.text, CompareOp::LessOrEqual),
                    TokenKind::GreaterEqual => {
                        self.parse_compare(&token.text, CompareOp::GreaterOrEqual)
                    }
                    TokenKind::GreaterThan => {
                        self.parse_compare(&token.text, CompareOp::GreaterThan)
                    }
                    TokenKind::Between => self.parse_between(&token.text),
                    TokenKind::Punctuation => self.parse_joined(token),
                    _ => {
                        self.terms.push(token.text.clone());
                        Ok(Some(Ast::Contains {
                            index: FULL_TEXT.to_string(),
                            term: token.text,
                        }))
                    }
                }
            }
            _ => Err(Error::parse(
                self.lookahead.start,
                format!("unexpected {:?}", self.lookahead.kind),
            )),
        }
    }

    /// Terms glued by punctuation ("ab-1.cd") search as a phrase but count
    /// as separate free terms.
    fn parse_joined(&mut self, first: Token) -> Result<Option<Ast>> {
        self.terms.push(first.text.clone());
        let mut words = vec![first.text];

        while self.lookahead.kind == TokenKind::Punctuation {
            self.advance();
            if !self.lookahead.kind.is_term() {
                break;
            }
            let token = self.advance();
            self.terms.push(token.text.clone());
            words.push(token.text);
        }

        if words.len() > 1 {
            Ok(Some(Ast::Phrase { index: FULL_TEXT.to_string(), terms: words }))
        } else {
            Ok(Some(Ast::Contains { index: FULL_TEXT.to_string(), term: words.pop().unwrap() }))
        }
    }

    fn parse_term(&mut self, index: &str) -> Result<Option<Ast>> {
        match self.lookahead.kind {
            TokenKind::String => {
                let token = self.advance();
                let words = self.collect_string_terms(&token.text);
                Ok(Some(Ast::Phrase { index: index.to_string(), terms: words }))
            }
            TokenKind::Pattern => {
                let token = self.advance();
                Ok(Some(Ast::Pattern { index: index.to_string(), pattern: token.text }))
            }
            TokenKind::Word | TokenKind::Number | TokenKind::Float => {
                let token = self.advance();
                Ok(Some(Ast::Contains { index: index.to_string(), term: token.text }))
            }
            _ => Err(Error::parse(
                self.lookahead.start,
                format!("expected a term after {index}:"),
            )),
        }
    }

    fn parse_compare(&mut self, index: &str, op: CompareOp) -> Result<Option<Ast>> {
        self.is_boolean = true;
        self.advance();
        match self.lookahead.kind {
            TokenKind::Word | TokenKind::Number | TokenKind::Float | TokenKind::String => {
                let token = self.advance();
                Ok(Some(Ast::Compare { index: index.to_string(), op, value: token.text }))
            }
            _ => Err(Error::parse(
                self.lookahead.start,
                "expected a value after comparison operator",
            )),
        }
    }

    fn parse_between(&mut self, index: &str) -> Result<Option<Ast>> {
        self.is_boolean = true;
        self.expect(TokenKind::Between)?;

        let lo = self.bound()?;
        self.expect(TokenKind::And)?;
        let hi = self.bound()?;

        Ok(Some(Ast::Range { index: index.to_string(), lo, hi }))
    }

    fn bound(&mut self) -> Result<String> {
        match self.lookahead.kind {
            TokenKind::Word
            | TokenKind::Number
            | TokenKind::Float
            | TokenKind::String => Ok(self.advance().text),
            _ => Err(Error::parse(self.lookahead.start, "expected a range bound")),
        }
    }

    fn parse_link(&mut self) -> Result<Option<Ast>> {
        let mut result = None;

        while self.lookahead.kind != TokenKind::CloseBracket {
            let db = self.expect(TokenKind::Word)?;
            self.expect(TokenKind::Slash)?;
            let id = match self.lookahead.kind {
                TokenKind::DocNr
                | TokenKind::Word
                | TokenKind::Number
                | TokenKind::Float => self.advance(),
                _ => {
                    return Err(Error::parse(
                        self.lookahead.start,
                        "expected an id after databank/",
                    ))
                }
            };
            result = Ast::or(
                result,
                Some(Ast::Linked { databank: db.text, id: id.text }),
            );
        }

        Ok(result)
    }

    /// Words inside a quoted string become free terms too.
    fn collect_string_terms(&mut self, text: &str) -> Vec<String> {
        let words = crate::analysis::tokenize_words(text);
        self.terms.extend(words.iter().cloned());
        words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_term_is_not_boolean() {
        let q = parse_query("hyhel-5", true).unwrap();
        assert_eq!(q.terms, vec!["hyhel-5"]);
        assert!(!q.is_boolean);
        assert_eq!(
            q.ast,
            Some(Ast::Contains { index: FULL_TEXT.into(), term: "hyhel-5".into() })
        );
    }

    #[test]
    fn signed_number_splits_into_two_terms() {
        let q = parse_query("hyhel -5", true).unwrap();
        assert_eq!(q.terms, vec!["hyhel", "-5"]);
        assert!(!q.is_boolean);
    }

    #[test]
    fn comparison_has_no_free_terms() {
        let q = parse_query("resolution < 1.2", true).unwrap();
        assert!(q.terms.is_empty());
        assert!(q.is_boolean);
        assert_eq!(
            q.ast,
            Some(Ast::Compare {
                index: "resolution".into(),
                op: CompareOp::LessThan,
                value: "1.2".into()
            })
        );
    }

    #[test]
    fn qualified_term() {
        let q = parse_query("exp_method:x", true).unwrap();
        assert!(q.is_boolean);
        assert_eq!(
            q.ast,
            Some(Ast::Contains { index: "exp_method".into(), term: "x".into() })
        );
    }

    #[test]
    fn boolean_operators_and_grouping() {
        let q = parse_query("alpha AND (beta OR gamma)", true).unwrap();
        assert!(q.is_boolean);
        let Some(Ast::And(lhs, rhs)) = q.ast else { panic!("expected And") };
        assert_eq!(*lhs, Ast::Contains { index: FULL_TEXT.into(), term: "alpha".into() });
        let Ast::Or(_, _) = *rhs else { panic!("expected Or") };
    }

    #[test]
    fn implicit_composition_follows_all_terms_flag() {
        let q = parse_query("alpha beta", true).unwrap();
        assert!(matches!(q.ast, Some(Ast::And(_, _))));
        assert_eq!(q.terms, vec!["alpha", "beta"]);

        let q = parse_query("alpha beta", false).unwrap();
        assert!(matches!(q.ast, Some(Ast::Or(_, _))));
    }

    #[test]
    fn not_keeps_terms_outside() {
        let q = parse_query("alpha NOT beta", true).unwrap();
        assert_eq!(q.terms, vec!["alpha"]);
        assert!(q.is_boolean);
    }

    #[test]
    fn between_and_links_and_phrases() {
        let q = parse_query("mass BETWEEN 100 AND 200", true).unwrap();
        assert_eq!(
            q.ast,
            Some(Ast::Range { index: "mass".into(), lo: "100".into(), hi: "200".into() })
        );

        let q = parse_query("[sprot/CRAM_CRAAB]", true).unwrap();
        assert_eq!(
            q.ast,
            Some(Ast::Linked { databank: "sprot".into(), id: "CRAM_CRAAB".into() })
        );

        let q = parse_query("\"green fluorescent protein\"", true).unwrap();
        assert_eq!(q.terms, vec!["green", "fluorescent", "protein"]);
        assert_eq!(
            q.ast,
            Some(Ast::Phrase {
                index: FULL_TEXT.into(),
                terms: vec!["green".into(), "fluorescent".into(), "protein".into()]
            })
        );
    }

    #[test]
    fn doc_nr_and_match_all() {
        let q = parse_query("#42", true).unwrap();
        assert_eq!(q.ast, Some(Ast::DocNr(42)));

        let q = parse_query("*", true).unwrap();
        assert_eq!(q.ast, Some(Ast::MatchAll));
    }

    #[test]
    fn parse_errors_carry_position() {
        let err = parse_query("alpha AND", true).unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::Parse);
        assert!(err.position.is_some());

        assert!(parse_query("(unclosed", true).is_err());
        assert!(parse_query("index >", true).is_err());
    }

    #[test]
    fn empty_query() {
        let q = parse_query("   ", true).unwrap();
        assert!(q.ast.is_none());
        assert!(q.terms.is_empty());
        assert!(!q.is_boolean);
    }
}
