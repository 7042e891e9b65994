use super::token::{Token, TokenKind};

/// Character-class tokenizer shared by document indexing and the query
/// parser. Document mode yields Word / Number / Float / Punctuation; query
/// mode adds operators, quoted strings, globs and `#`-doc-nrs.
///
/// Words fold to ASCII lowercase; non-ASCII passes through except that a
/// run of Han characters is split into one token per codepoint. A hyphen
/// between alphanumerics stays inside the word (`hyhel-5` is one token),
/// while a leading minus binds to a number only in query mode.
pub struct Tokenizer<'a> {
    text: &'a str,
    pos: usize,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_han(c: char) -> bool {
    matches!(c as u32,
        0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF | 0x20000..=0x2A6DF)
}

fn fold(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii() { c.to_ascii_lowercase() } else { c })
        .collect()
}

impl<'a> Tokenizer<'a> {
    pub fn new(text: &'a str) -> Self {
        Tokenizer { text, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.text[self.pos..].chars().nth(offset)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    /// Next document-mode token.
    pub fn next_word(&mut self) -> Token {
        self.next_token(false)
    }

    /// Next query-mode token.
    pub fn next_query_token(&mut self) -> Token {
        self.next_token(true)
    }

    fn next_token(&mut self, query: bool) -> Token {
        self.skip_whitespace();
        let start = self.pos;

        let Some(c) = self.peek() else {
            return Token::eof(start);
        };

        if query {
            if let Some(token) = self.scan_operator(start) {
                return token;
            }
            if c == '"' {
                return self.scan_string(start);
            }
            if c == '#' && self.peek_at(1).map(|d| d.is_ascii_digit()).unwrap_or(false) {
                self.bump();
                let token = self.scan_run(self.pos, query);
                return Token { kind: TokenKind::DocNr, text: token.text, start };
            }
            if c == '-' && self.peek_at(1).map(|d| d.is_ascii_digit()).unwrap_or(false) {
                self.bump();
                let token = self.scan_run(self.pos, query);
                if matches!(token.kind, TokenKind::Number | TokenKind::Float) {
                    return Token { kind: token.kind, text: format!("-{}", token.text), start };
                }
                return Token { kind: token.kind, text: token.text, start };
            }
        }

        if is_han(c) {
            self.bump();
            return Token { kind: TokenKind::Word, text: c.to_string(), start };
        }

        if is_word_char(c) || (query && (c == '?' || c == '*')) {
            return self.scan_run(start, query);
        }

        self.bump();
        Token { kind: TokenKind::Punctuation, text: c.to_string(), start }
    }

    /// Scan a word / number / float / pattern run starting at the current
    /// position.
    fn scan_run(&mut self, start: usize, query: bool) -> Token {
        let run_start = self.pos;
        let mut has_glob = false;

        while let Some(c) = self.peek() {
            if is_han(c) {
                break;
            }
            if is_word_char(c) {
                self.bump();
                continue;
            }
            if query && (c == '?' || c == '*') {
                has_glob = true;
                self.bump();
                continue;
            }
            // hyphen or dot glue: only between alphanumerics
            if (c == '-' || c == '.')
                && self.pos > run_start
                && self.peek_at(1).map(is_word_char).unwrap_or(false)
            {
                self.bump();
                continue;
            }
            break;
        }

        let raw = &self.text[run_start..self.pos];
        let kind = if has_glob {
            TokenKind::Pattern
        } else {
            classify_run(raw)
        };
        let text = match kind {
            TokenKind::Word => fold(raw),
            _ => raw.to_string(),
        };
        Token { kind, text, start }
    }

    fn scan_string(&mut self, start: usize) -> Token {
        self.bump(); // opening quote
        let content_start = self.pos;
        while let Some(c) = self.peek() {
            if c == '"' {
                break;
            }
            self.bump();
        }
        let text = self.text[content_start..self.pos].to_string();
        self.bump(); // closing quote, if any
        Token { kind: TokenKind::String, text, start }
    }

    fn scan_operator(&mut self, start: usize) -> Option<Token> {
        let rest = &self.text[self.pos..];
        let (kind, text, len) = if rest.starts_with("<=") {
            (TokenKind::LessEqual, "<=", 2)
        } else if rest.starts_with(">=") {
            (TokenKind::GreaterEqual, ">=", 2)
        } else if rest.starts_with('<') {
            (TokenKind::LessThan, "<", 1)
        } else if rest.starts_with('>') {
            (TokenKind::GreaterThan, ">", 1)
        } else if rest.starts_with(':') {
            (TokenKind::Colon, ":", 1)
        } else if rest.starts_with('=') {
            (TokenKind::Equals, "=", 1)
        } else if rest.starts_with('(') {
            (TokenKind::OpenParen, "(", 1)
        } else if rest.starts_with(')') {
            (TokenKind::CloseParen, ")", 1)
        } else if rest.starts_with('[') {
            (TokenKind::OpenBracket, "[", 1)
        } else if rest.starts_with(']') {
            (TokenKind::CloseBracket, "]", 1)
        } else if rest.starts_with('/') {
            (TokenKind::Slash, "/", 1)
        } else {
            return self.scan_keyword(start);
        };
        self.pos += len;
        Some(Token { kind, text: text.to_string(), start })
    }

    /// Reserved words are recognized case-insensitively, but only when they
    /// stand alone.
    fn scan_keyword(&mut self, start: usize) -> Option<Token> {
        let rest = &self.text[self.pos..];
        for (word, kind) in [
            ("AND", TokenKind::And),
            ("OR", TokenKind::Or),
            ("NOT", TokenKind::Not),
            ("BETWEEN", TokenKind::Between),
        ] {
            if rest.len() >= word.len()
                && rest[..word.len()].eq_ignore_ascii_case(word)
                && !rest[word.len()..]
                    .chars()
                    .next()
                    .map(is_word_char)
                    .unwrap_or(false)
            {
                self.pos += word.len();
                return Some(Token { kind, text: word.to_string(), start });
            }
        }
        None
    }
}

fn classify_run(raw: &str) -> TokenKind {
    let mut digits = 0;
    let mut dots = 0;
    let mut other = 0;
    for c in raw.chars() {
        if c.is_ascii_digit() {
            digits += 1;
        } else if c == '.' {
            dots += 1;
        } else {
            other += 1;
        }
    }
    if other == 0 && digits > 0 && dots == 0 {
        TokenKind::Number
    } else if other == 0 && digits > 0 && dots == 1 {
        TokenKind::Float
    } else {
        TokenKind::Word
    }
}

/// Indexable tokens of a text blob, case-folded, in order.
pub fn tokenize_words(text: &str) -> Vec<String> {
    let mut tokenizer = Tokenizer::new(text);
    let mut out = Vec::new();
    loop {
        let token = tokenizer.next_word();
        match token.kind {
            TokenKind::Eof => break,
            kind if kind.is_term() => out.push(token.text),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(text: &str) -> Vec<String> {
        tokenize_words(text)
    }

    fn query_kinds(text: &str) -> Vec<(TokenKind, String)> {
        let mut t = Tokenizer::new(text);
        let mut out = Vec::new();
        loop {
            let token = t.next_query_token();
            if token.kind == TokenKind::Eof {
                break;
            }
            out.push((token.kind, token.text));
        }
        out
    }

    #[test]
    fn folds_and_splits_words() {
        assert_eq!(words("The Crambin PROTEIN"), vec!["the", "crambin", "protein"]);
        assert_eq!(words("alpha,beta;gamma"), vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn hyphen_glues_inside_a_word() {
        assert_eq!(words("hyhel-5"), vec!["hyhel-5"]);
        assert_eq!(words("hyhel -5"), vec!["hyhel", "5"]);
        assert_eq!(words("x-ray diffraction"), vec!["x-ray", "diffraction"]);
    }

    #[test]
    fn numbers_and_floats() {
        assert_eq!(words("46 aa 4.75 angstrom"), vec!["46", "aa", "4.75", "angstrom"]);
        let kinds = query_kinds("resolution < 1.2");
        assert_eq!(
            kinds,
            vec![
                (TokenKind::Word, "resolution".into()),
                (TokenKind::LessThan, "<".into()),
                (TokenKind::Float, "1.2".into()),
            ]
        );
    }

    #[test]
    fn signed_numbers_only_in_query_mode() {
        let kinds = query_kinds("hyhel -5");
        assert_eq!(
            kinds,
            vec![(TokenKind::Word, "hyhel".into()), (TokenKind::Number, "-5".into())]
        );
        assert_eq!(words("hyhel -5"), vec!["hyhel", "5"]);
    }

    #[test]
    fn han_runs_split_per_codepoint() {
        assert_eq!(words("蛋白质 sequence"), vec!["蛋", "白", "质", "sequence"]);
    }

    #[test]
    fn query_operators_and_keywords() {
        let kinds = query_kinds("a AND (b OR c) NOT d BETWEEN 1 AND 9");
        let expect = [
            TokenKind::Word,
            TokenKind::And,
            TokenKind::OpenParen,
            TokenKind::Word,
            TokenKind::Or,
            TokenKind::Word,
            TokenKind::CloseParen,
            TokenKind::Not,
            TokenKind::Word,
            TokenKind::Between,
            TokenKind::Number,
            TokenKind::And,
            TokenKind::Number,
        ];
        assert_eq!(kinds.iter().map(|(k, _)| *k).collect::<Vec<_>>(), expect);

        // keywords are case-insensitive, but prefixes of words are not
        // keywords
        let kinds = query_kinds("and android");
        assert_eq!(kinds[0].0, TokenKind::And);
        assert_eq!(kinds[1], (TokenKind::Word, "android".into()));
    }

    #[test]
    fn strings_patterns_and_doc_nrs() {
        let kinds = query_kinds("\"exact phrase\" prot* #42 db/id1");
        assert_eq!(
            kinds,
            vec![
                (TokenKind::String, "exact phrase".into()),
                (TokenKind::Pattern, "prot*".into()),
                (TokenKind::DocNr, "42".into()),
                (TokenKind::Word, "db".into()),
                (TokenKind::Slash, "/".into()),
                (TokenKind::Word, "id1".into()),
            ]
        );
    }
}
