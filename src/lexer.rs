// Lexer — Converts NNEF source text into a stream of Tokens
//
// The lexer is a hand-written scanner (no regex, no generator). It processes
// the source one byte at a time and hands out one token at a time: `next()`
// advances, `token()` is the current token, `peek()` looks one token ahead.
//
// DESIGN DECISIONS:
//
//   1. Identifiers start with a letter or `_` and continue with letters,
//      digits and `_`; keywords are recognized through `keyword_lookup`.
//
//   2. Numbers: a digit run is Decimal; a `.` followed by more digits, or an
//      exponent `e`/`E` with optional sign and at least one digit, makes it
//      Fractional. A leading minus is the parser's job.
//
//   3. Strings are delimited by `'` or `"` and have no escape sequences.
//
//   4. Comments start with `#` and run to the end of the line.
//
//   5. `\r`, `\n` and `\r\n` each count as a single line break.
//
//   6. Anything else is returned as a single-character token; the parser
//      decides whether it is meaningful.

use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::token::{keyword_lookup, Position, Token, TokenKind};

/// Lexer state over a source string.
pub struct Lexer<'src> {
    src: &'src str,
    bytes: &'src [u8],
    filename: Arc<str>,
    pos: usize,
    line: usize,
    col: usize,
    token: Token,
    lookahead: Option<Token>,
}

impl<'src> Lexer<'src> {
    /// Create a lexer positioned before the first token. Call [`Lexer::next`]
    /// to read it.
    pub fn new(src: &'src str, filename: impl Into<Arc<str>>) -> Self {
        let filename = filename.into();
        let start = Position::new(filename.clone(), 1, 1);
        Self {
            src,
            bytes: src.as_bytes(),
            filename,
            pos: 0,
            line: 1,
            col: 1,
            token: Token::new(TokenKind::Eof, start),
            lookahead: None,
        }
    }

    /// The current token.
    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn kind(&self) -> &TokenKind {
        &self.token.kind
    }

    /// Position of the current token.
    pub fn position(&self) -> &Position {
        &self.token.position
    }

    /// Advance to the next token. Once the end of input is reached the
    /// current token stays `Eof`.
    pub fn next(&mut self) -> Result<()> {
        self.token = match self.lookahead.take() {
            Some(tok) => tok,
            None => self.scan()?,
        };
        Ok(())
    }

    /// The kind of the token after the current one.
    pub fn peek(&mut self) -> Result<&TokenKind> {
        if self.lookahead.is_none() {
            self.lookahead = Some(self.scan()?);
        }
        match &self.lookahead {
            Some(tok) => Ok(&tok.kind),
            None => Err(Error::assertion("lookahead token missing")),
        }
    }

    /// Consume the current token if it is of kind `kind`, otherwise fail with
    /// a syntax error at the current position.
    pub fn read_token(&mut self, kind: &TokenKind) -> Result<Token> {
        if self.token.kind.same_kind(kind) {
            let tok = self.token.clone();
            self.next()?;
            Ok(tok)
        } else {
            Err(Error::new(
                ErrorKind::UnexpectedToken {
                    expected: kind.to_string(),
                    found: self.token.kind.to_string(),
                },
                self.token.position.clone(),
            ))
        }
    }

    /// Consume the current token if it is of kind `kind`.
    pub fn read_if_token(&mut self, kind: &TokenKind) -> Result<bool> {
        if self.token.kind.same_kind(kind) {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Tokenize the remaining source, returning a Vec of Tokens.
    /// The last token is always Eof.
    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.next()?;
            let is_eof = self.token.kind == TokenKind::Eof;
            tokens.push(self.token.clone());
            if is_eof {
                break;
            }
        }
        Ok(tokens)
    }

    /// Scan the next token from the source.
    fn scan(&mut self) -> Result<Token> {
        self.skip_whitespace_and_comments();

        let start = self.here();
        if self.pos >= self.bytes.len() {
            return Ok(Token::new(TokenKind::Eof, start));
        }

        let ch = self.bytes[self.pos] as char;

        if ch == '\'' || ch == '"' {
            return self.lex_string(ch, start);
        }
        if ch.is_ascii_digit() {
            return self.lex_number(start);
        }
        if ch.is_ascii_alphabetic() || ch == '_' {
            return Ok(self.lex_ident(start));
        }

        self.advance();
        let kind = match (ch, self.peek_byte()) {
            ('-', Some('>')) => TokenKind::Arrow,
            ('&', Some('&')) => TokenKind::And,
            ('|', Some('|')) => TokenKind::Or,
            ('<', Some('=')) => TokenKind::Le,
            ('>', Some('=')) => TokenKind::Ge,
            ('=', Some('=')) => TokenKind::Eq,
            ('!', Some('=')) => TokenKind::Ne,
            _ => return Ok(Token::new(TokenKind::Char(ch), start)),
        };
        self.advance();
        Ok(Token::new(kind, start))
    }

    // Helpers

    fn here(&self) -> Position {
        Position::new(self.filename.clone(), self.line, self.col)
    }

    fn advance(&mut self) {
        if self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\n' => {
                    self.line += 1;
                    self.col = 1;
                }
                b'\r' => {
                    // \r\n is a single break, counted on the \n
                    if self.bytes.get(self.pos + 1) != Some(&b'\n') {
                        self.line += 1;
                        self.col = 1;
                    }
                }
                _ => self.col += 1,
            }
            self.pos += 1;
        }
    }

    fn peek_byte(&self) -> Option<char> {
        self.bytes.get(self.pos).map(|&b| b as char)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
                self.advance();
            }
            if self.peek_byte() == Some('#') {
                while self.pos < self.bytes.len()
                    && self.bytes[self.pos] != b'\n'
                    && self.bytes[self.pos] != b'\r'
                {
                    self.advance();
                }
                continue;
            }
            break;
        }
    }

    /// Lex a quoted string literal, starting at the opening delimiter.
    fn lex_string(&mut self, delim: char, start: Position) -> Result<Token> {
        self.advance();
        let value_start = self.pos;
        loop {
            match self.peek_byte() {
                None => {
                    return Err(Error::new(ErrorKind::UnterminatedString, self.here()));
                }
                Some(c) if c == delim => break,
                Some(_) => self.advance(),
            }
        }
        let value = self.src[value_start..self.pos].to_string();
        self.advance();
        Ok(Token::new(TokenKind::Characters(value), start))
    }

    /// Lex a number: decimal or fractional.
    fn lex_number(&mut self, start: Position) -> Result<Token> {
        let num_start = self.pos;
        self.skip_digits();

        let mut fractional = false;

        if self.peek_byte() == Some('.')
            && self
                .bytes
                .get(self.pos + 1)
                .is_some_and(|b| b.is_ascii_digit())
        {
            fractional = true;
            self.advance();
            self.skip_digits();
        }

        if matches!(self.peek_byte(), Some('e') | Some('E')) {
            fractional = true;
            self.advance();
            if matches!(self.peek_byte(), Some('+') | Some('-')) {
                self.advance();
            }
            if !self.peek_byte().is_some_and(|c| c.is_ascii_digit()) {
                let raw = &self.src[num_start..self.pos];
                return Err(Error::new(ErrorKind::InvalidNumber(raw.to_string()), self.here()));
            }
            self.skip_digits();
        }

        let raw = self.src[num_start..self.pos].to_string();
        let kind = if fractional {
            TokenKind::Fractional(raw)
        } else {
            TokenKind::Decimal(raw)
        };
        Ok(Token::new(kind, start))
    }

    fn skip_digits(&mut self) {
        while self.peek_byte().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
    }

    /// Lex an identifier or keyword.
    fn lex_ident(&mut self, start: Position) -> Token {
        let id_start = self.pos;
        while self
            .peek_byte()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.advance();
        }
        let word = &self.src[id_start..self.pos];
        let kind = keyword_lookup(word).unwrap_or_else(|| TokenKind::Identifier(word.to_string()));
        Token::new(kind, start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<TokenKind> {
        Lexer::new(src, "test")
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let kinds = lex("version graph foo length_of add_n");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Version,
                TokenKind::Graph,
                TokenKind::Identifier("foo".into()),
                TokenKind::LengthOf,
                TokenKind::Identifier("add_n".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_number_literals() {
        let kinds = lex("42 1.0 3.14 1e-4 2E+3");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Decimal("42".into()),
                TokenKind::Fractional("1.0".into()),
                TokenKind::Fractional("3.14".into()),
                TokenKind::Fractional("1e-4".into()),
                TokenKind::Fractional("2E+3".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_dot_without_digits_is_separate() {
        let kinds = lex("1.");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Decimal("1".into()),
                TokenKind::Char('.'),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_exponent_requires_digits() {
        let err = Lexer::new("1e+", "test").tokenize().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidNumber("1e+".into()));
    }

    #[test]
    fn test_string_literals() {
        let kinds = lex(r#"'constant' "it's""#);
        assert_eq!(
            kinds,
            vec![
                TokenKind::Characters("constant".into()),
                TokenKind::Characters("it's".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_unterminated_string_reports_end_position() {
        let err = Lexer::new("x = 'abc", "test").tokenize().unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnterminatedString);
        let position = err.position.unwrap();
        assert_eq!((position.line, position.column), (1, 9));
    }

    #[test]
    fn test_operators() {
        let kinds = lex("-> && || <= >= == != < > = - ! ^");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Arrow,
                TokenKind::And,
                TokenKind::Or,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::Eq,
                TokenKind::Ne,
                TokenKind::Char('<'),
                TokenKind::Char('>'),
                TokenKind::Char('='),
                TokenKind::Char('-'),
                TokenKind::Char('!'),
                TokenKind::Char('^'),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comment_skipping() {
        let kinds = lex("graph # a comment\nfoo");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Graph,
                TokenKind::Identifier("foo".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_negative_number_is_minus_and_decimal() {
        let kinds = lex("-3");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Char('-'),
                TokenKind::Decimal("3".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_position_tracking() {
        let tokens = Lexer::new("ab 'cd' ef", "test").tokenize().unwrap();
        assert_eq!((tokens[0].position.line, tokens[0].position.column), (1, 1));
        assert_eq!((tokens[1].position.line, tokens[1].position.column), (1, 4));
        assert_eq!((tokens[2].position.line, tokens[2].position.column), (1, 9));
    }

    #[test]
    fn test_line_breaks() {
        let tokens = Lexer::new("a\nb\r\nc\rd", "test").tokenize().unwrap();
        let lines: Vec<_> = tokens
            .iter()
            .map(|t| (t.position.line, t.position.column))
            .collect();
        assert_eq!(lines, vec![(1, 1), (2, 1), (3, 1), (4, 1), (4, 2)]);
    }

    #[test]
    fn test_read_token_and_peek() {
        let mut lexer = Lexer::new("graph g(", "test");
        lexer.next().unwrap();
        assert_eq!(lexer.peek().unwrap(), &TokenKind::Identifier("g".into()));
        assert!(lexer.read_if_token(&TokenKind::Graph).unwrap());
        assert!(!lexer.read_if_token(&TokenKind::Char(')')).unwrap());
        lexer.read_token(&TokenKind::Identifier(String::new())).unwrap();
        let err = lexer.read_token(&TokenKind::Char(')')).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnexpectedToken { .. }));
        assert!(lexer.read_if_token(&TokenKind::Char('(')).unwrap());
        assert_eq!(lexer.kind(), &TokenKind::Eof);
        lexer.next().unwrap();
        assert_eq!(lexer.kind(), &TokenKind::Eof);
    }
}
