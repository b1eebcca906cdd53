//! Lexer for the kaleido language.
//!
//! Scanning is deliberately generic: the scanner only splits the text
//! into words, numbers, quoted literals and single characters. Meaning
//! is attached afterwards by [`classify`], which matches the raw text
//! against keywords and symbols. Nothing here ever fails; text the
//! language does not understand becomes an `Identifier` token and the
//! parser rejects it.

use std::fmt;

use crate::span::Position;

/// Kind of a token produced by the lexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    EndOfInput,
    Def,
    Import,
    If,
    Else,
    Identifier,
    NumberLiteral,
    Symbol,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::EndOfInput => "end of input",
            TokenKind::Def => "'def'",
            TokenKind::Import => "'import'",
            TokenKind::If => "'if'",
            TokenKind::Else => "'else'",
            TokenKind::Identifier => "identifier",
            TokenKind::NumberLiteral => "number",
            TokenKind::Symbol => "symbol",
        };
        f.write_str(name)
    }
}

/// Single-character symbols recognised by the classifier.
pub const SYMBOLS: &[&str] = &["(", ")", ",", "+", "-", "/", "*", ":", ";", "="];

/// A single token with its text, kind and starting position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub position: Position,
    /// Parsed value; only meaningful for `NumberLiteral`.
    pub value: f64,
}

impl Token {
    fn end_of_input(position: Position) -> Self {
        Token {
            kind: TokenKind::EndOfInput,
            text: String::new(),
            position,
            value: 0.0,
        }
    }

    pub fn is_end(&self) -> bool {
        self.kind == TokenKind::EndOfInput
    }

    /// True for identifier tokens that look like a name (`foo`, `_x1`),
    /// as opposed to stray punctuation that also lexes as `Identifier`.
    pub fn is_name(&self) -> bool {
        self.kind == TokenKind::Identifier
            && self.text.chars().next().is_some_and(is_ident_start)
            && self.text.chars().all(is_ident_continue)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_end() {
            f.write_str("end of input")
        } else {
            write!(f, "'{}'", self.text)
        }
    }
}

/// An ordered token sequence with a cursor.
///
/// Invariants: the sequence ends with exactly one `EndOfInput` token
/// and the cursor always indexes a valid token. Advancing at the end
/// stays on `EndOfInput`.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenStream {
    tokens: Vec<Token>,
    cursor: usize,
}

impl TokenStream {
    fn new(tokens: Vec<Token>) -> Self {
        debug_assert!(tokens.last().is_some_and(Token::is_end));
        TokenStream { tokens, cursor: 0 }
    }

    pub fn peek(&self) -> &Token {
        &self.tokens[self.cursor]
    }

    /// Consume the current token and return it.
    pub fn advance(&mut self) -> Token {
        let token = self.tokens[self.cursor].clone();
        if self.cursor + 1 < self.tokens.len() {
            self.cursor += 1;
        }
        token
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn is_at_end(&self) -> bool {
        self.peek().is_end()
    }
}

impl Default for TokenStream {
    fn default() -> Self {
        TokenStream::new(vec![Token::end_of_input(Position::start())])
    }
}

/// Lex a source string into a fresh token stream.
pub fn tokenize(source: &str) -> TokenStream {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        index: 0,
        line: 1,
        column: 1,
    };
    lexer.run()
}

/// Attach a kind (and a numeric value) to a scanned piece of text.
pub fn classify(text: String, position: Position) -> Token {
    let mut value = 0.0;
    let kind = match text.as_str() {
        "def" => TokenKind::Def,
        "import" => TokenKind::Import,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        symbol if SYMBOLS.contains(&symbol) => TokenKind::Symbol,
        other => match other.parse::<f64>() {
            Ok(parsed) => {
                value = parsed;
                TokenKind::NumberLiteral
            }
            Err(_) => TokenKind::Identifier,
        },
    };
    Token {
        kind,
        text,
        position,
        value,
    }
}

struct Lexer {
    chars: Vec<char>,
    index: usize,
    line: u32,
    column: u32,
}

impl Lexer {
    fn run(&mut self) -> TokenStream {
        let mut tokens = Vec::new();

        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() {
                self.consume_char();
                continue;
            }
            if ch == '/' && matches!(self.peek_next(), Some('/') | Some('*')) {
                self.skip_comment();
                continue;
            }

            let position = self.position();
            let start = self.index;
            match ch {
                '0'..='9' => self.scan_number(),
                '.' if self.peek_next().is_some_and(|next| next.is_ascii_digit()) => {
                    self.scan_number()
                }
                '"' | '\'' | '`' => self.scan_quoted(ch),
                _ if is_ident_start(ch) => self.scan_ident(),
                _ => self.consume_char(),
            }

            let text: String = self.chars[start..self.index].iter().collect();
            tokens.push(classify(text, position));
        }

        tokens.push(Token::end_of_input(self.position()));
        TokenStream::new(tokens)
    }

    fn skip_comment(&mut self) {
        self.consume_char(); // '/'
        if self.peek_char() == Some('/') {
            while let Some(ch) = self.peek_char() {
                if ch == '\n' {
                    break;
                }
                self.consume_char();
            }
            return;
        }

        self.consume_char(); // '*'
        while let Some(ch) = self.peek_char() {
            self.consume_char();
            if ch == '*' && self.peek_char() == Some('/') {
                self.consume_char();
                return;
            }
        }
        // Unterminated block comments run to the end of the input.
    }

    fn scan_number(&mut self) {
        self.consume_digits();
        if self.peek_char() == Some('.') {
            self.consume_char();
            self.consume_digits();
        }
        if matches!(self.peek_char(), Some('e') | Some('E')) {
            let exponent_follows = match self.peek_next() {
                Some(next) if next.is_ascii_digit() => true,
                Some('+') | Some('-') => self
                    .chars
                    .get(self.index + 2)
                    .is_some_and(|c| c.is_ascii_digit()),
                _ => false,
            };
            if exponent_follows {
                self.consume_char(); // 'e'
                if matches!(self.peek_char(), Some('+') | Some('-')) {
                    self.consume_char();
                }
                self.consume_digits();
            }
        }
    }

    fn consume_digits(&mut self) {
        while self.peek_char().is_some_and(|ch| ch.is_ascii_digit()) {
            self.consume_char();
        }
    }

    fn scan_quoted(&mut self, quote: char) {
        self.consume_char(); // opening quote
        while let Some(ch) = self.peek_char() {
            if ch == '\n' && quote != '`' {
                return;
            }
            self.consume_char();
            if ch == quote {
                return;
            }
            if ch == '\\' && quote != '`' && self.peek_char().is_some() {
                self.consume_char();
            }
        }
    }

    fn scan_ident(&mut self) {
        while self.peek_char().is_some_and(is_ident_continue) {
            self.consume_char();
        }
    }

    fn position(&self) -> Position {
        Position::new(self.line, self.column)
    }

    fn peek_char(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.index + 1).copied()
    }

    fn consume_char(&mut self) {
        if let Some(ch) = self.peek_char() {
            self.index += 1;
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_alphabetic() || ch == '_'
}

fn is_ident_continue(ch: char) -> bool {
    is_ident_start(ch) || ch.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).tokens().iter().map(|t| t.kind).collect()
    }

    fn texts(source: &str) -> Vec<String> {
        tokenize(source)
            .tokens()
            .iter()
            .map(|t| t.text.clone())
            .collect()
    }

    #[test]
    fn classifies_keywords_and_symbols() {
        assert_eq!(
            kinds("def import if else ( ) , + - / * : ; ="),
            vec![
                TokenKind::Def,
                TokenKind::Import,
                TokenKind::If,
                TokenKind::Else,
                TokenKind::Symbol,
                TokenKind::Symbol,
                TokenKind::Symbol,
                TokenKind::Symbol,
                TokenKind::Symbol,
                TokenKind::Symbol,
                TokenKind::Symbol,
                TokenKind::Symbol,
                TokenKind::Symbol,
                TokenKind::Symbol,
                TokenKind::EndOfInput,
            ]
        );
    }

    #[test]
    fn numbers_carry_their_value() {
        let stream = tokenize("4 2.5 .5 1e3 6.02E-2");
        let values: Vec<f64> = stream.tokens()[..5].iter().map(|t| t.value).collect();
        assert_eq!(values, vec![4.0, 2.5, 0.5, 1000.0, 0.0602]);
        assert!(
            stream.tokens()[..5]
                .iter()
                .all(|t| t.kind == TokenKind::NumberLiteral)
        );
    }

    #[test]
    fn unknown_text_becomes_identifier() {
        let stream = tokenize("foo { } < ? \"str\"");
        let tokens = stream.tokens();
        assert_eq!(tokens.len(), 7);
        assert!(
            tokens[..6]
                .iter()
                .all(|t| t.kind == TokenKind::Identifier)
        );
        assert!(tokens[0].is_name());
        assert!(!tokens[1].is_name());
        assert!(!tokens[3].is_name());
        assert_eq!(tokens[5].text, "\"str\"");
    }

    #[test]
    fn splits_words_from_punctuation() {
        assert_eq!(
            texts("def add : x, y { x+y }"),
            vec!["def", "add", ":", "x", ",", "y", "{", "x", "+", "y", "}", ""]
        );
        assert_eq!(texts("f(x-1)"), vec!["f", "(", "x", "-", "1", ")", ""]);
    }

    #[test]
    fn skips_comments() {
        let source = "1 // line comment\n/* block\ncomment */ 2";
        assert_eq!(texts(source), vec!["1", "2", ""]);
    }

    #[test]
    fn records_line_and_column() {
        let stream = tokenize("def f\n  : x");
        let positions: Vec<Position> = stream.tokens().iter().map(|t| t.position).collect();
        assert_eq!(
            positions,
            vec![
                Position::new(1, 1),
                Position::new(1, 5),
                Position::new(2, 3),
                Position::new(2, 5),
                Position::new(2, 6),
            ]
        );
    }

    #[test]
    fn always_ends_with_a_single_end_token() {
        for source in ["", "   ", "x", "// only a comment"] {
            let stream = tokenize(source);
            let ends = stream.tokens().iter().filter(|t| t.is_end()).count();
            assert_eq!(ends, 1, "source {source:?}");
            assert!(stream.tokens().last().unwrap().is_end());
        }
    }

    #[test]
    fn advancing_stops_at_end_of_input() {
        let mut stream = tokenize("x");
        assert_eq!(stream.advance().text, "x");
        assert!(stream.is_at_end());
        assert!(stream.advance().is_end());
        assert!(stream.advance().is_end());
        assert_eq!(stream.cursor(), 1);
    }
}
