#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Punctuation
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Semicolon,

    // Operators
    Minus,
    Plus,
    Slash,
    Star,
    Hash,      // #
    At,        // @
    Ampersand, // &
    Pipe,      // |
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // Literals
    Identifier,
    Number,
    /// Raw text between brackets, trimmed.
    ArrayBody,

    // Keywords
    And,
    Else,
    False,
    For,
    Fun,
    If,
    Or,
    Print,
    Return,
    True,
    Var,
    While,

    // Special
    /// Lexical error; the lexeme is the message.
    Error,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub line: usize,
}

impl Token<'_> {
    /// Placeholder used before the first token is scanned.
    pub fn synthetic() -> Token<'static> {
        Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 0,
        }
    }
}

/// On-demand scanner. Whitespace is insignificant outside brackets; inside
/// them everything up to the next bracket is one `ArrayBody` token, so the
/// scanner tracks bracket depth itself.
pub struct Scanner<'src> {
    source: &'src str,
    bytes: &'src [u8],
    start: usize,
    pos: usize,
    line: usize,
    depth: usize,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            start: 0,
            pos: 0,
            line: 1,
            depth: 0,
        }
    }

    /// Produce the next token. Never fails: problems come back as
    /// `TokenKind::Error` tokens, and `Eof` repeats forever at the end.
    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace_and_comments();
        self.start = self.pos;
        let Some(ch) = self.peek() else {
            return self.make(TokenKind::Eof);
        };

        if self.depth > 0 {
            return self.scan_in_brackets(ch);
        }

        self.pos += 1;
        match ch {
            b'(' => self.make(TokenKind::LeftParen),
            b')' => self.make(TokenKind::RightParen),
            b'{' => self.make(TokenKind::LeftBrace),
            b'}' => self.make(TokenKind::RightBrace),
            b'[' => {
                self.depth += 1;
                self.make(TokenKind::LeftBracket)
            }
            b']' => self.make(TokenKind::RightBracket),
            b',' => self.make(TokenKind::Comma),
            b'.' => self.make(TokenKind::Dot),
            b';' => self.make(TokenKind::Semicolon),
            b'-' => self.make(TokenKind::Minus),
            b'+' => self.make(TokenKind::Plus),
            b'/' => self.make(TokenKind::Slash),
            b'*' => self.make(TokenKind::Star),
            b'#' => self.make(TokenKind::Hash),
            b'@' => self.make(TokenKind::At),
            b'&' => self.make(TokenKind::Ampersand),
            b'|' => self.make(TokenKind::Pipe),
            b'!' => self.make_if_eq(TokenKind::BangEqual, TokenKind::Bang),
            b'=' => self.make_if_eq(TokenKind::EqualEqual, TokenKind::Equal),
            b'<' => self.make_if_eq(TokenKind::LessEqual, TokenKind::Less),
            b'>' => self.make_if_eq(TokenKind::GreaterEqual, TokenKind::Greater),
            c if c.is_ascii_digit() => self.number(),
            c if c.is_ascii_alphabetic() || c == b'_' => self.identifier(),
            _ => {
                // Step over the whole character so lexemes stay on char boundaries.
                let width = self.source[self.start..].chars().next().map_or(1, char::len_utf8);
                self.pos = self.start + width;
                self.error("Unexpected character.")
            }
        }
    }

    fn scan_in_brackets(&mut self, ch: u8) -> Token<'src> {
        match ch {
            b'[' => {
                self.pos += 1;
                self.depth += 1;
                self.make(TokenKind::LeftBracket)
            }
            b']' => {
                self.pos += 1;
                self.depth -= 1;
                self.make(TokenKind::RightBracket)
            }
            b',' => {
                self.pos += 1;
                self.make(TokenKind::Comma)
            }
            _ => {
                while let Some(c) = self.peek() {
                    if c == b'[' || c == b']' || (c == b'/' && self.peek_next() == Some(b'/')) {
                        break;
                    }
                    if c == b'\n' {
                        self.line += 1;
                    }
                    self.pos += 1;
                }
                Token {
                    kind: TokenKind::ArrayBody,
                    lexeme: self.source[self.start..self.pos].trim_end(),
                    line: self.line,
                }
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.bytes.get(self.pos + 1).copied()
    }

    fn make(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.pos],
            line: self.line,
        }
    }

    fn make_if_eq(&mut self, matched: TokenKind, single: TokenKind) -> Token<'src> {
        if self.peek() == Some(b'=') {
            self.pos += 1;
            self.make(matched)
        } else {
            self.make(single)
        }
    }

    fn error(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            line: self.line,
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                b' ' | b'\t' | b'\r' => self.pos += 1,
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                b'/' if self.peek_next() == Some(b'/') => {
                    while self.peek().is_some_and(|c| c != b'\n') {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        self.make(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token<'src> {
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_') {
            self.pos += 1;
        }
        let kind = match &self.source[self.start..self.pos] {
            "and" => TokenKind::And,
            "else" => TokenKind::Else,
            "false" => TokenKind::False,
            "for" => TokenKind::For,
            "fun" => TokenKind::Fun,
            "if" => TokenKind::If,
            "or" => TokenKind::Or,
            "print" => TokenKind::Print,
            "return" => TokenKind::Return,
            "true" => TokenKind::True,
            "var" => TokenKind::Var,
            "while" => TokenKind::While,
            _ => TokenKind::Identifier,
        };
        self.make(kind)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tokens(s: &str) -> Vec<Token<'_>> {
        let mut scanner = Scanner::new(s);
        let mut out = Vec::new();
        loop {
            let token = scanner.scan_token();
            out.push(token);
            if token.kind == TokenKind::Eof {
                return out;
            }
        }
    }

    fn kinds(s: &str) -> Vec<TokenKind> {
        tokens(s).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn operators_and_keywords() {
        use TokenKind::*;
        assert_eq!(
            kinds("var x = a @ b . c != d <= e;"),
            vec![Var, Identifier, Equal, Identifier, At, Identifier, Dot, Identifier, BangEqual, Identifier, LessEqual, Identifier, Semicolon, Eof]
        );
        assert_eq!(kinds("fun while for if else print return and or true false"), vec![
            Fun, While, For, If, Else, Print, Return, And, Or, True, False, Eof
        ]);
        assert_eq!(kinds("# & | ! -"), vec![Hash, Ampersand, Pipe, Bang, Minus, Eof]);
    }

    #[test]
    fn numbers_outside_brackets() {
        let toks = tokens("12 3.5 4.");
        assert_eq!(toks[0].lexeme, "12");
        assert_eq!(toks[1].lexeme, "3.5");
        assert_eq!(toks[2].lexeme, "4");
        assert_eq!(toks[3].kind, TokenKind::Dot);
    }

    #[test]
    fn array_body_is_raw_text() {
        let toks = tokens("[1, 2,  3 ]");
        assert_eq!(toks[0].kind, TokenKind::LeftBracket);
        assert_eq!(toks[1].kind, TokenKind::ArrayBody);
        assert_eq!(toks[1].lexeme, "1, 2,  3");
        assert_eq!(toks[2].kind, TokenKind::RightBracket);
        assert_eq!(toks[3].kind, TokenKind::Eof);
    }

    #[test]
    fn nested_brackets_split_on_commas_between_levels() {
        use TokenKind::*;
        assert_eq!(
            kinds("[[1,2], [3,4]] + x"),
            vec![LeftBracket, LeftBracket, ArrayBody, RightBracket, Comma, LeftBracket, ArrayBody, RightBracket, RightBracket, Plus, Identifier, Eof]
        );
    }

    #[test]
    fn character_body_keeps_inner_spaces() {
        let toks = tokens("[ hello world ]");
        assert_eq!(toks[1].lexeme, "hello world");
    }

    #[test]
    fn comment_ends_an_array_body() {
        use TokenKind::*;
        let toks = tokens("[1, 2 // two\n, 3]");
        assert_eq!(
            toks.iter().map(|t| t.kind).collect::<Vec<_>>(),
            vec![LeftBracket, ArrayBody, Comma, ArrayBody, RightBracket, Eof]
        );
        assert_eq!(toks[1].lexeme, "1, 2");
        assert_eq!(toks[3].lexeme, "3");
        assert_eq!(toks[3].line, 2);
    }

    #[test]
    fn comments_and_lines() {
        let toks = tokens("a // note\nb\n\nc");
        assert_eq!(toks.len(), 4);
        assert_eq!(toks[0].line, 1);
        assert_eq!(toks[1].line, 2);
        assert_eq!(toks[2].line, 4);
    }

    #[test]
    fn unexpected_character_is_an_error_token() {
        let toks = tokens("a $ b é");
        assert_eq!(toks[1].kind, TokenKind::Error);
        assert_eq!(toks[1].lexeme, "Unexpected character.");
        assert_eq!(toks[2].kind, TokenKind::Identifier);
        assert_eq!(toks[3].kind, TokenKind::Error);
        assert_eq!(toks[4].kind, TokenKind::Eof);
    }

    #[test]
    fn eof_repeats() {
        let mut scanner = Scanner::new("");
        assert_eq!(scanner.scan_token().kind, TokenKind::Eof);
        assert_eq!(scanner.scan_token().kind, TokenKind::Eof);
    }
}
