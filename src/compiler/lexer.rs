//! Tokenizer for taxi sources

use super::{CompilationMessage, Severity};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Identifier, possibly dotted (`film.types.Title`)
    Ident(String),
    Str(String),
    Number(String),
    /// `[[ ... ]]`
    Doc(String),
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Colon,
    Comma,
    Question,
    At,
    Equals,
    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(s) => format!("'{}'", s),
            TokenKind::Str(s) => format!("\"{}\"", s),
            TokenKind::Number(n) => n.clone(),
            TokenKind::Doc(_) => "documentation block".to_string(),
            TokenKind::LBrace => "'{'".to_string(),
            TokenKind::RBrace => "'}'".to_string(),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::LBracket => "'['".to_string(),
            TokenKind::RBracket => "']'".to_string(),
            TokenKind::Colon => "':'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::Question => "'?'".to_string(),
            TokenKind::At => "'@'".to_string(),
            TokenKind::Equals => "'='".to_string(),
            TokenKind::Eof => "end of file".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

struct Cursor<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek_second(&self) -> Option<char> {
        let mut clone = self.chars.clone();
        clone.next();
        clone.next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }
}

/// Split a source file into tokens.
///
/// Unrecognised characters are reported and skipped, so a stray character
/// produces one diagnostic rather than aborting the file.
pub fn tokenize(source_name: &str, src: &str) -> (Vec<Token>, Vec<CompilationMessage>) {
    let mut cursor = Cursor::new(src);
    let mut tokens = Vec::new();
    let mut messages = Vec::new();

    while let Some(c) = cursor.peek() {
        let (line, column) = (cursor.line, cursor.column);
        let push = |tokens: &mut Vec<Token>, kind| tokens.push(Token { kind, line, column });

        if c.is_whitespace() {
            cursor.bump();
            continue;
        }

        match c {
            '/' if cursor.peek_second() == Some('/') => {
                while let Some(c) = cursor.peek() {
                    if c == '\n' {
                        break;
                    }
                    cursor.bump();
                }
            }
            '/' if cursor.peek_second() == Some('*') => {
                cursor.bump();
                cursor.bump();
                let mut closed = false;
                while let Some(c) = cursor.bump() {
                    if c == '*' && cursor.peek() == Some('/') {
                        cursor.bump();
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    messages.push(CompilationMessage::new(
                        source_name,
                        line,
                        column,
                        "Unterminated block comment",
                        Severity::Error,
                    ));
                }
            }
            '[' if cursor.peek_second() == Some('[') => {
                cursor.bump();
                cursor.bump();
                let mut text = String::new();
                let mut closed = false;
                while let Some(c) = cursor.bump() {
                    if c == ']' && cursor.peek() == Some(']') {
                        cursor.bump();
                        closed = true;
                        break;
                    }
                    text.push(c);
                }
                if !closed {
                    messages.push(CompilationMessage::new(
                        source_name,
                        line,
                        column,
                        "Unterminated documentation block, expected ']]'",
                        Severity::Error,
                    ));
                }
                push(&mut tokens, TokenKind::Doc(text.trim().to_string()));
            }
            '"' => {
                cursor.bump();
                let mut text = String::new();
                let mut closed = false;
                while let Some(c) = cursor.bump() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => {
                            if let Some(escaped) = cursor.bump() {
                                text.push(escaped);
                            }
                        }
                        '\n' => break,
                        other => text.push(other),
                    }
                }
                if !closed {
                    messages.push(CompilationMessage::new(
                        source_name,
                        line,
                        column,
                        "Unterminated string literal",
                        Severity::Error,
                    ));
                }
                push(&mut tokens, TokenKind::Str(text));
            }
            '{' | '}' | '(' | ')' | '[' | ']' | ':' | ',' | '?' | '@' | '=' => {
                cursor.bump();
                let kind = match c {
                    '{' => TokenKind::LBrace,
                    '}' => TokenKind::RBrace,
                    '(' => TokenKind::LParen,
                    ')' => TokenKind::RParen,
                    '[' => TokenKind::LBracket,
                    ']' => TokenKind::RBracket,
                    ':' => TokenKind::Colon,
                    ',' => TokenKind::Comma,
                    '?' => TokenKind::Question,
                    '@' => TokenKind::At,
                    _ => TokenKind::Equals,
                };
                push(&mut tokens, kind);
            }
            c if c.is_ascii_digit() || (c == '-' && cursor.peek_second().map_or(false, |n| n.is_ascii_digit())) => {
                let mut text = String::new();
                text.push(c);
                cursor.bump();
                while let Some(c) = cursor.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        text.push(c);
                        cursor.bump();
                    } else {
                        break;
                    }
                }
                push(&mut tokens, TokenKind::Number(text));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(c) = cursor.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '.' {
                        text.push(c);
                        cursor.bump();
                    } else {
                        break;
                    }
                }
                push(&mut tokens, TokenKind::Ident(text));
            }
            other => {
                cursor.bump();
                messages.push(CompilationMessage::new(
                    source_name,
                    line,
                    column,
                    format!("Unexpected character '{}'", other),
                    Severity::Error,
                ));
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        line: cursor.line,
        column: cursor.column,
    });
    (tokens, messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let (tokens, messages) = tokenize("test.taxi", src);
        assert!(messages.is_empty(), "unexpected messages: {:?}", messages);
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_model_tokens() {
        let tokens = kinds("model Person { name : film.Name? }");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Ident("model".into()),
                TokenKind::Ident("Person".into()),
                TokenKind::LBrace,
                TokenKind::Ident("name".into()),
                TokenKind::Colon,
                TokenKind::Ident("film.Name".into()),
                TokenKind::Question,
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_docs_and_comments() {
        let tokens = kinds("// leading\n[[ The title ]]\n/* block */ type Title");
        assert_eq!(tokens[0], TokenKind::Doc("The title".into()));
        assert_eq!(tokens[1], TokenKind::Ident("type".into()));
    }

    #[test]
    fn test_positions() {
        let (tokens, _) = tokenize("t.taxi", "type A\n  type B");
        let b = &tokens[3];
        assert_eq!(b.kind, TokenKind::Ident("B".into()));
        assert_eq!((b.line, b.column), (2, 8));
    }

    #[test]
    fn test_unexpected_character_is_reported() {
        let (tokens, messages) = tokenize("t.taxi", "type A # type B");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].column, 8);
        assert_eq!(tokens.len(), 5);
    }
}
