//! Recursive descent parser for taxi sources
//!
//! Produces unresolved declarations. Type names are kept exactly as written;
//! resolution against the rest of the package and its imports happens in
//! [`super::taxi`].

use std::collections::BTreeMap;

use super::lexer::{Token, TokenKind};
use super::{CompilationMessage, Severity};

const TOP_LEVEL_KEYWORDS: [&str; 6] = ["type", "model", "enum", "service", "namespace", "import"];

/// A type name as written in source, with its position
#[derive(Debug, Clone, PartialEq)]
pub struct RawTypeRef {
    pub name: String,
    pub is_collection: bool,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawAnnotation {
    pub name: String,
    pub params: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawField {
    pub name: String,
    pub type_ref: RawTypeRef,
    pub nullable: bool,
    pub doc: Option<String>,
    pub annotations: Vec<RawAnnotation>,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawParameter {
    pub name: Option<String>,
    pub type_ref: RawTypeRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawOperation {
    pub name: String,
    pub parameters: Vec<RawParameter>,
    pub return_type: Option<RawTypeRef>,
    pub annotations: Vec<RawAnnotation>,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeclarationKind {
    /// `type` or `model`; models are types with fields
    Type {
        inherits: Vec<RawTypeRef>,
        fields: Vec<RawField>,
    },
    Enum {
        values: Vec<String>,
    },
    Service {
        operations: Vec<RawOperation>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub namespace: String,
    pub name: String,
    pub kind: DeclarationKind,
    pub doc: Option<String>,
    pub annotations: Vec<RawAnnotation>,
    pub line: usize,
    pub column: usize,
}

/// Everything parsed out of one source file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFile {
    pub imports: Vec<String>,
    pub declarations: Vec<Declaration>,
}

type ParseResult<T> = std::result::Result<T, CompilationMessage>;

struct Parser<'a> {
    source_name: &'a str,
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
    messages: Vec<CompilationMessage>,
}

/// Parse a tokenized file.
///
/// A malformed declaration is reported and skipped; parsing resumes at the
/// next top-level keyword so later declarations are still checked.
pub fn parse(source_name: &str, tokens: &[Token]) -> (ParsedFile, Vec<CompilationMessage>) {
    let mut parser = Parser {
        source_name,
        tokens,
        pos: 0,
        depth: 0,
        messages: Vec::new(),
    };
    let mut file = ParsedFile::default();
    parser.parse_members(&mut file, String::new(), false);
    (file, parser.messages)
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        // tokenize always terminates the stream with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_nth(&self, n: usize) -> &TokenKind {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::LBrace => self.depth += 1,
            TokenKind::RBrace => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn error_at(&self, token: &Token, message: impl Into<String>) -> CompilationMessage {
        CompilationMessage::new(
            self.source_name,
            token.line,
            token.column,
            message,
            Severity::Error,
        )
    }

    fn unexpected(&self, expected: &str) -> CompilationMessage {
        let token = self.peek();
        self.error_at(
            token,
            format!("Expected {} but found {}", expected, token.kind.describe()),
        )
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> ParseResult<Token> {
        if *self.peek_kind() == kind {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&kind.describe()))
        }
    }

    fn expect_ident(&mut self, what: &str) -> ParseResult<(String, Token)> {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                let token = self.advance();
                Ok((name, token))
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek_kind(), TokenKind::Ident(s) if s == keyword)
    }

    fn at_declaration_start(&self) -> bool {
        match self.peek_kind() {
            TokenKind::Ident(s) if TOP_LEVEL_KEYWORDS.contains(&s.as_str()) => {
                matches!(self.peek_nth(1), TokenKind::Ident(_))
            }
            TokenKind::Doc(_) | TokenKind::At => true,
            _ => false,
        }
    }

    /// Skip ahead to the next declaration at `depth`
    fn recover(&mut self, depth: usize, start: usize) {
        if self.pos == start {
            self.advance();
        }
        loop {
            match self.peek_kind() {
                TokenKind::Eof => return,
                TokenKind::RBrace if self.depth == depth && depth > 0 => return,
                _ if self.depth == depth && self.at_declaration_start() => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn parse_members(&mut self, file: &mut ParsedFile, namespace: String, in_block: bool) {
        let depth = self.depth;
        let mut current_namespace = namespace;
        loop {
            let start = self.pos;
            match self.peek_kind() {
                TokenKind::Eof => {
                    if in_block {
                        let message = self.unexpected("'}' closing the namespace block");
                        self.messages.push(message);
                    }
                    return;
                }
                TokenKind::RBrace if in_block => {
                    self.advance();
                    return;
                }
                TokenKind::RBrace => {
                    let message = self.error_at(self.peek(), "Unexpected '}'");
                    self.messages.push(message);
                    self.advance();
                }
                _ if self.at_keyword("namespace") => {
                    self.advance();
                    match self.expect_ident("a namespace name") {
                        Ok((name, _)) => {
                            if self.peek_kind() == &TokenKind::LBrace {
                                self.advance();
                                self.parse_members(file, name, true);
                            } else {
                                current_namespace = name;
                            }
                        }
                        Err(message) => {
                            self.messages.push(message);
                            self.recover(depth, start);
                        }
                    }
                }
                _ if self.at_keyword("import") => {
                    self.advance();
                    match self.expect_ident("an imported type name") {
                        Ok((name, _)) => file.imports.push(name),
                        Err(message) => {
                            self.messages.push(message);
                            self.recover(depth, start);
                        }
                    }
                }
                _ => match self.parse_declaration(&current_namespace) {
                    Ok(declaration) => file.declarations.push(declaration),
                    Err(message) => {
                        self.messages.push(message);
                        self.recover(depth, start);
                    }
                },
            }
        }
    }

    /// Leading `[[ doc ]]` and `@Annotation` blocks, in any order
    fn parse_preamble(&mut self) -> ParseResult<(Option<String>, Vec<RawAnnotation>)> {
        let mut doc = None;
        let mut annotations = Vec::new();
        loop {
            match self.peek_kind().clone() {
                TokenKind::Doc(text) => {
                    self.advance();
                    doc = Some(text);
                }
                TokenKind::At => annotations.push(self.parse_annotation()?),
                _ => return Ok((doc, annotations)),
            }
        }
    }

    fn parse_annotation(&mut self) -> ParseResult<RawAnnotation> {
        self.expect(TokenKind::At)?;
        let (name, _) = self.expect_ident("an annotation name")?;
        let mut params = BTreeMap::new();
        if self.eat(&TokenKind::LParen) {
            while !self.eat(&TokenKind::RParen) {
                let (key, value) = match self.peek_kind().clone() {
                    TokenKind::Ident(key) if self.peek_nth(1) == &TokenKind::Equals => {
                        self.advance();
                        self.advance();
                        (key, self.parse_literal()?)
                    }
                    _ => ("value".to_string(), self.parse_literal()?),
                };
                params.insert(key, value);
                if !self.eat(&TokenKind::Comma) && self.peek_kind() != &TokenKind::RParen {
                    return Err(self.unexpected("',' or ')'"));
                }
            }
        }
        Ok(RawAnnotation { name, params })
    }

    fn parse_literal(&mut self) -> ParseResult<serde_json::Value> {
        let value = match self.peek_kind().clone() {
            TokenKind::Str(s) => serde_json::Value::String(s),
            TokenKind::Number(n) => match n.parse::<i64>() {
                Ok(i) => serde_json::Value::from(i),
                Err(_) => n
                    .parse::<f64>()
                    .map(serde_json::Value::from)
                    .map_err(|_| self.error_at(self.peek(), format!("Invalid number {}", n)))?,
            },
            TokenKind::Ident(s) if s == "true" => serde_json::Value::Bool(true),
            TokenKind::Ident(s) if s == "false" => serde_json::Value::Bool(false),
            TokenKind::Ident(s) => serde_json::Value::String(s),
            _ => return Err(self.unexpected("a value")),
        };
        self.advance();
        Ok(value)
    }

    fn parse_declaration(&mut self, namespace: &str) -> ParseResult<Declaration> {
        let (doc, annotations) = self.parse_preamble()?;
        let keyword = match self.peek_kind() {
            TokenKind::Ident(k) if ["type", "model", "enum", "service"].contains(&k.as_str()) => k.clone(),
            _ => return Err(self.unexpected("a type, model, enum or service declaration")),
        };
        self.advance();
        let (name, token) = self.expect_ident(&format!("a {} name", keyword))?;
        if name.contains('.') {
            return Err(self.error_at(
                &token,
                format!("Declared names cannot be qualified, found '{}'. Use a namespace instead", name),
            ));
        }

        let kind = match keyword.as_str() {
            "enum" => DeclarationKind::Enum {
                values: self.parse_enum_body()?,
            },
            "service" => DeclarationKind::Service {
                operations: self.parse_service_body()?,
            },
            _ => {
                let mut inherits = Vec::new();
                if self.at_keyword("inherits") {
                    self.advance();
                    inherits.push(self.parse_type_ref()?);
                    while self.eat(&TokenKind::Comma) {
                        inherits.push(self.parse_type_ref()?);
                    }
                }
                let fields = if self.peek_kind() == &TokenKind::LBrace {
                    self.parse_fields()?
                } else if keyword == "model" {
                    return Err(self.unexpected("'{' opening the model body"));
                } else {
                    Vec::new()
                };
                DeclarationKind::Type { inherits, fields }
            }
        };

        Ok(Declaration {
            namespace: namespace.to_string(),
            name,
            kind,
            doc,
            annotations,
            line: token.line,
            column: token.column,
        })
    }

    fn parse_type_ref(&mut self) -> ParseResult<RawTypeRef> {
        let (name, token) = self.expect_ident("a type name")?;
        let mut is_collection = false;
        if self.peek_kind() == &TokenKind::LBracket && self.peek_nth(1) == &TokenKind::RBracket {
            self.advance();
            self.advance();
            is_collection = true;
        }
        Ok(RawTypeRef {
            name,
            is_collection,
            line: token.line,
            column: token.column,
        })
    }

    fn parse_fields(&mut self) -> ParseResult<Vec<RawField>> {
        self.expect(TokenKind::LBrace)?;
        let mut fields = Vec::new();
        loop {
            if self.eat(&TokenKind::RBrace) {
                return Ok(fields);
            }
            let (doc, annotations) = self.parse_preamble()?;
            let (name, token) = self.expect_ident("a field name or '}'")?;
            self.expect(TokenKind::Colon)?;
            let type_ref = self.parse_type_ref()?;
            let nullable = self.eat(&TokenKind::Question);
            self.eat(&TokenKind::Comma);
            fields.push(RawField {
                name,
                type_ref,
                nullable,
                doc,
                annotations,
                line: token.line,
                column: token.column,
            });
        }
    }

    fn parse_enum_body(&mut self) -> ParseResult<Vec<String>> {
        self.expect(TokenKind::LBrace)?;
        let mut values = Vec::new();
        loop {
            if self.eat(&TokenKind::RBrace) {
                return Ok(values);
            }
            self.parse_preamble()?;
            let (value, _) = self.expect_ident("an enum value or '}'")?;
            // Synonyms and explicit values are accepted but not modelled
            if self.eat(&TokenKind::LParen) {
                while !self.eat(&TokenKind::RParen) {
                    if self.peek_kind() == &TokenKind::Eof {
                        return Err(self.unexpected("')'"));
                    }
                    self.advance();
                }
            }
            self.eat(&TokenKind::Comma);
            values.push(value);
        }
    }

    fn parse_service_body(&mut self) -> ParseResult<Vec<RawOperation>> {
        self.expect(TokenKind::LBrace)?;
        let mut operations = Vec::new();
        loop {
            if self.eat(&TokenKind::RBrace) {
                return Ok(operations);
            }
            let (_, annotations) = self.parse_preamble()?;
            if !self.at_keyword("operation") {
                return Err(self.unexpected("'operation' or '}'"));
            }
            self.advance();
            let (name, token) = self.expect_ident("an operation name")?;
            self.expect(TokenKind::LParen)?;
            let mut parameters = Vec::new();
            while !self.eat(&TokenKind::RParen) {
                self.parse_preamble()?;
                let parameter = if matches!(self.peek_kind(), TokenKind::Ident(_))
                    && self.peek_nth(1) == &TokenKind::Colon
                {
                    let (param_name, _) = self.expect_ident("a parameter name")?;
                    self.advance();
                    RawParameter {
                        name: Some(param_name),
                        type_ref: self.parse_type_ref()?,
                    }
                } else {
                    RawParameter {
                        name: None,
                        type_ref: self.parse_type_ref()?,
                    }
                };
                parameters.push(parameter);
                if !self.eat(&TokenKind::Comma) && self.peek_kind() != &TokenKind::RParen {
                    return Err(self.unexpected("',' or ')'"));
                }
            }
            let return_type = if self.eat(&TokenKind::Colon) {
                Some(self.parse_type_ref()?)
            } else {
                None
            };
            operations.push(RawOperation {
                name,
                parameters,
                return_type,
                annotations,
                line: token.line,
                column: token.column,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::tokenize;

    fn parse_src(src: &str) -> (ParsedFile, Vec<CompilationMessage>) {
        let (tokens, lex_messages) = tokenize("test.taxi", src);
        assert!(lex_messages.is_empty());
        parse("test.taxi", &tokens)
    }

    #[test]
    fn test_parse_scalar_and_model() {
        let (file, messages) = parse_src(
            "type FirstName inherits String\nmodel Person { firstName : FirstName\n friends : Person[]? }",
        );
        assert!(messages.is_empty(), "{:?}", messages);
        assert_eq!(file.declarations.len(), 2);
        match &file.declarations[1].kind {
            DeclarationKind::Type { fields, .. } => {
                assert_eq!(fields.len(), 2);
                assert!(fields[1].type_ref.is_collection);
                assert!(fields[1].nullable);
            }
            other => panic!("expected a type, got {:?}", other),
        }
    }

    #[test]
    fn test_namespace_block_and_docs() {
        let (file, messages) = parse_src(
            "namespace film.types {\n [[ A description ]]\n type Description inherits String\n}\ntype Outside",
        );
        assert!(messages.is_empty(), "{:?}", messages);
        assert_eq!(file.declarations[0].namespace, "film.types");
        assert_eq!(file.declarations[0].doc.as_deref(), Some("A description"));
        assert_eq!(file.declarations[1].namespace, "");
    }

    #[test]
    fn test_namespace_statement_and_imports() {
        let (file, _) = parse_src("namespace film\nimport people.Person\ntype Title inherits String");
        assert_eq!(file.imports, vec!["people.Person".to_string()]);
        assert_eq!(file.declarations[0].namespace, "film");
    }

    #[test]
    fn test_service_operations() {
        let (file, messages) = parse_src(
            "service FilmService {\n @HttpOperation(method = \"GET\", url = \"/films\")\n operation findAll() : Film[]\n operation findOne(id : FilmId, Region) : Film\n}",
        );
        assert!(messages.is_empty(), "{:?}", messages);
        match &file.declarations[0].kind {
            DeclarationKind::Service { operations } => {
                assert_eq!(operations.len(), 2);
                assert_eq!(operations[0].annotations[0].params["method"], "GET");
                assert_eq!(operations[1].parameters[0].name.as_deref(), Some("id"));
                assert_eq!(operations[1].parameters[1].name, None);
            }
            other => panic!("expected a service, got {:?}", other),
        }
    }

    #[test]
    fn test_recovers_after_broken_declaration() {
        let (file, messages) = parse_src("model Broken { name String }\ntype Fine inherits String");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].line, 1);
        assert_eq!(file.declarations.len(), 1);
        assert_eq!(file.declarations[0].name, "Fine");
    }

    #[test]
    fn test_recovery_keeps_namespace_block() {
        let (file, messages) = parse_src("namespace a {\n model B { x Y }\n type C\n}\ntype D");
        assert_eq!(messages.len(), 1, "{:?}", messages);
        let names: Vec<_> = file
            .declarations
            .iter()
            .map(|d| format!("{}:{}", d.namespace, d.name))
            .collect();
        assert_eq!(names, vec!["a:C", ":D"]);
    }

    #[test]
    fn test_enum_values() {
        let (file, messages) = parse_src("enum Genre { Action, Comedy(\"funny\"), Drama }");
        assert!(messages.is_empty());
        assert_eq!(
            file.declarations[0].kind,
            DeclarationKind::Enum {
                values: vec!["Action".into(), "Comedy".into(), "Drama".into()]
            }
        );
    }
}
