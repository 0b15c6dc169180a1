use std::ops::Range;

use logos::{Lexer, Logos};

use crate::ast::token_kind::TokenKind;

type Result<T> = std::result::Result<T, String>;

#[derive(Clone, PartialEq, Eq)]
pub struct Token<'a> {
    pub source: &'a str,
    pub slice: &'a str,
    pub kind: TokenKind,
    pub span: Range<usize>,
}

impl<'a> Token<'a> {
    fn new_eoi(source: &'a str) -> Self {
        Token { source, slice: "", kind: TokenKind::EOI, span: (source.len()..source.len()) }
    }

    pub fn text(&self) -> &'a str {
        &self.source[self.span.clone()]
    }
}

impl<'a> std::fmt::Debug for Token<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({:?})", self.kind, self.span)
    }
}

pub struct Tokenizer<'a> {
    source: &'a str,
    lexer: Lexer<'a, TokenKind>,
    eoi: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(source: &'a str) -> Self {
        Tokenizer { source, lexer: TokenKind::lexer(source), eoi: false }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Result<Token<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.lexer.next() {
            Some(Err(_)) => Some(Err(format!(
                "unable to recognize the rest tokens: {:?}",
                &self.source[self.lexer.span().start..]
            ))),
            Some(Ok(kind)) => Some(Ok(Token {
                source: self.source,
                slice: self.lexer.slice(),
                kind,
                span: self.lexer.span(),
            })),
            None if !self.eoi => {
                self.eoi = true;
                Some(Ok(Token::new_eoi(self.source)))
            }
            None => None,
        }
    }
}

pub fn tokenize_sql(sql: &str) -> Result<Vec<Token>> {
    Tokenizer::new(sql).collect::<Result<Vec<_>>>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::token_kind::TokenKind::*;

    #[test]
    fn keywords_are_case_insensitive() {
        let tokens = tokenize_sql("select * from t1;").unwrap();
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![SELECT, Multiply, FROM, Ident, SemiColon, EOI]);
    }

    #[test]
    fn literals_and_idents() {
        let tokens = tokenize_sql("INSERT INTO t VALUES ('a''b', 42, 1.5, x'0aff')").unwrap();
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                INSERT,
                INTO,
                Ident,
                VALUES,
                LParen,
                QuotedString,
                Comma,
                LiteralInteger,
                Comma,
                LiteralFloat,
                Comma,
                LiteralHex,
                RParen,
                EOI
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        let tokens = tokenize_sql("-- nothing to see\nSHOW TABLES").unwrap();
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![SHOW, TABLES, EOI]);
    }

    #[test]
    fn keyword_prefix_is_still_ident() {
        let tokens = tokenize_sql("SELECTED").unwrap();
        assert_eq!(tokens[0].kind, Ident);
        assert_eq!(tokens[0].text(), "SELECTED");
    }
}
