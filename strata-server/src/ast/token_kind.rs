use logos::Logos;

pub use self::TokenKind::*;

/// Tokens of the statement translator. Keywords match case-insensitively;
/// only the statement shapes that drive the executor are covered here, the
/// full SQL grammar stays outside the engine.
#[derive(Logos, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    EOI,

    #[regex(r"[ \t\r\n\f]+", logos::skip)]
    Whitespace,

    #[regex(r"--[^\n]*", logos::skip)]
    Comment,

    #[regex(r#"[_a-zA-Z][_a-zA-Z0-9]*"#, priority = 1)]
    Ident,

    #[regex(r#"'([^'\\]|\\.|'')*'"#)]
    QuotedString,

    #[regex(r"[xX]'[a-fA-F0-9]*'")]
    LiteralHex,

    #[regex(r"[0-9]+")]
    LiteralInteger,

    #[regex(r"([0-9]*\.[0-9]+([eE][+-]?[0-9]+)?)|([0-9]+\.[0-9]*([eE][+-]?[0-9]+)?)")]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+")]
    LiteralFloat,

    // Symbols
    #[token("=")]
    Eq,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token(".")]
    Period,
    #[token(";")]
    SemiColon,
    #[token("*")]
    Multiply,
    #[token("-")]
    Minus,

    // Keywords
    #[token("ACCESS", ignore(ascii_case))]
    ACCESS,
    #[token("ACTIVE", ignore(ascii_case))]
    ACTIVE,
    #[token("ADD", ignore(ascii_case))]
    ADD,
    #[token("ALL", ignore(ascii_case))]
    ALL,
    #[token("ALTER", ignore(ascii_case))]
    ALTER,
    #[token("AND", ignore(ascii_case))]
    AND,
    #[token("CHECK", ignore(ascii_case))]
    CHECK,
    #[token("CIPHER", ignore(ascii_case))]
    CIPHER,
    #[token("CREATE", ignore(ascii_case))]
    CREATE,
    #[token("DATABASE", ignore(ascii_case))]
    DATABASE,
    #[token("DATABASES", ignore(ascii_case))]
    DATABASES,
    #[token("DELETE", ignore(ascii_case))]
    DELETE,
    #[token("DESCRIBE", ignore(ascii_case))]
    DESCRIBE,
    #[token("DROP", ignore(ascii_case))]
    DROP,
    #[token("FALSE", ignore(ascii_case))]
    FALSE,
    #[token("FROM", ignore(ascii_case))]
    FROM,
    #[token("GRANT", ignore(ascii_case))]
    GRANT,
    #[token("INACTIVE", ignore(ascii_case))]
    INACTIVE,
    #[token("INSERT", ignore(ascii_case))]
    INSERT,
    #[token("INTO", ignore(ascii_case))]
    INTO,
    #[token("KEY", ignore(ascii_case))]
    KEY,
    #[token("NULL", ignore(ascii_case))]
    NULL,
    #[token("ON", ignore(ascii_case))]
    ON,
    #[token("OPTION", ignore(ascii_case))]
    OPTION,
    #[token("RENAME", ignore(ascii_case))]
    RENAME,
    #[token("REVOKE", ignore(ascii_case))]
    REVOKE,
    #[token("SELECT", ignore(ascii_case))]
    SELECT,
    #[token("SET", ignore(ascii_case))]
    SET,
    #[token("SHOW", ignore(ascii_case))]
    SHOW,
    #[token("TABLE", ignore(ascii_case))]
    TABLE,
    #[token("TABLES", ignore(ascii_case))]
    TABLES,
    #[token("TO", ignore(ascii_case))]
    TO,
    #[token("TOKEN", ignore(ascii_case))]
    TOKEN,
    #[token("TRUE", ignore(ascii_case))]
    TRUE,
    #[token("UPDATE", ignore(ascii_case))]
    UPDATE,
    #[token("USE", ignore(ascii_case))]
    USE,
    #[token("USER", ignore(ascii_case))]
    USER,
    #[token("VALUES", ignore(ascii_case))]
    VALUES,
    #[token("WHERE", ignore(ascii_case))]
    WHERE,
    #[token("WITH", ignore(ascii_case))]
    WITH,
}
