//! Statement-to-request translation.
//!
//! A recursive-descent pass over the token stream that produces typed
//! engine requests. Only the statement shapes the executor consumes are
//! recognized; everything else is a syntax error.

use strata::error::{CResult, Error};
use strata::instance::{build_permission_mask, PermissionType};
use strata::request::{Condition, DbeRequest, RowFilter};
use strata::row::{ColumnDataType, Variant};

use super::token_kind::TokenKind;
use super::tokenizer::{tokenize_sql, Token};

/// Parses a statement list into engine requests.
pub fn parse_statements(sql: &str) -> CResult<Vec<DbeRequest>> {
    let tokens = tokenize_sql(sql).map_err(Error::InvalidArgument)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut requests = Vec::new();
    loop {
        while parser.accept(TokenKind::SemiColon) {}
        if parser.at_end() {
            break;
        }
        requests.push(parser.parse_statement()?);
        if !parser.at_end() && !parser.accept(TokenKind::SemiColon) {
            return Err(parser.unexpected("';' or end of input"));
        }
    }
    Ok(requests)
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn at_end(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::EOI)
    }

    fn peek_kind(&self) -> TokenKind {
        self.tokens.get(self.pos).map(|t| t.kind).unwrap_or(TokenKind::EOI)
    }

    fn peek_kind_at(&self, offset: usize) -> TokenKind {
        self.tokens.get(self.pos + offset).map(|t| t.kind).unwrap_or(TokenKind::EOI)
    }

    fn advance(&mut self) -> &Token<'a> {
        let token = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        self.pos += 1;
        token
    }

    fn accept(&mut self, kind: TokenKind) -> bool {
        if self.peek_kind() == kind {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> CResult<&Token<'a>> {
        if self.peek_kind() == kind {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&format!("{:?}", kind)))
        }
    }

    fn unexpected(&self, wanted: &str) -> Error {
        let got = self
            .tokens
            .get(self.pos)
            .map(|t| format!("'{}'", t.text()))
            .unwrap_or_else(|| "end of input".to_string());
        Error::InvalidArgument(format!("syntax error: expected {}, got {}", wanted, got))
    }

    /// Uppercased identifier.
    fn ident(&mut self) -> CResult<String> {
        let token = self.expect(TokenKind::Ident)?;
        Ok(token.text().to_ascii_uppercase())
    }

    /// `name` or `db.name`.
    fn qualified_name(&mut self) -> CResult<(Option<String>, String)> {
        let first = self.ident()?;
        if self.accept(TokenKind::Period) {
            let second = self.ident()?;
            Ok((Some(first), second))
        } else {
            Ok((None, first))
        }
    }

    fn quoted_string(&mut self) -> CResult<String> {
        let token = self.expect(TokenKind::QuotedString)?;
        Ok(unquote(token.text()))
    }

    fn hex_literal(&mut self) -> CResult<Vec<u8>> {
        let token = self.expect(TokenKind::LiteralHex)?;
        let inner = &token.text()[2..token.text().len() - 1];
        hex::decode(inner)
            .map_err(|_| Error::InvalidArgument(format!("invalid hex literal {}", token.text())))
    }

    fn literal(&mut self) -> CResult<Variant> {
        match self.peek_kind() {
            TokenKind::NULL => {
                self.advance();
                Ok(Variant::Null)
            }
            TokenKind::TRUE => {
                self.advance();
                Ok(Variant::Bool(true))
            }
            TokenKind::FALSE => {
                self.advance();
                Ok(Variant::Bool(false))
            }
            TokenKind::Minus => {
                self.advance();
                match self.peek_kind() {
                    TokenKind::LiteralInteger => {
                        let text = self.advance().text();
                        let value: i64 = format!("-{}", text).parse().map_err(|_| {
                            Error::InvalidArgument(format!("integer literal -{} overflows", text))
                        })?;
                        Ok(Variant::Int64(value))
                    }
                    TokenKind::LiteralFloat => {
                        let text = self.advance().text();
                        let value: f64 = text.parse().map_err(|_| {
                            Error::InvalidArgument(format!("bad float literal {}", text))
                        })?;
                        Ok(Variant::Double(-value))
                    }
                    _ => Err(self.unexpected("a numeric literal")),
                }
            }
            TokenKind::LiteralInteger => {
                let text = self.advance().text();
                if let Ok(value) = text.parse::<i64>() {
                    Ok(Variant::Int64(value))
                } else {
                    text.parse::<u64>().map(Variant::UInt64).map_err(|_| {
                        Error::InvalidArgument(format!("integer literal {} overflows", text))
                    })
                }
            }
            TokenKind::LiteralFloat => {
                let text = self.advance().text();
                text.parse::<f64>()
                    .map(Variant::Double)
                    .map_err(|_| Error::InvalidArgument(format!("bad float literal {}", text)))
            }
            TokenKind::QuotedString => Ok(Variant::Text(self.quoted_string()?)),
            TokenKind::LiteralHex => Ok(Variant::Binary(self.hex_literal()?)),
            _ => Err(self.unexpected("a literal")),
        }
    }

    fn parse_statement(&mut self) -> CResult<DbeRequest> {
        match self.peek_kind() {
            TokenKind::CREATE => self.parse_create(),
            TokenKind::DROP => self.parse_drop(),
            TokenKind::RENAME => self.parse_rename(),
            TokenKind::ALTER => self.parse_alter_user(),
            TokenKind::USE => self.parse_use(),
            TokenKind::SHOW => self.parse_show(),
            TokenKind::DESCRIBE => self.parse_describe(),
            TokenKind::INSERT => self.parse_insert(),
            TokenKind::SELECT => self.parse_select(),
            TokenKind::UPDATE => self.parse_update(),
            TokenKind::DELETE => self.parse_delete(),
            TokenKind::GRANT => self.parse_grant(),
            TokenKind::REVOKE => self.parse_revoke(),
            TokenKind::CHECK => self.parse_check_token(),
            _ => Err(self.unexpected("a statement")),
        }
    }

    fn parse_create(&mut self) -> CResult<DbeRequest> {
        self.expect(TokenKind::CREATE)?;
        match self.peek_kind() {
            TokenKind::DATABASE => {
                self.advance();
                let database = self.ident()?;
                let mut cipher_id = None;
                if self.accept(TokenKind::WITH) {
                    self.expect(TokenKind::CIPHER)?;
                    cipher_id = Some(self.quoted_string()?);
                }
                Ok(DbeRequest::CreateDatabase { database, cipher_id, description: None })
            }
            TokenKind::TABLE => {
                self.advance();
                let (database, table) = self.qualified_name()?;
                self.expect(TokenKind::LParen)?;
                let mut columns = Vec::new();
                loop {
                    let name = self.ident()?;
                    let data_type = self.data_type()?;
                    columns.push((name, data_type));
                    if !self.accept(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RParen)?;
                Ok(DbeRequest::CreateTable { database, table, columns })
            }
            TokenKind::USER => {
                self.advance();
                let name = self.ident()?;
                Ok(DbeRequest::CreateUser {
                    name,
                    real_name: None,
                    description: None,
                    active: true,
                })
            }
            _ => Err(self.unexpected("DATABASE, TABLE or USER")),
        }
    }

    fn parse_drop(&mut self) -> CResult<DbeRequest> {
        self.expect(TokenKind::DROP)?;
        match self.peek_kind() {
            TokenKind::DATABASE => {
                self.advance();
                let database = self.ident()?;
                Ok(DbeRequest::DropDatabase { database })
            }
            TokenKind::TABLE => {
                self.advance();
                let (database, table) = self.qualified_name()?;
                Ok(DbeRequest::DropTable { database, table })
            }
            TokenKind::USER => {
                self.advance();
                let name = self.ident()?;
                Ok(DbeRequest::DropUser { name })
            }
            _ => Err(self.unexpected("DATABASE, TABLE or USER")),
        }
    }

    fn parse_rename(&mut self) -> CResult<DbeRequest> {
        self.expect(TokenKind::RENAME)?;
        self.expect(TokenKind::DATABASE)?;
        let database = self.ident()?;
        self.expect(TokenKind::TO)?;
        let new_name = self.ident()?;
        Ok(DbeRequest::RenameDatabase { database, new_name })
    }

    fn parse_alter_user(&mut self) -> CResult<DbeRequest> {
        self.expect(TokenKind::ALTER)?;
        self.expect(TokenKind::USER)?;
        let user = self.ident()?;
        match self.peek_kind() {
            TokenKind::ACTIVE => {
                self.advance();
                Ok(DbeRequest::SetUserAttributes {
                    name: user,
                    real_name: None,
                    description: None,
                    active: Some(true),
                })
            }
            TokenKind::INACTIVE => {
                self.advance();
                Ok(DbeRequest::SetUserAttributes {
                    name: user,
                    real_name: None,
                    description: None,
                    active: Some(false),
                })
            }
            TokenKind::ADD => {
                self.advance();
                if self.accept(TokenKind::ACCESS) {
                    self.expect(TokenKind::KEY)?;
                    let key_name = self.ident()?;
                    let text = self.quoted_string()?;
                    Ok(DbeRequest::AddUserAccessKey { user, key_name, text, description: None })
                } else {
                    self.expect(TokenKind::TOKEN)?;
                    let token_name = self.ident()?;
                    let value = if self.peek_kind() == TokenKind::LiteralHex {
                        Some(self.hex_literal()?)
                    } else {
                        None
                    };
                    Ok(DbeRequest::CreateUserToken {
                        user,
                        token_name,
                        value,
                        expiration_timestamp: None,
                        description: None,
                    })
                }
            }
            TokenKind::DROP => {
                self.advance();
                if self.accept(TokenKind::ACCESS) {
                    self.expect(TokenKind::KEY)?;
                    let key_name = self.ident()?;
                    Ok(DbeRequest::DropUserAccessKey { user, key_name })
                } else {
                    self.expect(TokenKind::TOKEN)?;
                    let token_name = self.ident()?;
                    Ok(DbeRequest::DropUserToken { user, token_name })
                }
            }
            _ => Err(self.unexpected("ACTIVE, INACTIVE, ADD or DROP")),
        }
    }

    fn parse_use(&mut self) -> CResult<DbeRequest> {
        self.expect(TokenKind::USE)?;
        self.accept(TokenKind::DATABASE);
        let database = self.ident()?;
        Ok(DbeRequest::UseDatabase { database })
    }

    fn parse_show(&mut self) -> CResult<DbeRequest> {
        self.expect(TokenKind::SHOW)?;
        match self.peek_kind() {
            TokenKind::DATABASES => {
                self.advance();
                Ok(DbeRequest::ShowDatabases)
            }
            TokenKind::TABLES => {
                self.advance();
                Ok(DbeRequest::ShowTables)
            }
            _ => Err(self.unexpected("DATABASES or TABLES")),
        }
    }

    fn parse_describe(&mut self) -> CResult<DbeRequest> {
        self.expect(TokenKind::DESCRIBE)?;
        self.accept(TokenKind::TABLE);
        let (database, table) = self.qualified_name()?;
        Ok(DbeRequest::DescribeTable { database, table })
    }

    fn parse_insert(&mut self) -> CResult<DbeRequest> {
        self.expect(TokenKind::INSERT)?;
        self.expect(TokenKind::INTO)?;
        let (database, table) = self.qualified_name()?;
        let mut columns = Vec::new();
        if self.accept(TokenKind::LParen) {
            loop {
                columns.push(self.ident()?);
                if !self.accept(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
        }
        self.expect(TokenKind::VALUES)?;
        let mut values = Vec::new();
        loop {
            self.expect(TokenKind::LParen)?;
            let mut row = Vec::new();
            loop {
                row.push(self.literal()?);
                if !self.accept(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
            values.push(row);
            if !self.accept(TokenKind::Comma) {
                break;
            }
        }
        Ok(DbeRequest::Insert { database, table, columns, values })
    }

    fn parse_select(&mut self) -> CResult<DbeRequest> {
        self.expect(TokenKind::SELECT)?;
        let mut columns = Vec::new();
        if !self.accept(TokenKind::Multiply) {
            loop {
                columns.push(self.ident()?);
                if !self.accept(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::FROM)?;
        let (database, table) = self.qualified_name()?;
        let filter = self.where_clause()?;
        Ok(DbeRequest::Select { database, table, columns, filter })
    }

    fn parse_update(&mut self) -> CResult<DbeRequest> {
        self.expect(TokenKind::UPDATE)?;
        let (database, table) = self.qualified_name()?;
        self.expect(TokenKind::SET)?;
        let mut assignments = Vec::new();
        loop {
            let column = self.ident()?;
            self.expect(TokenKind::Eq)?;
            assignments.push((column, self.literal()?));
            if !self.accept(TokenKind::Comma) {
                break;
            }
        }
        let filter = self.where_clause()?;
        Ok(DbeRequest::Update { database, table, assignments, filter })
    }

    fn parse_delete(&mut self) -> CResult<DbeRequest> {
        self.expect(TokenKind::DELETE)?;
        self.expect(TokenKind::FROM)?;
        let (database, table) = self.qualified_name()?;
        let filter = self.where_clause()?;
        Ok(DbeRequest::Delete { database, table, filter })
    }

    fn parse_grant(&mut self) -> CResult<DbeRequest> {
        self.expect(TokenKind::GRANT)?;
        let permissions = self.permission_list(TokenKind::ON)?;
        self.expect(TokenKind::ON)?;
        let (database, table) = self.permission_object()?;
        self.expect(TokenKind::TO)?;
        let user = self.ident()?;
        let mut grant_option = false;
        if self.accept(TokenKind::WITH) {
            self.expect(TokenKind::GRANT)?;
            self.expect(TokenKind::OPTION)?;
            grant_option = true;
        }
        Ok(DbeRequest::GrantPermissions { user, database, table, permissions, grant_option })
    }

    fn parse_revoke(&mut self) -> CResult<DbeRequest> {
        self.expect(TokenKind::REVOKE)?;
        let permissions = self.permission_list(TokenKind::ON)?;
        self.expect(TokenKind::ON)?;
        let (database, table) = self.permission_object()?;
        self.expect(TokenKind::FROM)?;
        let user = self.ident()?;
        Ok(DbeRequest::RevokePermissions { user, database, table, permissions })
    }

    fn parse_check_token(&mut self) -> CResult<DbeRequest> {
        self.expect(TokenKind::CHECK)?;
        self.expect(TokenKind::TOKEN)?;
        let user = self.ident()?;
        self.expect(TokenKind::Period)?;
        let token_name = self.ident()?;
        let value = self.hex_literal()?;
        Ok(DbeRequest::CheckUserToken { user, token_name, value })
    }

    fn where_clause(&mut self) -> CResult<RowFilter> {
        let mut filter = Vec::new();
        if self.accept(TokenKind::WHERE) {
            loop {
                let column = self.ident()?;
                self.expect(TokenKind::Eq)?;
                let value = self.literal()?;
                filter.push(Condition { column, value });
                if !self.accept(TokenKind::AND) {
                    break;
                }
            }
        }
        Ok(filter)
    }

    fn data_type(&mut self) -> CResult<ColumnDataType> {
        let name = self.ident()?;
        match name.as_str() {
            "BOOLEAN" | "BOOL" => Ok(ColumnDataType::Bool),
            "BIGINT" | "INTEGER" | "INT" => Ok(ColumnDataType::Int64),
            "BIGUINT" | "UINT" => Ok(ColumnDataType::UInt64),
            "DOUBLE" | "FLOAT" | "REAL" => Ok(ColumnDataType::Double),
            "TEXT" | "VARCHAR" | "STRING" => Ok(ColumnDataType::Text),
            "BINARY" | "BLOB" => Ok(ColumnDataType::Binary),
            other => Err(Error::InvalidArgument(format!("unknown column type {}", other))),
        }
    }

    /// Comma-separated permission names up to `stop`.
    fn permission_list(&mut self, stop: TokenKind) -> CResult<u64> {
        let mut mask = 0u64;
        loop {
            if self.peek_kind() == stop {
                break;
            }
            let token = self.advance();
            let name = token.text().to_ascii_uppercase();
            if name == "ALL" {
                mask |= build_permission_mask(&[
                    PermissionType::Select,
                    PermissionType::Insert,
                    PermissionType::Delete,
                    PermissionType::Update,
                    PermissionType::Show,
                    PermissionType::Create,
                    PermissionType::Drop,
                    PermissionType::Alter,
                ]);
            } else {
                let permission = PermissionType::from_name(&name).ok_or_else(|| {
                    Error::InvalidArgument(format!("unknown permission {}", name))
                })?;
                mask |= permission.mask();
            }
            if self.peek_kind() != stop {
                self.expect(TokenKind::Comma)?;
            }
        }
        if mask == 0 {
            return Err(Error::InvalidArgument("empty permission list".into()));
        }
        Ok(mask)
    }

    /// `DATABASE db`, `TABLE [db.]t`, or `db.t` / `db.*`.
    fn permission_object(&mut self) -> CResult<(Option<String>, Option<String>)> {
        match self.peek_kind() {
            TokenKind::DATABASE => {
                self.advance();
                Ok((Some(self.ident()?), None))
            }
            TokenKind::TABLE => {
                self.advance();
                let (database, table) = self.qualified_name()?;
                Ok((database, Some(table)))
            }
            _ => {
                let database = self.ident()?;
                if self.accept(TokenKind::Period) {
                    if self.accept(TokenKind::Multiply) {
                        Ok((Some(database), Some("*".to_string())))
                    } else {
                        Ok((Some(database), Some(self.ident()?)))
                    }
                } else if self.peek_kind_at(0) == TokenKind::TO
                    || self.peek_kind_at(0) == TokenKind::FROM
                {
                    // Bare name: a database-level grant.
                    Ok((Some(database), None))
                } else {
                    Err(self.unexpected("'.' or TO/FROM"))
                }
            }
        }
    }
}

fn unquote(text: &str) -> String {
    let inner = &text[1..text.len() - 1];
    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    result.push(escaped);
                }
            }
            '\'' => {
                // Doubled quote inside a quoted string.
                chars.next();
                result.push('\'');
            }
            other => result.push(other),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn create_statements() {
        let requests = parse_statements(
            "CREATE DATABASE appdb WITH CIPHER 'aes256'; \
             CREATE TABLE appdb.events (kind TEXT, amount BIGINT); \
             CREATE USER alice",
        )
        .unwrap();
        assert_eq!(
            requests,
            vec![
                DbeRequest::CreateDatabase {
                    database: "APPDB".into(),
                    cipher_id: Some("aes256".into()),
                    description: None,
                },
                DbeRequest::CreateTable {
                    database: Some("APPDB".into()),
                    table: "EVENTS".into(),
                    columns: vec![
                        ("KIND".into(), ColumnDataType::Text),
                        ("AMOUNT".into(), ColumnDataType::Int64),
                    ],
                },
                DbeRequest::CreateUser {
                    name: "ALICE".into(),
                    real_name: None,
                    description: None,
                    active: true,
                },
            ]
        );
    }

    #[test]
    fn dml_statements() {
        let requests = parse_statements(
            "INSERT INTO t (a, b) VALUES ('x', 1), ('y', -2); \
             SELECT a, b FROM db1.t WHERE trid = 4 AND a = 'x'; \
             UPDATE t SET b = 3 WHERE a = 'x'; \
             DELETE FROM t WHERE b = 3",
        )
        .unwrap();
        assert_eq!(requests.len(), 4);
        assert_eq!(
            requests[0],
            DbeRequest::Insert {
                database: None,
                table: "T".into(),
                columns: vec!["A".into(), "B".into()],
                values: vec![
                    vec![Variant::Text("x".into()), Variant::Int64(1)],
                    vec![Variant::Text("y".into()), Variant::Int64(-2)],
                ],
            }
        );
        assert_eq!(
            requests[1],
            DbeRequest::Select {
                database: Some("DB1".into()),
                table: "T".into(),
                columns: vec!["A".into(), "B".into()],
                filter: vec![
                    Condition { column: "TRID".into(), value: Variant::Int64(4) },
                    Condition { column: "A".into(), value: Variant::Text("x".into()) },
                ],
            }
        );
    }

    #[test]
    fn user_and_token_statements() {
        let requests = parse_statements(
            "ALTER USER alice INACTIVE; \
             ALTER USER alice ADD ACCESS KEY main 'deadbeef'; \
             ALTER USER alice ADD TOKEN api x'0102'; \
             CHECK TOKEN alice.api x'0102'",
        )
        .unwrap();
        assert_eq!(
            requests[0],
            DbeRequest::SetUserAttributes {
                name: "ALICE".into(),
                real_name: None,
                description: None,
                active: Some(false),
            }
        );
        assert_eq!(
            requests[2],
            DbeRequest::CreateUserToken {
                user: "ALICE".into(),
                token_name: "API".into(),
                value: Some(vec![1, 2]),
                expiration_timestamp: None,
                description: None,
            }
        );
        assert_eq!(
            requests[3],
            DbeRequest::CheckUserToken {
                user: "ALICE".into(),
                token_name: "API".into(),
                value: vec![1, 2],
            }
        );
    }

    #[test]
    fn grant_and_revoke() {
        let requests = parse_statements(
            "GRANT SELECT, INSERT ON appdb.events TO alice WITH GRANT OPTION; \
             REVOKE INSERT ON DATABASE appdb FROM alice",
        )
        .unwrap();
        assert_eq!(
            requests[0],
            DbeRequest::GrantPermissions {
                user: "ALICE".into(),
                database: Some("APPDB".into()),
                table: Some("EVENTS".into()),
                permissions: PermissionType::Select.mask() | PermissionType::Insert.mask(),
                grant_option: true,
            }
        );
        assert_eq!(
            requests[1],
            DbeRequest::RevokePermissions {
                user: "ALICE".into(),
                database: Some("APPDB".into()),
                table: None,
                permissions: PermissionType::Insert.mask(),
            }
        );
    }

    #[test]
    fn syntax_errors_are_invalid_argument() {
        assert!(matches!(
            parse_statements("CREATE SOMETHING"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(parse_statements("SELECT FROM"), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            parse_statements("GRANT FLY ON DATABASE d TO u"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn use_and_show() {
        let requests =
            parse_statements("USE DATABASE appdb; use appdb; SHOW DATABASES; SHOW TABLES")
                .unwrap();
        assert_eq!(requests[0], DbeRequest::UseDatabase { database: "APPDB".into() });
        assert_eq!(requests[1], DbeRequest::UseDatabase { database: "APPDB".into() });
        assert_eq!(requests[2], DbeRequest::ShowDatabases);
        assert_eq!(requests[3], DbeRequest::ShowTables);
    }
}
