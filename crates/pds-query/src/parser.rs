//! Recursive-descent statement parser.
//!
//! Keywords are matched case-insensitively. Errors carry the line/column
//! of the offending token.

use crate::ast::*;
use crate::error::QueryError;
use crate::token::{Token, TokenKind, Tokenizer};
use pds_core::path::FieldPath;
use pds_core::scalar::Scalar;

/// Parse one statement.
pub fn parse_statement(src: &str) -> Result<Statement, QueryError> {
    let tokens = Tokenizer::new(src).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let statement = parser.statement()?;
    parser.expect_end()?;
    Ok(statement)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn statement(&mut self) -> Result<Statement, QueryError> {
        if self.eat_keyword("SELECT") {
            self.select().map(Statement::Select)
        } else if self.eat_keyword("INSERT") {
            self.insert().map(Statement::Insert)
        } else if self.eat_keyword("UPDATE") {
            self.update().map(Statement::Update)
        } else if self.eat_keyword("EVICT") {
            self.evict().map(Statement::Evict)
        } else {
            Err(self.error("expected SELECT, INSERT, UPDATE or EVICT"))
        }
    }

    // === SELECT ===

    fn select(&mut self) -> Result<SelectStatement, QueryError> {
        let distinct = self.eat_keyword("DISTINCT");
        let projection = self.projection()?;
        self.expect_keyword("FROM")?;
        let collection = self.ident()?;

        let predicate = if self.eat_keyword("WHERE") {
            Some(self.expr()?)
        } else {
            None
        };

        let group_by = if self.eat_keyword("GROUP") {
            self.expect_keyword("BY")?;
            Some(self.path()?)
        } else {
            None
        };

        let order_by = if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            let path = self.path()?;
            let order = if self.eat_keyword("DESC") {
                SortOrder::Desc
            } else {
                self.eat_keyword("ASC");
                SortOrder::Asc
            };
            Some((path, order))
        } else {
            None
        };

        let limit = if self.eat_keyword("LIMIT") {
            Some(self.unsigned()?)
        } else {
            None
        };
        let offset = if self.eat_keyword("OFFSET") {
            Some(self.unsigned()?)
        } else {
            None
        };

        Ok(SelectStatement {
            distinct,
            projection,
            collection,
            predicate,
            group_by,
            order_by,
            limit,
            offset,
        })
    }

    fn projection(&mut self) -> Result<Projection, QueryError> {
        if self.eat(&TokenKind::Star) {
            return Ok(Projection::All);
        }

        let mut aggregates = Vec::new();
        let mut fields = Vec::new();
        loop {
            if let Some(func) = self.peek_aggregate() {
                self.bump();
                self.expect(&TokenKind::LParen)?;
                let arg = if self.eat(&TokenKind::Star) {
                    None
                } else {
                    Some(self.path()?)
                };
                self.expect(&TokenKind::RParen)?;
                aggregates.push(AggregateExpr { func, arg });
            } else {
                fields.push(self.path()?);
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }

        match (aggregates.is_empty(), fields.is_empty()) {
            (false, true) => Ok(Projection::Aggregates(aggregates)),
            (true, false) => Ok(Projection::Fields(fields)),
            _ => Err(self.error("cannot mix aggregates and plain fields in a projection")),
        }
    }

    fn peek_aggregate(&self) -> Option<AggregateFunc> {
        let TokenKind::Ident(name) = &self.peek()?.kind else {
            return None;
        };
        // Only treat as an aggregate when a parenthesis follows
        if !matches!(self.peek_ahead(1).map(|t| &t.kind), Some(TokenKind::LParen)) {
            return None;
        }
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggregateFunc::Count),
            "SUM" => Some(AggregateFunc::Sum),
            "AVG" => Some(AggregateFunc::Avg),
            "MIN" => Some(AggregateFunc::Min),
            "MAX" => Some(AggregateFunc::Max),
            _ => None,
        }
    }

    // === INSERT ===

    fn insert(&mut self) -> Result<InsertStatement, QueryError> {
        self.expect_keyword("INTO")?;
        let collection = self.ident()?;
        self.expect_keyword("DOCUMENTS")?;

        let mut documents = Vec::new();
        loop {
            documents.push(self.document_literal()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }

        let on_conflict = if self.eat_keyword("ON") {
            self.expect_keyword("ID")?;
            self.expect_keyword("CONFLICT")?;
            self.expect_keyword("DO")?;
            if self.eat_keyword("FAIL") {
                ConflictPolicy::Fail
            } else if self.eat_keyword("NOTHING") {
                ConflictPolicy::DoNothing
            } else if self.eat_keyword("UPDATE_LOCAL_DIFF") {
                ConflictPolicy::DoUpdateLocalDiff
            } else if self.eat_keyword("UPDATE") {
                ConflictPolicy::DoUpdate
            } else {
                return Err(self.error("expected FAIL, NOTHING, UPDATE or UPDATE_LOCAL_DIFF"));
            }
        } else {
            ConflictPolicy::Fail
        };

        Ok(InsertStatement {
            collection,
            documents,
            on_conflict,
        })
    }

    fn document_literal(&mut self) -> Result<Vec<(String, ValueLiteral)>, QueryError> {
        self.expect(&TokenKind::LBrace)?;
        let mut pairs = Vec::new();
        if self.eat(&TokenKind::RBrace) {
            return Ok(pairs);
        }
        loop {
            let key = self.key()?;
            self.expect(&TokenKind::Colon)?;
            let value = self.value_literal()?;
            pairs.push((key, value));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(pairs)
    }

    fn value_literal(&mut self) -> Result<ValueLiteral, QueryError> {
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::LBrace)) {
            let pairs = self.document_literal()?;
            return Ok(ValueLiteral::Map(pairs));
        }
        if self.peek_keyword("PNCOUNTER")
            && matches!(self.peek_ahead(1).map(|t| &t.kind), Some(TokenKind::LParen))
        {
            self.bump();
            self.expect(&TokenKind::LParen)?;
            let start = self.literal()?;
            self.expect(&TokenKind::RParen)?;
            return Ok(ValueLiteral::Counter(start));
        }
        Ok(ValueLiteral::Scalar(self.literal()?))
    }

    // === UPDATE ===

    fn update(&mut self) -> Result<UpdateStatement, QueryError> {
        let collection = self.ident()?;
        self.expect_keyword("SET")?;

        let mut sets = Vec::new();
        loop {
            sets.push(self.set_clause()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }

        let predicate = if self.eat_keyword("WHERE") {
            Some(self.expr()?)
        } else {
            None
        };

        Ok(UpdateStatement {
            collection,
            sets,
            predicate,
        })
    }

    fn set_clause(&mut self) -> Result<SetClause, QueryError> {
        if self.eat_keyword("RESTART") {
            let path = self.path()?;
            self.expect_keyword("TO")?;
            let value = self.literal()?;
            return Ok(SetClause::Restart { path, value });
        }
        if self.eat_keyword("UNSET") {
            let path = self.path()?;
            return Ok(SetClause::Remove { path });
        }

        let path = self.path()?;
        self.expect(&TokenKind::Eq)?;

        // `SET qty = qty + 3` adjusts the counter at qty; anything else is
        // a plain assignment.
        let starts_with_path = matches!(
            self.peek().map(|t| &t.kind),
            Some(TokenKind::Ident(_))
        );
        if starts_with_path {
            if !self.peek_keyword("TRUE")
                && !self.peek_keyword("FALSE")
                && !self.peek_keyword("NULL")
                && !self.peek_keyword("PNCOUNTER")
            {
                let checkpoint = self.pos;
                let rhs_path = self.path()?;
                if rhs_path == path {
                    if self.eat(&TokenKind::Plus) {
                        let amount = self.literal()?;
                        return Ok(SetClause::Adjust {
                            path,
                            amount,
                            negated: false,
                        });
                    }
                    if self.eat(&TokenKind::Minus) {
                        let amount = self.literal()?;
                        return Ok(SetClause::Adjust {
                            path,
                            amount,
                            negated: true,
                        });
                    }
                }
                self.pos = checkpoint;
                return Err(self.error(
                    "right-hand side must be a literal, or `path + n` / `path - n` on the same path",
                ));
            }
        }

        let value = self.value_literal()?;
        Ok(SetClause::Assign { path, value })
    }

    // === EVICT ===

    fn evict(&mut self) -> Result<EvictStatement, QueryError> {
        self.expect_keyword("FROM")?;
        let collection = self.ident()?;
        let predicate = if self.eat_keyword("WHERE") {
            Some(self.expr()?)
        } else {
            None
        };
        let limit = if self.eat_keyword("LIMIT") {
            Some(self.unsigned()?)
        } else {
            None
        };
        Ok(EvictStatement {
            collection,
            predicate,
            limit,
        })
    }

    // === Predicates ===

    fn expr(&mut self) -> Result<Expr, QueryError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("OR") {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.not_expr()?;
        while self.eat_keyword("AND") {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, QueryError> {
        if self.eat_keyword("NOT") {
            let inner = self.not_expr()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.primary_expr()
    }

    fn primary_expr(&mut self) -> Result<Expr, QueryError> {
        if self.eat(&TokenKind::LParen) {
            let inner = self.expr()?;
            self.expect(&TokenKind::RParen)?;
            return Ok(inner);
        }

        let path = self.path()?;

        if self.eat_keyword("IN") {
            self.expect(&TokenKind::LParen)?;
            let mut values = Vec::new();
            loop {
                values.push(self.literal()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen)?;
            return Ok(Expr::In { path, values });
        }

        if self.eat_keyword("LIKE") {
            let pattern = self.literal()?;
            return Ok(Expr::Like { path, pattern });
        }

        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            let ty = self.type_name()?;
            return Ok(Expr::TypeGuard { path, ty, negated });
        }

        let op = self.compare_op()?;
        let value = self.literal()?;
        Ok(Expr::Compare { path, op, value })
    }

    fn compare_op(&mut self) -> Result<CompareOp, QueryError> {
        let op = match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Eq) => CompareOp::Eq,
            Some(TokenKind::NotEq) => CompareOp::Ne,
            Some(TokenKind::Lt) => CompareOp::Lt,
            Some(TokenKind::LtEq) => CompareOp::Le,
            Some(TokenKind::Gt) => CompareOp::Gt,
            Some(TokenKind::GtEq) => CompareOp::Ge,
            _ => return Err(self.error("expected a comparison operator")),
        };
        self.bump();
        Ok(op)
    }

    fn type_name(&mut self) -> Result<TypeName, QueryError> {
        let name = self.ident()?;
        match name.to_ascii_uppercase().as_str() {
            "STRING" => Ok(TypeName::String),
            "NUMBER" => Ok(TypeName::Number),
            "BOOLEAN" => Ok(TypeName::Boolean),
            "NULL" => Ok(TypeName::Null),
            "MAP" => Ok(TypeName::Map),
            "COUNTER" => Ok(TypeName::Counter),
            _ => Err(self.error("expected STRING, NUMBER, BOOLEAN, NULL, MAP or COUNTER")),
        }
    }

    // === Terminals ===

    fn literal(&mut self) -> Result<Literal, QueryError> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| self.error("expected a literal"))?;
        let literal = match token.kind {
            TokenKind::Str(s) => Literal::Scalar(Scalar::Text(s)),
            TokenKind::Int(i) => Literal::Scalar(Scalar::Int(i)),
            TokenKind::Float(x) => Literal::Scalar(Scalar::Float(x)),
            TokenKind::Positional(index) => Literal::Positional(index),
            TokenKind::Named(name) => Literal::Named(name),
            TokenKind::Minus => {
                self.bump();
                return match self.peek().map(|t| t.kind.clone()) {
                    Some(TokenKind::Int(i)) => {
                        self.bump();
                        Ok(Literal::Scalar(Scalar::Int(-i)))
                    }
                    Some(TokenKind::Float(x)) => {
                        self.bump();
                        Ok(Literal::Scalar(Scalar::Float(-x)))
                    }
                    _ => Err(self.error("expected a number after '-'")),
                };
            }
            TokenKind::Ident(ref name) => match name.to_ascii_uppercase().as_str() {
                "TRUE" => Literal::Scalar(Scalar::Bool(true)),
                "FALSE" => Literal::Scalar(Scalar::Bool(false)),
                "NULL" => Literal::Scalar(Scalar::Null),
                _ => return Err(self.error("expected a literal")),
            },
            _ => return Err(self.error("expected a literal")),
        };
        self.bump();
        Ok(literal)
    }

    fn path(&mut self) -> Result<FieldPath, QueryError> {
        let mut segments = vec![self.ident()?];
        while self.eat(&TokenKind::Dot) {
            segments.push(self.ident()?);
        }
        Ok(FieldPath(segments))
    }

    fn key(&mut self) -> Result<String, QueryError> {
        match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Ident(name)) => {
                self.bump();
                Ok(name)
            }
            Some(TokenKind::Str(name)) => {
                self.bump();
                Ok(name)
            }
            _ => Err(self.error("expected a field name")),
        }
    }

    fn ident(&mut self) -> Result<String, QueryError> {
        match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Ident(name)) => {
                self.bump();
                Ok(name)
            }
            _ => Err(self.error("expected an identifier")),
        }
    }

    fn unsigned(&mut self) -> Result<usize, QueryError> {
        match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Int(i)) if i >= 0 => {
                self.bump();
                Ok(i as usize)
            }
            _ => Err(self.error("expected a non-negative integer")),
        }
    }

    // === Cursor helpers ===

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_ahead(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n)
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().map(|t| &t.kind) == Some(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(
            self.peek().map(|t| &t.kind),
            Some(TokenKind::Ident(name)) if name.eq_ignore_ascii_case(keyword)
        )
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), QueryError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected {keyword}")))
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), QueryError> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.error(format!("expected {kind:?}")))
        }
    }

    fn expect_end(&mut self) -> Result<(), QueryError> {
        if self.peek().is_some() {
            Err(self.error("unexpected trailing input"))
        } else {
            Ok(())
        }
    }

    fn error(&self, message: impl Into<String>) -> QueryError {
        let (line, column) = self
            .peek()
            .or_else(|| self.tokens.last())
            .map(|t| (t.line, t.column))
            .unwrap_or((1, 1));
        QueryError::Parse {
            line,
            column,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_select_full() {
        let stmt = parse_statement(
            "SELECT status, total FROM orders WHERE total > 10 AND status != 'closed' \
             ORDER BY total DESC LIMIT 5 OFFSET 2",
        )
        .unwrap();
        let Statement::Select(select) = stmt else {
            panic!("expected select")
        };
        assert_eq!(select.collection, "orders");
        assert_eq!(select.limit, Some(5));
        assert_eq!(select.offset, Some(2));
        assert!(matches!(select.projection, Projection::Fields(ref f) if f.len() == 2));
        assert!(select.predicate.is_some());
        assert_eq!(
            select.order_by,
            Some((FieldPath::parse("total"), SortOrder::Desc))
        );
    }

    #[test]
    fn test_parse_aggregates() {
        let stmt =
            parse_statement("SELECT COUNT(*), SUM(total) FROM orders GROUP BY region").unwrap();
        let Statement::Select(select) = stmt else {
            panic!("expected select")
        };
        let Projection::Aggregates(aggs) = select.projection else {
            panic!("expected aggregates")
        };
        assert_eq!(aggs.len(), 2);
        assert_eq!(aggs[0].func, AggregateFunc::Count);
        assert!(aggs[0].arg.is_none());
        assert_eq!(select.group_by, Some(FieldPath::parse("region")));
    }

    #[test]
    fn test_parse_insert_with_policy() {
        let stmt = parse_statement(
            "INSERT INTO orders DOCUMENTS {_id: 'o1', status: 'pending', meta: {tag: 'a'}} \
             ON ID CONFLICT DO UPDATE_LOCAL_DIFF",
        )
        .unwrap();
        let Statement::Insert(insert) = stmt else {
            panic!("expected insert")
        };
        assert_eq!(insert.collection, "orders");
        assert_eq!(insert.on_conflict, ConflictPolicy::DoUpdateLocalDiff);
        assert_eq!(insert.documents.len(), 1);
        assert_eq!(insert.documents[0].len(), 3);
    }

    #[test]
    fn test_parse_update_forms() {
        let stmt = parse_statement(
            "UPDATE orders SET status = 'shipped', qty = qty + 3, RESTART retries TO 0, \
             UNSET note WHERE _id = ?1",
        )
        .unwrap();
        let Statement::Update(update) = stmt else {
            panic!("expected update")
        };
        assert_eq!(update.sets.len(), 4);
        assert!(matches!(update.sets[0], SetClause::Assign { .. }));
        assert!(matches!(update.sets[1], SetClause::Adjust { .. }));
        assert!(matches!(update.sets[2], SetClause::Restart { .. }));
        assert!(matches!(update.sets[3], SetClause::Remove { .. }));
    }

    #[test]
    fn test_parse_update_decrement() {
        let stmt = parse_statement("UPDATE orders SET qty = qty - 2").unwrap();
        let Statement::Update(update) = stmt else {
            panic!("expected update")
        };
        let SetClause::Adjust {
            amount, negated, ..
        } = &update.sets[0]
        else {
            panic!("expected adjust")
        };
        assert_eq!(amount, &Literal::Scalar(Scalar::Int(2)));
        assert!(negated);
    }

    #[test]
    fn test_parse_evict() {
        let stmt =
            parse_statement("EVICT FROM orders WHERE archived = TRUE LIMIT 100").unwrap();
        let Statement::Evict(evict) = stmt else {
            panic!("expected evict")
        };
        assert_eq!(evict.collection, "orders");
        assert_eq!(evict.limit, Some(100));
        assert!(evict.predicate.is_some());
    }

    #[test]
    fn test_parse_predicate_forms() {
        let stmt = parse_statement(
            "SELECT * FROM orders WHERE region IN ('eu', 'us') OR name LIKE 'ord%' \
             AND total IS NUMBER AND NOT closed = TRUE",
        )
        .unwrap();
        assert!(matches!(stmt, Statement::Select(_)));
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = parse_statement("SELECT FROM orders").unwrap_err();
        match err {
            QueryError::Parse { line, column, .. } => {
                assert_eq!(line, 1);
                assert!(column > 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_trailing_input_rejected() {
        assert!(parse_statement("SELECT * FROM orders garbage here").is_err());
    }
}
