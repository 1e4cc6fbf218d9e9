//! Script parser.
//!
//! Recursive descent over the token stream from [`lexer`](crate::domain::lexer).
//! Errors carry the line and column of the offending token. Constructs outside
//! the script language (classes, `with`, generators, decorators, starred
//! expressions) are rejected here; constructs that parse but are not allowed
//! to run (`import`, `nonlocal`) are left for the validator.

use std::sync::Arc;

use crate::domain::ast::{
    BinOp, BoolOp, CmpOp, Comprehension, Constant, ExceptHandler, Expr, ExprKind, FunctionDef,
    Lambda, Param, Program, Stmt, StmtKind, Target, UnaryOp, declared_globals,
};
use crate::domain::error::ParseError;
use crate::domain::lexer::{Token, TokenKind, is_keyword, tokenize};

/// Deepest expression or block nesting accepted before parsing is refused.
pub const MAX_NESTING: usize = 100;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    // ---- token helpers ----

    fn peek(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek_nth(&self, n: usize) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.pos + n).min(last)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn line(&self) -> usize {
        self.peek().line
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        let tok = self.peek();
        ParseError::new(message, tok.line, tok.column)
    }

    fn unexpected(&self) -> ParseError {
        let tok = self.peek();
        ParseError::new(format!("unexpected {}", tok.describe()), tok.line, tok.column)
    }

    fn check_op(&self, op: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.check_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ParseError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error_here(format!(
                "expected '{}', found {}",
                op,
                self.peek().describe()
            )))
        }
    }

    fn check_keyword(&self, keyword: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Name(n) if n == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.check_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ParseError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error_here(format!(
                "expected '{}', found {}",
                keyword,
                self.peek().describe()
            )))
        }
    }

    fn expect_name(&mut self) -> Result<String, ParseError> {
        match &self.peek().kind {
            TokenKind::Name(n) if !is_keyword(n) => {
                let name = n.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.error_here(format!(
                "expected identifier, found {}",
                self.peek().describe()
            ))),
        }
    }

    fn expect_newline(&mut self) -> Result<(), ParseError> {
        match self.peek().kind {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::EndOfInput => Ok(()),
            _ => Err(self.unexpected()),
        }
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error_here(format!(
                "too many nested expressions or blocks (limit {MAX_NESTING})"
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// True when the current token can begin an expression.
    fn starts_expression(&self) -> bool {
        match &self.peek().kind {
            TokenKind::Name(n) => {
                !is_keyword(n) || matches!(n.as_str(), "None" | "True" | "False" | "not" | "lambda")
            }
            TokenKind::Int(_) | TokenKind::Float(_) | TokenKind::Str(_) => true,
            TokenKind::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+" | "~"),
            _ => false,
        }
    }

    // ---- statements ----

    fn parse_program(&mut self) -> Result<Program, ParseError> {
        let mut body = Vec::new();
        loop {
            match self.peek().kind {
                TokenKind::EndOfInput => break,
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Indent => return Err(self.error_here("unexpected indent")),
                _ => body.extend(self.parse_statement()?),
            }
        }
        Ok(Program { body })
    }

    /// One compound statement or a `;`-separated line of simple statements.
    fn parse_statement(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let tok = self.peek().clone();
        if let TokenKind::Name(word) = &tok.kind {
            match word.as_str() {
                "if" => return Ok(vec![self.parse_if()?]),
                "while" => return Ok(vec![self.parse_while()?]),
                "for" => return Ok(vec![self.parse_for()?]),
                "try" => return Ok(vec![self.parse_try()?]),
                "def" => return Ok(vec![self.parse_def()?]),
                "class" => return Err(self.error_here("class definitions are not supported")),
                "with" => return Err(self.error_here("'with' statements are not supported")),
                "async" | "await" => {
                    return Err(self.error_here("async code is not supported"));
                }
                _ => {}
            }
        }
        if self.check_op("@") {
            return Err(self.error_here("decorators are not supported"));
        }
        self.parse_simple_statements()
    }

    fn parse_simple_statements(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = vec![self.parse_small_statement()?];
        while self.eat_op(";") {
            if matches!(self.peek().kind, TokenKind::Newline | TokenKind::EndOfInput) {
                break;
            }
            stmts.push(self.parse_small_statement()?);
        }
        self.expect_newline()?;
        Ok(stmts)
    }

    fn parse_small_statement(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        let keyword = match &self.peek().kind {
            TokenKind::Name(n) if is_keyword(n) => Some(n.clone()),
            _ => None,
        };
        let kind = match keyword.as_deref() {
            Some("pass") => {
                self.advance();
                StmtKind::Pass
            }
            Some("break") => {
                self.advance();
                StmtKind::Break
            }
            Some("continue") => {
                self.advance();
                StmtKind::Continue
            }
            Some("return") => {
                self.advance();
                if self.starts_expression() {
                    StmtKind::Return(Some(self.parse_testlist()?))
                } else {
                    StmtKind::Return(None)
                }
            }
            Some("raise") => {
                self.advance();
                if self.starts_expression() {
                    let exc = self.parse_test()?;
                    if self.eat_keyword("from") {
                        self.parse_test()?;
                    }
                    StmtKind::Raise(Some(exc))
                } else {
                    StmtKind::Raise(None)
                }
            }
            Some("global") => {
                self.advance();
                StmtKind::Global(self.parse_name_list()?)
            }
            Some("nonlocal") => {
                self.advance();
                StmtKind::Nonlocal(self.parse_name_list()?)
            }
            Some("import") => {
                self.advance();
                StmtKind::Import(self.parse_import_names()?)
            }
            Some("from") => {
                self.advance();
                StmtKind::Import(vec![self.parse_from_import()?])
            }
            Some("del") => {
                self.advance();
                let expr = self.parse_target_list()?;
                let targets = match to_target(expr)? {
                    Target::Tuple(items) => items,
                    single => vec![single],
                };
                StmtKind::Delete(targets)
            }
            Some("assert") => {
                self.advance();
                let test = self.parse_test()?;
                let msg = if self.eat_op(",") {
                    Some(self.parse_test()?)
                } else {
                    None
                };
                StmtKind::Assert { test, msg }
            }
            Some("yield") => return Err(self.error_here("generators are not supported")),
            _ => self.parse_expression_statement()?,
        };
        Ok(Stmt { kind, line })
    }

    fn parse_expression_statement(&mut self) -> Result<StmtKind, ParseError> {
        let first = self.parse_testlist()?;

        let augmented = match self.peek().kind {
            TokenKind::Op(op) => BinOp::from_augmented(op),
            _ => None,
        };
        if let Some(bin) = augmented {
            self.advance();
            let target = to_target(first)?;
            if matches!(target, Target::Tuple(_)) {
                return Err(self.error_here("illegal expression for augmented assignment"));
            }
            let value = self.parse_testlist()?;
            return Ok(StmtKind::AugAssign {
                target,
                op: bin,
                value,
            });
        }

        if self.check_op(":=") {
            return Err(self.error_here("assignment expressions are not supported"));
        }
        if self.check_op(":") {
            return Err(self.error_here("annotated assignments are not supported"));
        }

        if !self.check_op("=") {
            return Ok(StmtKind::Expr(first));
        }

        let mut exprs = vec![first];
        while self.eat_op("=") {
            exprs.push(self.parse_testlist()?);
        }
        let value = exprs.pop().ok_or_else(|| self.unexpected())?;
        let targets = exprs
            .into_iter()
            .map(to_target)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StmtKind::Assign { targets, value })
    }

    fn parse_name_list(&mut self) -> Result<Vec<String>, ParseError> {
        let mut names = vec![self.expect_name()?];
        while self.eat_op(",") {
            names.push(self.expect_name()?);
        }
        Ok(names)
    }

    fn parse_dotted_name(&mut self) -> Result<String, ParseError> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn parse_import_names(&mut self) -> Result<Vec<String>, ParseError> {
        let mut modules = Vec::new();
        loop {
            modules.push(self.parse_dotted_name()?);
            if self.eat_keyword("as") {
                self.expect_name()?;
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(modules)
    }

    fn parse_from_import(&mut self) -> Result<String, ParseError> {
        let mut module = String::new();
        while self.check_op(".") || self.check_op("...") {
            if let TokenKind::Op(op) = self.advance().kind {
                module.push_str(op);
            }
        }
        if !self.check_keyword("import") {
            module.push_str(&self.parse_dotted_name()?);
        }
        self.expect_keyword("import")?;
        if self.eat_op("*") {
            return Ok(module);
        }
        let parenthesized = self.eat_op("(");
        loop {
            self.expect_name()?;
            if self.eat_keyword("as") {
                self.expect_name()?;
            }
            if !self.eat_op(",") {
                break;
            }
            if parenthesized && self.check_op(")") {
                break;
            }
        }
        if parenthesized {
            self.expect_op(")")?;
        }
        Ok(module)
    }

    /// `:` followed by either an indented block or simple statements on the same line.
    fn parse_suite(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect_op(":")?;
        if !matches!(self.peek().kind, TokenKind::Newline) {
            return self.parse_simple_statements();
        }
        self.advance();
        if !matches!(self.peek().kind, TokenKind::Indent) {
            return Err(self.error_here("expected an indented block"));
        }
        self.advance();
        self.enter()?;
        let mut body = Vec::new();
        loop {
            match self.peek().kind {
                TokenKind::Dedent => {
                    self.advance();
                    break;
                }
                TokenKind::EndOfInput => break,
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Indent => return Err(self.error_here("unexpected indent")),
                _ => body.extend(self.parse_statement()?),
            }
        }
        self.leave();
        Ok(body)
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.advance(); // 'if' or 'elif'
        let test = self.parse_test()?;
        let body = self.parse_suite()?;
        let orelse = if self.check_keyword("elif") {
            // Each elif nests one If deeper.
            self.enter()?;
            let nested = self.parse_if();
            self.leave();
            vec![nested?]
        } else if self.eat_keyword("else") {
            self.parse_suite()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::If { test, body, orelse },
            line,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.expect_keyword("while")?;
        let test = self.parse_test()?;
        let body = self.parse_suite()?;
        let orelse = if self.eat_keyword("else") {
            self.parse_suite()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::While { test, body, orelse },
            line,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.expect_keyword("for")?;
        let target = to_target(self.parse_target_list()?)?;
        self.expect_keyword("in")?;
        let iter = self.parse_testlist()?;
        let body = self.parse_suite()?;
        let orelse = if self.eat_keyword("else") {
            self.parse_suite()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::For {
                target,
                iter,
                body,
                orelse,
            },
            line,
        })
    }

    fn parse_try(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.expect_keyword("try")?;
        let body = self.parse_suite()?;

        let mut handlers = Vec::new();
        while self.check_keyword("except") {
            let handler_line = self.line();
            self.advance();
            let (kind, name) = if self.check_op(":") {
                (None, None)
            } else {
                let kind = self.parse_test()?;
                let name = if self.eat_keyword("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                (Some(kind), name)
            };
            let handler_body = self.parse_suite()?;
            handlers.push(ExceptHandler {
                kind,
                name,
                body: handler_body,
                line: handler_line,
            });
        }

        let orelse = if !handlers.is_empty() && self.eat_keyword("else") {
            self.parse_suite()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_keyword("finally") {
            self.parse_suite()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.error_here("expected 'except' or 'finally' block"));
        }
        Ok(Stmt {
            kind: StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            },
            line,
        })
    }

    fn parse_def(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.expect_keyword("def")?;
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.parse_params(")")?;
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.parse_test()?;
        }
        let body = self.parse_suite()?;
        let globals = declared_globals(&body);
        Ok(Stmt {
            kind: StmtKind::FunctionDef(Arc::new(FunctionDef {
                name,
                params,
                body,
                globals,
                line,
            })),
            line,
        })
    }

    /// Parameters up to (not including) `close`, shared by `def` and `lambda`.
    fn parse_params(&mut self, close: &str) -> Result<Vec<Param>, ParseError> {
        let mut params: Vec<Param> = Vec::new();
        let annotations = close == ")";
        while !self.check_op(close) {
            if self.check_op("*") || self.check_op("**") || self.check_op("/") {
                return Err(
                    self.error_here("*args, **kwargs and positional-only markers are not supported")
                );
            }
            let name = self.expect_name()?;
            if params.iter().any(|p| p.name == name) {
                return Err(
                    self.error_here(format!("duplicate argument '{name}' in function definition"))
                );
            }
            if annotations && self.eat_op(":") {
                self.parse_test()?;
            }
            let default = if self.eat_op("=") {
                Some(self.parse_test()?)
            } else {
                None
            };
            if default.is_none() && params.iter().any(|p| p.default.is_some()) {
                return Err(self.error_here("non-default argument follows default argument"));
            }
            params.push(Param { name, default });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    // ---- expressions ----

    /// Comma-separated expressions; more than one (or a trailing comma) forms a tuple.
    fn parse_testlist(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let first = self.parse_test()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expression() {
                break;
            }
            items.push(self.parse_test()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line))
    }

    /// Targets of `for`/`del`/comprehensions; stops before `in`.
    fn parse_target_list(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let first = self.parse_bitor()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expression() {
                break;
            }
            items.push(self.parse_bitor()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line))
    }

    fn parse_test(&mut self) -> Result<Expr, ParseError> {
        self.enter()?;
        let result = self.parse_test_inner();
        self.leave();
        result
    }

    fn parse_test_inner(&mut self) -> Result<Expr, ParseError> {
        if self.check_keyword("lambda") {
            return self.parse_lambda();
        }
        if self.check_keyword("yield") {
            return Err(self.error_here("generators are not supported"));
        }
        if self.check_keyword("await") {
            return Err(self.error_here("async code is not supported"));
        }
        let line = self.line();
        let body = self.parse_or()?;
        if self.eat_keyword("if") {
            let test = self.parse_or()?;
            self.expect_keyword("else")?;
            let orelse = self.parse_test()?;
            return Ok(Expr::new(
                ExprKind::IfExp {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
                line,
            ));
        }
        Ok(body)
    }

    fn parse_lambda(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        self.expect_keyword("lambda")?;
        let params = self.parse_params(":")?;
        self.expect_op(":")?;
        let body = self.parse_test()?;
        Ok(Expr::new(
            ExprKind::Lambda(Arc::new(Lambda { params, body, line })),
            line,
        ))
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let first = self.parse_and()?;
        if !self.check_keyword("or") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_keyword("or") {
            values.push(self.parse_and()?);
        }
        Ok(Expr::new(
            ExprKind::BoolOp {
                op: BoolOp::Or,
                values,
            },
            line,
        ))
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let first = self.parse_not()?;
        if !self.check_keyword("and") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_keyword("and") {
            values.push(self.parse_not()?);
        }
        Ok(Expr::new(
            ExprKind::BoolOp {
                op: BoolOp::And,
                values,
            },
            line,
        ))
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        if self.eat_keyword("not") {
            self.enter()?;
            let operand = self.parse_not();
            self.leave();
            return Ok(Expr::new(
                ExprKind::UnaryOp {
                    op: UnaryOp::Not,
                    operand: Box::new(operand?),
                },
                line,
            ));
        }
        self.parse_comparison()
    }

    fn comparison_operator(&mut self) -> Option<CmpOp> {
        let next_is = |p: &Self, word: &str| {
            matches!(&p.peek_nth(1).kind, TokenKind::Name(m) if m == word)
        };
        let (op, width) = match &self.peek().kind {
            TokenKind::Op("==") => (CmpOp::Eq, 1),
            TokenKind::Op("!=") => (CmpOp::NotEq, 1),
            TokenKind::Op("<") => (CmpOp::Lt, 1),
            TokenKind::Op("<=") => (CmpOp::LtE, 1),
            TokenKind::Op(">") => (CmpOp::Gt, 1),
            TokenKind::Op(">=") => (CmpOp::GtE, 1),
            TokenKind::Name(n) if n == "in" => (CmpOp::In, 1),
            TokenKind::Name(n) if n == "is" => {
                if next_is(self, "not") {
                    (CmpOp::IsNot, 2)
                } else {
                    (CmpOp::Is, 1)
                }
            }
            TokenKind::Name(n) if n == "not" && next_is(self, "in") => (CmpOp::NotIn, 2),
            _ => return None,
        };
        for _ in 0..width {
            self.advance();
        }
        Some(op)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let left = self.parse_bitor()?;
        let mut ops = Vec::new();
        while let Some(op) = self.comparison_operator() {
            ops.push((op, self.parse_bitor()?));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr::new(
            ExprKind::Compare {
                left: Box::new(left),
                ops,
            },
            line,
        ))
    }

    /// Left-associative binary operator level. Every operator in a chain
    /// adds one level of AST depth, so each counts against the nesting limit.
    fn parse_binary_level(
        &mut self,
        table: &[(&str, BinOp)],
        next: fn(&mut Self) -> Result<Expr, ParseError>,
    ) -> Result<Expr, ParseError> {
        let depth = self.depth;
        let result = self.parse_binary_chain(table, next);
        self.depth = depth;
        result
    }

    fn parse_binary_chain(
        &mut self,
        table: &[(&str, BinOp)],
        next: fn(&mut Self) -> Result<Expr, ParseError>,
    ) -> Result<Expr, ParseError> {
        let mut left = next(self)?;
        'outer: loop {
            for (symbol, op) in table {
                if self.check_op(symbol) {
                    let line = self.line();
                    self.advance();
                    self.enter()?;
                    let right = next(self)?;
                    left = Expr::new(
                        ExprKind::BinOp {
                            left: Box::new(left),
                            op: *op,
                            right: Box::new(right),
                        },
                        line,
                    );
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn parse_bitor(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(&[("|", BinOp::BitOr)], Self::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(&[("^", BinOp::BitXor)], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(&[("&", BinOp::BitAnd)], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(
            &[("<<", BinOp::LShift), (">>", BinOp::RShift)],
            Self::parse_arith,
        )
    }

    fn parse_arith(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::parse_term)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        if self.check_op("@") {
            return Err(self.error_here("matrix multiplication is not supported"));
        }
        self.parse_binary_level(
            &[
                ("*", BinOp::Mult),
                ("/", BinOp::Div),
                ("//", BinOp::FloorDiv),
                ("%", BinOp::Mod),
            ],
            Self::parse_factor,
        )
    }

    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let op = if self.check_op("-") {
            Some(UnaryOp::Neg)
        } else if self.check_op("+") {
            Some(UnaryOp::Pos)
        } else if self.check_op("~") {
            Some(UnaryOp::Invert)
        } else {
            None
        };
        let Some(op) = op else {
            return self.parse_power();
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_factor();
        self.leave();
        let operand = operand?;

        // Fold negative numeric literals so `-9223372036854775808` style
        // constants and `x ** -1` stay simple.
        if op == UnaryOp::Neg {
            match &operand.kind {
                ExprKind::Constant(Constant::Int(i)) => {
                    if let Some(neg) = i.checked_neg() {
                        return Ok(Expr::new(ExprKind::Constant(Constant::Int(neg)), line));
                    }
                }
                ExprKind::Constant(Constant::Float(f)) => {
                    return Ok(Expr::new(ExprKind::Constant(Constant::Float(-f)), line));
                }
                _ => {}
            }
        }
        Ok(Expr::new(
            ExprKind::UnaryOp {
                op,
                operand: Box::new(operand),
            },
            line,
        ))
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_atom_expr()?;
        if self.check_op("**") {
            let line = self.line();
            self.advance();
            self.enter()?;
            let exponent = self.parse_factor();
            self.leave();
            return Ok(Expr::new(
                ExprKind::BinOp {
                    left: Box::new(base),
                    op: BinOp::Pow,
                    right: Box::new(exponent?),
                },
                line,
            ));
        }
        Ok(base)
    }

    fn parse_atom_expr(&mut self) -> Result<Expr, ParseError> {
        let atom = self.parse_atom()?;
        let depth = self.depth;
        let result = self.parse_trailers(atom);
        self.depth = depth;
        result
    }

    /// Calls, subscripts and attributes after an atom; each one nests the
    /// expression a level deeper.
    fn parse_trailers(&mut self, mut expr: Expr) -> Result<Expr, ParseError> {
        loop {
            let line = self.line();
            if !(self.check_op("(") || self.check_op("[") || self.check_op(".")) {
                return Ok(expr);
            }
            self.enter()?;
            if self.eat_op("(") {
                let (args, keywords) = self.parse_call_arguments()?;
                self.expect_op(")")?;
                expr = Expr::new(
                    ExprKind::Call {
                        func: Box::new(expr),
                        args,
                        keywords,
                    },
                    line,
                );
            } else if self.eat_op("[") {
                let index = self.parse_subscript_list()?;
                self.expect_op("]")?;
                expr = Expr::new(
                    ExprKind::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    },
                    line,
                );
            } else {
                self.expect_op(".")?;
                let attr = match &self.peek().kind {
                    TokenKind::Name(n) => n.clone(),
                    _ => return Err(self.unexpected()),
                };
                self.advance();
                expr = Expr::new(
                    ExprKind::Attribute {
                        value: Box::new(expr),
                        attr,
                    },
                    line,
                );
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn parse_call_arguments(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ParseError> {
        let mut args = Vec::new();
        let mut keywords: Vec<(String, Expr)> = Vec::new();
        while !self.check_op(")") {
            if self.check_op("*") || self.check_op("**") {
                return Err(self.error_here("starred arguments are not supported"));
            }
            let is_keyword_arg = matches!(&self.peek().kind, TokenKind::Name(n) if !is_keyword(n))
                && matches!(self.peek_nth(1).kind, TokenKind::Op("="));
            if is_keyword_arg {
                let name = self.expect_name()?;
                self.advance(); // '='
                if keywords.iter().any(|(k, _)| *k == name) {
                    return Err(self.error_here(format!("keyword argument repeated: {name}")));
                }
                keywords.push((name, self.parse_test()?));
            } else {
                if !keywords.is_empty() {
                    return Err(
                        self.error_here("positional argument follows keyword argument")
                    );
                }
                let line = self.line();
                let arg = self.parse_test()?;
                if self.check_keyword("for") {
                    let generators = self.parse_comprehension_clauses()?;
                    args.push(Expr::new(
                        ExprKind::GeneratorExp {
                            element: Box::new(arg),
                            generators,
                        },
                        line,
                    ));
                } else {
                    args.push(arg);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok((args, keywords))
    }

    fn parse_subscript_list(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let first = self.parse_subscript()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("]") {
                break;
            }
            items.push(self.parse_subscript()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line))
    }

    fn parse_subscript(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let lower = if self.check_op(":") {
            None
        } else {
            let expr = self.parse_test()?;
            if !self.check_op(":") {
                return Ok(expr);
            }
            Some(Box::new(expr))
        };
        self.expect_op(":")?;
        let bound = |p: &mut Self| -> Result<Option<Box<Expr>>, ParseError> {
            if p.check_op(":") || p.check_op("]") || p.check_op(",") {
                Ok(None)
            } else {
                Ok(Some(Box::new(p.parse_test()?)))
            }
        };
        let upper = bound(self)?;
        let step = if self.eat_op(":") { bound(self)? } else { None };
        Ok(Expr::new(ExprKind::Slice { lower, upper, step }, line))
    }

    fn parse_comprehension_clauses(&mut self) -> Result<Vec<Comprehension>, ParseError> {
        let mut generators = Vec::new();
        while self.eat_keyword("for") {
            let target = to_target(self.parse_target_list()?)?;
            self.expect_keyword("in")?;
            let iter = self.parse_or()?;
            let mut ifs = Vec::new();
            while self.eat_keyword("if") {
                ifs.push(self.parse_or()?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(generators)
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        let tok = self.peek().clone();
        let line = tok.line;
        match tok.kind {
            TokenKind::Int(i) => {
                self.advance();
                Ok(Expr::new(ExprKind::Constant(Constant::Int(i)), line))
            }
            TokenKind::Float(f) => {
                self.advance();
                Ok(Expr::new(ExprKind::Constant(Constant::Float(f)), line))
            }
            TokenKind::Str(_) => {
                let mut text = String::new();
                while let TokenKind::Str(s) = &self.peek().kind {
                    text.push_str(s);
                    self.advance();
                }
                Ok(Expr::new(ExprKind::Constant(Constant::Str(text)), line))
            }
            TokenKind::Name(ref n) => {
                let constant = match n.as_str() {
                    "None" => Some(Constant::None),
                    "True" => Some(Constant::Bool(true)),
                    "False" => Some(Constant::Bool(false)),
                    _ => None,
                };
                if let Some(c) = constant {
                    self.advance();
                    return Ok(Expr::new(ExprKind::Constant(c), line));
                }
                let name = self.expect_name()?;
                Ok(Expr::new(ExprKind::Name(name), line))
            }
            TokenKind::Op("(") => {
                self.advance();
                self.parse_paren_body(line)
            }
            TokenKind::Op("[") => {
                self.advance();
                self.parse_list_body(line)
            }
            TokenKind::Op("{") => {
                self.advance();
                self.parse_brace_body(line)
            }
            TokenKind::Op("*") | TokenKind::Op("**") => {
                Err(self.error_here("starred expressions are not supported"))
            }
            TokenKind::Op("...") => Err(self.error_here("Ellipsis is not supported")),
            _ => Err(self.unexpected()),
        }
    }

    fn parse_paren_body(&mut self, line: usize) -> Result<Expr, ParseError> {
        if self.eat_op(")") {
            return Ok(Expr::new(ExprKind::Tuple(Vec::new()), line));
        }
        let first = self.parse_test()?;
        if self.check_keyword("for") {
            let generators = self.parse_comprehension_clauses()?;
            self.expect_op(")")?;
            return Ok(Expr::new(
                ExprKind::GeneratorExp {
                    element: Box::new(first),
                    generators,
                },
                line,
            ));
        }
        if self.eat_op(")") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op(")") {
                break;
            }
            items.push(self.parse_test()?);
        }
        self.expect_op(")")?;
        Ok(Expr::new(ExprKind::Tuple(items), line))
    }

    fn parse_list_body(&mut self, line: usize) -> Result<Expr, ParseError> {
        if self.eat_op("]") {
            return Ok(Expr::new(ExprKind::List(Vec::new()), line));
        }
        let first = self.parse_test()?;
        if self.check_keyword("for") {
            let generators = self.parse_comprehension_clauses()?;
            self.expect_op("]")?;
            return Ok(Expr::new(
                ExprKind::ListComp {
                    element: Box::new(first),
                    generators,
                },
                line,
            ));
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("]") {
                break;
            }
            items.push(self.parse_test()?);
        }
        self.expect_op("]")?;
        Ok(Expr::new(ExprKind::List(items), line))
    }

    fn parse_brace_body(&mut self, line: usize) -> Result<Expr, ParseError> {
        if self.eat_op("}") {
            return Ok(Expr::new(ExprKind::Dict(Vec::new()), line));
        }
        if self.check_op("**") {
            return Err(self.error_here("dict unpacking is not supported"));
        }
        let first = self.parse_test()?;

        if self.eat_op(":") {
            let value = self.parse_test()?;
            if self.check_keyword("for") {
                let generators = self.parse_comprehension_clauses()?;
                self.expect_op("}")?;
                return Ok(Expr::new(
                    ExprKind::DictComp {
                        key: Box::new(first),
                        value: Box::new(value),
                        generators,
                    },
                    line,
                ));
            }
            let mut entries = vec![(first, value)];
            while self.eat_op(",") {
                if self.check_op("}") {
                    break;
                }
                let key = self.parse_test()?;
                self.expect_op(":")?;
                entries.push((key, self.parse_test()?));
            }
            self.expect_op("}")?;
            return Ok(Expr::new(ExprKind::Dict(entries), line));
        }

        if self.check_keyword("for") {
            let generators = self.parse_comprehension_clauses()?;
            self.expect_op("}")?;
            return Ok(Expr::new(
                ExprKind::SetComp {
                    element: Box::new(first),
                    generators,
                },
                line,
            ));
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("}") {
                break;
            }
            items.push(self.parse_test()?);
        }
        self.expect_op("}")?;
        Ok(Expr::new(ExprKind::Set(items), line))
    }
}

/// Converts a parsed expression into an assignment target.
fn to_target(expr: Expr) -> Result<Target, ParseError> {
    let line = expr.line;
    match expr.kind {
        ExprKind::Name(n) => Ok(Target::Name(n)),
        ExprKind::Subscript { value, index } => Ok(Target::Subscript { value, index }),
        ExprKind::Tuple(items) | ExprKind::List(items) => Ok(Target::Tuple(
            items.into_iter().map(to_target).collect::<Result<_, _>>()?,
        )),
        ExprKind::Attribute { attr, .. } => Err(ParseError::new(
            format!("cannot assign to attribute '{attr}'"),
            line,
            1,
        )),
        ExprKind::Call { .. } => Err(ParseError::new("cannot assign to function call", line, 1)),
        ExprKind::Constant(_) => Err(ParseError::new("cannot assign to literal", line, 1)),
        _ => Err(ParseError::new("cannot assign to expression", line, 1)),
    }
}

/// Parses script source into a syntax tree without any capability checks.
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let tokens = tokenize(source)?;
    Parser::new(tokens).parse_program()
}
