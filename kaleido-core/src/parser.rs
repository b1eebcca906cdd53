//! Recursive-descent parser with precedence climbing for binary operators.
//!
//! Every production returns `Result`: a failed production never hands
//! back a partially built node. The caller decides how to recover.

use crate::ast::{Expr, Function, Prototype};
use crate::error::CoreError;
use crate::lexer::{Token, TokenKind, TokenStream, tokenize};

/// Name prefix for functions synthesized from bare top-level expressions.
pub const ANONYMOUS_PREFIX: &str = "__anon_expr";

/// Deepest expression the parser builds. Every primary and every binary
/// node counts one level, so lowering and encoding stay within the stack.
pub const MAX_EXPRESSION_DEPTH: usize = 256;

/// Binary operator table: `(operator, precedence)`.
///
/// `/` is intentionally absent, so the climbing loop never treats it as
/// an infix operator. Lowering still knows how to divide.
const BINARY_OPERATORS: &[(char, u8)] = &[('=', 9), ('<', 10), ('+', 20), ('-', 20), ('*', 40)];

/// Look up the operator and precedence for a token's text.
pub fn binary_operator(text: &str) -> Option<(char, u8)> {
    let mut chars = text.chars();
    let (Some(op), None) = (chars.next(), chars.next()) else {
        return None;
    };
    BINARY_OPERATORS
        .iter()
        .find(|(candidate, _)| *candidate == op)
        .copied()
}

#[derive(Debug, Default)]
pub struct Parser {
    stream: TokenStream,
    anonymous_count: u64,
    depth: usize,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        Parser {
            stream: tokenize(source),
            anonymous_count: 0,
            depth: 0,
        }
    }

    /// Replace the token stream with the tokens of `source`.
    ///
    /// The anonymous-function counter is kept so synthesized names stay
    /// unique across chunks.
    pub fn retokenize(&mut self, source: &str) {
        self.stream = tokenize(source);
    }

    pub fn peek(&self) -> &Token {
        self.stream.peek()
    }

    pub fn advance(&mut self) -> Token {
        self.stream.advance()
    }

    pub fn cursor(&self) -> usize {
        self.stream.cursor()
    }

    pub fn matches(&self, expected: &str) -> bool {
        self.peek().text == expected && !self.peek().is_end()
    }

    /// Consume `expected` or fail with a syntax error at the current token.
    pub fn require(&mut self, expected: &str) -> Result<Token, CoreError> {
        self.expect(expected, &format!("expected '{expected}'"))
    }

    fn expect(&mut self, expected: &str, message: &str) -> Result<Token, CoreError> {
        if self.matches(expected) {
            Ok(self.advance())
        } else {
            Err(self.error(message))
        }
    }

    fn error(&self, message: impl Into<String>) -> CoreError {
        let token = self.peek();
        CoreError::Syntax {
            position: token.position,
            message: message.into(),
            found: token.to_string(),
        }
    }

    fn current_operator(&self) -> Option<(char, u8)> {
        let token = self.peek();
        if token.kind == TokenKind::NumberLiteral {
            return None;
        }
        binary_operator(&token.text)
    }

    fn descend(&mut self) -> Result<(), CoreError> {
        if self.depth >= MAX_EXPRESSION_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        self.depth += 1;
        Ok(())
    }

    /// primary := number | name [ call-args ] | if-expr | '(' expr ')'
    pub fn parse_primary(&mut self) -> Result<Expr, CoreError> {
        let depth = self.depth;
        let result = self.descend().and_then(|()| self.parse_primary_inner());
        self.depth = depth;
        result
    }

    fn parse_primary_inner(&mut self) -> Result<Expr, CoreError> {
        let kind = self.peek().kind;
        let is_name = self.peek().is_name();
        match kind {
            TokenKind::NumberLiteral => self.parse_number(),
            TokenKind::If => self.parse_if(),
            _ if is_name => self.parse_identifier(),
            _ if self.matches("(") => self.parse_paren(),
            _ => Err(self.error("unexpected token when expecting an expression")),
        }
    }

    fn parse_number(&mut self) -> Result<Expr, CoreError> {
        let token = self.advance();
        Ok(Expr::Number(token.value))
    }

    fn parse_paren(&mut self) -> Result<Expr, CoreError> {
        self.require("(")?;
        let inner = self.parse_expression()?;
        self.expect(")", "expected ')'")?;
        Ok(inner)
    }

    fn parse_identifier(&mut self) -> Result<Expr, CoreError> {
        let name = self.advance().text;
        if !self.matches("(") {
            return Ok(Expr::Variable(name));
        }

        self.advance();
        let mut args = Vec::new();
        if !self.matches(")") {
            loop {
                args.push(self.parse_expression()?);
                if self.matches(")") {
                    break;
                }
                if !self.matches(",") {
                    return Err(self.error("expected ')' or ',' in argument list"));
                }
                self.advance();
            }
        }
        self.advance();

        Ok(Expr::Call { callee: name, args })
    }

    /// expr := primary binop-rhs(0)
    pub fn parse_expression(&mut self) -> Result<Expr, CoreError> {
        let lhs = self.parse_primary()?;
        self.parse_binop_rhs(0, lhs)
    }

    /// Precedence climbing over the operator table.
    pub fn parse_binop_rhs(&mut self, min_precedence: u8, lhs: Expr) -> Result<Expr, CoreError> {
        let depth = self.depth;
        let result = self.climb(min_precedence, lhs);
        self.depth = depth;
        result
    }

    fn climb(&mut self, min_precedence: u8, mut lhs: Expr) -> Result<Expr, CoreError> {
        loop {
            let (op, precedence) = match self.current_operator() {
                Some((op, precedence)) if precedence >= min_precedence => (op, precedence),
                _ => return Ok(lhs),
            };
            // Each node built here deepens the left spine of `lhs`.
            self.descend()?;
            self.advance();

            let mut rhs = self.parse_primary()?;
            if self
                .current_operator()
                .is_some_and(|(_, next)| next > precedence)
            {
                rhs = self.parse_binop_rhs(precedence + 1, rhs)?;
            }

            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    /// prototype := name ':' (name (',' name)*)? '{'
    pub fn parse_prototype(&mut self) -> Result<Prototype, CoreError> {
        if !self.peek().is_name() {
            return Err(self.error("expected function name in prototype"));
        }
        if self.peek().text.starts_with(ANONYMOUS_PREFIX) {
            return Err(self.error(format!(
                "function names starting with '{ANONYMOUS_PREFIX}' are reserved"
            )));
        }
        let name = self.advance().text;

        self.expect(":", "expected ':' in prototype")?;

        let mut params: Vec<String> = Vec::new();
        if self.peek().is_name() {
            loop {
                let param = self.advance();
                if params.contains(&param.text) {
                    return Err(CoreError::Syntax {
                        position: param.position,
                        message: format!("duplicate parameter name in prototype of '{name}'"),
                        found: param.to_string(),
                    });
                }
                params.push(param.text);

                if !self.matches(",") {
                    break;
                }
                self.advance();
                if !self.peek().is_name() {
                    return Err(self.error("expected parameter name after ','"));
                }
            }
        }

        self.expect("{", "expected '{' in prototype")?;
        Ok(Prototype { name, params })
    }

    /// definition := 'def' prototype expr '}'
    pub fn parse_definition(&mut self) -> Result<Function, CoreError> {
        self.require("def")?;
        let prototype = self.parse_prototype()?;
        let body = self.parse_expression()?;
        self.expect("}", "expected '}' after function body")?;
        Ok(Function { prototype, body })
    }

    /// external := 'import' prototype '}'
    pub fn parse_extern(&mut self) -> Result<Prototype, CoreError> {
        self.require("import")?;
        let prototype = self.parse_prototype()?;
        self.expect("}", "expected '}' after imported prototype")?;
        Ok(prototype)
    }

    /// Wrap a bare expression into an anonymous zero-parameter function.
    pub fn parse_top_level_expression(&mut self) -> Result<Function, CoreError> {
        let body = self.parse_expression()?;
        self.anonymous_count += 1;
        let name = format!("{ANONYMOUS_PREFIX}{}", self.anonymous_count);
        Ok(Function {
            prototype: Prototype::new(name, Vec::new()),
            body,
        })
    }

    /// if-expr := 'if' expr ',' expr 'else' expr
    pub fn parse_if(&mut self) -> Result<Expr, CoreError> {
        self.require("if")?;
        let cond = self.parse_expression()?;
        self.require(",")?;
        let then_branch = self.parse_expression()?;
        self.require("else")?;
        let else_branch = self.parse_expression()?;
        Ok(Expr::if_else(cond, then_branch, else_branch))
    }
}
