//! Unit driver: reads top-level units from source text and hands them to
//! the lowering session.
//!
//! A unit is a definition (`def`), a declaration (`import`) or a bare
//! expression. `;` separates units and is otherwise ignored. After a
//! syntax error the driver resynchronises on the next `def`, `import` or
//! `;` so a single bad unit does not hide the ones after it.

use std::io::{self, BufRead, Write};

use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::CoreError;
use crate::lexer::TokenKind;
use crate::lower::Session;
use crate::parser::Parser;

pub const PROMPT: &str = ">>> ";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverOptions {
    /// Execute top-level expressions in whole-source mode. Interactive
    /// mode always executes them.
    pub evaluate_top_level: bool,
}

/// What happened to one top-level unit.
#[derive(Debug)]
pub enum UnitOutcome {
    Defined { name: String },
    Declared { name: String },
    Evaluated { value: f64 },
    /// A top-level expression that was lowered but not executed.
    Compiled { name: String },
    Failed(CoreError),
}

impl UnitOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, UnitOutcome::Failed(_))
    }
}

pub struct Driver<B: Backend> {
    parser: Parser,
    session: Session<B>,
    options: DriverOptions,
}

impl<B: Backend> Driver<B> {
    pub fn new(backend: B, options: DriverOptions) -> Self {
        Driver {
            parser: Parser::default(),
            session: Session::new(backend),
            options,
        }
    }

    pub fn session(&self) -> &Session<B> {
        &self.session
    }

    /// Process a whole source text, returning one outcome per unit.
    pub fn process_source(&mut self, source: &str) -> Vec<UnitOutcome> {
        self.process_chunk(source, self.options.evaluate_top_level)
    }

    /// Read lines from `input` until it ends, treating each line as a
    /// chunk of units. Results and errors are written to `output`.
    pub fn run_interactive<R: BufRead, W: Write>(
        &mut self,
        mut input: R,
        mut output: W,
    ) -> io::Result<()> {
        let mut line = String::new();
        loop {
            write!(output, "{PROMPT}")?;
            output.flush()?;

            line.clear();
            if input.read_line(&mut line)? == 0 {
                writeln!(output)?;
                return Ok(());
            }

            for outcome in self.process_chunk(&line, true) {
                match outcome {
                    UnitOutcome::Evaluated { value } => writeln!(output, "Evaluated to {value}")?,
                    UnitOutcome::Failed(err) => writeln!(output, "error: {err}")?,
                    UnitOutcome::Defined { .. }
                    | UnitOutcome::Declared { .. }
                    | UnitOutcome::Compiled { .. } => {}
                }
            }
        }
    }

    fn process_chunk(&mut self, source: &str, evaluate: bool) -> Vec<UnitOutcome> {
        self.parser.retokenize(source);
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.next_unit(evaluate) {
            if let UnitOutcome::Failed(err) = &outcome {
                warn!(error = %err, "top-level unit failed");
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Handle the next unit, or return `None` at the end of input.
    fn next_unit(&mut self, evaluate: bool) -> Option<UnitOutcome> {
        while self.parser.matches(";") {
            self.parser.advance();
        }

        let start = self.parser.cursor();
        let outcome = match self.parser.peek().kind {
            TokenKind::EndOfInput => return None,
            TokenKind::Def => self.handle_definition(),
            TokenKind::Import => self.handle_import(),
            _ => self.handle_top_level_expression(evaluate),
        };

        if let UnitOutcome::Failed(err) = &outcome {
            if err.is_syntax() {
                self.synchronize(start);
            }
        }
        Some(outcome)
    }

    fn handle_definition(&mut self) -> UnitOutcome {
        let result = self.parser.parse_definition().and_then(|function| {
            self.session.lower_function(&function)?;
            Ok(function.prototype.name)
        });
        match result {
            Ok(name) => {
                debug!(%name, "defined function");
                UnitOutcome::Defined { name }
            }
            Err(err) => UnitOutcome::Failed(err),
        }
    }

    fn handle_import(&mut self) -> UnitOutcome {
        let result = self.parser.parse_extern().and_then(|prototype| {
            self.session.declare_extern(&prototype)?;
            Ok(prototype.name)
        });
        match result {
            Ok(name) => UnitOutcome::Declared { name },
            Err(err) => UnitOutcome::Failed(err),
        }
    }

    fn handle_top_level_expression(&mut self, evaluate: bool) -> UnitOutcome {
        let function = match self.parser.parse_top_level_expression() {
            Ok(function) => function,
            Err(err) => return UnitOutcome::Failed(err),
        };

        if evaluate {
            match self.session.evaluate(&function) {
                Ok(value) => UnitOutcome::Evaluated { value },
                Err(err) => UnitOutcome::Failed(err),
            }
        } else {
            match self.session.lower_function(&function) {
                Ok(_) => UnitOutcome::Compiled {
                    name: function.prototype.name,
                },
                Err(err) => UnitOutcome::Failed(err),
            }
        }
    }

    /// Skip the rest of a unit that failed to parse. At least one token
    /// of the failed unit is consumed.
    fn synchronize(&mut self, start: usize) {
        if self.parser.cursor() == start {
            self.parser.advance();
        }
        loop {
            let token = self.parser.peek();
            let at_boundary = matches!(
                token.kind,
                TokenKind::EndOfInput | TokenKind::Def | TokenKind::Import
            ) || self.parser.matches(";");
            if at_boundary {
                return;
            }
            self.parser.advance();
        }
    }
}
