//! Host functions that `import` declarations can bind to.
//!
//! This module only describes the builtins. The wasm backend maps each
//! descriptor to a host function when it links a module for execution.

use std::io::{self, Write};

/// Module name under which imported functions are expected.
pub const IMPORT_MODULE: &str = "env";

/// Native implementation of a builtin.
#[derive(Debug, Clone, Copy)]
pub enum HostFunction {
    Unary(fn(f64) -> f64),
    Binary(fn(f64, f64) -> f64),
}

impl HostFunction {
    pub fn arity(&self) -> usize {
        match self {
            HostFunction::Unary(_) => 1,
            HostFunction::Binary(_) => 2,
        }
    }
}

/// Metadata about a single builtin symbol.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinDescriptor {
    /// Name the language imports the builtin under.
    pub name: &'static str,
    pub function: HostFunction,
}

impl BuiltinDescriptor {
    pub fn arity(&self) -> usize {
        self.function.arity()
    }
}

/// The complete list of builtins known to the core.
pub const BUILTINS: &[BuiltinDescriptor] = &[
    BuiltinDescriptor {
        name: "sin",
        function: HostFunction::Unary(f64::sin),
    },
    BuiltinDescriptor {
        name: "cos",
        function: HostFunction::Unary(f64::cos),
    },
    BuiltinDescriptor {
        name: "tan",
        function: HostFunction::Unary(f64::tan),
    },
    BuiltinDescriptor {
        name: "sqrt",
        function: HostFunction::Unary(f64::sqrt),
    },
    BuiltinDescriptor {
        name: "exp",
        function: HostFunction::Unary(f64::exp),
    },
    BuiltinDescriptor {
        name: "log",
        function: HostFunction::Unary(f64::ln),
    },
    BuiltinDescriptor {
        name: "fabs",
        function: HostFunction::Unary(f64::abs),
    },
    BuiltinDescriptor {
        name: "floor",
        function: HostFunction::Unary(f64::floor),
    },
    BuiltinDescriptor {
        name: "ceil",
        function: HostFunction::Unary(f64::ceil),
    },
    BuiltinDescriptor {
        name: "pow",
        function: HostFunction::Binary(f64::powf),
    },
    BuiltinDescriptor {
        name: "fmod",
        function: HostFunction::Binary(fmod),
    },
    BuiltinDescriptor {
        name: "putchard",
        function: HostFunction::Unary(putchard),
    },
    BuiltinDescriptor {
        name: "printd",
        function: HostFunction::Unary(printd),
    },
];

/// Look up a builtin by its language-level name.
///
/// The search is linear over `BUILTINS` because the table is small.
pub fn find_builtin(name: &str) -> Option<&'static BuiltinDescriptor> {
    BUILTINS.iter().find(|builtin| builtin.name == name)
}

fn fmod(lhs: f64, rhs: f64) -> f64 {
    lhs % rhs
}

/// Print the character with the given code point; returns 0.
fn putchard(code: f64) -> f64 {
    if let Some(ch) = char::from_u32(code as u32) {
        let mut stdout = io::stdout().lock();
        let _ = write!(stdout, "{ch}");
        let _ = stdout.flush();
    }
    0.0
}

/// Print a number on its own line; returns 0.
fn printd(value: f64) -> f64 {
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{value}");
    0.0
}
