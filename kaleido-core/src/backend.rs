//! Capability interface between lowering and an IR backend.
//!
//! Lowering only talks to the backend through [`Backend`], so the same
//! session logic drives the wasm backend in production and a recording
//! double in tests.

use std::fmt::Debug;

use thiserror::Error;

/// Arithmetic on the language's single numeric type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

/// Floating-point comparisons; the result is a backend boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Predicate {
    /// True when either side is NaN or `lhs < rhs`.
    UnorderedLess,
    /// True when either side is NaN or `lhs == rhs`.
    UnorderedEqual,
    /// True when neither side is NaN and `lhs != rhs`.
    OrderedNotEqual,
}

/// Blocks created by a conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branches<B> {
    pub then_block: B,
    pub else_block: B,
    pub merge_block: B,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no function body is being built")]
    NoActiveFunction,
    #[error("function handle does not refer to a live function")]
    StaleFunction,
    #[error("function '{0}' is already declared")]
    AlreadyDeclared(String),
    #[error("function '{0}' already has a body")]
    BodyExists(String),
    #[error("function '{0}' has no body")]
    MissingBody(String),
    #[error("block {0} already ends in a terminator")]
    BlockTerminated(usize),
    #[error("block {0} does not belong to the function being built")]
    UnknownBlock(usize),
    #[error("expected a {expected} value, found a {found} value")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("'{callee}' takes {expected} arguments, {found} were supplied")]
    CallArity {
        callee: String,
        expected: usize,
        found: usize,
    },
    #[error("function '{0}' takes parameters and cannot be executed directly")]
    NotExecutable(String),
    #[error("'{caller}' calls a function that has been discarded")]
    DanglingCall { caller: String },
    #[error("imported function '{0}' is not provided by the host")]
    UnresolvedImport(String),
    #[error(
        "imported function '{name}' is declared with {declared} parameters, the host provides {provided}"
    )]
    ImportSignature {
        name: String,
        declared: usize,
        provided: usize,
    },
    #[error("malformed function body in '{function}': {reason}")]
    MalformedBody { function: String, reason: String },
    #[error("execution failed: {0}")]
    Execution(String),
}

/// Operations lowering needs from an IR backend.
///
/// A backend owns the functions of one module. At most one function
/// body is under construction at a time, started by
/// [`Backend::begin_function_body`] and completed by
/// [`Backend::finish_function`] or abandoned by
/// [`Backend::discard_body`] / [`Backend::discard_function`].
/// Instruction-emitting operations append to the current block of that
/// body.
pub trait Backend {
    type Value: Clone + Debug;
    type FunctionRef: Copy + Eq + Debug;
    type Block: Copy + Eq + Debug;

    /// Declare a function taking `arity` numbers and returning a number.
    fn declare_function(&mut self, name: &str, arity: usize)
    -> Result<Self::FunctionRef, BackendError>;

    fn lookup_function(&self, name: &str) -> Option<Self::FunctionRef>;

    fn arity(&self, function: Self::FunctionRef) -> usize;

    fn has_body(&self, function: Self::FunctionRef) -> bool;

    /// Start the body of `function` and return its parameter values in
    /// declaration order.
    fn begin_function_body(
        &mut self,
        function: Self::FunctionRef,
    ) -> Result<Vec<Self::Value>, BackendError>;

    fn constant(&mut self, value: f64) -> Self::Value;

    fn binary_op(
        &mut self,
        op: BinaryOp,
        lhs: Self::Value,
        rhs: Self::Value,
    ) -> Result<Self::Value, BackendError>;

    fn compare(
        &mut self,
        predicate: Predicate,
        lhs: Self::Value,
        rhs: Self::Value,
    ) -> Result<Self::Value, BackendError>;

    /// Convert a boolean into the numeric type (`false` → 0, `true` → 1).
    fn widen(&mut self, flag: Self::Value) -> Result<Self::Value, BackendError>;

    fn call(
        &mut self,
        function: Self::FunctionRef,
        args: Vec<Self::Value>,
    ) -> Result<Self::Value, BackendError>;

    /// End the current block with a two-way branch on a boolean and
    /// return the fresh then/else/merge blocks.
    fn branch_on_condition(
        &mut self,
        condition: Self::Value,
    ) -> Result<Branches<Self::Block>, BackendError>;

    /// Continue emitting at the end of `block`.
    fn position_at(&mut self, block: Self::Block) -> Result<(), BackendError>;

    /// End the current block with a jump to `target` and return the
    /// block that was ended, which is the real predecessor of `target`.
    fn jump(&mut self, target: Self::Block) -> Result<Self::Block, BackendError>;

    /// Merge one value per predecessor block into a single value.
    fn merge_values(
        &mut self,
        incoming: Vec<(Self::Value, Self::Block)>,
    ) -> Result<Self::Value, BackendError>;

    /// Return `value` from the current block and complete the body.
    fn finish_function(
        &mut self,
        function: Self::FunctionRef,
        value: Self::Value,
    ) -> Result<(), BackendError>;

    /// Drop the body of `function`, keeping its declaration.
    fn discard_body(&mut self, function: Self::FunctionRef);

    /// Remove `function` from the module entirely.
    fn discard_function(&mut self, function: Self::FunctionRef);

    /// Run a completed zero-parameter function and return its result.
    fn execute(&mut self, function: Self::FunctionRef) -> Result<f64, BackendError>;
}
