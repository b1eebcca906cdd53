//! Lowering from the syntax tree to backend operations.
//!
//! A [`Session`] owns everything that outlives a single unit: the
//! backend module and the table of known prototypes. The variable
//! scope only lives while one function body is being lowered.

use std::collections::HashMap;

use tracing::debug;

use crate::ast::{Expr, Function, Prototype};
use crate::backend::{Backend, BinaryOp, Branches, Predicate};
use crate::error::CoreError;

pub struct Session<B: Backend> {
    backend: B,
    prototypes: HashMap<String, Prototype>,
    named_values: HashMap<String, B::Value>,
}

impl<B: Backend> Session<B> {
    pub fn new(backend: B) -> Self {
        Session {
            backend,
            prototypes: HashMap::new(),
            named_values: HashMap::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// The prototype registered under `name`, if any.
    pub fn prototype(&self, name: &str) -> Option<&Prototype> {
        self.prototypes.get(name)
    }

    pub fn lower_expr(&mut self, expr: &Expr) -> Result<B::Value, CoreError> {
        match expr {
            Expr::Number(value) => Ok(self.backend.constant(*value)),
            Expr::Variable(name) => self
                .named_values
                .get(name)
                .cloned()
                .ok_or_else(|| CoreError::UnknownVariable(name.clone())),
            Expr::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs),
            Expr::Call { callee, args } => self.lower_call(callee, args),
            Expr::If {
                cond,
                then_branch,
                else_branch,
            } => self.lower_if(cond, then_branch, else_branch),
        }
    }

    fn lower_binary(&mut self, op: char, lhs: &Expr, rhs: &Expr) -> Result<B::Value, CoreError> {
        let lhs = self.lower_expr(lhs)?;
        let rhs = self.lower_expr(rhs)?;

        let value = match op {
            '+' => self.backend.binary_op(BinaryOp::Add, lhs, rhs)?,
            '-' => self.backend.binary_op(BinaryOp::Subtract, lhs, rhs)?,
            '*' => self.backend.binary_op(BinaryOp::Multiply, lhs, rhs)?,
            '/' => self.backend.binary_op(BinaryOp::Divide, lhs, rhs)?,
            '<' => {
                let flag = self.backend.compare(Predicate::UnorderedLess, lhs, rhs)?;
                self.backend.widen(flag)?
            }
            '=' => {
                let flag = self.backend.compare(Predicate::UnorderedEqual, lhs, rhs)?;
                self.backend.widen(flag)?
            }
            other => return Err(CoreError::InvalidOperator(other)),
        };
        Ok(value)
    }

    fn lower_call(&mut self, callee: &str, args: &[Expr]) -> Result<B::Value, CoreError> {
        let function = self
            .resolve_function(callee)?
            .ok_or_else(|| CoreError::UnknownFunction(callee.to_string()))?;

        let expected = self.backend.arity(function);
        if expected != args.len() {
            return Err(CoreError::ArgumentCount {
                callee: callee.to_string(),
                expected,
                found: args.len(),
            });
        }

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.lower_expr(arg)?);
        }
        Ok(self.backend.call(function, values)?)
    }

    fn lower_if(
        &mut self,
        cond: &Expr,
        then_branch: &Expr,
        else_branch: &Expr,
    ) -> Result<B::Value, CoreError> {
        let cond = self.lower_expr(cond)?;
        let zero = self.backend.constant(0.0);
        let flag = self
            .backend
            .compare(Predicate::OrderedNotEqual, cond, zero)?;

        let Branches {
            then_block,
            else_block,
            merge_block,
        } = self.backend.branch_on_condition(flag)?;

        self.backend.position_at(then_block)?;
        let then_value = self.lower_expr(then_branch)?;
        // Lowering the branch may have moved emission to another block.
        let then_exit = self.backend.jump(merge_block)?;

        self.backend.position_at(else_block)?;
        let else_value = self.lower_expr(else_branch)?;
        let else_exit = self.backend.jump(merge_block)?;

        self.backend.position_at(merge_block)?;
        Ok(self
            .backend
            .merge_values(vec![(then_value, then_exit), (else_value, else_exit)])?)
    }

    /// Find a callable function: an existing one first, otherwise a known
    /// prototype declared on demand.
    fn resolve_function(&mut self, name: &str) -> Result<Option<B::FunctionRef>, CoreError> {
        if let Some(function) = self.backend.lookup_function(name) {
            return Ok(Some(function));
        }
        match self.prototypes.get(name).cloned() {
            Some(prototype) => self.lower_prototype(&prototype).map(Some),
            None => Ok(None),
        }
    }

    /// Declare `prototype`, or reuse a compatible bodiless declaration.
    pub fn lower_prototype(&mut self, prototype: &Prototype) -> Result<B::FunctionRef, CoreError> {
        let Some(existing) = self.backend.lookup_function(&prototype.name) else {
            return Ok(self
                .backend
                .declare_function(&prototype.name, prototype.arity())?);
        };

        if self.backend.has_body(existing) {
            return Err(CoreError::Redefinition(prototype.name.clone()));
        }
        let declared = self.backend.arity(existing);
        if declared != prototype.arity() {
            return Err(CoreError::ArityRedefinition {
                name: prototype.name.clone(),
                declared,
                found: prototype.arity(),
            });
        }
        Ok(existing)
    }

    /// Lower a complete function definition.
    ///
    /// On failure nothing is left behind: a function created here is
    /// removed, a previously bodiless declaration loses the partial body,
    /// and the prototype table is restored.
    pub fn lower_function(&mut self, function: &Function) -> Result<B::FunctionRef, CoreError> {
        let prototype = &function.prototype;
        let existed = self.backend.lookup_function(&prototype.name).is_some();
        let previous = self
            .prototypes
            .insert(prototype.name.clone(), prototype.clone());

        let handle = match self.lower_prototype(prototype) {
            Ok(handle) => handle,
            Err(err) => {
                self.restore_prototype(&prototype.name, previous);
                return Err(err);
            }
        };

        if let Err(err) = self.lower_body(handle, function) {
            if existed {
                self.backend.discard_body(handle);
            } else {
                self.backend.discard_function(handle);
            }
            self.named_values.clear();
            self.restore_prototype(&prototype.name, previous);
            return Err(err);
        }

        debug!(name = %prototype.name, arity = prototype.arity(), "defined function");
        Ok(handle)
    }

    fn lower_body(&mut self, handle: B::FunctionRef, function: &Function) -> Result<(), CoreError> {
        let params = self.backend.begin_function_body(handle)?;

        self.named_values.clear();
        for (name, value) in function.prototype.params.iter().zip(params) {
            self.named_values.insert(name.clone(), value);
        }

        let result = self.lower_expr(&function.body)?;
        self.backend.finish_function(handle, result)?;
        self.named_values.clear();
        Ok(())
    }

    fn restore_prototype(&mut self, name: &str, previous: Option<Prototype>) {
        match previous {
            Some(prototype) => {
                self.prototypes.insert(name.to_string(), prototype);
            }
            None => {
                self.prototypes.remove(name);
            }
        }
    }

    /// Declare an imported function and remember its prototype.
    pub fn declare_extern(&mut self, prototype: &Prototype) -> Result<B::FunctionRef, CoreError> {
        let handle = self.lower_prototype(prototype)?;
        self.prototypes
            .insert(prototype.name.clone(), prototype.clone());
        debug!(name = %prototype.name, arity = prototype.arity(), "declared external function");
        Ok(handle)
    }

    /// Lower, run and then discard a zero-parameter function.
    pub fn evaluate(&mut self, function: &Function) -> Result<f64, CoreError> {
        let handle = self.lower_function(function)?;
        let result = self.backend.execute(handle);
        self.discard(handle, function.name());

        let value = result?;
        debug!(name = %function.name(), value, "evaluated top-level expression");
        Ok(value)
    }

    /// Remove a function and its prototype from the session.
    pub fn discard(&mut self, handle: B::FunctionRef, name: &str) {
        self.backend.discard_function(handle);
        self.prototypes.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::parser::Parser;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Declare(String, usize),
        Begin(String),
        Const(f64),
        Binary(BinaryOp),
        Compare(Predicate),
        Widen,
        Call(String, usize),
        Branch,
        Position(usize),
        Jump { from: usize, to: usize },
        Merge(Vec<usize>),
        Finish(String),
        DiscardBody(String),
        DiscardFunction(String),
        Execute(String),
    }

    #[derive(Debug)]
    struct Recorded {
        name: String,
        arity: usize,
        has_body: bool,
    }

    /// Backend double that records every operation it is asked for.
    #[derive(Debug, Default)]
    struct RecordingBackend {
        functions: Vec<Option<Recorded>>,
        ops: Vec<Op>,
        next_value: u32,
        next_block: usize,
        current_block: usize,
    }

    impl RecordingBackend {
        fn value(&mut self) -> u32 {
            self.next_value += 1;
            self.next_value
        }

        fn block(&mut self) -> usize {
            self.next_block += 1;
            self.next_block
        }

        fn recorded(&self, function: usize) -> &Recorded {
            self.functions[function].as_ref().expect("live function")
        }

        fn name(&self, function: usize) -> String {
            self.recorded(function).name.clone()
        }
    }

    impl Backend for RecordingBackend {
        type Value = u32;
        type FunctionRef = usize;
        type Block = usize;

        fn declare_function(&mut self, name: &str, arity: usize) -> Result<usize, BackendError> {
            self.ops.push(Op::Declare(name.to_string(), arity));
            self.functions.push(Some(Recorded {
                name: name.to_string(),
                arity,
                has_body: false,
            }));
            Ok(self.functions.len() - 1)
        }

        fn lookup_function(&self, name: &str) -> Option<usize> {
            self.functions
                .iter()
                .position(|f| f.as_ref().is_some_and(|f| f.name == name))
        }

        fn arity(&self, function: usize) -> usize {
            self.recorded(function).arity
        }

        fn has_body(&self, function: usize) -> bool {
            self.recorded(function).has_body
        }

        fn begin_function_body(&mut self, function: usize) -> Result<Vec<u32>, BackendError> {
            self.ops.push(Op::Begin(self.name(function)));
            if let Some(recorded) = self.functions[function].as_mut() {
                recorded.has_body = true;
            }
            self.current_block = self.block();
            let arity = self.arity(function);
            Ok((0..arity).map(|_| self.value()).collect())
        }

        fn constant(&mut self, value: f64) -> u32 {
            self.ops.push(Op::Const(value));
            self.value()
        }

        fn binary_op(&mut self, op: BinaryOp, _: u32, _: u32) -> Result<u32, BackendError> {
            self.ops.push(Op::Binary(op));
            Ok(self.value())
        }

        fn compare(&mut self, predicate: Predicate, _: u32, _: u32) -> Result<u32, BackendError> {
            self.ops.push(Op::Compare(predicate));
            Ok(self.value())
        }

        fn widen(&mut self, _: u32) -> Result<u32, BackendError> {
            self.ops.push(Op::Widen);
            Ok(self.value())
        }

        fn call(&mut self, function: usize, args: Vec<u32>) -> Result<u32, BackendError> {
            self.ops.push(Op::Call(self.name(function), args.len()));
            Ok(self.value())
        }

        fn branch_on_condition(&mut self, _: u32) -> Result<Branches<usize>, BackendError> {
            self.ops.push(Op::Branch);
            Ok(Branches {
                then_block: self.block(),
                else_block: self.block(),
                merge_block: self.block(),
            })
        }

        fn position_at(&mut self, block: usize) -> Result<(), BackendError> {
            self.ops.push(Op::Position(block));
            self.current_block = block;
            Ok(())
        }

        fn jump(&mut self, target: usize) -> Result<usize, BackendError> {
            let from = self.current_block;
            self.ops.push(Op::Jump { from, to: target });
            Ok(from)
        }

        fn merge_values(&mut self, incoming: Vec<(u32, usize)>) -> Result<u32, BackendError> {
            self.ops
                .push(Op::Merge(incoming.iter().map(|(_, block)| *block).collect()));
            Ok(self.value())
        }

        fn finish_function(&mut self, function: usize, _: u32) -> Result<(), BackendError> {
            self.ops.push(Op::Finish(self.name(function)));
            Ok(())
        }

        fn discard_body(&mut self, function: usize) {
            self.ops.push(Op::DiscardBody(self.name(function)));
            if let Some(recorded) = self.functions[function].as_mut() {
                recorded.has_body = false;
            }
        }

        fn discard_function(&mut self, function: usize) {
            self.ops.push(Op::DiscardFunction(self.name(function)));
            self.functions[function] = None;
        }

        fn execute(&mut self, function: usize) -> Result<f64, BackendError> {
            self.ops.push(Op::Execute(self.name(function)));
            Ok(42.0)
        }
    }

    fn session() -> Session<RecordingBackend> {
        Session::new(RecordingBackend::default())
    }

    fn define(session: &mut Session<RecordingBackend>, source: &str) -> Result<usize, CoreError> {
        let function = Parser::new(source).parse_definition().expect("parse");
        session.lower_function(&function)
    }

    fn top_level(source: &str) -> Function {
        Parser::new(source)
            .parse_top_level_expression()
            .expect("parse")
    }

    #[test]
    fn lowers_arithmetic_in_operand_order() {
        let mut session = session();
        define(&mut session, "def f : x { x * 2 - 1 }").expect("lower");
        let ops = &session.backend().ops;
        assert_eq!(
            ops[2..],
            [
                Op::Const(2.0),
                Op::Binary(BinaryOp::Multiply),
                Op::Const(1.0),
                Op::Binary(BinaryOp::Subtract),
                Op::Finish("f".to_string()),
            ]
        );
    }

    #[test]
    fn comparisons_are_widened_to_numbers() {
        let mut session = session();
        define(&mut session, "def f : a, b { a < b = b < a }").expect("lower");
        let ops = &session.backend().ops;
        assert_eq!(
            ops[2..],
            [
                Op::Compare(Predicate::UnorderedLess),
                Op::Widen,
                Op::Compare(Predicate::UnorderedLess),
                Op::Widen,
                Op::Compare(Predicate::UnorderedEqual),
                Op::Widen,
                Op::Finish("f".to_string()),
            ]
        );
    }

    #[test]
    fn division_lowers_from_hand_built_tree() {
        let mut session = session();
        let function = Function {
            prototype: Prototype::new("half", vec!["x".to_string()]),
            body: Expr::binary('/', Expr::variable("x"), Expr::Number(2.0)),
        };
        session.lower_function(&function).expect("lower");
        assert!(
            session
                .backend()
                .ops
                .contains(&Op::Binary(BinaryOp::Divide))
        );
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let mut session = session();
        let function = Function {
            prototype: Prototype::new("m", vec!["x".to_string()]),
            body: Expr::binary('%', Expr::variable("x"), Expr::Number(2.0)),
        };
        let err = session.lower_function(&function).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperator('%')));
        assert!(session.backend().lookup_function("m").is_none());
    }

    #[test]
    fn arity_mismatch_fails_before_emitting_anything() {
        let mut session = session();
        define(&mut session, "def add : x, y { x + y }").expect("lower");
        session.backend_mut().ops.clear();

        let err = session.lower_function(&top_level("add(1)")).unwrap_err();
        assert!(matches!(
            err,
            CoreError::ArgumentCount {
                expected: 2,
                found: 1,
                ..
            }
        ));
        let ops = &session.backend().ops;
        assert!(!ops.iter().any(|op| matches!(op, Op::Const(_) | Op::Call(..))));
        assert_eq!(
            ops.last(),
            Some(&Op::DiscardFunction("__anon_expr1".to_string()))
        );
    }

    #[test]
    fn self_recursive_function_lowers() {
        let mut session = session();
        define(&mut session, "def f : x { if x < 1 , 1 else f(x - 1) }").expect("lower");
        let ops = &session.backend().ops;
        assert!(ops.contains(&Op::Call("f".to_string(), 1)));
        assert!(ops.contains(&Op::Compare(Predicate::OrderedNotEqual)));
        assert_eq!(ops.last(), Some(&Op::Finish("f".to_string())));
        assert_eq!(session.prototype("f").map(Prototype::arity), Some(1));
    }

    #[test]
    fn merge_uses_branch_exit_blocks() {
        let mut session = session();
        define(
            &mut session,
            "def f : a, b { if a , (if b , 1 else 2) else 3 }",
        )
        .expect("lower");

        // entry = 1; outer then/else/merge = 2/3/4; inner = 5/6/7.
        let merges: Vec<&Op> = session
            .backend()
            .ops
            .iter()
            .filter(|op| matches!(op, Op::Merge(_)))
            .collect();
        assert_eq!(merges, [&Op::Merge(vec![5, 6]), &Op::Merge(vec![7, 3])]);
    }

    #[test]
    fn redefinition_keeps_first_definition() {
        let mut session = session();
        let first = define(&mut session, "def g : x { x }").expect("lower");

        let err = define(&mut session, "def g : x, y { x }").unwrap_err();
        assert!(matches!(err, CoreError::Redefinition(ref name) if name == "g"));
        assert_eq!(session.backend().lookup_function("g"), Some(first));
        assert_eq!(session.backend().arity(first), 1);
        assert_eq!(session.prototype("g").map(Prototype::arity), Some(1));
    }

    #[test]
    fn definition_must_match_imported_arity() {
        let mut session = session();
        session
            .declare_extern(&Prototype::new("k", vec!["x".to_string()]))
            .expect("declare");

        let err = define(&mut session, "def k : x, y { x }").unwrap_err();
        assert!(matches!(
            err,
            CoreError::ArityRedefinition {
                declared: 1,
                found: 2,
                ..
            }
        ));
        assert_eq!(session.prototype("k").map(Prototype::arity), Some(1));
    }

    #[test]
    fn failed_definition_leaves_nothing_behind() {
        let mut session = session();
        let err = define(&mut session, "def h : x { y }").unwrap_err();
        assert!(matches!(err, CoreError::UnknownVariable(ref name) if name == "y"));
        assert!(session.backend().lookup_function("h").is_none());
        assert!(session.prototype("h").is_none());
        assert_eq!(
            session.backend().ops.last(),
            Some(&Op::DiscardFunction("h".to_string()))
        );
    }

    #[test]
    fn failed_definition_of_import_reverts_to_declaration() {
        let mut session = session();
        let declared = session
            .declare_extern(&Prototype::new("e", vec!["x".to_string()]))
            .expect("declare");

        define(&mut session, "def e : x { nope }").unwrap_err();
        assert_eq!(session.backend().lookup_function("e"), Some(declared));
        assert!(!session.backend().has_body(declared));
        assert!(session.prototype("e").is_some());
    }

    #[test]
    fn scope_does_not_leak_between_functions() {
        let mut session = session();
        define(&mut session, "def a : x { x }").expect("lower");
        let err = define(&mut session, "def b : y { x }").unwrap_err();
        assert!(matches!(err, CoreError::UnknownVariable(ref name) if name == "x"));
    }

    #[test]
    fn unknown_function_is_reported() {
        let mut session = session();
        let err = session.lower_function(&top_level("nope(1)")).unwrap_err();
        assert!(matches!(err, CoreError::UnknownFunction(ref name) if name == "nope"));
    }

    #[test]
    fn calls_redeclare_known_prototypes_on_demand() {
        let mut session = session();
        let handle = session
            .declare_extern(&Prototype::new("sin", vec!["x".to_string()]))
            .expect("declare");
        session.backend_mut().discard_function(handle);
        session.backend_mut().ops.clear();

        session
            .lower_function(&top_level("sin(1)"))
            .expect("lower");
        let ops = &session.backend().ops;
        assert!(ops.contains(&Op::Declare("sin".to_string(), 1)));
        assert!(ops.contains(&Op::Call("sin".to_string(), 1)));
    }

    #[test]
    fn import_of_defined_function_is_a_redefinition() {
        let mut session = session();
        define(&mut session, "def d : x { x }").expect("lower");
        let err = session
            .declare_extern(&Prototype::new("d", vec!["x".to_string()]))
            .unwrap_err();
        assert!(matches!(err, CoreError::Redefinition(_)));
    }

    #[test]
    fn evaluation_discards_the_anonymous_function() {
        let mut session = session();
        let function = top_level("1 + 2");
        assert_eq!(session.evaluate(&function).expect("evaluate"), 42.0);

        let ops = &session.backend().ops;
        assert!(ops.contains(&Op::Execute("__anon_expr1".to_string())));
        assert_eq!(
            ops.last(),
            Some(&Op::DiscardFunction("__anon_expr1".to_string()))
        );
        assert!(session.backend().lookup_function("__anon_expr1").is_none());
        assert!(session.prototype("__anon_expr1").is_none());
    }
}
