//! WASM backend for kaleido core.
//!
//! `WasmBackend` implements [`Backend`] by building the block IR from
//! [`crate::ir`]. Nothing is encoded until a module is needed: for
//! execution, the target function and everything it reaches are
//! translated into a wasm module with `wasm-encoder` and run on `wasmi`.
//! Functions without a body become imports from [`IMPORT_MODULE`] and are
//! linked against the host builtins.
//!
//! Control flow produced by lowering is always a nest of diamonds
//! (branch, two arms, merge), so every branch is emitted as a structured
//! `if`/`else`/`end` and phis become `local.set`s at the end of each arm.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;
use wasm_encoder::{
    BlockType, CodeSection, EntityType, ExportKind, ExportSection, Function, FunctionSection,
    ImportSection, Instruction, Module, TypeSection, ValType,
};
use wasmi::{Engine, Linker, Store};

use crate::backend::{Backend, BackendError, BinaryOp, Branches, Predicate};
use crate::builtins::{HostFunction, IMPORT_MODULE, find_builtin};
use crate::ir::{BlockId, Body, FuncId, FunctionData, Inst, Phi, Terminator, Value, ValueKind};

/// An encoded module plus the imports it expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImage {
    pub wasm: Vec<u8>,
    /// `(name, arity)` of every imported function, in import order.
    pub imports: Vec<(String, usize)>,
}

/// Function ids are never reused, so a handle to a discarded function
/// stays stale instead of aliasing a later declaration.
#[derive(Debug, Default)]
pub struct WasmBackend {
    functions: BTreeMap<FuncId, FunctionData>,
    next_id: usize,
    names: HashMap<String, FuncId>,
    active: Option<FuncId>,
}

impl WasmBackend {
    pub fn new() -> Self {
        WasmBackend::default()
    }

    fn data(&self, id: FuncId) -> Result<&FunctionData, BackendError> {
        self.functions.get(&id).ok_or(BackendError::StaleFunction)
    }

    fn data_mut(&mut self, id: FuncId) -> Result<&mut FunctionData, BackendError> {
        self.functions.get_mut(&id).ok_or(BackendError::StaleFunction)
    }

    fn active_body(&mut self) -> Result<&mut Body, BackendError> {
        let id = self.active.ok_or(BackendError::NoActiveFunction)?;
        self.data_mut(id)?
            .body
            .as_mut()
            .ok_or(BackendError::NoActiveFunction)
    }

    fn live(&self) -> impl Iterator<Item = (FuncId, &FunctionData)> {
        self.functions.iter().map(|(id, data)| (*id, data))
    }

    /// Names of functions with a complete body, in declaration order.
    pub fn defined_functions(&self) -> Vec<&str> {
        self.live()
            .filter(|(_, data)| data.is_defined())
            .map(|(_, data)| data.name.as_str())
            .collect()
    }

    /// Encode every defined function (exported by name), importing
    /// every bodiless declaration.
    pub fn emit_module(&self) -> Result<ModuleImage, BackendError> {
        let roots: Vec<FuncId> = self
            .live()
            .filter(|(_, data)| data.is_defined() || data.body.is_none())
            .map(|(id, _)| id)
            .collect();
        self.build_module(&roots)
    }

    /// Functions reachable from `roots` through calls, in id order.
    fn reachable(&self, roots: &[FuncId]) -> Result<BTreeSet<FuncId>, BackendError> {
        let mut seen = BTreeSet::new();
        let mut pending: Vec<FuncId> = roots.to_vec();

        while let Some(id) = pending.pop() {
            if !seen.insert(id) {
                continue;
            }
            let data = self.data(id)?;
            let Some(body) = &data.body else {
                continue;
            };
            if !body.complete {
                return Err(BackendError::MissingBody(data.name.clone()));
            }
            for callee in body.callees() {
                if self.data(callee).is_err() {
                    return Err(BackendError::DanglingCall {
                        caller: data.name.clone(),
                    });
                }
                pending.push(callee);
            }
        }
        Ok(seen)
    }

    fn build_module(&self, roots: &[FuncId]) -> Result<ModuleImage, BackendError> {
        let reachable = self.reachable(roots)?;

        let mut imported = Vec::new();
        let mut defined = Vec::new();
        for id in &reachable {
            let data = self.data(*id)?;
            match &data.body {
                Some(body) => defined.push((*id, data, body)),
                None => imported.push((*id, data)),
            }
        }

        let mut indices = HashMap::new();
        for (index, (id, _)) in imported.iter().enumerate() {
            indices.insert(*id, index as u32);
        }
        for (offset, (id, _, _)) in defined.iter().enumerate() {
            indices.insert(*id, (imported.len() + offset) as u32);
        }

        let mut module = Module::new();

        // Type section: one `(f64 * arity) -> f64` signature per arity.
        let mut types = TypeSection::new();
        let mut type_indices = BTreeMap::new();
        for id in &reachable {
            let arity = self.data(*id)?.arity;
            if !type_indices.contains_key(&arity) {
                type_indices.insert(arity, types.len());
                types
                    .ty()
                    .function(vec![ValType::F64; arity], [ValType::F64]);
            }
        }
        module.section(&types);

        if !imported.is_empty() {
            let mut imports = ImportSection::new();
            for (_, data) in &imported {
                imports.import(
                    IMPORT_MODULE,
                    &data.name,
                    EntityType::Function(type_indices[&data.arity]),
                );
            }
            module.section(&imports);
        }

        let mut functions = FunctionSection::new();
        for (_, data, _) in &defined {
            functions.function(type_indices[&data.arity]);
        }
        module.section(&functions);

        let mut exports = ExportSection::new();
        for (id, data, _) in &defined {
            exports.export(&data.name, ExportKind::Func, indices[id]);
        }
        module.section(&exports);

        let mut code = CodeSection::new();
        for (_, data, body) in &defined {
            let function = BodyEncoder::encode(&data.name, body, &indices)?;
            code.function(&function);
        }
        module.section(&code);

        Ok(ModuleImage {
            wasm: module.finish(),
            imports: imported
                .iter()
                .map(|(_, data)| (data.name.clone(), data.arity))
                .collect(),
        })
    }
}

impl Backend for WasmBackend {
    type Value = Value;
    type FunctionRef = FuncId;
    type Block = BlockId;

    fn declare_function(&mut self, name: &str, arity: usize) -> Result<FuncId, BackendError> {
        if self.names.contains_key(name) {
            return Err(BackendError::AlreadyDeclared(name.to_string()));
        }
        let id = FuncId(self.next_id);
        self.next_id += 1;
        self.functions.insert(
            id,
            FunctionData {
                name: name.to_string(),
                arity,
                body: None,
            },
        );
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    fn lookup_function(&self, name: &str) -> Option<FuncId> {
        self.names.get(name).copied()
    }

    fn arity(&self, function: FuncId) -> usize {
        self.data(function).map(|data| data.arity).unwrap_or(0)
    }

    fn has_body(&self, function: FuncId) -> bool {
        self.data(function)
            .map(|data| data.body.is_some())
            .unwrap_or(false)
    }

    fn begin_function_body(&mut self, function: FuncId) -> Result<Vec<Value>, BackendError> {
        let data = self.data_mut(function)?;
        if data.body.is_some() {
            return Err(BackendError::BodyExists(data.name.clone()));
        }
        let body = Body::new(data.arity);
        let params = body.param_values();
        data.body = Some(body);
        self.active = Some(function);
        Ok(params)
    }

    fn constant(&mut self, value: f64) -> Value {
        Value::Const(value)
    }

    fn binary_op(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, BackendError> {
        let lhs = lhs.expect(ValueKind::Number)?;
        let rhs = rhs.expect(ValueKind::Number)?;
        let body = self.active_body()?;
        let dest = body.new_local(ValueKind::Number);
        body.append(Inst::Binary { op, lhs, rhs, dest })?;
        Ok(Value::Local {
            index: dest,
            kind: ValueKind::Number,
        })
    }

    fn compare(
        &mut self,
        predicate: Predicate,
        lhs: Value,
        rhs: Value,
    ) -> Result<Value, BackendError> {
        let lhs = lhs.expect(ValueKind::Number)?;
        let rhs = rhs.expect(ValueKind::Number)?;
        let body = self.active_body()?;
        let dest = body.new_local(ValueKind::Boolean);
        body.append(Inst::Compare {
            predicate,
            lhs,
            rhs,
            dest,
        })?;
        Ok(Value::Local {
            index: dest,
            kind: ValueKind::Boolean,
        })
    }

    fn widen(&mut self, flag: Value) -> Result<Value, BackendError> {
        let flag = flag.expect(ValueKind::Boolean)?;
        let body = self.active_body()?;
        let dest = body.new_local(ValueKind::Number);
        body.append(Inst::Widen { flag, dest })?;
        Ok(Value::Local {
            index: dest,
            kind: ValueKind::Number,
        })
    }

    fn call(&mut self, function: FuncId, args: Vec<Value>) -> Result<Value, BackendError> {
        let callee = self.data(function)?;
        if callee.arity != args.len() {
            return Err(BackendError::CallArity {
                callee: callee.name.clone(),
                expected: callee.arity,
                found: args.len(),
            });
        }
        let args = args
            .iter()
            .map(|arg| arg.expect(ValueKind::Number))
            .collect::<Result<Vec<_>, _>>()?;

        let body = self.active_body()?;
        let dest = body.new_local(ValueKind::Number);
        body.append(Inst::Call {
            callee: function,
            args,
            dest,
        })?;
        Ok(Value::Local {
            index: dest,
            kind: ValueKind::Number,
        })
    }

    fn branch_on_condition(&mut self, condition: Value) -> Result<Branches<BlockId>, BackendError> {
        let condition = condition.expect(ValueKind::Boolean)?;
        let body = self.active_body()?;
        let then_block = body.new_block();
        let else_block = body.new_block();
        let merge_block = body.new_block();
        body.terminate(Terminator::Branch {
            condition,
            then_block,
            else_block,
            merge_block,
        })?;
        Ok(Branches {
            then_block,
            else_block,
            merge_block,
        })
    }

    fn position_at(&mut self, block: BlockId) -> Result<(), BackendError> {
        self.active_body()?.position_at(block)
    }

    fn jump(&mut self, target: BlockId) -> Result<BlockId, BackendError> {
        let body = self.active_body()?;
        body.block(target)?;
        body.terminate(Terminator::Jump(target))
    }

    fn merge_values(&mut self, incoming: Vec<(Value, BlockId)>) -> Result<Value, BackendError> {
        let incoming = incoming
            .into_iter()
            .map(|(value, block)| Ok((value.expect(ValueKind::Number)?, block)))
            .collect::<Result<Vec<_>, BackendError>>()?;

        let body = self.active_body()?;
        for (_, block) in &incoming {
            body.block(*block)?;
        }
        let dest = body.new_local(ValueKind::Number);
        body.append_phi(Phi { dest, incoming })?;
        Ok(Value::Local {
            index: dest,
            kind: ValueKind::Number,
        })
    }

    fn finish_function(&mut self, function: FuncId, value: Value) -> Result<(), BackendError> {
        if self.active != Some(function) {
            return Err(BackendError::NoActiveFunction);
        }
        let value = value.expect(ValueKind::Number)?;
        let body = self.active_body()?;
        body.terminate(Terminator::Return(value))?;
        body.complete = true;
        self.active = None;
        Ok(())
    }

    fn discard_body(&mut self, function: FuncId) {
        if let Ok(data) = self.data_mut(function) {
            data.body = None;
        }
        if self.active == Some(function) {
            self.active = None;
        }
    }

    fn discard_function(&mut self, function: FuncId) {
        if let Some(data) = self.functions.remove(&function) {
            if self.names.get(&data.name) == Some(&function) {
                self.names.remove(&data.name);
            }
        }
        if self.active == Some(function) {
            self.active = None;
        }
    }

    fn execute(&mut self, function: FuncId) -> Result<f64, BackendError> {
        let data = self.data(function)?;
        if data.arity != 0 {
            return Err(BackendError::NotExecutable(data.name.clone()));
        }
        if !data.is_defined() {
            return Err(BackendError::MissingBody(data.name.clone()));
        }
        let entry = data.name.clone();

        let image = self.build_module(&[function])?;
        debug!(
            function = %entry,
            bytes = image.wasm.len(),
            imports = image.imports.len(),
            "executing function"
        );
        run_module(&image, &entry)
    }
}

fn execution_error(err: impl std::fmt::Display) -> BackendError {
    BackendError::Execution(err.to_string())
}

/// Instantiate `image` on wasmi, linking imports to host builtins, and
/// call the exported zero-parameter function `entry`.
pub fn run_module(image: &ModuleImage, entry: &str) -> Result<f64, BackendError> {
    let engine = Engine::default();
    let module = wasmi::Module::new(&engine, &image.wasm).map_err(execution_error)?;

    let mut linker = Linker::<()>::new(&engine);
    for (name, arity) in &image.imports {
        let builtin =
            find_builtin(name).ok_or_else(|| BackendError::UnresolvedImport(name.clone()))?;
        if builtin.arity() != *arity {
            return Err(BackendError::ImportSignature {
                name: name.clone(),
                declared: *arity,
                provided: builtin.arity(),
            });
        }
        match builtin.function {
            HostFunction::Unary(host) => linker.func_wrap(IMPORT_MODULE, builtin.name, host),
            HostFunction::Binary(host) => linker.func_wrap(IMPORT_MODULE, builtin.name, host),
        }
        .map_err(execution_error)?;
    }

    let mut store = Store::new(&engine, ());
    let instance = linker
        .instantiate_and_start(&mut store, &module)
        .map_err(execution_error)?;
    let main = instance
        .get_typed_func::<(), f64>(&store, entry)
        .map_err(execution_error)?;
    main.call(&mut store, ()).map_err(execution_error)
}

/// Translates one function body into a wasm function.
struct BodyEncoder<'a> {
    name: &'a str,
    body: &'a Body,
    indices: &'a HashMap<FuncId, u32>,
    visited: Vec<bool>,
    out: Function,
}

impl<'a> BodyEncoder<'a> {
    fn encode(
        name: &'a str,
        body: &'a Body,
        indices: &'a HashMap<FuncId, u32>,
    ) -> Result<Function, BackendError> {
        let locals: Vec<(u32, ValType)> = body
            .locals
            .iter()
            .map(|kind| (1, val_type(*kind)))
            .collect();
        let mut encoder = BodyEncoder {
            name,
            body,
            indices,
            visited: vec![false; body.blocks.len()],
            out: Function::new(locals),
        };
        encoder.emit_chain(BlockId::ENTRY, None)?;
        encoder.out.instruction(&Instruction::End);
        Ok(encoder.out)
    }

    fn malformed(&self, reason: String) -> BackendError {
        BackendError::MalformedBody {
            function: self.name.to_string(),
            reason,
        }
    }

    /// Emit `start` and its successors until control reaches `stop`.
    fn emit_chain(&mut self, start: BlockId, stop: Option<BlockId>) -> Result<(), BackendError> {
        let mut current = start;
        loop {
            if Some(current) == stop {
                return Ok(());
            }
            let body = self.body;
            let block = body.block(current)?;
            if std::mem::replace(&mut self.visited[current.index()], true) {
                return Err(self.malformed(format!("block {} is reached twice", current.index())));
            }

            for inst in &block.insts {
                self.emit_inst(inst)?;
            }

            match &block.terminator {
                None => {
                    return Err(self.malformed(format!(
                        "block {} has no terminator",
                        current.index()
                    )));
                }
                Some(Terminator::Return(value)) => {
                    self.push(value);
                    self.out.instruction(&Instruction::Return);
                    return Ok(());
                }
                Some(Terminator::Jump(target)) => {
                    self.emit_phi_copies(current, *target)?;
                    current = *target;
                }
                Some(Terminator::Branch {
                    condition,
                    then_block,
                    else_block,
                    merge_block,
                }) => {
                    self.push(condition);
                    self.out.instruction(&Instruction::If(BlockType::Empty));
                    self.emit_chain(*then_block, Some(*merge_block))?;
                    self.out.instruction(&Instruction::Else);
                    self.emit_chain(*else_block, Some(*merge_block))?;
                    self.out.instruction(&Instruction::End);
                    current = *merge_block;
                }
            }
        }
    }

    /// Assign the merge values flowing from `from` into `target`.
    fn emit_phi_copies(&mut self, from: BlockId, target: BlockId) -> Result<(), BackendError> {
        let body = self.body;
        for phi in &body.block(target)?.phis {
            let Some((value, _)) = phi.incoming.iter().find(|(_, block)| *block == from) else {
                return Err(self.malformed(format!(
                    "merge in block {} has no value for predecessor {}",
                    target.index(),
                    from.index()
                )));
            };
            self.push(value);
            self.out.instruction(&Instruction::LocalSet(phi.dest));
        }
        Ok(())
    }

    fn emit_inst(&mut self, inst: &Inst) -> Result<(), BackendError> {
        match inst {
            Inst::Binary { op, lhs, rhs, dest } => {
                self.push(lhs);
                self.push(rhs);
                self.out.instruction(&match op {
                    BinaryOp::Add => Instruction::F64Add,
                    BinaryOp::Subtract => Instruction::F64Sub,
                    BinaryOp::Multiply => Instruction::F64Mul,
                    BinaryOp::Divide => Instruction::F64Div,
                });
                self.out.instruction(&Instruction::LocalSet(*dest));
            }
            Inst::Compare {
                predicate,
                lhs,
                rhs,
                dest,
            } => {
                match predicate {
                    // !(lhs >= rhs)
                    Predicate::UnorderedLess => {
                        self.push(lhs);
                        self.push(rhs);
                        self.out.instruction(&Instruction::F64Ge);
                        self.out.instruction(&Instruction::I32Eqz);
                    }
                    // !(lhs < rhs || lhs > rhs)
                    Predicate::UnorderedEqual => {
                        self.emit_less_or_greater(lhs, rhs);
                        self.out.instruction(&Instruction::I32Eqz);
                    }
                    Predicate::OrderedNotEqual => self.emit_less_or_greater(lhs, rhs),
                }
                self.out.instruction(&Instruction::LocalSet(*dest));
            }
            Inst::Widen { flag, dest } => {
                self.push(flag);
                self.out.instruction(&Instruction::F64ConvertI32U);
                self.out.instruction(&Instruction::LocalSet(*dest));
            }
            Inst::Call { callee, args, dest } => {
                let Some(index) = self.indices.get(callee).copied() else {
                    return Err(self.malformed(format!("call to unindexed function {}", callee.0)));
                };
                for arg in args {
                    self.push(arg);
                }
                self.out.instruction(&Instruction::Call(index));
                self.out.instruction(&Instruction::LocalSet(*dest));
            }
        }
        Ok(())
    }

    fn emit_less_or_greater(&mut self, lhs: &Value, rhs: &Value) {
        self.push(lhs);
        self.push(rhs);
        self.out.instruction(&Instruction::F64Lt);
        self.push(lhs);
        self.push(rhs);
        self.out.instruction(&Instruction::F64Gt);
        self.out.instruction(&Instruction::I32Or);
    }

    fn push(&mut self, value: &Value) {
        match value {
            Value::Const(constant) => self
                .out
                .instruction(&Instruction::F64Const((*constant).into())),
            Value::Local { index, .. } => self.out.instruction(&Instruction::LocalGet(*index)),
        };
    }
}

fn val_type(kind: ValueKind) -> ValType {
    match kind {
        ValueKind::Number => ValType::F64,
        ValueKind::Boolean => ValType::I32,
    }
}
