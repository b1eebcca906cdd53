//! Block IR built by the wasm backend.
//!
//! Functions are lists of basic blocks holding three-address
//! instructions over numbered locals. Merges are recorded as phis on
//! the merge block and become local copies at the end of each
//! predecessor when the function is encoded.

use crate::backend::{BackendError, BinaryOp, Predicate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub(crate) usize);

impl BlockId {
    pub const ENTRY: BlockId = BlockId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Number,
    Boolean,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Number => "number",
            ValueKind::Boolean => "boolean",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Const(f64),
    Local { index: u32, kind: ValueKind },
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Const(_) => ValueKind::Number,
            Value::Local { kind, .. } => *kind,
        }
    }

    /// Fail unless the value has the expected kind.
    pub fn expect(&self, expected: ValueKind) -> Result<Value, BackendError> {
        if self.kind() == expected {
            Ok(*self)
        } else {
            Err(BackendError::TypeMismatch {
                expected: expected.name(),
                found: self.kind().name(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Binary {
        op: BinaryOp,
        lhs: Value,
        rhs: Value,
        dest: u32,
    },
    Compare {
        predicate: Predicate,
        lhs: Value,
        rhs: Value,
        dest: u32,
    },
    Widen {
        flag: Value,
        dest: u32,
    },
    Call {
        callee: FuncId,
        args: Vec<Value>,
        dest: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Jump(BlockId),
    Branch {
        condition: Value,
        then_block: BlockId,
        else_block: BlockId,
        merge_block: BlockId,
    },
    Return(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Phi {
    pub dest: u32,
    pub incoming: Vec<(Value, BlockId)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub phis: Vec<Phi>,
    pub insts: Vec<Inst>,
    pub terminator: Option<Terminator>,
}

/// The body of one function while and after it is built.
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    params: u32,
    /// Kinds of the locals declared after the parameters.
    pub locals: Vec<ValueKind>,
    pub blocks: Vec<Block>,
    pub current: BlockId,
    pub complete: bool,
}

impl Body {
    pub fn new(params: usize) -> Self {
        Body {
            params: params as u32,
            locals: Vec::new(),
            blocks: vec![Block::default()],
            current: BlockId::ENTRY,
            complete: false,
        }
    }

    pub fn param_values(&self) -> Vec<Value> {
        (0..self.params)
            .map(|index| Value::Local {
                index,
                kind: ValueKind::Number,
            })
            .collect()
    }

    pub fn new_local(&mut self, kind: ValueKind) -> u32 {
        let index = self.params + self.locals.len() as u32;
        self.locals.push(kind);
        index
    }

    pub fn new_block(&mut self) -> BlockId {
        self.blocks.push(Block::default());
        BlockId(self.blocks.len() - 1)
    }

    pub fn block(&self, id: BlockId) -> Result<&Block, BackendError> {
        self.blocks
            .get(id.0)
            .ok_or(BackendError::UnknownBlock(id.0))
    }

    fn open_block(&mut self) -> Result<&mut Block, BackendError> {
        let id = self.current;
        let block = self
            .blocks
            .get_mut(id.0)
            .ok_or(BackendError::UnknownBlock(id.0))?;
        if block.terminator.is_some() {
            return Err(BackendError::BlockTerminated(id.0));
        }
        Ok(block)
    }

    pub fn position_at(&mut self, id: BlockId) -> Result<(), BackendError> {
        self.block(id)?;
        self.current = id;
        Ok(())
    }

    pub fn append(&mut self, inst: Inst) -> Result<(), BackendError> {
        self.open_block()?.insts.push(inst);
        Ok(())
    }

    pub fn append_phi(&mut self, phi: Phi) -> Result<(), BackendError> {
        self.open_block()?.phis.push(phi);
        Ok(())
    }

    /// Terminate the current block and return its id.
    pub fn terminate(&mut self, terminator: Terminator) -> Result<BlockId, BackendError> {
        let id = self.current;
        self.open_block()?.terminator = Some(terminator);
        Ok(id)
    }

    /// Every function called from this body.
    pub fn callees(&self) -> impl Iterator<Item = FuncId> + '_ {
        self.blocks
            .iter()
            .flat_map(|block| block.insts.iter())
            .filter_map(|inst| match inst {
                Inst::Call { callee, .. } => Some(*callee),
                _ => None,
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionData {
    pub name: String,
    pub arity: usize,
    pub body: Option<Body>,
}

impl FunctionData {
    pub fn is_defined(&self) -> bool {
        self.body.as_ref().is_some_and(|body| body.complete)
    }
}
