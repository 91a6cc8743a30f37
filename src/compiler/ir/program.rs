//! IR function, block and module definitions

use super::instruction::{BlockId, FunctionId, Instruction, IrReg, Terminator};
use crate::compiler::constants::ConstantPool;
use crate::types::{Type, TypeId, TypeTable};
use serde::{Deserialize, Serialize};

/// Basic block: straight-line instructions plus one terminator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    /// Block id (equals its index in the function)
    pub id: BlockId,
    /// Human-readable label
    pub label: String,
    /// Instructions; phis come first
    pub instructions: Vec<Instruction>,
    /// Control transfer out of the block
    pub terminator: Terminator,
}

/// Lowered function. Immutable after verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrFunction {
    /// Function id
    pub id: FunctionId,
    /// Source name
    pub name: String,
    /// Parameter registers (defined on entry)
    pub params: Vec<IrReg>,
    /// Return type
    pub ret_type: TypeId,
    /// Blocks; block 0 is the entry
    pub blocks: Vec<BasicBlock>,
    /// Type of every register; its length is the declared register count
    pub reg_types: Vec<TypeId>,
    /// Content type of every stack slot
    pub slot_types: Vec<TypeId>,
}

impl IrFunction {
    /// Declared register count
    pub fn reg_count(&self) -> usize {
        self.reg_types.len()
    }

    /// Type of a register
    pub fn reg_type(&self, reg: IrReg) -> Option<TypeId> {
        self.reg_types.get(reg.0 as usize).copied()
    }

    /// Block by id
    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.0 as usize)
    }

    /// Parameter types in order
    pub fn param_types(&self) -> Vec<TypeId> {
        self.params
            .iter()
            .filter_map(|r| self.reg_type(*r))
            .collect()
    }

    /// Predecessor lists indexed by block id
    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for block in &self.blocks {
            for succ in block.terminator.successors() {
                if let Some(list) = preds.get_mut(succ.0 as usize) {
                    if !list.contains(&block.id) {
                        list.push(block.id);
                    }
                }
            }
        }
        preds
    }

    /// Total instruction count (terminators excluded)
    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instructions.len()).sum()
    }
}

/// A lowered compilation unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrModule {
    /// Interned types referenced by the functions
    pub types: TypeTable,
    /// Constant pool
    pub constants: ConstantPool,
    /// Functions in declaration order (index == id)
    pub functions: Vec<IrFunction>,
}

impl IrModule {
    /// Function by id
    pub fn function(&self, id: FunctionId) -> Option<&IrFunction> {
        self.functions.get(id.0 as usize)
    }

    /// Function by name
    pub fn function_by_name(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Resolve a type id
    pub fn ty(&self, id: TypeId) -> Option<&Type> {
        self.types.get(id)
    }

    /// Resolved type of a register in a function
    pub fn reg_ty(&self, func: &IrFunction, reg: IrReg) -> Option<&Type> {
        func.reg_type(reg).and_then(|t| self.types.get(t))
    }
}
