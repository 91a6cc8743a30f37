//! # Typed Intermediate Representation
//!
//! Checked functions are lowered to an SSA register IR that both execution
//! modes consume: the interpreter walks it directly and the native path
//! lowers it to TVM64 instructions.
//!
//! ## Module Structure
//!
//! ```text
//! ir/
//! ├── mod.rs          # This file - module definition and re-exports
//! ├── instruction.rs  # IrReg, BlockId, Instruction, Terminator
//! ├── program.rs      # BasicBlock, IrFunction, IrModule
//! ├── generator.rs    # IrGenerator: typed tree to SSA
//! └── serial.rs       # Versioned binary encoding of an IrModule
//! ```
//!
//! ## Key Types
//!
//! - [`IrReg`] - SSA register; each is defined exactly once and typed by the
//!   function's register table
//! - [`Instruction`] - Typed operation (scalar, complex, struct, memory,
//!   call, phi, tensor)
//! - [`IrFunction`] - Blocks plus register and stack-slot type tables
//! - [`IrModule`] - Functions sharing one [`TypeTable`](crate::types::TypeTable)
//!   and one [`ConstantPool`](crate::compiler::constants::ConstantPool)
//!
//! ## Invariants
//!
//! | Property | Guarantee |
//! |----------|-----------|
//! | SSA | one definition per register, dominating every use |
//! | Blocks | exactly one terminator; phis first; block 0 is the entry |
//! | Phis | one incoming value per predecessor |
//! | Loops | every back edge targets a block id `<=` its source |

mod generator;
mod instruction;
mod program;
pub mod serial;

pub use generator::{lower_module, IrGenerator};
pub use instruction::{
    BlockId, ComplexPart, ComplexUnaryOp, ConstId, FunctionId, Instruction, IrReg, Terminator,
};
pub use program::{BasicBlock, IrFunction, IrModule};
pub use serial::{decode_module, encode_module};
