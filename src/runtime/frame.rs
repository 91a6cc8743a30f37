//! Interpreter frame: register file and stack slots of one invocation

use crate::compiler::ir::{IrFunction, IrReg};
use crate::error::RuntimeError;
use crate::runtime::TypedValue;

/// One active invocation.
///
/// Registers are pre-sized from the function's declared register count and
/// start empty; SSA guarantees every read follows the defining write on any
/// path the verifier accepted.
#[derive(Debug)]
pub struct Frame<'f> {
    func: &'f IrFunction,
    regs: Vec<Option<TypedValue>>,
    slots: Vec<Option<TypedValue>>,
}

impl<'f> Frame<'f> {
    /// Create a frame with parameters bound
    pub fn new(func: &'f IrFunction, args: Vec<TypedValue>) -> Result<Self, RuntimeError> {
        if args.len() != func.params.len() {
            return Err(RuntimeError::internal(format!(
                "`{}` takes {} arguments, frame got {}",
                func.name,
                func.params.len(),
                args.len()
            )));
        }
        let mut frame = Self {
            func,
            regs: vec![None; func.reg_count()],
            slots: vec![None; func.slot_types.len()],
        };
        for (reg, arg) in func.params.iter().zip(args) {
            frame.set(*reg, arg)?;
        }
        Ok(frame)
    }

    /// Function this frame executes
    pub fn function(&self) -> &'f IrFunction {
        self.func
    }

    /// Read a register
    pub fn get(&self, reg: IrReg) -> Result<&TypedValue, RuntimeError> {
        self.regs
            .get(reg.0 as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| RuntimeError::internal(format!("{} read before definition in `{}`", reg, self.func.name)))
    }

    /// Take a register's value, leaving it empty
    pub fn take(&mut self, reg: IrReg) -> Result<TypedValue, RuntimeError> {
        self.regs
            .get_mut(reg.0 as usize)
            .and_then(Option::take)
            .ok_or_else(|| RuntimeError::internal(format!("{} read before definition in `{}`", reg, self.func.name)))
    }

    /// Write a register
    pub fn set(&mut self, reg: IrReg, value: TypedValue) -> Result<(), RuntimeError> {
        let slot = self
            .regs
            .get_mut(reg.0 as usize)
            .ok_or_else(|| RuntimeError::internal(format!("{} outside the register file", reg)))?;
        *slot = Some(value);
        Ok(())
    }

    /// Read a stack slot
    pub fn load(&self, slot: u32) -> Result<&TypedValue, RuntimeError> {
        self.slots
            .get(slot as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| RuntimeError::internal(format!("slot {} read before any store", slot)))
    }

    /// Write a stack slot
    pub fn store(&mut self, slot: u32, value: TypedValue) -> Result<(), RuntimeError> {
        let entry = self
            .slots
            .get_mut(slot as usize)
            .ok_or_else(|| RuntimeError::internal(format!("slot {} outside the frame", slot)))?;
        *entry = Some(value);
        Ok(())
    }
}
