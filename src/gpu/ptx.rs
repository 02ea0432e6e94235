//! PTX (Parallel Thread Execution) Code Generator
//!
//! Generates NVIDIA PTX assembly from GPU IR.
//!
//! References:
//! - PTX ISA: https://docs.nvidia.com/cuda/parallel-thread-execution/

use std::fmt::{self, Write};

use rustc_hash::FxHashMap;
use thiserror::Error;

use super::ir::*;

/// PTX lowering failure
#[derive(Debug, Error)]
pub enum PtxError {
    #[error(transparent)]
    Ir(#[from] IrError),

    #[error("kernel `{kernel}`: type `{ty}` is not supported by the PTX backend")]
    UnsupportedType { kernel: String, ty: GpuType },

    #[error("failed to format PTX output")]
    Format(#[from] fmt::Error),
}

/// Lowest PTX ISA that introduced each `sm_XY` target past sm_80.
/// Older targets all accept ISA 7.0.
const PTX_ISA_BY_TARGET: &[((u32, u32), (u32, u32))] = &[
    ((8, 6), (7, 1)),
    ((8, 7), (7, 4)),
    ((8, 9), (7, 8)),
    ((9, 0), (7, 8)),
    ((10, 0), (8, 6)),
    ((10, 1), (8, 6)),
    ((10, 3), (8, 8)),
    ((11, 0), (9, 0)),
    ((12, 0), (8, 7)),
    ((12, 1), (8, 8)),
];

/// `.version` a driver needs to accept `.target sm_<sm_version>`
///
/// Targets missing from the table get the newest ISA of any target at or
/// below them.
pub fn min_ptx_version(sm_version: (u32, u32)) -> (u32, u32) {
    if let Some(&(_, isa)) = PTX_ISA_BY_TARGET.iter().find(|(sm, _)| *sm == sm_version) {
        return isa;
    }
    PTX_ISA_BY_TARGET
        .iter()
        .filter(|(sm, _)| *sm <= sm_version)
        .map(|&(_, isa)| isa)
        .max()
        .unwrap_or((7, 0))
}

/// PTX code generator
pub struct PtxCodegen {
    /// Output buffer
    output: String,

    /// Target compute capability
    sm_version: (u32, u32),

    /// PTX ISA version
    ptx_version: (u32, u32),

    /// Value to register mapping
    registers: FxHashMap<ValueId, String>,

    /// Next register number per class
    reg_counters: RegCounters,
}

#[derive(Default)]
struct RegCounters {
    pred: u32, // %p
    b32: u32,  // %r
    b64: u32,  // %rd
}

impl PtxCodegen {
    pub fn new(sm_version: (u32, u32)) -> Self {
        Self {
            output: String::new(),
            sm_version,
            ptx_version: min_ptx_version(sm_version),
            registers: FxHashMap::default(),
            reg_counters: RegCounters::default(),
        }
    }

    /// Codegen for the compute capability recorded in the module target
    pub fn for_target(target: GpuTarget) -> Self {
        Self::new(target.compute_capability())
    }

    /// Override the emitted `.version` directive
    pub fn with_ptx_version(mut self, major: u32, minor: u32) -> Self {
        self.ptx_version = (major, minor);
        self
    }

    /// Generate PTX code from GPU module
    pub fn generate(&mut self, module: &GpuModule) -> Result<String, PtxError> {
        self.output.clear();
        self.emit_header(module)?;

        for kernel in module.kernels.values() {
            self.emit_kernel(kernel)?;
        }

        Ok(std::mem::take(&mut self.output))
    }

    fn emit_header(&mut self, module: &GpuModule) -> fmt::Result {
        writeln!(self.output, "//")?;
        writeln!(self.output, "// Generated by ptxsmoke")?;
        writeln!(self.output, "// Module: {}", module.name)?;
        writeln!(self.output, "//")?;
        writeln!(self.output)?;
        writeln!(
            self.output,
            ".version {}.{}",
            self.ptx_version.0, self.ptx_version.1
        )?;
        writeln!(
            self.output,
            ".target sm_{}{}",
            self.sm_version.0, self.sm_version.1
        )?;
        writeln!(self.output, ".address_size 64")?;
        writeln!(self.output)
    }

    fn emit_kernel(&mut self, kernel: &GpuKernel) -> Result<(), PtxError> {
        let types = kernel.value_types()?;

        for param in &kernel.params {
            if !param.ty.is_integer() && !param.ty.is_pointer() {
                return Err(PtxError::UnsupportedType {
                    kernel: kernel.name.clone(),
                    ty: param.ty.clone(),
                });
            }
        }

        self.registers.clear();
        self.reg_counters = RegCounters::default();

        // Lower the body first so the register declarations know their counts
        let header = std::mem::take(&mut self.output);
        for block in &kernel.blocks {
            self.emit_block(kernel, block, &types)?;
        }
        let body = std::mem::replace(&mut self.output, header);

        if kernel.params.is_empty() {
            writeln!(self.output, ".visible .entry {}()", kernel.name)?;
        } else {
            writeln!(self.output, ".visible .entry {}(", kernel.name)?;
            for (i, param) in kernel.params.iter().enumerate() {
                let comma = if i + 1 < kernel.params.len() { "," } else { "" };
                writeln!(
                    self.output,
                    "\t.param .{} {}_param_{}{}",
                    param_suffix(&param.ty),
                    kernel.name,
                    i,
                    comma
                )?;
            }
            writeln!(self.output, ")")?;
        }

        if let Some(max_threads) = kernel.max_threads {
            writeln!(self.output, ".maxntid {}, 1, 1", max_threads)?;
        }

        writeln!(self.output, "{{")?;
        self.emit_register_declarations()?;
        writeln!(self.output)?;
        self.output.push_str(&body);
        writeln!(self.output, "}}")?;
        writeln!(self.output)?;
        Ok(())
    }

    fn emit_block(
        &mut self,
        kernel: &GpuKernel,
        block: &GpuBlock,
        types: &FxHashMap<ValueId, GpuType>,
    ) -> Result<(), PtxError> {
        writeln!(self.output, "{}: // {}", block.id, block.label)?;

        for (value_id, op) in &block.instructions {
            self.emit_instruction(kernel, *value_id, op, types)?;
        }

        self.emit_terminator(&block.terminator)?;
        Ok(())
    }

    fn emit_instruction(
        &mut self,
        kernel: &GpuKernel,
        value_id: ValueId,
        op: &GpuOp,
        types: &FxHashMap<ValueId, GpuType>,
    ) -> Result<(), PtxError> {
        let ty = &types[&value_id];

        match op {
            GpuOp::ConstInt(n, _) => {
                let reg = self.define(value_id, ty);
                writeln!(self.output, "\tmov.{} {}, {};", type_suffix(ty), reg, n)?;
            }

            GpuOp::Add(lhs, rhs) => self.emit_binary("add", value_id, ty, *lhs, *rhs)?,
            GpuOp::Sub(lhs, rhs) => self.emit_binary("sub", value_id, ty, *lhs, *rhs)?,
            GpuOp::Mul(lhs, rhs) => self.emit_binary("mul.lo", value_id, ty, *lhs, *rhs)?,

            GpuOp::Eq(lhs, rhs) | GpuOp::Lt(lhs, rhs) => {
                let cmp = if matches!(op, GpuOp::Eq(_, _)) { "eq" } else { "lt" };
                let operand_ty = &types[lhs];
                let l = self.register(*lhs);
                let r = self.register(*rhs);
                let reg = self.define(value_id, ty);
                writeln!(
                    self.output,
                    "\tsetp.{}.{} {}, {}, {};",
                    cmp,
                    type_suffix(operand_ty),
                    reg,
                    l,
                    r
                )?;
            }

            GpuOp::Load(ptr, load_ty, space) => {
                if !load_ty.is_integer() && !load_ty.is_pointer() {
                    return Err(PtxError::UnsupportedType {
                        kernel: kernel.name.clone(),
                        ty: load_ty.clone(),
                    });
                }
                let p = self.register(*ptr);
                let reg = self.define(value_id, ty);
                writeln!(
                    self.output,
                    "\tld{}.{} {}, [{}];",
                    memory_space_to_ptx(*space),
                    type_suffix(load_ty),
                    reg,
                    p
                )?;
            }

            GpuOp::Store(ptr, val, space) => {
                let p = self.register(*ptr);
                let v = self.register(*val);
                writeln!(
                    self.output,
                    "\tst{}.{} [{}], {};",
                    memory_space_to_ptx(*space),
                    type_suffix(&types[val]),
                    p,
                    v
                )?;
            }

            GpuOp::GetElementPtr(ptr, index, elem) => {
                let p = self.register(*ptr);
                let i = self.register(*index);
                let offset = self.temp_b64();
                let index_ty = &types[index];
                if index_ty.size_bytes() == 4 {
                    writeln!(
                        self.output,
                        "\tmul.wide.{} {}, {}, {};",
                        type_suffix(index_ty),
                        offset,
                        i,
                        elem.size_bytes()
                    )?;
                } else {
                    writeln!(
                        self.output,
                        "\tmul.lo.s64 {}, {}, {};",
                        offset,
                        i,
                        elem.size_bytes()
                    )?;
                }
                let reg = self.define(value_id, ty);
                writeln!(self.output, "\tadd.s64 {}, {}, {};", reg, p, offset)?;
            }

            GpuOp::ToGlobal(ptr) => {
                let p = self.register(*ptr);
                let reg = self.define(value_id, ty);
                writeln!(self.output, "\tcvta.to.global.u64 {}, {};", reg, p)?;
            }

            GpuOp::ThreadIdX => self.emit_special(value_id, ty, "%tid.x")?,
            GpuOp::BlockIdX => self.emit_special(value_id, ty, "%ctaid.x")?,
            GpuOp::BlockDimX => self.emit_special(value_id, ty, "%ntid.x")?,
            GpuOp::GridDimX => self.emit_special(value_id, ty, "%nctaid.x")?,

            GpuOp::Param(idx) => {
                let reg = self.define(value_id, ty);
                writeln!(
                    self.output,
                    "\tld.param.{} {}, [{}_param_{}];",
                    param_suffix(ty),
                    reg,
                    kernel.name,
                    idx
                )?;
            }
        }

        Ok(())
    }

    fn emit_binary(
        &mut self,
        mnemonic: &str,
        value_id: ValueId,
        ty: &GpuType,
        lhs: ValueId,
        rhs: ValueId,
    ) -> fmt::Result {
        let l = self.register(lhs);
        let r = self.register(rhs);
        let reg = self.define(value_id, ty);
        writeln!(
            self.output,
            "\t{}.{} {}, {}, {};",
            mnemonic,
            type_suffix(ty),
            reg,
            l,
            r
        )
    }

    fn emit_special(&mut self, value_id: ValueId, ty: &GpuType, sreg: &str) -> fmt::Result {
        let reg = self.define(value_id, ty);
        writeln!(self.output, "\tmov.u32 {}, {};", reg, sreg)
    }

    fn emit_terminator(&mut self, term: &GpuTerminator) -> fmt::Result {
        match term {
            GpuTerminator::Br(target) => writeln!(self.output, "\tbra.uni {};", target),

            GpuTerminator::CondBr(cond, then_block, else_block) => {
                let c = self.register(*cond);
                writeln!(self.output, "\t@{} bra {};", c, then_block)?;
                writeln!(self.output, "\tbra.uni {};", else_block)
            }

            GpuTerminator::ReturnVoid => writeln!(self.output, "\tret;"),

            GpuTerminator::Unreachable => writeln!(self.output, "\ttrap;"),
        }
    }

    fn emit_register_declarations(&mut self) -> fmt::Result {
        let counters = [
            (".pred", "%p", self.reg_counters.pred),
            (".b32", "%r", self.reg_counters.b32),
            (".b64", "%rd", self.reg_counters.b64),
        ];
        for (class, prefix, count) in counters {
            if count > 0 {
                writeln!(self.output, "\t.reg {} {}<{}>;", class, prefix, count)?;
            }
        }
        Ok(())
    }

    /// Allocate the register that holds `value_id`
    fn define(&mut self, value_id: ValueId, ty: &GpuType) -> String {
        let reg = self.alloc_register(ty);
        self.registers.insert(value_id, reg.clone());
        reg
    }

    fn alloc_register(&mut self, ty: &GpuType) -> String {
        match ty {
            GpuType::Bool => {
                let n = self.reg_counters.pred;
                self.reg_counters.pred += 1;
                format!("%p{}", n)
            }
            GpuType::I32 | GpuType::U32 => {
                let n = self.reg_counters.b32;
                self.reg_counters.b32 += 1;
                format!("%r{}", n)
            }
            _ => self.temp_b64(),
        }
    }

    fn temp_b64(&mut self) -> String {
        let n = self.reg_counters.b64;
        self.reg_counters.b64 += 1;
        format!("%rd{}", n)
    }

    fn register(&self, id: ValueId) -> String {
        // Validation guarantees every operand was defined earlier
        self.registers
            .get(&id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }
}

fn type_suffix(ty: &GpuType) -> &'static str {
    match ty {
        GpuType::I32 => "s32",
        GpuType::U32 => "u32",
        GpuType::I64 => "s64",
        GpuType::U64 | GpuType::Ptr(_, _) => "u64",
        GpuType::Bool => "pred",
        GpuType::Void => "b32",
    }
}

/// Parameter state space type; signedness is irrelevant for `ld.param`
fn param_suffix(ty: &GpuType) -> &'static str {
    match ty.size_bytes() {
        8 => "u64",
        _ => "u32",
    }
}

fn memory_space_to_ptx(space: MemorySpace) -> &'static str {
    match space {
        MemorySpace::Global => ".global",
        MemorySpace::Shared => ".shared",
        MemorySpace::Local => ".local",
        MemorySpace::Param => ".param",
        MemorySpace::Generic => "",
    }
}
