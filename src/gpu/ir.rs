//! GPU Intermediate Representation
//!
//! A small SSA-style IR for the kernels this crate ships. It captures:
//! - Thread hierarchy intrinsics (thread, block, grid)
//! - Memory spaces (global, shared, local, param)
//! - Integer arithmetic, comparisons and branches
//!
//! Kernels written in this IR are lowered to PTX by [`super::ptx`] and
//! executed directly by the simulated device in [`super::sim`].

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use thiserror::Error;

/// GPU module containing kernels
#[derive(Debug, Clone)]
pub struct GpuModule {
    /// Module name
    pub name: String,

    /// Kernel functions, in insertion order
    pub kernels: IndexMap<String, GpuKernel>,

    /// Target architecture
    pub target: GpuTarget,
}

/// GPU target architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuTarget {
    /// NVIDIA CUDA (PTX)
    Cuda { compute_capability: (u32, u32) },

    /// In-process simulated device
    Simulated,
}

impl GpuTarget {
    /// Compute capability used when lowering to PTX
    pub fn compute_capability(&self) -> (u32, u32) {
        match self {
            GpuTarget::Cuda { compute_capability } => *compute_capability,
            GpuTarget::Simulated => (7, 5),
        }
    }
}

impl Default for GpuTarget {
    fn default() -> Self {
        GpuTarget::Cuda {
            compute_capability: (7, 5),
        }
    }
}

impl fmt::Display for GpuTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuTarget::Cuda { compute_capability } => {
                write!(
                    f,
                    "CUDA sm_{}{}",
                    compute_capability.0, compute_capability.1
                )
            }
            GpuTarget::Simulated => write!(f, "Simulated"),
        }
    }
}

/// GPU kernel function
#[derive(Debug, Clone)]
pub struct GpuKernel {
    /// Kernel name
    pub name: String,

    /// Parameters
    pub params: Vec<GpuParam>,

    /// Basic blocks
    pub blocks: Vec<GpuBlock>,

    /// Entry block
    pub entry: BlockId,

    /// Maximum threads per block (optional hint)
    pub max_threads: Option<u32>,
}

/// GPU parameter
#[derive(Debug, Clone, PartialEq)]
pub struct GpuParam {
    /// Parameter name
    pub name: String,

    /// Parameter type
    pub ty: GpuType,
}

impl GpuParam {
    pub fn new(name: impl Into<String>, ty: GpuType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// GPU type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuType {
    Void,
    Bool,
    I32,
    U32,
    I64,
    U64,

    /// Pointer into the given memory space
    Ptr(Box<GpuType>, MemorySpace),
}

impl GpuType {
    /// Pointer to `elem` in global memory
    pub fn global_ptr(elem: GpuType) -> Self {
        GpuType::Ptr(Box::new(elem), MemorySpace::Global)
    }

    pub fn size_bytes(&self) -> u32 {
        match self {
            GpuType::Void => 0,
            GpuType::Bool => 1,
            GpuType::I32 | GpuType::U32 => 4,
            GpuType::I64 | GpuType::U64 | GpuType::Ptr(_, _) => 8,
        }
    }

    /// Check if this is a signed integer type
    pub fn is_signed(&self) -> bool {
        matches!(self, GpuType::I32 | GpuType::I64)
    }

    /// Check if this is an integer type
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            GpuType::I32 | GpuType::U32 | GpuType::I64 | GpuType::U64
        )
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, GpuType::Ptr(_, _))
    }

    /// Element type behind a pointer
    pub fn pointee(&self) -> Option<&GpuType> {
        match self {
            GpuType::Ptr(elem, _) => Some(elem),
            _ => None,
        }
    }
}

impl fmt::Display for GpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuType::Void => write!(f, "void"),
            GpuType::Bool => write!(f, "bool"),
            GpuType::I32 => write!(f, "i32"),
            GpuType::U32 => write!(f, "u32"),
            GpuType::I64 => write!(f, "i64"),
            GpuType::U64 => write!(f, "u64"),
            GpuType::Ptr(t, space) => write!(f, "*{} {}", space, t),
        }
    }
}

/// Memory space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    /// Global device memory (DRAM)
    Global,

    /// Shared memory (on-chip, per block)
    Shared,

    /// Local memory (per thread)
    Local,

    /// Kernel parameter space
    Param,

    /// Generic (resolved at runtime)
    Generic,
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySpace::Global => write!(f, "global"),
            MemorySpace::Shared => write!(f, "shared"),
            MemorySpace::Local => write!(f, "local"),
            MemorySpace::Param => write!(f, "param"),
            MemorySpace::Generic => write!(f, "generic"),
        }
    }
}

/// Block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BB{}", self.0)
    }
}

/// Value identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// GPU basic block
#[derive(Debug, Clone)]
pub struct GpuBlock {
    /// Block ID
    pub id: BlockId,

    /// Block label
    pub label: String,

    /// Instructions
    pub instructions: Vec<(ValueId, GpuOp)>,

    /// Terminator
    pub terminator: GpuTerminator,
}

/// GPU operations
#[derive(Debug, Clone, PartialEq)]
pub enum GpuOp {
    // === Constants ===
    ConstInt(i64, GpuType),

    // === Arithmetic (wrapping) ===
    Add(ValueId, ValueId),
    Sub(ValueId, ValueId),
    Mul(ValueId, ValueId),

    // === Comparisons ===
    Eq(ValueId, ValueId),
    Lt(ValueId, ValueId),

    // === Memory ===
    Load(ValueId, GpuType, MemorySpace),
    Store(ValueId, ValueId, MemorySpace), // ptr, value

    // === Address computation ===
    /// ptr + index * sizeof(elem)
    GetElementPtr(ValueId, ValueId, GpuType),
    /// Generic to global address conversion
    ToGlobal(ValueId),

    // === GPU Intrinsics ===
    ThreadIdX,
    BlockIdX,
    BlockDimX,
    GridDimX,

    // === Parameter ===
    Param(u32),
}

impl GpuOp {
    /// Values read by this operation
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            GpuOp::Add(a, b)
            | GpuOp::Sub(a, b)
            | GpuOp::Mul(a, b)
            | GpuOp::Eq(a, b)
            | GpuOp::Lt(a, b)
            | GpuOp::Store(a, b, _)
            | GpuOp::GetElementPtr(a, b, _) => vec![*a, *b],
            GpuOp::Load(p, _, _) | GpuOp::ToGlobal(p) => vec![*p],
            GpuOp::ConstInt(_, _)
            | GpuOp::ThreadIdX
            | GpuOp::BlockIdX
            | GpuOp::BlockDimX
            | GpuOp::GridDimX
            | GpuOp::Param(_) => Vec::new(),
        }
    }
}

/// GPU terminator
#[derive(Debug, Clone, PartialEq)]
pub enum GpuTerminator {
    /// Unconditional branch
    Br(BlockId),

    /// Conditional branch
    CondBr(ValueId, BlockId, BlockId),

    /// Return from kernel
    ReturnVoid,

    /// Block not terminated yet
    Unreachable,
}

/// Malformed kernel IR
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IrError {
    #[error("kernel `{0}` has no basic blocks")]
    EmptyKernel(String),

    #[error("kernel `{kernel}`: value {value} is used but never defined")]
    UndefinedValue { kernel: String, value: ValueId },

    #[error("kernel `{kernel}`: value {value} is defined twice")]
    DuplicateValue { kernel: String, value: ValueId },

    #[error("kernel `{kernel}`: branch to unknown block {block}")]
    UnknownBlock { kernel: String, block: BlockId },

    #[error("kernel `{kernel}`: block {block} has no terminator")]
    MissingTerminator { kernel: String, block: BlockId },

    #[error("kernel `{kernel}`: parameter index {index} out of range")]
    ParamOutOfRange { kernel: String, index: u32 },

    #[error("kernel `{kernel}`: {value} has type `{found}`, expected {expected}")]
    TypeMismatch {
        kernel: String,
        value: ValueId,
        expected: &'static str,
        found: GpuType,
    },
}

impl GpuModule {
    pub fn new(name: impl Into<String>, target: GpuTarget) -> Self {
        Self {
            name: name.into(),
            kernels: IndexMap::new(),
            target,
        }
    }

    pub fn add_kernel(&mut self, kernel: GpuKernel) {
        self.kernels.insert(kernel.name.clone(), kernel);
    }

    pub fn kernel(&self, name: &str) -> Option<&GpuKernel> {
        self.kernels.get(name)
    }
}

impl GpuKernel {
    /// Create a new empty kernel
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            blocks: Vec::new(),
            entry: BlockId(0),
            max_threads: None,
        }
    }

    /// Add a parameter to the kernel
    pub fn add_param(&mut self, param: GpuParam) {
        self.params.push(param);
    }

    /// Add a basic block
    pub fn add_block(&mut self, block: GpuBlock) {
        self.blocks.push(block);
    }

    /// Get the number of parameters
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn block(&self, id: BlockId) -> Option<&GpuBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Check the kernel is well formed and infer the type of every value.
    ///
    /// Values must be defined in block order before they are used; the IR
    /// has no phi nodes, so cross-block uses only flow forward.
    pub fn value_types(&self) -> Result<FxHashMap<ValueId, GpuType>, IrError> {
        if self.blocks.is_empty() {
            return Err(IrError::EmptyKernel(self.name.clone()));
        }

        let block_ids: FxHashSet<BlockId> = self.blocks.iter().map(|b| b.id).collect();
        if !block_ids.contains(&self.entry) {
            return Err(self.unknown_block(self.entry));
        }

        let mut types: FxHashMap<ValueId, GpuType> = FxHashMap::default();

        for block in &self.blocks {
            for (id, op) in &block.instructions {
                for operand in op.operands() {
                    if !types.contains_key(&operand) {
                        return Err(IrError::UndefinedValue {
                            kernel: self.name.clone(),
                            value: operand,
                        });
                    }
                }

                let ty = self.result_type(*id, op, &types)?;
                if types.insert(*id, ty).is_some() {
                    return Err(IrError::DuplicateValue {
                        kernel: self.name.clone(),
                        value: *id,
                    });
                }
            }

            match &block.terminator {
                GpuTerminator::Br(target) => {
                    if !block_ids.contains(target) {
                        return Err(self.unknown_block(*target));
                    }
                }
                GpuTerminator::CondBr(cond, then_block, else_block) => {
                    match types.get(cond) {
                        Some(GpuType::Bool) => {}
                        Some(other) => {
                            return Err(self.mismatch(*cond, "bool", other));
                        }
                        None => {
                            return Err(IrError::UndefinedValue {
                                kernel: self.name.clone(),
                                value: *cond,
                            });
                        }
                    }
                    for target in [then_block, else_block] {
                        if !block_ids.contains(target) {
                            return Err(self.unknown_block(*target));
                        }
                    }
                }
                GpuTerminator::ReturnVoid => {}
                GpuTerminator::Unreachable => {
                    return Err(IrError::MissingTerminator {
                        kernel: self.name.clone(),
                        block: block.id,
                    });
                }
            }
        }

        Ok(types)
    }

    fn result_type(
        &self,
        id: ValueId,
        op: &GpuOp,
        types: &FxHashMap<ValueId, GpuType>,
    ) -> Result<GpuType, IrError> {
        let ty = match op {
            GpuOp::ConstInt(_, ty) => {
                if !ty.is_integer() {
                    return Err(self.mismatch(id, "integer", ty));
                }
                ty.clone()
            }
            GpuOp::Add(a, b) | GpuOp::Sub(a, b) | GpuOp::Mul(a, b) => {
                let lhs = &types[a];
                let rhs = &types[b];
                if !lhs.is_integer() {
                    return Err(self.mismatch(*a, "integer", lhs));
                }
                if lhs != rhs {
                    return Err(self.mismatch(*b, "matching operand types", rhs));
                }
                lhs.clone()
            }
            GpuOp::Eq(a, b) | GpuOp::Lt(a, b) => {
                let lhs = &types[a];
                if *lhs == GpuType::Bool || *lhs == GpuType::Void {
                    return Err(self.mismatch(*a, "integer or pointer", lhs));
                }
                if lhs != &types[b] {
                    return Err(self.mismatch(*b, "matching operand types", &types[b]));
                }
                GpuType::Bool
            }
            GpuOp::Load(ptr, ty, _) => {
                self.expect_pointer(*ptr, types)?;
                ty.clone()
            }
            GpuOp::Store(ptr, value, _) => {
                self.expect_pointer(*ptr, types)?;
                if types[ptr].pointee() != Some(&types[value]) {
                    return Err(self.mismatch(*value, "the pointee type", &types[value]));
                }
                GpuType::Void
            }
            GpuOp::GetElementPtr(ptr, index, _) => {
                self.expect_pointer(*ptr, types)?;
                if !types[index].is_integer() {
                    return Err(self.mismatch(*index, "integer", &types[index]));
                }
                types[ptr].clone()
            }
            GpuOp::ToGlobal(ptr) => {
                self.expect_pointer(*ptr, types)?;
                types[ptr].clone()
            }
            GpuOp::ThreadIdX | GpuOp::BlockIdX | GpuOp::BlockDimX | GpuOp::GridDimX => {
                GpuType::U32
            }
            GpuOp::Param(index) => self
                .params
                .get(*index as usize)
                .map(|p| p.ty.clone())
                .ok_or_else(|| IrError::ParamOutOfRange {
                    kernel: self.name.clone(),
                    index: *index,
                })?,
        };
        Ok(ty)
    }

    fn expect_pointer(
        &self,
        ptr: ValueId,
        types: &FxHashMap<ValueId, GpuType>,
    ) -> Result<(), IrError> {
        let ty = &types[&ptr];
        if ty.is_pointer() {
            Ok(())
        } else {
            Err(self.mismatch(ptr, "pointer", ty))
        }
    }

    fn mismatch(&self, value: ValueId, expected: &'static str, found: &GpuType) -> IrError {
        IrError::TypeMismatch {
            kernel: self.name.clone(),
            value,
            expected,
            found: found.clone(),
        }
    }

    fn unknown_block(&self, block: BlockId) -> IrError {
        IrError::UnknownBlock {
            kernel: self.name.clone(),
            block,
        }
    }
}

impl GpuBlock {
    /// Create a new empty block
    pub fn new(id: BlockId, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            instructions: Vec::new(),
            terminator: GpuTerminator::Unreachable,
        }
    }

    /// Add an instruction to the block
    pub fn add_instruction(&mut self, value_id: ValueId, op: GpuOp) {
        self.instructions.push((value_id, op));
    }

    /// Set the terminator for the block
    pub fn set_terminator(&mut self, terminator: GpuTerminator) {
        self.terminator = terminator;
    }
}

/// Builder that hands out value and block ids while a kernel is assembled
pub struct KernelBuilder {
    kernel: GpuKernel,
    current: usize,
    next_value_id: u32,
    next_block_id: u32,
}

impl KernelBuilder {
    /// Start a kernel with an `entry` block selected
    pub fn new(name: impl Into<String>) -> Self {
        let mut kernel = GpuKernel::new(name);
        kernel.add_block(GpuBlock::new(BlockId(0), "entry"));
        Self {
            kernel,
            current: 0,
            next_value_id: 0,
            next_block_id: 1,
        }
    }

    /// Declare a parameter and return its index
    pub fn param(&mut self, name: impl Into<String>, ty: GpuType) -> u32 {
        self.kernel.add_param(GpuParam::new(name, ty));
        (self.kernel.params.len() - 1) as u32
    }

    pub fn max_threads(&mut self, n: u32) -> &mut Self {
        self.kernel.max_threads = Some(n);
        self
    }

    /// Create a new block; it is not selected
    pub fn block(&mut self, label: impl Into<String>) -> BlockId {
        let id = BlockId(self.next_block_id);
        self.next_block_id += 1;
        self.kernel.add_block(GpuBlock::new(id, label));
        id
    }

    /// Select the block that subsequent instructions are appended to
    pub fn switch_to(&mut self, block: BlockId) {
        if let Some(idx) = self.kernel.blocks.iter().position(|b| b.id == block) {
            self.current = idx;
        }
    }

    /// Append an instruction to the current block
    pub fn push(&mut self, op: GpuOp) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.kernel.blocks[self.current].add_instruction(id, op);
        id
    }

    /// Terminate the current block
    pub fn terminate(&mut self, terminator: GpuTerminator) {
        self.kernel.blocks[self.current].set_terminator(terminator);
    }

    pub fn finish(self) -> GpuKernel {
        self.kernel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_type_size() {
        assert_eq!(GpuType::Void.size_bytes(), 0);
        assert_eq!(GpuType::Bool.size_bytes(), 1);
        assert_eq!(GpuType::I32.size_bytes(), 4);
        assert_eq!(GpuType::U64.size_bytes(), 8);
        assert_eq!(GpuType::global_ptr(GpuType::I32).size_bytes(), 8);
    }

    #[test]
    fn test_gpu_type_properties() {
        assert!(GpuType::I32.is_signed());
        assert!(!GpuType::U32.is_signed());
        assert!(GpuType::U64.is_integer());
        assert!(!GpuType::Bool.is_integer());

        let ptr = GpuType::global_ptr(GpuType::I32);
        assert!(ptr.is_pointer());
        assert_eq!(ptr.pointee(), Some(&GpuType::I32));
        assert_eq!(ptr.to_string(), "*global i32");
    }

    #[test]
    fn test_gpu_target_display() {
        let cuda = GpuTarget::Cuda {
            compute_capability: (8, 6),
        };
        assert_eq!(format!("{}", cuda), "CUDA sm_86");
        assert_eq!(GpuTarget::Simulated.to_string(), "Simulated");
    }

    #[test]
    fn test_module_keeps_kernel_order() {
        let mut module = GpuModule::new("test", GpuTarget::default());
        for name in ["zeta", "alpha", "mid"] {
            module.add_kernel(GpuKernel::new(name));
        }
        let names: Vec<&str> = module.kernels.keys().map(String::as_str).collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
        assert!(module.kernel("alpha").is_some());
        assert!(module.kernel("missing").is_none());
    }

    #[test]
    fn test_builder_infers_types() {
        let mut b = KernelBuilder::new("sum");
        b.param("a", GpuType::I32);
        b.param("b", GpuType::I32);
        let a = b.push(GpuOp::Param(0));
        let c = b.push(GpuOp::Param(1));
        let sum = b.push(GpuOp::Add(a, c));
        let tid = b.push(GpuOp::ThreadIdX);
        b.terminate(GpuTerminator::ReturnVoid);
        let kernel = b.finish();

        let types = kernel.value_types().unwrap();
        assert_eq!(types[&sum], GpuType::I32);
        assert_eq!(types[&tid], GpuType::U32);
    }

    #[test]
    fn test_empty_kernel_rejected() {
        let kernel = GpuKernel::new("empty");
        assert_eq!(
            kernel.value_types(),
            Err(IrError::EmptyKernel("empty".to_string()))
        );
    }

    #[test]
    fn test_undefined_value_rejected() {
        let mut b = KernelBuilder::new("bad");
        b.push(GpuOp::Add(ValueId(7), ValueId(8)));
        b.terminate(GpuTerminator::ReturnVoid);
        let err = b.finish().value_types().unwrap_err();
        assert!(matches!(err, IrError::UndefinedValue { value: ValueId(7), .. }));
    }

    #[test]
    fn test_missing_terminator_rejected() {
        let mut b = KernelBuilder::new("open");
        b.push(GpuOp::ThreadIdX);
        let err = b.finish().value_types().unwrap_err();
        assert!(matches!(err, IrError::MissingTerminator { .. }));
    }

    #[test]
    fn test_unknown_branch_target_rejected() {
        let mut b = KernelBuilder::new("jump");
        b.terminate(GpuTerminator::Br(BlockId(42)));
        let err = b.finish().value_types().unwrap_err();
        assert!(matches!(err, IrError::UnknownBlock { block: BlockId(42), .. }));
    }

    #[test]
    fn test_store_through_integer_rejected() {
        let mut b = KernelBuilder::new("store");
        let v = b.push(GpuOp::ConstInt(1, GpuType::I32));
        b.push(GpuOp::Store(v, v, MemorySpace::Global));
        b.terminate(GpuTerminator::ReturnVoid);
        let err = b.finish().value_types().unwrap_err();
        assert!(matches!(err, IrError::TypeMismatch { expected: "pointer", .. }));
    }

    #[test]
    fn test_store_must_match_pointee() {
        let mut b = KernelBuilder::new("narrow");
        b.param("out", GpuType::global_ptr(GpuType::I32));
        let out = b.push(GpuOp::Param(0));
        let wide = b.push(GpuOp::ConstInt(5, GpuType::I64));
        b.push(GpuOp::Store(out, wide, MemorySpace::Global));
        b.terminate(GpuTerminator::ReturnVoid);
        let err = b.finish().value_types().unwrap_err();
        assert!(matches!(
            err,
            IrError::TypeMismatch { value, found: GpuType::I64, .. } if value == wide
        ));
    }

    #[test]
    fn test_store_of_predicate_rejected() {
        let mut b = KernelBuilder::new("flag");
        b.param("out", GpuType::global_ptr(GpuType::I32));
        let out = b.push(GpuOp::Param(0));
        let tid = b.push(GpuOp::ThreadIdX);
        let same = b.push(GpuOp::Eq(tid, tid));
        b.push(GpuOp::Store(out, same, MemorySpace::Global));
        b.terminate(GpuTerminator::ReturnVoid);
        let err = b.finish().value_types().unwrap_err();
        assert!(matches!(
            err,
            IrError::TypeMismatch { found: GpuType::Bool, .. }
        ));
    }

    #[test]
    fn test_compare_of_predicates_rejected() {
        let mut b = KernelBuilder::new("cmp");
        let tid = b.push(GpuOp::ThreadIdX);
        let p = b.push(GpuOp::Lt(tid, tid));
        b.push(GpuOp::Eq(p, p));
        b.terminate(GpuTerminator::ReturnVoid);
        let err = b.finish().value_types().unwrap_err();
        assert!(matches!(
            err,
            IrError::TypeMismatch { value, expected: "integer or pointer", .. } if value == p
        ));
    }

    #[test]
    fn test_param_out_of_range_rejected() {
        let mut b = KernelBuilder::new("params");
        b.push(GpuOp::Param(3));
        b.terminate(GpuTerminator::ReturnVoid);
        let err = b.finish().value_types().unwrap_err();
        assert!(matches!(err, IrError::ParamOutOfRange { index: 3, .. }));
    }
}
