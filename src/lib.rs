//! ptxsmoke: does my GPU toolchain work?
//!
//! Reads a PTX file (`test.ptx` by default), echoes it, then launches a
//! one-thread `add` kernel on the device and prints the result:
//!
//! ```text
//! <contents of test.ptx>
//! Hello world 9
//! ```
//!
//! # Architecture
//!
//! ```text
//! input -> smoke -> gpu::runtime -> CUDA driver (feature `cuda`)
//!                                \-> simulated device
//! gpu::kernels -> gpu::ir -> gpu::ptx
//! ```
//!
//! The kernel comes from this crate's own IR; the `emit` command writes its
//! PTX, which is one way to produce a `test.ptx`.

pub mod config;
pub mod diagnostics;
pub mod gpu;
pub mod input;
pub mod smoke;

use std::io::Write;

pub use config::SmokeConfig;
pub use diagnostics::{SmokeError, SourceFile};
pub use input::IrFile;
pub use smoke::{SmokeOutcome, SmokeTest};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run the smoke test with `config`, printing to `out`
pub fn run<W: Write>(config: SmokeConfig, out: &mut W) -> Result<SmokeOutcome, SmokeError> {
    SmokeTest::new(config).run(out)
}

/// PTX for the built-in kernel module, targeting `compute_capability`
pub fn emit_ptx(compute_capability: (u32, u32)) -> Result<String, SmokeError> {
    let target = gpu::GpuTarget::Cuda { compute_capability };
    let module = gpu::smoke_module(target);
    Ok(gpu::PtxCodegen::for_target(target).generate(&module)?)
}
