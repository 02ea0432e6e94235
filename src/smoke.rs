//! The smoke test procedure
//!
//! 1. Read the IR file; if it cannot be read there is nothing to do.
//! 2. Print its bytes verbatim.
//! 3. Run `add(2, 7, c)` on one thread of the device and print
//!    `Hello world <c>`.
//!
//! Outside strict mode every failure is logged and skipped so the process
//! still exits successfully.

use std::io::Write;

use crate::config::SmokeConfig;
use crate::diagnostics::SmokeError;
use crate::gpu::{
    ADD_KERNEL, GpuBackend, GpuError, GpuRuntime, GpuTarget, KernelArg, LaunchConfig,
    smoke_module,
};
use crate::input::IrFile;

/// First operand of the kernel launch
pub const LHS: i32 = 2;

/// Second operand of the kernel launch
pub const RHS: i32 = 7;

/// What a smoke test run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmokeOutcome {
    /// The IR file could not be read; nothing was printed
    NoInput,
    /// The IR bytes were printed but the GPU step failed
    Skipped { reason: String },
    /// Everything ran; `result` was printed
    Completed { result: i32 },
}

/// Result line printed after a successful launch
pub fn result_line(result: i32) -> String {
    format!("Hello world {}\n", result)
}

pub struct SmokeTest {
    config: SmokeConfig,
}

impl SmokeTest {
    pub fn new(config: SmokeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SmokeConfig {
        &self.config
    }

    /// Run the smoke test, writing everything it prints to `out`
    pub fn run<W: Write>(&self, out: &mut W) -> Result<SmokeOutcome, SmokeError> {
        let path = &self.config.ptx_path;
        let input = match IrFile::read(path) {
            Ok(input) => input,
            Err(source) if self.config.strict => {
                return Err(SmokeError::ReadInput {
                    path: path.clone(),
                    source,
                });
            }
            Err(source) => {
                tracing::warn!(path = %path.display(), error = %source, "IR file not readable, nothing to run");
                return Ok(SmokeOutcome::NoInput);
            }
        };

        self.write(out, input.bytes())?;

        let result = match self.launch_add() {
            Ok(result) => result,
            Err(err) if self.config.strict => return Err(err.into()),
            Err(err) => {
                tracing::warn!(error = %err, "GPU step failed, skipping result");
                return Ok(SmokeOutcome::Skipped {
                    reason: err.to_string(),
                });
            }
        };

        self.write(out, result_line(result).as_bytes())?;
        Ok(SmokeOutcome::Completed { result })
    }

    /// Launch `add(LHS, RHS, c)` on a single thread and read `c` back
    pub fn launch_add(&self) -> Result<i32, GpuError> {
        let runtime = GpuRuntime::select(self.config.backend, self.config.device)?;
        let target = match runtime.backend() {
            GpuBackend::Cuda => GpuTarget::Cuda {
                compute_capability: runtime.device_info().compute_capability,
            },
            GpuBackend::Simulated => GpuTarget::Simulated,
        };
        tracing::debug!(backend = %runtime.backend(), %target, "running smoke kernel");

        let module = smoke_module(target);
        let kernel = runtime.load_module(&module, ADD_KERNEL)?;
        let dev_c = runtime.alloc_typed::<i32>(1)?;

        runtime.launch(
            &kernel,
            &LaunchConfig::single(),
            &[
                KernelArg::I32(LHS),
                KernelArg::I32(RHS),
                KernelArg::from_buffer(&dev_c),
            ],
        )?;
        runtime.synchronize()?;

        let mut c = [0i32; 1];
        runtime.copy_to_host(&mut c, &dev_c)?;
        runtime.free(dev_c)?;

        tracing::debug!(result = c[0], "smoke kernel finished");
        Ok(c[0])
    }

    fn write<W: Write>(&self, out: &mut W, bytes: &[u8]) -> Result<(), SmokeError> {
        match out.write_all(bytes).and_then(|()| out.flush()) {
            Ok(()) => Ok(()),
            Err(source) if self.config.strict => Err(SmokeError::Output(source)),
            Err(source) => {
                tracing::warn!(error = %source, "failed to write output");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::BackendChoice;
    use std::path::Path;

    fn simulated(path: &Path) -> SmokeConfig {
        SmokeConfig {
            ptx_path: path.to_path_buf(),
            backend: BackendChoice::Simulated,
            ..SmokeConfig::default()
        }
    }

    #[test]
    fn test_result_line() {
        assert_eq!(result_line(LHS + RHS), "Hello world 9\n");
    }

    #[test]
    fn test_launch_add_simulated() {
        let smoke = SmokeTest::new(simulated(Path::new("unused.ptx")));
        assert_eq!(smoke.launch_add().unwrap(), 9);
    }

    #[test]
    fn test_missing_input_prints_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let smoke = SmokeTest::new(simulated(&dir.path().join("test.ptx")));

        let mut out = Vec::new();
        assert_eq!(smoke.run(&mut out).unwrap(), SmokeOutcome::NoInput);
        assert!(out.is_empty());
    }

    #[test]
    fn test_gpu_failure_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.ptx");
        std::fs::write(&path, "ptx").unwrap();

        let config = SmokeConfig {
            device: 7,
            ..simulated(&path)
        };
        let mut out = Vec::new();
        let outcome = SmokeTest::new(config).run(&mut out).unwrap();

        assert!(matches!(outcome, SmokeOutcome::Skipped { .. }));
        assert_eq!(out, b"ptx");
    }

    #[test]
    fn test_gpu_failure_is_error_when_strict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.ptx");
        std::fs::write(&path, "ptx").unwrap();

        let config = SmokeConfig {
            device: 7,
            strict: true,
            ..simulated(&path)
        };
        let err = SmokeTest::new(config).run(&mut Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            SmokeError::Gpu(GpuError::DeviceNotFound(7))
        ));
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_output_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.ptx");
        std::fs::write(&path, "ptx").unwrap();

        let outcome = SmokeTest::new(simulated(&path)).run(&mut BrokenPipe).unwrap();
        assert_eq!(outcome, SmokeOutcome::Completed { result: 9 });

        let strict = SmokeConfig {
            strict: true,
            ..simulated(&path)
        };
        let err = SmokeTest::new(strict).run(&mut BrokenPipe).unwrap_err();
        assert!(matches!(err, SmokeError::Output(_)));
    }
}
