//! # Compute Runtime
//!
//! A [`ComputeRuntime`] owns one GPU device (and so one queue), the programs
//! compiled on it and the [`Tuner`] holding launch parameters for it. It is
//! built once from a [`RuntimeConfig`] and shared as an `Arc` by every GPU
//! functor; nothing about it changes after construction.
//!
//! ## Kernel Identity
//!
//! A program is compiled once per `(program name, build options)` pair. Each
//! [`ComputeRuntime::build_kernel`] call still returns a fresh kernel object,
//! so functors never share argument slots.
//!
//! Before compiling from source the runtime tries, in order, a binary cached in
//! the key-value store and a binary file in one of the configured binary paths.
//!
//! ## Submodules
//!
//! - [`device`] — the [`GpuDevice`] seam, buffers and kernel handles
//! - [`program`] — built-in kernel sources and the preprocessor
//! - [`cpu`] — the CPU worker pool
//! - `wgpu` *(feature `wgpu`)* — [`GpuDevice`] over `wgpu`

pub mod cpu;
pub mod device;
pub mod program;
#[cfg(feature = "wgpu")]
pub mod wgpu;

pub use cpu::{AffinityPolicy, CpuExecutor, ThreadPolicy};
pub use device::{
    BufferId, Capabilities, DeviceBuffer, GpuDevice, KernelArg, KernelHandle, KernelId, MappedBuffer, ProgramId,
    ProgramSource,
};
pub use program::BuildOptions;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::storage::{FileStorage, KvStorage};
use crate::tuning::{Tuner, TunerConfig};

/// Performance hint passed to the device at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuPerfHint {
    #[default]
    Default,
    Low,
    Normal,
    High,
}

/// Queue priority hint passed to the device at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuPriorityHint {
    #[default]
    Default,
    Low,
    Normal,
    High,
}

/// Everything a [`ComputeRuntime`] reads at construction.
#[derive(Clone, Default)]
pub struct RuntimeConfig {
    pub perf_hint: GpuPerfHint,
    pub priority_hint: GpuPriorityHint,
    /// Directories searched for precompiled program binaries.
    pub binary_paths: Vec<PathBuf>,
    /// File used as the key-value store when no storage is injected.
    pub parameter_path: Option<PathBuf>,
    /// Injected key-value store for tuning records and program binaries.
    pub storage: Option<Arc<dyn KvStorage>>,
    /// Build kernels with the device-side out-of-range check.
    pub out_of_range_check: bool,
    pub tuning: TunerConfig,
}

impl RuntimeConfig {
    /// Defaults overridden by `FERROKERN_TUNING`, `FERROKERN_OUT_OF_RANGE_CHECK`
    /// and `FERROKERN_PARAMETER_PATH`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(on) = env_flag("FERROKERN_TUNING") {
            config.tuning.enabled = on;
        }
        if let Some(on) = env_flag("FERROKERN_OUT_OF_RANGE_CHECK") {
            config.out_of_range_check = on;
        }
        if let Ok(path) = std::env::var("FERROKERN_PARAMETER_PATH") {
            if !path.is_empty() {
                config.parameter_path = Some(PathBuf::from(path));
            }
        }
        config
    }

    pub fn with_hints(mut self, perf: GpuPerfHint, priority: GpuPriorityHint) -> Self {
        self.perf_hint = perf;
        self.priority_hint = priority;
        self
    }

    pub fn with_binary_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.binary_paths = paths;
        self
    }

    pub fn with_parameter_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.parameter_path = Some(path.into());
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn KvStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_out_of_range_check(mut self, enabled: bool) -> Self {
        self.out_of_range_check = enabled;
        self
    }

    pub fn with_tuning(mut self, tuning: TunerConfig) -> Self {
        self.tuning = tuning;
        self
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("perf_hint", &self.perf_hint)
            .field("priority_hint", &self.priority_hint)
            .field("binary_paths", &self.binary_paths)
            .field("parameter_path", &self.parameter_path)
            .field("storage", &self.storage.is_some())
            .field("out_of_range_check", &self.out_of_range_check)
            .field("tuning", &self.tuning)
            .finish()
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" | "" => Some(false),
        other => {
            tracing::warn!(name, value = other, "ignoring unrecognized flag value");
            None
        }
    }
}

/// GPU execution context shared by every GPU functor.
pub struct ComputeRuntime {
    device: Arc<dyn GpuDevice>,
    caps: Capabilities,
    out_of_range_check: bool,
    binary_paths: Vec<PathBuf>,
    storage: Option<Arc<dyn KvStorage>>,
    programs: Mutex<HashMap<(String, BuildOptions), ProgramId>>,
    tuner: Tuner,
}

impl ComputeRuntime {
    /// Creates a runtime over `device`.
    ///
    /// # Errors
    /// Fails if the configured parameter file exists but cannot be opened.
    pub fn new(device: Arc<dyn GpuDevice>, config: RuntimeConfig) -> Result<Self> {
        let caps = device.capabilities();
        let storage: Option<Arc<dyn KvStorage>> = match (config.storage, &config.parameter_path) {
            (Some(storage), _) => Some(storage),
            (None, Some(path)) => Some(Arc::new(FileStorage::open(path)?)),
            (None, None) => None,
        };
        let out_of_range_check = config.out_of_range_check && caps.out_of_range_check;
        if config.out_of_range_check && !caps.out_of_range_check {
            tracing::warn!(device = %device.name(), "device cannot run out-of-range checks; disabled");
        }

        tracing::info!(
            device = %device.name(),
            out_of_range_check,
            non_uniform_work_groups = caps.non_uniform_work_groups,
            tuning = config.tuning.enabled,
            persistent = storage.is_some(),
            priority = ?config.priority_hint,
            "created compute runtime"
        );

        Ok(Self {
            tuner: Tuner::new(config.tuning, caps.max_work_group_dims, storage.clone()),
            device,
            caps,
            out_of_range_check,
            binary_paths: config.binary_paths,
            storage,
            programs: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a runtime on the default `wgpu` adapter.
    #[cfg(feature = "wgpu")]
    pub fn with_default_gpu(config: RuntimeConfig) -> Result<Self> {
        let device = self::wgpu::WgpuDevice::new(config.perf_hint)?;
        Self::new(Arc::new(device), config)
    }

    /// Compiles `program` for `options` if needed and creates a kernel object
    /// for its `entry` point.
    ///
    /// # Errors
    /// [`Error::Compile`] for unknown programs or failed builds.
    pub fn build_kernel(&self, program: &str, entry: &str, options: &BuildOptions) -> Result<KernelHandle> {
        let program_id = {
            let mut programs = self.programs.lock();
            let key = (program.to_string(), options.clone());
            match programs.get(&key) {
                Some(id) => {
                    tracing::debug!(program, %options, "program cache hit");
                    *id
                }
                None => {
                    let id = self.load_program(program, entry, options)?;
                    programs.insert(key, id);
                    id
                }
            }
        };
        let kernel = self.device.create_kernel(program_id)?;
        Ok(KernelHandle::new(Arc::clone(&self.device), kernel, program.to_string()))
    }

    fn load_program(&self, program: &str, entry: &str, options: &BuildOptions) -> Result<ProgramId> {
        let text = program::program_source(program).ok_or_else(|| Error::Compile {
            program: program.to_string(),
            msg: "no such program".to_string(),
        })?;
        let source = ProgramSource {
            name: program.to_string(),
            entry: entry.to_string(),
            text: program::preprocess(program, text, options)?,
            options: options.clone(),
        };
        let identity = format!("{program}-{:016x}", program::fnv1a(format!("{entry} {options}").as_bytes()));
        let binary_key = format!("bin:{identity}");

        if let Some(storage) = &self.storage {
            if let Some(binary) = storage.load(&binary_key)? {
                if let Some(id) = self.device.load_program_binary(&source, &binary)? {
                    tracing::debug!(program, "loaded program binary from storage");
                    return Ok(id);
                }
            }
        }
        for dir in &self.binary_paths {
            let path = dir.join(format!("{identity}.bin"));
            let Ok(binary) = std::fs::read(&path) else {
                continue;
            };
            if let Some(id) = self.device.load_program_binary(&source, &binary)? {
                tracing::debug!(program, path = %path.display(), "loaded program binary");
                return Ok(id);
            }
        }

        tracing::debug!(program, %options, "compiling program");
        let id = self.device.compile_program(&source)?;
        if self.caps.program_binaries {
            if let (Some(storage), Some(binary)) = (&self.storage, self.device.program_binary(id)) {
                storage.insert(&binary_key, binary)?;
            }
        }
        Ok(id)
    }

    pub fn is_out_of_range_check_enabled(&self) -> bool {
        self.out_of_range_check
    }

    pub fn is_non_uniform_workgroups_supported(&self) -> bool {
        self.caps.non_uniform_work_groups
    }

    pub fn kernel_max_work_group_size(&self, kernel: &KernelHandle) -> u32 {
        kernel.max_work_group_size()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn tuner(&self) -> &Tuner {
        &self.tuner
    }

    /// Allocates `bytes` of zeroed device memory.
    pub fn allocate(&self, bytes: usize) -> Result<DeviceBuffer> {
        DeviceBuffer::allocate(Arc::clone(&self.device), bytes)
    }

    /// Makes tuning records and program binaries durable.
    pub fn flush(&self) -> Result<()> {
        self.tuner.flush()
    }
}

impl fmt::Debug for ComputeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeRuntime")
            .field("device", &self.device.name())
            .field("caps", &self.caps)
            .field("out_of_range_check", &self.out_of_range_check)
            .field("programs", &self.programs.lock().len())
            .field("tuner", &self.tuner)
            .finish()
    }
}

impl Drop for ComputeRuntime {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::warn!("failed to flush key-value storage: {err}");
        }
    }
}
