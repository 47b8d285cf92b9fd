//! A host-side stand-in for a GPU.
//!
//! `EmulatedDevice` runs the built-in kernels on the CPU, reading arguments by
//! position exactly as the WGSL programs declare them. It counts compiles,
//! argument writes, launches and buffer reads, can plant a fault code in the
//! next bound error buffer, and reports a cost computed from the local size.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ferrokern::future::CallStats;
use ferrokern::runtime::{
    BufferId, Capabilities, ComputeRuntime, GpuDevice, KernelArg, KernelId, ProgramId, ProgramSource, RuntimeConfig,
};
use ferrokern::{Error, Result};
use parking_lot::Mutex;

pub type CostModel = fn([u32; 3]) -> Duration;

/// Favors wide `x`, penalizes deep `z`; has a single minimum for most grids.
pub fn default_cost(lws: [u32; 3]) -> Duration {
    let [x, y, z] = lws.map(u64::from);
    Duration::from_nanos(10_000 / x + 37 * y + 500 * z)
}

/// Every launch with the same cost.
pub fn flat_cost(_lws: [u32; 3]) -> Duration {
    Duration::from_micros(5)
}

const BINARY_MAGIC: &[u8] = b"emu:";

#[derive(Debug, Clone, PartialEq)]
pub struct Launch {
    pub program: String,
    pub global: [u32; 3],
    pub local: [u32; 3],
}

#[derive(Default)]
struct State {
    next_id: u64,
    buffers: HashMap<BufferId, Vec<u8>>,
    programs: HashMap<ProgramId, ProgramSource>,
    kernels: HashMap<KernelId, (ProgramId, Vec<Option<KernelArg>>)>,
    launches: Vec<Launch>,
    pending_fault: Option<u32>,
}

impl State {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct EmulatedDevice {
    caps: Capabilities,
    max_work_group_size: u32,
    cost: CostModel,
    state: Mutex<State>,
    compiles: AtomicUsize,
    binary_loads: AtomicUsize,
    set_args: AtomicUsize,
    reads: AtomicUsize,
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self {
            caps: Capabilities::default(),
            max_work_group_size: 256,
            cost: default_cost,
            state: Mutex::new(State::default()),
            compiles: AtomicUsize::new(0),
            binary_loads: AtomicUsize::new(0),
            set_args: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }
}

impl EmulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_cost(mut self, cost: CostModel) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_max_work_group_size(mut self, n: u32) -> Self {
        self.max_work_group_size = n;
        self
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn binary_loads(&self) -> usize {
        self.binary_loads.load(Ordering::SeqCst)
    }

    pub fn set_arg_calls(&self) -> usize {
        self.set_args.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.state.lock().launches.clone()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_kernels(&self) -> usize {
        self.state.lock().kernels.len()
    }

    /// The next launch writes `code` into its error buffer, if it has one.
    pub fn inject_fault(&self, code: u32) {
        self.state.lock().pending_fault = Some(code);
    }

    fn register(&self, state: &mut State, source: &ProgramSource) -> ProgramId {
        let id = ProgramId(state.next());
        state.programs.insert(id, source.clone());
        id
    }
}

/// Shares `device` as the runtime's GPU.
pub fn runtime_on(device: &Arc<EmulatedDevice>, config: RuntimeConfig) -> Arc<ComputeRuntime> {
    let device: Arc<dyn GpuDevice> = device.clone();
    Arc::new(ComputeRuntime::new(device, config).unwrap())
}

fn launch_err(program: &str, msg: impl Into<String>) -> Error {
    Error::Launch {
        kernel: program.to_string(),
        msg: msg.into(),
    }
}

fn words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn store_words(dst: &mut [u8], values: &[u32]) {
    for (chunk, v) in dst.chunks_exact_mut(4).zip(values) {
        chunk.copy_from_slice(&v.to_le_bytes());
    }
}

/// Positional reader over a kernel's argument slots.
struct Args<'a> {
    program: &'a str,
    slots: &'a [Option<KernelArg>],
    next: usize,
}

impl Args<'_> {
    fn take(&mut self) -> Result<KernelArg> {
        let arg = self
            .slots
            .get(self.next)
            .copied()
            .flatten()
            .ok_or_else(|| launch_err(self.program, format!("argument {} is not set", self.next)))?;
        self.next += 1;
        Ok(arg)
    }

    fn buffer(&mut self) -> Result<BufferId> {
        match self.take()? {
            KernelArg::Buffer(id) => Ok(id),
            other => Err(launch_err(self.program, format!("expected a buffer, got {other:?}"))),
        }
    }

    fn u32(&mut self) -> Result<u32> {
        match self.take()? {
            KernelArg::U32(v) => Ok(v),
            other => Err(launch_err(self.program, format!("expected a u32, got {other:?}"))),
        }
    }
}

impl GpuDevice for EmulatedDevice {
    fn name(&self) -> String {
        "emulated".to_string()
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn compile_program(&self, source: &ProgramSource) -> Result<ProgramId> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let compile_err = |msg: &str| Error::Compile {
            program: source.name.clone(),
            msg: msg.to_string(),
        };
        if !source.text.contains(&format!("fn {}(", source.entry)) {
            return Err(compile_err("entry point not found"));
        }
        if source.text.contains("KERNEL_ARG") || source.text.contains("DATA_TYPE") {
            return Err(compile_err("unresolved token"));
        }
        if source.text.lines().any(|l| l.trim_start().starts_with('#')) {
            return Err(compile_err("unresolved directive"));
        }
        let mut state = self.state.lock();
        Ok(self.register(&mut state, source))
    }

    fn load_program_binary(&self, source: &ProgramSource, binary: &[u8]) -> Result<Option<ProgramId>> {
        self.binary_loads.fetch_add(1, Ordering::SeqCst);
        match binary.strip_prefix(BINARY_MAGIC) {
            Some(text) if self.caps.program_binaries && text == source.text.as_bytes() => {
                let mut state = self.state.lock();
                Ok(Some(self.register(&mut state, source)))
            }
            _ => Ok(None),
        }
    }

    fn program_binary(&self, program: ProgramId) -> Option<Vec<u8>> {
        if !self.caps.program_binaries {
            return None;
        }
        let state = self.state.lock();
        let source = state.programs.get(&program)?;
        let mut binary = BINARY_MAGIC.to_vec();
        binary.extend_from_slice(source.text.as_bytes());
        Some(binary)
    }

    fn create_kernel(&self, program: ProgramId) -> Result<KernelId> {
        let mut state = self.state.lock();
        if !state.programs.contains_key(&program) {
            return Err(Error::device("unknown program"));
        }
        let id = KernelId(state.next());
        state.kernels.insert(id, (program, Vec::new()));
        Ok(id)
    }

    fn release_kernel(&self, kernel: KernelId) {
        self.state.lock().kernels.remove(&kernel);
    }

    fn kernel_max_work_group_size(&self, _kernel: KernelId) -> u32 {
        self.max_work_group_size
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: KernelArg) -> Result<()> {
        self.set_args.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let (_, args) = state
            .kernels
            .get_mut(&kernel)
            .ok_or_else(|| Error::device("unknown kernel"))?;
        let index = index as usize;
        if args.len() <= index {
            args.resize(index + 1, None);
        }
        args[index] = Some(arg);
        Ok(())
    }

    fn enqueue_kernel(&self, kernel: KernelId, global: [u32; 3], local: [u32; 3], _wait: bool) -> Result<CallStats> {
        let mut state = self.state.lock();
        let (program_id, slots) = state
            .kernels
            .get(&kernel)
            .cloned()
            .ok_or_else(|| Error::device("unknown kernel"))?;
        let source = state
            .programs
            .get(&program_id)
            .cloned()
            .ok_or_else(|| Error::device("unknown program"))?;
        let name = source.name.as_str();

        let dims_ok = local
            .iter()
            .zip(self.caps.max_work_group_dims)
            .all(|(l, m)| *l >= 1 && *l <= m);
        if !dims_ok || local.iter().product::<u32>() > self.max_work_group_size {
            return Err(launch_err(name, format!("invalid local size {local:?}")));
        }

        let mut args = Args {
            program: name,
            slots: &slots,
            next: 0,
        };
        let error_buffer = if source.options.is_defined("OUT_OF_RANGE_CHECK") {
            Some(args.buffer()?)
        } else {
            None
        };
        if !source.options.is_defined("NON_UNIFORM_WORK_GROUP") {
            for (d, g) in global.iter().enumerate() {
                let bound = args.u32()?;
                if bound != *g {
                    return Err(launch_err(name, format!("stale global size {bound} in dimension {d}, launching {g}")));
                }
            }
        }

        let [gx, gy, gz] = global.map(|g| g as usize);
        let mut out_of_range = false;
        match name {
            "channel_shuffle" => {
                let src_id = args.buffer()?;
                let groups = args.u32()? as usize;
                let cpg = args.u32()? as usize;
                let dst_id = args.buffer()?;
                let src = words(state.buffers.get(&src_id).ok_or_else(|| launch_err(name, "released input"))?);
                let dst_bytes = state.buffers.get_mut(&dst_id).ok_or_else(|| launch_err(name, "released output"))?;
                let mut dst = words(dst_bytes);
                let channels = groups * cpg;
                for z in 0..gz {
                    for y in 0..gy {
                        for x in 0..gx {
                            let base = (z * gy + y) * channels;
                            for g in 0..groups {
                                for k in 0..4 {
                                    let c = x * 4 + k;
                                    let (i, o) = (base + g * cpg + c, base + c * groups + g);
                                    if i >= src.len() || o >= dst.len() {
                                        out_of_range = true;
                                    } else {
                                        dst[o] = src[i];
                                    }
                                }
                            }
                        }
                    }
                }
                store_words(dst_bytes, &dst);
            }
            "slice" => {
                let src_id = args.buffer()?;
                let stride = args.u32()? as usize;
                let offset = args.u32()? as usize;
                let dst_id = args.buffer()?;
                let src = words(state.buffers.get(&src_id).ok_or_else(|| launch_err(name, "released input"))?);
                let dst_bytes = state.buffers.get_mut(&dst_id).ok_or_else(|| launch_err(name, "released output"))?;
                let mut dst = words(dst_bytes);
                for y in 0..gy {
                    for x in 0..gx {
                        let (i, o) = (y * stride + offset + x, y * gx + x);
                        if i >= src.len() || o >= dst.len() {
                            out_of_range = true;
                        } else {
                            dst[o] = src[i];
                        }
                    }
                }
                store_words(dst_bytes, &dst);
            }
            other => return Err(launch_err(other, "no host implementation")),
        }

        let fault = state.pending_fault.take().or(out_of_range.then_some(1));
        if let (Some(id), Some(code)) = (error_buffer, fault) {
            if let Some(buf) = state.buffers.get_mut(&id) {
                buf[..4].copy_from_slice(&code.to_le_bytes());
            }
        }

        state.launches.push(Launch {
            program: source.name.clone(),
            global,
            local,
        });
        Ok(CallStats::starting_at(Instant::now(), (self.cost)(local)))
    }

    fn allocate(&self, bytes: usize) -> Result<BufferId> {
        let mut state = self.state.lock();
        let id = BufferId(state.next());
        state.buffers.insert(id, vec![0u8; bytes]);
        Ok(id)
    }

    fn release(&self, buffer: BufferId) {
        self.state.lock().buffers.remove(&buffer);
    }

    fn write_buffer(&self, buffer: BufferId, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let buf = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| Error::device("unknown buffer"))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, out: &mut [u8]) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let buf = state.buffers.get(&buffer).ok_or_else(|| Error::device("unknown buffer"))?;
        let n = out.len().min(buf.len());
        out[..n].copy_from_slice(&buf[..n]);
        Ok(())
    }
}
