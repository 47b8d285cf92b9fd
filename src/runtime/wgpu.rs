//! [`GpuDevice`] implementation on top of WGPU + WGSL.
//!
//! Programs stay as preprocessed WGSL text; a compute pipeline is created per
//! distinct local size, since WGSL fixes the work-group size at compile time.
//! Scalar kernel arguments live in small uniform buffers, buffer arguments are
//! bound as storage. Binding indices are the kernel argument indices.
//!
//! WGPU cannot launch partial work-groups, so this device never reports
//! non-uniform work-group support and kernels always receive their global size.

use std::collections::HashMap;
use std::sync::mpsc;
use std::time::Instant;

use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use crate::error::{Error, Result};
use crate::future::CallStats;
use crate::runtime::GpuPerfHint;
use crate::runtime::device::{BufferId, Capabilities, GpuDevice, KernelArg, KernelId, ProgramId, ProgramSource};
use crate::runtime::program::{LOCAL_SIZE_TOKENS, substitute_tokens};

/// Size of the uniform buffer backing one scalar argument.
const UNIFORM_SLOT: usize = 16;

struct Program {
    name: String,
    entry: String,
    text: String,
    pipelines: HashMap<[u32; 3], wgpu::ComputePipeline>,
}

enum BoundArg {
    Buffer(BufferId),
    Scalar(wgpu::Buffer),
}

struct Kernel {
    program: ProgramId,
    args: Vec<Option<BoundArg>>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    buffers: HashMap<BufferId, wgpu::Buffer>,
    programs: HashMap<ProgramId, Program>,
    kernels: HashMap<KernelId, Kernel>,
}

impl State {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Holds the WGPU device and queue used for executing compute pipelines.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    name: String,
    limits: wgpu::Limits,
    state: Mutex<State>,
}

impl WgpuDevice {
    /// Selects an adapter following `hint` and creates a device + queue.
    ///
    /// # Errors
    /// [`Error::Device`] if no adapter or device can be acquired.
    pub fn new(hint: GpuPerfHint) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let power_preference = match hint {
            GpuPerfHint::High => wgpu::PowerPreference::HighPerformance,
            GpuPerfHint::Low => wgpu::PowerPreference::LowPower,
            GpuPerfHint::Default | GpuPerfHint::Normal => wgpu::PowerPreference::default(),
        };
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .map_err(|e| Error::device(format!("adapter: {e}")))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("ferrokern"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| Error::device(format!("device: {e}")))?;

        let name = adapter.get_info().name;
        let limits = device.limits();
        tracing::debug!(device = %name, ?hint, "initialized wgpu device");
        Ok(Self {
            device,
            queue,
            name,
            limits,
            state: Mutex::new(State::default()),
        })
    }

    fn wait(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| Error::device(format!("poll: {e}")))
    }

    /// Pipeline of `program` specialized for `lws`, created on first use.
    fn pipeline(&self, program: &mut Program, lws: [u32; 3]) -> Result<wgpu::ComputePipeline> {
        if let Some(pipeline) = program.pipelines.get(&lws) {
            return Ok(pipeline.clone());
        }
        let tokens: Vec<(&str, String)> = LOCAL_SIZE_TOKENS
            .iter()
            .zip(lws)
            .map(|(token, v)| (*token, format!("{v}u")))
            .collect();
        let text = substitute_tokens(&program.text, &tokens);

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(program.name.as_str()),
            source: wgpu::ShaderSource::Wgsl(text.into()),
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(program.name.as_str()),
            layout: None,
            module: &module,
            entry_point: Some(program.entry.as_str()),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::Compile {
                program: program.name.clone(),
                msg: err.to_string(),
            });
        }
        program.pipelines.insert(lws, pipeline.clone());
        Ok(pipeline)
    }

    fn check_launch(&self, name: &str, groups: [u32; 3], local: [u32; 3]) -> Result<()> {
        let l = &self.limits;
        let max_local = [
            l.max_compute_workgroup_size_x,
            l.max_compute_workgroup_size_y,
            l.max_compute_workgroup_size_z,
        ];
        let fits = local.iter().zip(max_local).all(|(v, m)| *v >= 1 && *v <= m)
            && local.iter().product::<u32>() <= l.max_compute_invocations_per_workgroup
            && groups.iter().all(|g| *g <= l.max_compute_workgroups_per_dimension);
        if fits {
            Ok(())
        } else {
            Err(Error::Launch {
                kernel: name.to_string(),
                msg: format!("local size {local:?} with {groups:?} work-groups exceeds device limits"),
            })
        }
    }
}

impl GpuDevice for WgpuDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            non_uniform_work_groups: false,
            out_of_range_check: true,
            max_work_group_dims: [
                self.limits.max_compute_workgroup_size_x,
                self.limits.max_compute_workgroup_size_y,
                self.limits.max_compute_workgroup_size_z,
            ],
            program_binaries: false,
        }
    }

    fn compile_program(&self, source: &ProgramSource) -> Result<ProgramId> {
        let mut program = Program {
            name: source.name.clone(),
            entry: source.entry.clone(),
            text: source.text.clone(),
            pipelines: HashMap::new(),
        };
        // a 1x1x1 pipeline surfaces compile errors at build time
        self.pipeline(&mut program, [1, 1, 1])?;

        let mut state = self.state.lock();
        let id = ProgramId(state.next());
        state.programs.insert(id, program);
        Ok(id)
    }

    fn create_kernel(&self, program: ProgramId) -> Result<KernelId> {
        let mut state = self.state.lock();
        if !state.programs.contains_key(&program) {
            return Err(Error::device(format!("unknown program {program:?}")));
        }
        let id = KernelId(state.next());
        state.kernels.insert(
            id,
            Kernel {
                program,
                args: Vec::new(),
            },
        );
        Ok(id)
    }

    fn release_kernel(&self, kernel: KernelId) {
        let removed = self.state.lock().kernels.remove(&kernel);
        for arg in removed.into_iter().flat_map(|k| k.args).flatten() {
            if let BoundArg::Scalar(buf) = arg {
                buf.destroy();
            }
        }
    }

    fn kernel_max_work_group_size(&self, _kernel: KernelId) -> u32 {
        self.limits.max_compute_invocations_per_workgroup
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: KernelArg) -> Result<()> {
        let bound = match arg {
            KernelArg::Buffer(id) => BoundArg::Buffer(id),
            KernelArg::U32(v) => BoundArg::Scalar(self.scalar_buffer(v.to_le_bytes())),
            KernelArg::I32(v) => BoundArg::Scalar(self.scalar_buffer(v.to_le_bytes())),
            KernelArg::F32(v) => BoundArg::Scalar(self.scalar_buffer(v.to_le_bytes())),
        };
        let mut state = self.state.lock();
        let kernel = state
            .kernels
            .get_mut(&kernel)
            .ok_or_else(|| Error::device(format!("unknown kernel {kernel:?}")))?;
        let index = index as usize;
        if kernel.args.len() <= index {
            kernel.args.resize_with(index + 1, || None);
        }
        kernel.args[index] = Some(bound);
        Ok(())
    }

    fn enqueue_kernel(&self, kernel: KernelId, global: [u32; 3], local: [u32; 3], wait: bool) -> Result<CallStats> {
        let groups = [
            global[0].div_ceil(local[0].max(1)),
            global[1].div_ceil(local[1].max(1)),
            global[2].div_ceil(local[2].max(1)),
        ];

        let mut state = self.state.lock();
        let State {
            buffers,
            programs,
            kernels,
            ..
        } = &mut *state;
        let kernel = kernels
            .get(&kernel)
            .ok_or_else(|| Error::device(format!("unknown kernel {kernel:?}")))?;
        let program = programs
            .get_mut(&kernel.program)
            .ok_or_else(|| Error::device(format!("unknown program {:?}", kernel.program)))?;
        self.check_launch(&program.name, groups, local)?;
        let pipeline = self.pipeline(program, local)?;

        let mut entries = Vec::with_capacity(kernel.args.len());
        for (binding, arg) in kernel.args.iter().enumerate() {
            let resource = match arg {
                Some(BoundArg::Buffer(id)) => buffers
                    .get(id)
                    .ok_or_else(|| Error::Launch {
                        kernel: program.name.clone(),
                        msg: format!("argument {binding} refers to a released buffer"),
                    })?
                    .as_entire_binding(),
                Some(BoundArg::Scalar(buf)) => buf.as_entire_binding(),
                None => {
                    return Err(Error::Launch {
                        kernel: program.name.clone(),
                        msg: format!("argument {binding} is not set"),
                    });
                }
            };
            entries.push(wgpu::BindGroupEntry {
                binding: binding as u32,
                resource,
            });
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(program.name.as_str()),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(program.name.as_str()),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(program.name.as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }
        drop(state);

        let start = Instant::now();
        self.queue.submit(Some(encoder.finish()));
        if wait {
            self.wait()?;
        }
        Ok(CallStats::new(start, Instant::now()))
    }

    fn allocate(&self, bytes: usize) -> Result<BufferId> {
        let size = bytes.max(4).next_multiple_of(4) as u64;
        if size > self.limits.max_storage_buffer_binding_size as u64 {
            return Err(Error::device(format!("allocation of {bytes} bytes exceeds device limits")));
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut state = self.state.lock();
        let id = BufferId(state.next());
        state.buffers.insert(id, buffer);
        Ok(id)
    }

    fn release(&self, buffer: BufferId) {
        if let Some(buf) = self.state.lock().buffers.remove(&buffer) {
            buf.destroy();
        }
    }

    fn write_buffer(&self, buffer: BufferId, data: &[u8]) -> Result<()> {
        let state = self.state.lock();
        let buf = state
            .buffers
            .get(&buffer)
            .ok_or_else(|| Error::device(format!("unknown buffer {buffer:?}")))?;
        if data.len() % 4 == 0 {
            self.queue.write_buffer(buf, 0, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(data.len().next_multiple_of(4), 0);
            self.queue.write_buffer(buf, 0, &padded);
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, out: &mut [u8]) -> Result<()> {
        let staging = {
            let state = self.state.lock();
            let buf = state
                .buffers
                .get(&buffer)
                .ok_or_else(|| Error::device(format!("unknown buffer {buffer:?}")))?;
            let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("staging"),
                size: buf.size(),
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
            encoder.copy_buffer_to_buffer(buf, 0, &staging, 0, buf.size());
            self.queue.submit(Some(encoder.finish()));
            staging
        };

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.wait()?;
        rx.recv()
            .map_err(|e| Error::device(format!("map: {e}")))?
            .map_err(|e| Error::device(format!("map: {e}")))?;

        {
            let data = slice.get_mapped_range();
            let n = out.len().min(data.len());
            out[..n].copy_from_slice(&data[..n]);
        }
        staging.unmap();
        Ok(())
    }
}

impl WgpuDevice {
    fn scalar_buffer(&self, bytes: [u8; 4]) -> wgpu::Buffer {
        let mut contents = [0u8; UNIFORM_SLOT];
        contents[..4].copy_from_slice(&bytes);
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("scalar"),
            contents: &contents,
            usage: wgpu::BufferUsages::UNIFORM,
        })
    }
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDevice").field("name", &self.name).finish()
    }
}
