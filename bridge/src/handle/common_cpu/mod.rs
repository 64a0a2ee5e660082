//! 在主机上模拟的加速器。
//!
//! 每个设备有一块固定容量的显存，内核中间表示由解释器在 rayon 线程池上执行，
//! 每个工作组一个任务。

mod exec;

use crate::{
    args_not_support,
    common::{Blob, FreeList},
    compile_failed, execution_failed,
    ir::{KernelIr, ModuleImage},
    module_load_failed, out_of_memory, symbol_not_found, transfer_failed, BackendError,
    DeviceDescriptor, DeviceLimits, Driver, LaunchGeometry, TargetArch,
};
use exec::Buffer;
use log::warn;
use std::{
    collections::HashMap,
    ops::Range,
    path::{Path, PathBuf},
    ptr::copy_nonoverlapping,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc, Mutex,
    },
};

#[derive(Clone, Debug)]
pub struct CpuConfig {
    /// 模拟的设备数。
    pub devices: usize,
    /// 每个设备的显存字节数。
    pub memory: usize,
    pub alignment: usize,
    pub limits: DeviceLimits,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            memory: 64 << 20,
            alignment: 256,
            limits: DeviceLimits::default(),
        }
    }
}

pub struct Cpu {
    config: CpuConfig,
    target: TargetArch,
    launches: AtomicUsize,
    lowered: AtomicUsize,
    contexts_created: AtomicUsize,
    contexts_destroyed: AtomicUsize,
    live: AtomicUsize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HostDevice {
    pub index: usize,
}

pub struct HostContext {
    index: usize,
    target: TargetArch,
    arena: Mutex<Arena>,
}

struct Arena {
    free: FreeList,
    /// 起点 -> (请求的字节数, 占用的区间)
    live: HashMap<usize, (usize, Range<usize>)>,
    // 最后释放
    _blob: Blob,
}

/// 模拟显存中的地址。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HostPtr(usize);

pub struct HostModule {
    kernels: HashMap<String, Arc<KernelIr>>,
}

impl Cpu {
    pub fn new(config: CpuConfig) -> Self {
        Self {
            config,
            target: TargetArch::host(),
            launches: AtomicUsize::new(0),
            lowered: AtomicUsize::new(0),
            contexts_created: AtomicUsize::new(0),
            contexts_destroyed: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    /// 发射调用的次数，包括执行失败的调用。
    #[inline]
    pub fn launch_count(&self) -> usize {
        self.launches.load(Relaxed)
    }

    /// 降低步骤被调用的次数。
    #[inline]
    pub fn lowered(&self) -> usize {
        self.lowered.load(Relaxed)
    }

    #[inline]
    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Relaxed)
    }

    #[inline]
    pub fn contexts_destroyed(&self) -> usize {
        self.contexts_destroyed.load(Relaxed)
    }

    /// 所有设备上尚未释放的分配数。
    #[inline]
    pub fn live_allocations(&self) -> usize {
        self.live.load(Relaxed)
    }
}

impl Arena {
    fn check(&self, ptr: HostPtr, offset: usize, len: usize) -> Result<usize, String> {
        let &(size, _) = self
            .live
            .get(&ptr.0)
            .ok_or_else(|| format!("{ptr:?} is not a live allocation"))?;
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(ptr.0 + offset),
            _ => Err(format!("{len} bytes at {ptr:?}+{offset} out of {size}")),
        }
    }
}

impl Driver for Cpu {
    type Device = HostDevice;
    type Context = HostContext;
    type DevPtr = HostPtr;
    type Module = HostModule;
    type Function = Arc<KernelIr>;

    #[inline]
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor<Self>>, BackendError> {
        Ok((0..self.config.devices)
            .map(|index| {
                DeviceDescriptor::new(
                    index,
                    HostDevice { index },
                    format!("cpu{index}"),
                    self.target.clone(),
                    self.config.limits,
                )
            })
            .collect())
    }

    fn create_context(&self, device: &DeviceDescriptor<Self>) -> Result<HostContext, BackendError> {
        let CpuConfig {
            memory, alignment, ..
        } = self.config;
        let blob = Blob::new(memory, alignment).ok_or_else(|| {
            out_of_memory(format!(
                "{memory} bytes of device memory for {}",
                device.name()
            ))
        })?;
        let free = FreeList::new(blob.addr_range(), alignment);
        self.contexts_created.fetch_add(1, Relaxed);
        Ok(HostContext {
            index: device.index(),
            target: device.target().clone(),
            arena: Mutex::new(Arena {
                free,
                live: HashMap::new(),
                _blob: blob,
            }),
        })
    }

    fn destroy_context(&self, ctx: HostContext) {
        let arena = ctx.arena.into_inner().unwrap();
        if !arena.live.is_empty() {
            warn!(
                "{} allocation(s) alive when context on cpu{} destroyed",
                arena.live.len(),
                ctx.index
            );
            self.live.fetch_sub(arena.live.len(), Relaxed);
        }
        self.contexts_destroyed.fetch_add(1, Relaxed);
    }

    fn malloc(&self, ctx: &HostContext, size: usize) -> Result<HostPtr, BackendError> {
        let mut arena = ctx.arena.lock().unwrap();
        let range = arena.free.take(size).ok_or_else(|| {
            out_of_memory(format!(
                "{size} bytes on cpu{}, {} available",
                ctx.index,
                arena.free.available()
            ))
        })?;
        let ptr = HostPtr(range.start);
        arena.live.insert(range.start, (size, range));
        self.live.fetch_add(1, Relaxed);
        Ok(ptr)
    }

    fn free(&self, ctx: &HostContext, ptr: HostPtr) {
        let mut arena = ctx.arena.lock().unwrap();
        match arena.live.remove(&ptr.0) {
            Some((_, range)) => {
                arena.free.put(range);
                self.live.fetch_sub(1, Relaxed);
            }
            None => warn!("{ptr:?} freed twice on cpu{}", ctx.index),
        }
    }

    fn memcpy_h2d(
        &self,
        ctx: &HostContext,
        dst: HostPtr,
        offset: usize,
        src: &[u8],
    ) -> Result<(), BackendError> {
        let arena = ctx.arena.lock().unwrap();
        let addr = arena.check(dst, offset, src.len()).map_err(transfer_failed)?;
        unsafe { copy_nonoverlapping(src.as_ptr(), addr as *mut u8, src.len()) };
        Ok(())
    }

    fn memcpy_d2h(
        &self,
        ctx: &HostContext,
        dst: &mut [u8],
        src: HostPtr,
        offset: usize,
    ) -> Result<(), BackendError> {
        let arena = ctx.arena.lock().unwrap();
        let addr = arena.check(src, offset, dst.len()).map_err(transfer_failed)?;
        unsafe { copy_nonoverlapping(addr as *const u8, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn lower(
        &self,
        ir: &KernelIr,
        target: &TargetArch,
        work_dir: &Path,
    ) -> Result<PathBuf, BackendError> {
        if target != &self.target {
            return Err(compile_failed(format!("cannot lower for {target}")));
        }
        ir.validate()?;
        self.lowered.fetch_add(1, Relaxed);

        let payload = serde_json::to_string(&[ir])
            .map_err(|e| compile_failed(format!("`{}`: {e}", ir.name)))?;
        ModuleImage::new(target.clone(), vec![ir.name.clone()], payload)
            .write_to(work_dir)
            .map_err(compile_failed)
    }

    fn load_module(&self, ctx: &HostContext, image: &ModuleImage) -> Result<HostModule, BackendError> {
        image.check_target(&ctx.target)?;
        let kernels = serde_json::from_str::<Vec<KernelIr>>(&image.payload)
            .map_err(|e| module_load_failed(format!("corrupt payload: {e}")))?;
        let mut module = HostModule {
            kernels: HashMap::new(),
        };
        for ir in kernels {
            ir.validate().map_err(|e| module_load_failed(e.info))?;
            module.kernels.insert(ir.name.clone(), Arc::new(ir));
        }
        Ok(module)
    }

    #[inline]
    fn unload_module(&self, _ctx: &HostContext, module: HostModule) {
        drop(module)
    }

    fn get_function(&self, module: &HostModule, name: &str) -> Result<Arc<KernelIr>, BackendError> {
        module
            .kernels
            .get(name)
            .cloned()
            .ok_or_else(|| symbol_not_found(format!("`{name}`")))
    }

    fn launch(
        &self,
        ctx: &HostContext,
        _module: &HostModule,
        function: &Arc<KernelIr>,
        geometry: &LaunchGeometry,
        params: &[HostPtr],
    ) -> Result<(), BackendError> {
        self.launches.fetch_add(1, Relaxed);
        if params.len() != function.params.len() {
            return Err(args_not_support(format!(
                "`{}` takes {} argument(s), {} given",
                function.name,
                function.params.len(),
                params.len()
            )));
        }
        let arena = ctx.arena.lock().unwrap();
        let buffers = function
            .params
            .iter()
            .zip(params)
            .map(|(p, &ptr)| -> Result<Buffer, BackendError> {
                let &(len, _) = arena
                    .live
                    .get(&ptr.0)
                    .ok_or_else(|| execution_failed(format!("{ptr:?} bound to `{}`", p.name)))?;
                Ok(Buffer {
                    addr: ptr.0,
                    len,
                    ty: p.ty,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        exec::run(function, geometry, &buffers)
    }

    #[inline]
    fn synchronize(&self, _ctx: &HostContext) -> Result<(), BackendError> {
        Ok(())
    }
}
