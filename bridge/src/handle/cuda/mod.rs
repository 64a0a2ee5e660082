//! NVIDIA 驱动。内核被渲染为 CUDA C，由 nvrtc 编译为 PTX 后加载。

use crate::{
    compile_failed, driver_init, execution_failed,
    ir::{cuda_c, KernelIr, ModuleImage},
    module_load_failed, out_of_memory, symbol_not_found, transfer_failed, BackendError,
    DeviceDescriptor, DeviceLimits, Driver, LaunchGeometry, TargetArch,
};
use cuda::{
    bindings::{nvrtcResult, CUdeviceptr, CUfunction, CUmodule, CUresult},
    CurrentCtx, Device, Ptx, Version,
};
use log::warn;
use std::{
    collections::HashMap,
    ffi::{c_void, CString},
    path::{Path, PathBuf},
    ptr::{null_mut, NonNull},
    sync::{Arc, Mutex, OnceLock, RwLock},
};

/// CUDA 后端使用的目标三元组。
pub const TRIPLE: &str = "nvptx64-nvidia-cuda";

/// 调用驱动函数，失败时按 `$err` 构造错误而不是中止进程。
macro_rules! driver {
    ($f:ident($($arg:expr),* $(,)?) => $err:ident) => {{
        let result = unsafe { ::cuda::bindings::$f($($arg),*) };
        if matches!(result, CUresult::CUDA_SUCCESS) {
            Ok(())
        } else {
            Err($err(format!("{} failed with {result:?}", stringify!($f))))
        }
    }};
}

#[derive(Default)]
pub struct Gpu {
    /// 目标到计算能力，枚举时填写。
    arch: RwLock<HashMap<TargetArch, Version>>,
}

pub struct GpuContext {
    index: usize,
    target: TargetArch,
    context: cuda::Context,
    allocs: Mutex<HashMap<GpuPtr, usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GpuPtr(CUdeviceptr);

pub struct GpuModule {
    module: Option<NonNull<c_void>>,
    functions: HashMap<String, GpuFunction>,
}

#[derive(Clone, Copy)]
pub struct GpuFunction(NonNull<c_void>);

// 模块与函数句柄只在持有上下文时使用，上下文由后端串行化
unsafe impl Send for GpuModule {}
unsafe impl Send for GpuFunction {}
unsafe impl Sync for GpuFunction {}

impl Gpu {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    fn version(&self, target: &TargetArch) -> Result<Version, BackendError> {
        self.arch
            .read()
            .unwrap()
            .get(target)
            .copied()
            .ok_or_else(|| compile_failed(format!("no device with target {target}")))
    }
}

impl GpuContext {
    #[inline]
    fn apply<T>(&self, f: impl FnOnce(&CurrentCtx) -> T) -> T {
        self.context.apply(f)
    }

    fn check(&self, ptr: GpuPtr, offset: usize, len: usize) -> Result<CUdeviceptr, String> {
        let allocs = self.allocs.lock().unwrap();
        let &size = allocs
            .get(&ptr)
            .ok_or_else(|| format!("{ptr:?} is not a live allocation"))?;
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(ptr.0 + offset as CUdeviceptr),
            _ => Err(format!("{len} bytes at {ptr:?}+{offset} out of {size}")),
        }
    }
}

fn target_of(cc: Version) -> TargetArch {
    TargetArch::new(TRIPLE, format!("sm_{}{}", cc.major, cc.minor))
}

impl Driver for Gpu {
    type Device = Device;
    type Context = GpuContext;
    type DevPtr = GpuPtr;
    type Module = GpuModule;
    type Function = GpuFunction;

    #[inline]
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor<Self>>, BackendError> {
        if let Err(cuda::NoDevice) = cuda::init() {
            return Err(driver_init("no cuda device"));
        }
        let mut arch = self.arch.write().unwrap();
        Ok((0..Device::count() as usize)
            .map(|index| {
                let device = Device::new(index as _);
                let cc = device.compute_capability();
                let target = target_of(cc);
                arch.insert(target.clone(), cc);
                let limits = DeviceLimits {
                    max_threads_block: device.block_limit().max_threads,
                    ..DeviceLimits::default()
                };
                DeviceDescriptor::new(index, device, format!("cuda{index}"), target, limits)
            })
            .collect())
    }

    fn create_context(&self, device: &DeviceDescriptor<Self>) -> Result<GpuContext, BackendError> {
        Ok(GpuContext {
            index: device.index(),
            target: device.target().clone(),
            context: device.handle().context(),
            allocs: Default::default(),
        })
    }

    fn destroy_context(&self, ctx: GpuContext) {
        let allocs = std::mem::take(&mut *ctx.allocs.lock().unwrap());
        if !allocs.is_empty() {
            warn!(
                "{} allocation(s) alive when context on cuda{} destroyed",
                allocs.len(),
                ctx.index
            );
        }
        ctx.apply(|_| {
            for ptr in allocs.into_keys() {
                if let Err(e) = driver!(cuMemFree_v2(ptr.0) => execution_failed) {
                    warn!("{e}")
                }
            }
        })
    }

    fn malloc(&self, ctx: &GpuContext, size: usize) -> Result<GpuPtr, BackendError> {
        let mut ptr: CUdeviceptr = 0;
        ctx.apply(|_| driver!(cuMemAlloc_v2(&mut ptr, size) => out_of_memory))
            .map_err(|e| out_of_memory(format!("{size} bytes on cuda{}: {}", ctx.index, e.info)))?;
        let ptr = GpuPtr(ptr);
        ctx.allocs.lock().unwrap().insert(ptr, size);
        Ok(ptr)
    }

    fn free(&self, ctx: &GpuContext, ptr: GpuPtr) {
        if ctx.allocs.lock().unwrap().remove(&ptr).is_none() {
            warn!("{ptr:?} freed twice on cuda{}", ctx.index);
            return;
        }
        if let Err(e) = ctx.apply(|_| driver!(cuMemFree_v2(ptr.0) => execution_failed)) {
            warn!("{e}")
        }
    }

    fn memcpy_h2d(
        &self,
        ctx: &GpuContext,
        dst: GpuPtr,
        offset: usize,
        src: &[u8],
    ) -> Result<(), BackendError> {
        let addr = ctx.check(dst, offset, src.len()).map_err(transfer_failed)?;
        ctx.apply(|_| {
            driver!(cuMemcpyHtoD_v2(addr, src.as_ptr().cast(), src.len()) => transfer_failed)
        })
    }

    fn memcpy_d2h(
        &self,
        ctx: &GpuContext,
        dst: &mut [u8],
        src: GpuPtr,
        offset: usize,
    ) -> Result<(), BackendError> {
        let addr = ctx.check(src, offset, dst.len()).map_err(transfer_failed)?;
        ctx.apply(|_| {
            driver!(cuMemcpyDtoH_v2(dst.as_mut_ptr().cast(), addr, dst.len()) => transfer_failed)
        })
    }

    fn lower(
        &self,
        ir: &KernelIr,
        target: &TargetArch,
        work_dir: &Path,
    ) -> Result<PathBuf, BackendError> {
        ir.validate()?;
        let cc = self.version(target)?;
        let code = cuda_c::render(ir);
        cache_ptx(&code, cc).map_err(|(e, log)| compile_failed(format!("{e:?}\n{log}")))?;
        ModuleImage::new(target.clone(), vec![ir.name.clone()], code)
            .write_to(work_dir)
            .map_err(compile_failed)
    }

    fn load_module(&self, ctx: &GpuContext, image: &ModuleImage) -> Result<GpuModule, BackendError> {
        image.check_target(&ctx.target)?;
        let cc = self
            .version(&ctx.target)
            .map_err(|e| module_load_failed(e.info))?;
        let ptx = cache_ptx(&image.payload, cc)
            .map_err(|(e, log)| module_load_failed(format!("{e:?}\n{log}")))?;
        ctx.apply(|_| {
            let mut module: CUmodule = null_mut();
            driver!(cuModuleLoadData(&mut module, ptx.as_ptr().cast()) => module_load_failed)?;
            let Some(handle) = NonNull::new(module.cast()) else {
                return Err(module_load_failed("null module"));
            };
            let mut module = GpuModule {
                module: Some(handle),
                functions: HashMap::new(),
            };
            // 入口在模块加载时解析，之后无需再切换上下文
            for entry in &image.entries {
                let name = CString::new(entry.as_str())
                    .map_err(|_| symbol_not_found(format!("`{entry}`")))?;
                let mut function: CUfunction = null_mut();
                let resolved = driver!(cuModuleGetFunction(
                    &mut function,
                    handle.as_ptr().cast(),
                    name.as_ptr(),
                ) => symbol_not_found);
                match resolved.map(|()| NonNull::new(function.cast())) {
                    Ok(Some(f)) => {
                        module.functions.insert(entry.clone(), GpuFunction(f));
                    }
                    Ok(None) | Err(_) => {
                        let _ = driver!(cuModuleUnload(handle.as_ptr().cast()) => module_load_failed);
                        return Err(symbol_not_found(format!("`{entry}` in loaded module")));
                    }
                }
            }
            Ok(module)
        })
    }

    fn unload_module(&self, ctx: &GpuContext, mut module: GpuModule) {
        module.functions.clear();
        if let Some(module) = module.module.take() {
            let result = ctx.apply(|_| {
                driver!(cuModuleUnload(module.as_ptr().cast()) => module_load_failed)
            });
            if let Err(e) = result {
                warn!("{e}")
            }
        }
    }

    fn get_function(&self, module: &GpuModule, name: &str) -> Result<GpuFunction, BackendError> {
        if module.module.is_none() {
            return Err(module_load_failed(format!("module of `{name}` unloaded")));
        }
        module
            .functions
            .get(name)
            .copied()
            .ok_or_else(|| symbol_not_found(format!("`{name}`")))
    }

    fn launch(
        &self,
        ctx: &GpuContext,
        _module: &GpuModule,
        function: &GpuFunction,
        geometry: &LaunchGeometry,
        params: &[GpuPtr],
    ) -> Result<(), BackendError> {
        let &LaunchGeometry { block, grid } = geometry;
        let mut params = params
            .iter()
            .map(|p| &p.0 as *const CUdeviceptr as *mut c_void)
            .collect::<Vec<_>>();
        ctx.apply(|_| {
            driver!(cuLaunchKernel(
                function.0.as_ptr().cast(),
                grid.x as _,
                grid.y as _,
                grid.z as _,
                block.x as _,
                block.y as _,
                block.z as _,
                0,
                null_mut(),
                params.as_mut_ptr(),
                null_mut(),
            ) => execution_failed)?;
            // 内核中的错误在同步时报告
            driver!(cuCtxSynchronize() => execution_failed)
        })
    }

    fn synchronize(&self, ctx: &GpuContext) -> Result<(), BackendError> {
        ctx.apply(|_| driver!(cuCtxSynchronize() => execution_failed))
    }
}

/// 按 (源码指纹, 计算能力) 缓存 PTX。
fn cache_ptx(code: &str, cc: Version) -> Result<Arc<Ptx>, (nvrtcResult, String)> {
    static CACHE: OnceLock<RwLock<HashMap<(blake3::Hash, Version), Arc<Ptx>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(Default::default);

    let key = (blake3::hash(code.as_bytes()), cc);
    if let Some(ptx) = cache.read().unwrap().get(&key) {
        return Ok(ptx.clone());
    }
    let (ptx, log) = Ptx::compile(code.to_string(), cc);
    match ptx {
        Ok(ptx) => {
            if !log.is_empty() {
                warn!("{log}");
            }

            let ptx = Arc::new(ptx);
            let _ = cache.write().unwrap().insert(key, ptx.clone());
            Ok(ptx)
        }
        Err(e) => Err((e, log)),
    }
}
