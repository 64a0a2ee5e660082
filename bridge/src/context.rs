//! 设备上下文管理。

use crate::{
    compile::{CompiledModule, ModuleKey},
    device_not_found, driver_init, shut_down, BackendError, Config, DeviceLimits, Driver,
    TargetArch,
};
use log::{debug, info, warn};
use lru::LruCache;
use std::{
    collections::HashMap,
    fmt, fs,
    mem::take,
    num::NonZeroUsize,
    path::PathBuf,
    sync::{
        atomic::{
            AtomicBool, AtomicU64, AtomicUsize,
            Ordering::{AcqRel, Acquire, Relaxed},
        },
        Arc, Mutex,
    },
};

/// 一个物理设备。初始化后不可变。
pub struct DeviceDescriptor<D: Driver> {
    index: usize,
    handle: D::Device,
    name: String,
    target: TargetArch,
    limits: DeviceLimits,
}

impl<D: Driver> DeviceDescriptor<D> {
    #[inline]
    pub fn new(
        index: usize,
        handle: D::Device,
        name: impl Into<String>,
        target: TargetArch,
        limits: DeviceLimits,
    ) -> Self {
        Self {
            index,
            handle,
            name: name.into(),
            target,
            limits,
        }
    }

    #[inline]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub const fn handle(&self) -> &D::Device {
        &self.handle
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub const fn target(&self) -> &TargetArch {
        &self.target
    }

    #[inline]
    pub const fn limits(&self) -> &DeviceLimits {
        &self.limits
    }
}

impl<D: Driver> fmt::Debug for DeviceDescriptor<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("target", &self.target)
            .field("limits", &self.limits)
            .finish()
    }
}

/// 设备后端实例。
///
/// 持有驱动、设备列表和每个设备的执行上下文。可以克隆并在线程间共享，
/// 最后一个句柄释放时自动关闭。
pub struct Backend<D: Driver>(pub(crate) Arc<Internal<D>>);

impl<D: Driver> Clone for Backend<D> {
    #[inline]
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

pub(crate) struct Internal<D: Driver> {
    pub(crate) driver: D,
    pub(crate) config: Config,
    /// 实例独占的临时工作目录，关闭时删除。
    scratch: Option<PathBuf>,
    pub(crate) devices: Vec<DeviceDescriptor<D>>,
    /// 每个设备一个上下文槽，锁即上下文的串行化访问。
    slots: Vec<Mutex<Option<Slot<D>>>>,
    closed: AtomicBool,
    allocations: Mutex<HashMap<(usize, D::DevPtr), usize>>,
    pub(crate) compiled: Mutex<LruCache<ModuleKey, Arc<CompiledModule>>>,
    pub(crate) hits: AtomicUsize,
    pub(crate) misses: AtomicUsize,
    next_object: AtomicU64,
}

pub(crate) struct Slot<D: Driver> {
    pub context: D::Context,
    modules: HashMap<ModuleKey, D::Module>,
}

impl<D: Driver> Slot<D> {
    /// 确保模块已加载到本上下文。
    pub fn loaded(
        &mut self,
        driver: &D,
        compiled: &CompiledModule,
    ) -> Result<(&D::Context, &D::Module), BackendError> {
        let key = compiled.key();
        if !self.modules.contains_key(key) {
            let module = driver.load_module(&self.context, compiled.image())?;
            debug!("module {key} loaded");
            self.modules.insert(key.clone(), module);
        }
        Ok((&self.context, &self.modules[key]))
    }

    fn unload(&mut self, driver: &D, key: &ModuleKey) {
        if let Some(module) = self.modules.remove(key) {
            driver.unload_module(&self.context, module);
            debug!("module {key} unloaded");
        }
    }
}

impl<D: Driver> Backend<D> {
    /// 初始化驱动，枚举设备，并在 0 号设备上创建执行上下文。
    ///
    /// 驱动不可用或没有设备时返回 [ErrorKind::DriverInit](crate::ErrorKind::DriverInit)，
    /// 这是启动期的致命错误。
    pub fn initialize(driver: D, mut config: Config) -> Result<Self, BackendError> {
        let devices = driver.enumerate().map_err(|e| {
            driver_init(format!("{} driver unavailable: {}", driver.name(), e.info))
        })?;
        if devices.is_empty() {
            return Err(driver_init(format!("{}: no device found", driver.name())));
        }
        if let Some((i, d)) = devices.iter().enumerate().find(|(i, d)| d.index != *i) {
            return Err(driver_init(format!(
                "device #{i} enumerated with index {}",
                d.index
            )));
        }

        let context = driver
            .create_context(&devices[0])
            .map_err(|e| driver_init(format!("context on {}: {}", devices[0].name, e.info)))?;
        let mut slots = Vec::with_capacity(devices.len());
        slots.push(Mutex::new(Some(Slot {
            context,
            modules: HashMap::new(),
        })));
        slots.resize_with(devices.len(), || Mutex::new(None));

        let scratch = (config.work_root == Config::default_work_root()).then(|| {
            static INSTANCE: AtomicUsize = AtomicUsize::new(0);
            config.work_root = config
                .work_root
                .join(INSTANCE.fetch_add(1, Relaxed).to_string());
            config.work_root.clone()
        });
        let cache = NonZeroUsize::new(config.module_cache).unwrap_or(NonZeroUsize::MIN);
        info!(
            "{} initialized: {} device(s), context on {} ({})",
            driver.name(),
            devices.len(),
            devices[0].name,
            devices[0].target,
        );
        Ok(Self(Arc::new(Internal {
            driver,
            config,
            scratch,
            devices,
            slots,
            closed: AtomicBool::new(false),
            allocations: Default::default(),
            compiled: Mutex::new(LruCache::new(cache)),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            next_object: AtomicU64::new(1),
        })))
    }

    #[inline]
    pub fn driver(&self) -> &D {
        &self.0.driver
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.0.config
    }

    #[inline]
    pub fn devices(&self) -> &[DeviceDescriptor<D>] {
        &self.0.devices
    }

    #[inline]
    pub fn device(&self, index: usize) -> Result<&DeviceDescriptor<D>, BackendError> {
        self.0.device(index)
    }

    #[inline]
    pub fn is_shut_down(&self) -> bool {
        self.0.closed.load(Acquire)
    }

    /// 尚未释放的设备分配数。
    #[inline]
    pub fn outstanding_allocations(&self) -> usize {
        self.0.allocations.lock().unwrap().len()
    }

    /// 释放所有设备分配、卸载模块并销毁上下文。可重复调用。
    #[inline]
    pub fn shutdown(&self) {
        self.0.shutdown()
    }

    #[inline]
    pub(crate) fn owns(&self, backend: *const Internal<D>) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.0), backend)
    }
}

impl<D: Driver> Internal<D> {
    pub fn device(&self, index: usize) -> Result<&DeviceDescriptor<D>, BackendError> {
        self.devices.get(index).ok_or_else(|| {
            device_not_found(format!(
                "device #{index}, {} enumerated",
                self.devices.len()
            ))
        })
    }

    #[inline]
    pub fn next_object_id(&self) -> u64 {
        self.next_object.fetch_add(1, Relaxed)
    }

    pub fn check_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Acquire) {
            Err(shut_down(format!("{} backend", self.driver.name())))
        } else {
            Ok(())
        }
    }

    /// 在 `device` 的上下文上执行 `f`，期间独占该上下文。
    ///
    /// 非 0 号设备的上下文在第一次使用时创建。
    pub fn apply<T>(
        &self,
        device: usize,
        f: impl FnOnce(&D, &mut Slot<D>) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let desc = self.device(device)?;
        let mut guard = self.slots[device].lock().unwrap();
        self.check_open()?;
        if guard.is_none() {
            let context = self.driver.create_context(desc)?;
            info!("context created on {} ({})", desc.name, desc.target);
            *guard = Some(Slot {
                context,
                modules: HashMap::new(),
            });
        }
        let Some(slot) = guard.as_mut() else {
            unreachable!()
        };
        f(&self.driver, slot)
    }

    /// 在 `device` 上加载 `compiled` 并使用它。
    ///
    /// 模块在此之前已被缓存淘汰时，用完立即卸载，不留在上下文中。
    pub fn with_module<T>(
        &self,
        device: usize,
        compiled: &CompiledModule,
        f: impl FnOnce(&D, &D::Context, &D::Module) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        self.apply(device, |driver, slot| {
            let ans = {
                let (ctx, module) = slot.loaded(driver, compiled)?;
                f(driver, ctx, module)
            };
            let key = compiled.key();
            if !self.compiled.lock().unwrap().contains(key) {
                slot.unload(driver, key)
            }
            ans
        })
    }

    /// 分配设备存储并登记。
    pub fn alloc(&self, device: usize, size: usize) -> Result<D::DevPtr, BackendError> {
        self.apply(device, |driver, slot| {
            let ptr = driver.malloc(&slot.context, size)?;
            self.allocations
                .lock()
                .unwrap()
                .insert((device, ptr), size);
            debug!("{size} bytes allocated on device #{device} at {ptr:?}");
            Ok(ptr)
        })
    }

    /// 释放登记过的设备存储。后端已关闭时存储已被回收，返回 `false`。
    pub fn free(&self, device: usize, ptr: D::DevPtr) -> Result<bool, BackendError> {
        let ans = self.apply(device, |driver, slot| {
            let found = self
                .allocations
                .lock()
                .unwrap()
                .remove(&(device, ptr))
                .is_some();
            if found {
                driver.free(&slot.context, ptr);
                debug!("{ptr:?} freed on device #{device}");
            }
            Ok(found)
        });
        match ans {
            Err(e) if e.kind == crate::ErrorKind::ShutDown => Ok(false),
            ans => ans,
        }
    }

    /// 从所有已创建的上下文中卸载被缓存淘汰的模块。
    pub fn evict(&self, key: &ModuleKey) {
        for slot in &self.slots {
            let mut guard = slot.lock().unwrap();
            if let Some(slot) = guard.as_mut() {
                slot.unload(&self.driver, key)
            }
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, AcqRel) {
            return;
        }
        let mut released = 0;
        for (device, slot) in self.slots.iter().enumerate() {
            let mut guard = slot.lock().unwrap();
            let Some(Slot { context, modules }) = guard.take() else {
                continue;
            };
            let ptrs = {
                let mut allocations = self.allocations.lock().unwrap();
                let ptrs = allocations
                    .keys()
                    .filter(|(d, _)| *d == device)
                    .copied()
                    .collect::<Vec<_>>();
                for key in &ptrs {
                    allocations.remove(key);
                }
                ptrs
            };
            for (_, ptr) in ptrs {
                self.driver.free(&context, ptr);
                released += 1;
            }
            for (_, module) in modules {
                self.driver.unload_module(&context, module);
            }
            self.driver.destroy_context(context);
        }
        let leaked = take(&mut *self.allocations.lock().unwrap()).len();
        if leaked > 0 {
            warn!("{leaked} allocation(s) without context dropped at shutdown");
        }
        self.compiled.lock().unwrap().clear();
        if let Some(dir) = &self.scratch {
            if dir.exists() {
                if let Err(e) = fs::remove_dir_all(dir) {
                    warn!("failed to remove {}: {e}", dir.display())
                }
            }
            // 其他实例仍在使用时父目录非空，删除失败无妨
            if let Some(root) = dir.parent() {
                let _ = fs::remove_dir(root);
            }
        }
        info!(
            "{} backend shut down, {released} allocation(s) released",
            self.driver.name()
        );
    }
}

impl<D: Driver> Drop for Internal<D> {
    #[inline]
    fn drop(&mut self) {
        self.shutdown()
    }
}

#[cfg(test)]
mod test {
    use super::Backend;
    use crate::{
        common_cpu::{Cpu, CpuConfig},
        ir::samples,
        Config, Driver, ErrorKind, Kernel,
    };

    fn cpu(devices: usize) -> Cpu {
        Cpu::new(CpuConfig {
            devices,
            ..Default::default()
        })
    }

    #[test]
    fn test_initialize() {
        let backend = Backend::initialize(cpu(2), Config::default()).unwrap();
        assert_eq!(backend.devices().len(), 2);
        for (i, d) in backend.devices().iter().enumerate() {
            assert_eq!(d.index(), i);
            assert_eq!(d.handle().index, i);
        }
        assert_eq!(backend.device(1).unwrap().name(), "cpu1");
        assert_eq!(backend.device(2).unwrap_err().kind, ErrorKind::DeviceNotFound);
        assert_eq!(backend.driver().contexts_created(), 1);
        assert!(!backend.is_shut_down());
    }

    #[test]
    fn test_no_device() {
        let Err(e) = Backend::initialize(cpu(0), Config::default()) else {
            panic!("initialized without device")
        };
        assert_eq!(e.kind, ErrorKind::DriverInit);
        assert!(e.is_fatal());
    }

    #[test]
    fn test_lazy_context() {
        let backend = Backend::initialize(cpu(3), Config::default()).unwrap();
        let buf = backend.create_buffer(16).unwrap();
        backend.bind(&buf, 2).unwrap();
        assert_eq!(backend.driver().contexts_created(), 2);
        backend.bind(&buf, 2).unwrap();
        assert_eq!(backend.driver().contexts_created(), 2);
    }

    #[test]
    fn test_shutdown() {
        let backend = Backend::initialize(cpu(2), Config::default()).unwrap();
        let a = backend.create_buffer(64).unwrap();
        let b = backend.create_buffer(64).unwrap();
        backend.bind(&a, 0).unwrap();
        backend.bind(&a, 1).unwrap();
        backend.bind(&b, 0).unwrap();
        assert_eq!(backend.outstanding_allocations(), 3);

        backend.shutdown();
        backend.shutdown();
        assert!(backend.is_shut_down());
        assert_eq!(backend.outstanding_allocations(), 0);
        assert_eq!(backend.driver().contexts_destroyed(), 2);
        assert_eq!(backend.driver().live_allocations(), 0);

        assert_eq!(backend.bind(&b, 1).unwrap_err().kind, ErrorKind::ShutDown);
        assert_eq!(backend.create_buffer(4).unwrap_err().kind, ErrorKind::ShutDown);
        // 关闭后释放是空操作
        backend.release(&a, 0).unwrap();
        drop(a);
    }

    #[test]
    fn test_independent_instances() {
        let x = Backend::initialize(cpu(1), Config::default()).unwrap();
        let y = Backend::initialize(cpu(1), Config::default()).unwrap();
        let buf = x.create_buffer(8).unwrap();
        assert_eq!(y.bind(&buf, 0).unwrap_err().kind, ErrorKind::ArgsNotSupport);
        y.shutdown();
        x.bind(&buf, 0).unwrap();
        assert_eq!(x.outstanding_allocations(), 1);
    }

    #[test]
    fn test_scratch_removed() {
        let backend = Backend::initialize(cpu(1), Config::default()).unwrap();
        let root = backend.config().work_root.clone();
        assert!(root.starts_with(Config::default_work_root()));
        assert_ne!(root, Config::default_work_root());

        let kernel = Kernel::new(samples::add_scalar()).unwrap();
        let dir = backend.work_dir_for(&kernel, 0).unwrap();
        let module = backend.ensure_compiled(&kernel, 0, &dir).unwrap();
        assert!(module.path().is_file());

        backend.shutdown();
        assert!(!root.exists());
    }

    #[test]
    fn test_user_root_kept() {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            work_root: root.path().to_path_buf(),
            ..Config::default()
        };
        let backend = Backend::initialize(cpu(1), config).unwrap();
        assert_eq!(backend.config().work_root, root.path());

        let kernel = Kernel::new(samples::add_scalar()).unwrap();
        let dir = backend.work_dir_for(&kernel, 0).unwrap();
        let module = backend.ensure_compiled(&kernel, 0, &dir).unwrap();
        backend.shutdown();
        assert!(module.path().is_file());
    }

    #[test]
    fn test_evicted_module_not_kept() {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            module_cache: 1,
            work_root: root.path().to_path_buf(),
        };
        let backend = Backend::initialize(cpu(1), config).unwrap();
        let a = Kernel::new(samples::add_scalar()).unwrap();
        let b = Kernel::new(samples::group_index()).unwrap();
        let dir_a = backend.work_dir_for(&a, 0).unwrap();
        let dir_b = backend.work_dir_for(&b, 0).unwrap();

        let compiled = backend.ensure_compiled(&a, 0, &dir_a).unwrap();
        // `b` 挤出 `a`，之后仍持有 `a` 的调用者使用它
        backend.ensure_compiled(&b, 0, &dir_b).unwrap();
        let loaded = |backend: &Backend<Cpu>| {
            backend.0.slots[0]
                .lock()
                .unwrap()
                .as_ref()
                .map_or(0, |slot| slot.modules.len())
        };
        assert_eq!(loaded(&backend), 0);

        backend
            .0
            .with_module(0, &compiled, |driver, _, module| {
                driver.get_function(module, "add").map(drop)
            })
            .unwrap();
        assert_eq!(loaded(&backend), 0);

        let cached = backend.ensure_compiled(&b, 0, &dir_b).unwrap();
        backend
            .0
            .with_module(0, &cached, |_, _, _| Ok(()))
            .unwrap();
        assert_eq!(loaded(&backend), 1);
    }
}
