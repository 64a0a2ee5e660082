//! 内核编译触发与已编译模块缓存。

use crate::{
    compile_failed,
    ir::{KernelIr, ModuleImage, MODULE_FILE},
    utils::ensure_dir,
    Backend, BackendError, Driver, TargetArch,
};
use log::{debug, trace};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::{atomic::Ordering::Relaxed, Arc},
};

/// 内核中间表示的内容指纹。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Fingerprint(blake3::Hash);

impl Fingerprint {
    #[inline]
    pub fn of(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes))
    }

    /// 用于目录名和日志的短形式。
    pub fn short(&self) -> String {
        self.0.to_hex()[..16].to_string()
    }
}

impl fmt::Display for Fingerprint {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

/// 携带指纹的内核。
#[derive(Clone, Debug)]
pub struct Kernel {
    ir: KernelIr,
    fingerprint: Fingerprint,
}

impl Kernel {
    pub fn new(ir: KernelIr) -> Result<Self, BackendError> {
        let fingerprint = Fingerprint::of(&ir.encode()?);
        Ok(Self { ir, fingerprint })
    }

    #[inline]
    pub fn ir(&self) -> &KernelIr {
        &self.ir
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.ir.name
    }

    #[inline]
    pub const fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

/// 已编译模块的缓存键：相同内容为相同目标只编译一次。
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ModuleKey {
    pub fingerprint: Fingerprint,
    pub target: TargetArch,
}

impl fmt::Display for ModuleKey {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.fingerprint.short(), self.target)
    }
}

/// 降低步骤的产物。
#[derive(Debug)]
pub struct CompiledModule {
    key: ModuleKey,
    path: PathBuf,
    image: ModuleImage,
}

impl CompiledModule {
    #[inline]
    pub fn key(&self) -> &ModuleKey {
        &self.key
    }

    /// 首次编译时模块文件的位置。
    ///
    /// 之后命中缓存的命令会在各自的工作目录中得到一份副本，这里的路径不随之改变。
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn image(&self) -> &ModuleImage {
        &self.image
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct CompileStats {
    pub hits: usize,
    pub misses: usize,
    pub cached: usize,
}

impl<D: Driver> Backend<D> {
    /// 内核在 `device` 上的默认工作目录。
    pub fn work_dir_for(&self, kernel: &Kernel, device: usize) -> Result<PathBuf, BackendError> {
        let target = self.0.device(device)?.target();
        Ok(self
            .0
            .config
            .work_root
            .join(format!("{}-{}", kernel.name(), kernel.fingerprint.short()))
            .join(format!("{}.{}", target.triple, target.cpu)))
    }

    /// 确保内核已为 `device` 的目标编译，返回已编译模块。
    ///
    /// 模块按 (指纹, 目标) 缓存，未命中时调用降低步骤在 `work_dir` 中产出模块文件。
    #[inline]
    pub fn ensure_compiled(
        &self,
        kernel: &Kernel,
        device: usize,
        work_dir: &Path,
    ) -> Result<Arc<CompiledModule>, BackendError> {
        self.compile(kernel, device, Some(work_dir)).map(|(m, _)| m)
    }

    pub fn compile_stats(&self) -> CompileStats {
        CompileStats {
            hits: self.0.hits.load(Relaxed),
            misses: self.0.misses.load(Relaxed),
            cached: self.0.compiled.lock().unwrap().len(),
        }
    }

    /// 返回已编译模块以及是否命中缓存。
    pub(crate) fn compile(
        &self,
        kernel: &Kernel,
        device: usize,
        work_dir: Option<&Path>,
    ) -> Result<(Arc<CompiledModule>, bool), BackendError> {
        self.0.check_open()?;
        let target = self.0.device(device)?.target();
        let key = ModuleKey {
            fingerprint: kernel.fingerprint,
            target: target.clone(),
        };
        let dir = match work_dir {
            Some(dir) => dir.to_path_buf(),
            None => self.work_dir_for(kernel, device)?,
        };
        let cached = self.0.compiled.lock().unwrap().get(&key).cloned();
        if let Some(module) = cached {
            self.0.hits.fetch_add(1, Relaxed);
            trace!("module {key} found in cache");
            place(&module, &dir)?;
            return Ok((module, true));
        }
        self.0.misses.fetch_add(1, Relaxed);

        debug!("compiling `{}` for {target} in {}", kernel.name(), dir.display());
        ensure_dir(&dir).map_err(compile_failed)?;
        let path = self.0.driver.lower(kernel.ir(), target, &dir)?;
        let bytes = fs::read(&path)
            .map_err(|e| compile_failed(format!("{}: {e}", path.display())))?;
        let image = ModuleImage::from_bytes(&bytes).map_err(|e| compile_failed(e.info))?;

        let module = Arc::new(CompiledModule {
            key: key.clone(),
            path,
            image,
        });
        let evicted = self.0.compiled.lock().unwrap().push(key, module.clone());
        if let Some((old, _)) = evicted.filter(|(old, _)| old != module.key()) {
            debug!("module {old} evicted");
            self.0.evict(&old);
        }
        Ok((module, false))
    }
}

/// 命中缓存时，模块文件也要出现在本次命令的工作目录中。
fn place(module: &CompiledModule, dir: &Path) -> Result<(), BackendError> {
    if dir.join(MODULE_FILE) == module.path {
        return Ok(());
    }
    ensure_dir(dir).map_err(compile_failed)?;
    module.image.write_to(dir).map_err(compile_failed)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{Fingerprint, Kernel};
    use crate::{
        common_cpu::{Cpu, CpuConfig},
        ir::{samples, KernelIr, ModuleImage, MODULE_FILE},
        Backend, Config, ErrorKind,
    };
    use digit_layout::types as ty;

    fn backend(cache: usize) -> (Backend<Cpu>, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            module_cache: cache,
            work_root: root.path().to_path_buf(),
        };
        let cpu = Cpu::new(CpuConfig {
            devices: 2,
            ..Default::default()
        });
        (Backend::initialize(cpu, config).unwrap(), root)
    }

    #[test]
    fn test_fingerprint() {
        let a = Kernel::new(samples::vec_add(ty::F32)).unwrap();
        let b = Kernel::new(samples::vec_add(ty::F32)).unwrap();
        let c = Kernel::new(samples::vec_add(ty::I32)).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().to_string().len(), 64);
        assert_eq!(a.fingerprint().short().len(), 16);
        assert_ne!(a.fingerprint(), Fingerprint::of(b""));
    }

    #[test]
    fn test_cache() {
        let (backend, root) = backend(4);
        let kernel = Kernel::new(samples::add_scalar()).unwrap();
        let dir = root.path().join("add");

        let m = backend.ensure_compiled(&kernel, 0, &dir).unwrap();
        assert_eq!(m.path(), dir.join(MODULE_FILE));
        assert!(m.path().is_file());
        assert!(m.image().has_entry("add"));
        assert_eq!(&m.key().target, backend.device(0).unwrap().target());

        let n = backend.ensure_compiled(&kernel, 0, &dir).unwrap();
        assert!(std::sync::Arc::ptr_eq(&m, &n));
        // 两个主机设备目标相同，共享模块
        backend.ensure_compiled(&kernel, 1, &dir).unwrap();

        let stats = backend.compile_stats();
        assert_eq!((stats.hits, stats.misses, stats.cached), (2, 1, 1));
        assert_eq!(backend.driver().lowered(), 1);
    }

    #[test]
    fn test_hit_in_another_dir() {
        let (backend, root) = backend(4);
        let kernel = Kernel::new(samples::add_scalar()).unwrap();
        let x = root.path().join("x");
        let y = root.path().join("y");

        let m = backend.ensure_compiled(&kernel, 0, &x).unwrap();
        std::fs::remove_dir_all(&x).unwrap();
        let n = backend.ensure_compiled(&kernel, 0, &y).unwrap();
        assert!(std::sync::Arc::ptr_eq(&m, &n));
        assert_eq!(n.path(), x.join(MODULE_FILE));
        assert_eq!(backend.driver().lowered(), 1);

        let bytes = std::fs::read(y.join(MODULE_FILE)).unwrap();
        assert_eq!(&ModuleImage::from_bytes(&bytes).unwrap(), n.image());
    }

    #[test]
    fn test_eviction() {
        let (backend, _root) = backend(1);
        let a = Kernel::new(samples::add_scalar()).unwrap();
        let b = Kernel::new(samples::group_index()).unwrap();
        for kernel in [&a, &b, &a] {
            let dir = backend.work_dir_for(kernel, 0).unwrap();
            assert!(dir.starts_with(&backend.config().work_root));
            backend.ensure_compiled(kernel, 0, &dir).unwrap();
        }
        let stats = backend.compile_stats();
        assert_eq!((stats.hits, stats.misses, stats.cached), (0, 3, 1));
    }

    #[test]
    fn test_compile_failed() {
        let (backend, root) = backend(4);
        let bad = KernelIr::new("bad").param("x", ty::U8, crate::ir::Access::ReadWrite);
        let kernel = Kernel::new(bad).unwrap_err();
        assert_eq!(kernel.kind, ErrorKind::CompileFailed);

        let bad = KernelIr::new("bad")
            .param("x", ty::I32, crate::ir::Access::ReadOnly)
            .stmt(crate::ir::Stmt::store(0, crate::ir::Expr::Int(0), crate::ir::Expr::Int(1)));
        let kernel = Kernel::new(bad).unwrap();
        let e = backend
            .ensure_compiled(&kernel, 0, &root.path().join("bad"))
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::CompileFailed);
        assert!(!e.is_fatal());
        assert_eq!(backend.compile_stats().cached, 0);

        let e = backend
            .ensure_compiled(&kernel, 3, root.path())
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::DeviceNotFound);
    }
}
