//! 调度器提交的命令与后端的操作表。

use crate::{
    Backend, BackendError, CompiledModule, Config, Driver, LaunchCommand, LaunchReport,
    MemObject, PtrOf,
};
use log::warn;
use std::{fmt, sync::Arc};

/// 调度器排好序的一条命令。
pub enum Command<D: Driver> {
    Allocate {
        object: Arc<MemObject<D>>,
        device: usize,
    },
    Free {
        object: Arc<MemObject<D>>,
        device: usize,
    },
    Write {
        object: Arc<MemObject<D>>,
        device: usize,
        offset: usize,
        data: Vec<u8>,
    },
    Read {
        object: Arc<MemObject<D>>,
        device: usize,
        offset: usize,
        len: usize,
    },
    Launch(LaunchCommand<D>),
}

/// 命令完成的结果。
pub enum Completion<D: Driver> {
    Bound(PtrOf<D>),
    Released,
    Written(usize),
    Read(Vec<u8>),
    Launched(LaunchReport),
}

impl<D: Driver> fmt::Debug for Completion<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Bound(ptr) => f.debug_tuple("Bound").field(ptr).finish(),
            Self::Released => write!(f, "Released"),
            Self::Written(n) => f.debug_tuple("Written").field(n).finish(),
            Self::Read(data) => f.debug_tuple("Read").field(&data.len()).finish(),
            Self::Launched(report) => f.debug_tuple("Launched").field(report).finish(),
        }
    }
}

impl<D: Driver> Command<D> {
    #[inline]
    pub fn is_launch(&self) -> bool {
        matches!(self, Self::Launch(_))
    }
}

/// 后端向调度器暴露的操作表。
pub trait DeviceOps<D: Driver>: Sized {
    fn device_name(&self) -> &'static str;
    fn init(driver: D, config: Config) -> Result<Self, BackendError>;
    fn alloc(&self, object: &MemObject<D>, device: usize) -> Result<PtrOf<D>, BackendError>;
    fn free(&self, object: &MemObject<D>, device: usize) -> Result<(), BackendError>;
    fn write(
        &self,
        object: &MemObject<D>,
        device: usize,
        offset: usize,
        src: &[u8],
    ) -> Result<(), BackendError>;
    fn read(
        &self,
        dst: &mut [u8],
        object: &MemObject<D>,
        device: usize,
        offset: usize,
    ) -> Result<(), BackendError>;
    /// 为一批命令中的发射命令触发编译，其他命令原样跳过。
    ///
    /// 返回与 `batch` 一一对应的结果，非发射命令为 `Ok(None)`。
    fn compile_submitted_kernels(
        &self,
        batch: &[Command<D>],
    ) -> Vec<Result<Option<Arc<CompiledModule>>, BackendError>>;
    fn run(&self, cmd: &LaunchCommand<D>) -> Result<LaunchReport, BackendError>;
}

impl<D: Driver> DeviceOps<D> for Backend<D> {
    #[inline]
    fn device_name(&self) -> &'static str {
        self.driver().name()
    }

    #[inline]
    fn init(driver: D, config: Config) -> Result<Self, BackendError> {
        Self::initialize(driver, config)
    }

    #[inline]
    fn alloc(&self, object: &MemObject<D>, device: usize) -> Result<PtrOf<D>, BackendError> {
        self.bind(object, device)
    }

    #[inline]
    fn free(&self, object: &MemObject<D>, device: usize) -> Result<(), BackendError> {
        self.release(object, device)
    }

    #[inline]
    fn write(
        &self,
        object: &MemObject<D>,
        device: usize,
        offset: usize,
        src: &[u8],
    ) -> Result<(), BackendError> {
        self.upload_at(object, device, offset, src)
    }

    #[inline]
    fn read(
        &self,
        dst: &mut [u8],
        object: &MemObject<D>,
        device: usize,
        offset: usize,
    ) -> Result<(), BackendError> {
        self.download_at(dst, object, device, offset)
    }

    fn compile_submitted_kernels(
        &self,
        batch: &[Command<D>],
    ) -> Vec<Result<Option<Arc<CompiledModule>>, BackendError>> {
        batch
            .iter()
            .map(|cmd| match cmd {
                Command::Launch(launch) => self
                    .compile(&launch.kernel, launch.device, launch.work_dir.as_deref())
                    .map(|(module, _)| Some(module)),
                _ => Ok(None),
            })
            .collect()
    }

    #[inline]
    fn run(&self, cmd: &LaunchCommand<D>) -> Result<LaunchReport, BackendError> {
        self.launch(cmd)
    }
}

impl<D: Driver> Backend<D> {
    /// 执行一条命令。失败只影响这条命令。
    pub fn submit(&self, cmd: &Command<D>) -> Result<Completion<D>, BackendError> {
        match cmd {
            Command::Allocate { object, device } => self.bind(object, *device).map(Completion::Bound),
            Command::Free { object, device } => {
                self.release(object, *device).map(|()| Completion::Released)
            }
            Command::Write {
                object,
                device,
                offset,
                data,
            } => self
                .upload_at(object, *device, *offset, data)
                .map(|()| Completion::Written(data.len())),
            Command::Read {
                object,
                device,
                offset,
                len,
            } => {
                let mut data = vec![0u8; *len];
                self.download_at(&mut data, object, *device, *offset)
                    .map(|()| Completion::Read(data))
            }
            Command::Launch(launch) => self.launch(launch).map(Completion::Launched),
        }
    }

    /// 按序执行一批命令，每条命令独立成败。
    pub fn submit_batch(&self, batch: &[Command<D>]) -> Vec<Result<Completion<D>, BackendError>> {
        batch
            .iter()
            .enumerate()
            .map(|(i, cmd)| {
                let ans = self.submit(cmd);
                if let Err(e) = &ans {
                    warn!("command #{i} in batch failed: {e}");
                }
                ans
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::{Command, Completion, DeviceOps};
    use crate::{
        common_cpu::{Cpu, CpuConfig},
        ir::samples,
        Backend, Config, ErrorKind, Kernel, LaunchCommand,
    };
    use std::sync::Arc;

    fn backend() -> (Backend<Cpu>, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            work_root: root.path().to_path_buf(),
            ..Config::default()
        };
        let backend = <Backend<Cpu> as DeviceOps<Cpu>>::init(Cpu::new(CpuConfig::default()), config);
        (backend.unwrap(), root)
    }

    #[test]
    fn test_ops() {
        let (backend, _root) = backend();
        assert_eq!(backend.device_name(), "cpu");

        let buf = backend.create_buffer(8).unwrap();
        let ptr = DeviceOps::alloc(&backend, &buf, 0).unwrap();
        assert_eq!(DeviceOps::alloc(&backend, &buf, 0).unwrap(), ptr);
        backend.write(&buf, 0, 4, &[1, 2, 3, 4]).unwrap();
        let mut data = [0u8; 4];
        DeviceOps::read(&backend, &mut data, &buf, 0, 4).unwrap();
        assert_eq!(data, [1, 2, 3, 4]);
        DeviceOps::free(&backend, &buf, 0).unwrap();
        DeviceOps::free(&backend, &buf, 0).unwrap();
        assert_eq!(backend.outstanding_allocations(), 0);
    }

    #[test]
    fn test_batch() {
        let (backend, _root) = backend();
        let a = backend.create_buffer(4).unwrap();
        let b = backend.create_buffer(4).unwrap();
        let c = backend.create_buffer(4).unwrap();
        let kernel = Arc::new(Kernel::new(samples::add_scalar()).unwrap());
        let one = 1i32.to_ne_bytes().to_vec();

        let batch = vec![
            Command::Allocate { object: a.clone(), device: 0 },
            Command::Allocate { object: b.clone(), device: 0 },
            Command::Allocate { object: c.clone(), device: 0 },
            Command::Write { object: a.clone(), device: 0, offset: 0, data: one.clone() },
            Command::Write { object: b.clone(), device: 0, offset: 0, data: one },
            Command::Launch(
                LaunchCommand::new(kernel.clone())
                    .with_arg(&a)
                    .with_arg(&b)
                    .with_arg(&c),
            ),
            Command::Launch(LaunchCommand::new(kernel).with_entry("mul")),
            Command::Read { object: c.clone(), device: 0, offset: 0, len: 4 },
            Command::Free { object: c.clone(), device: 0 },
        ];

        let compiled = backend.compile_submitted_kernels(&batch);
        assert_eq!(compiled.len(), batch.len());
        assert!(compiled[..5].iter().all(|r| matches!(r, Ok(None))));
        assert!(matches!(&compiled[5], Ok(Some(_))));
        assert!(matches!(&compiled[6], Ok(Some(_))));
        assert_eq!(backend.compile_stats().misses, 1);

        let results = backend.submit_batch(&batch);
        assert!(matches!(results[0], Ok(Completion::Bound(_))));
        assert!(matches!(results[3], Ok(Completion::Written(4))));
        let Ok(Completion::Launched(report)) = &results[5] else {
            panic!("{:?}", results[5])
        };
        assert!(report.cache_hit);
        assert_eq!(results[6].as_ref().unwrap_err().kind, ErrorKind::SymbolNotFound);
        let Ok(Completion::Read(data)) = &results[7] else {
            panic!("{:?}", results[7])
        };
        assert_eq!(data[..], 2i32.to_ne_bytes());
        assert!(matches!(results[8], Ok(Completion::Released)));
        assert_eq!(backend.outstanding_allocations(), 2);
    }
}
