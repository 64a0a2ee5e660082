// #![deny(warnings)]

mod common;
mod handle;

pub mod command;
pub mod compile;
pub mod context;
pub mod ir;
pub mod launch;
pub mod memory;
pub mod transfer;

pub use command::{Command, Completion, DeviceOps};
pub use common::*;
pub use compile::{CompileStats, CompiledModule, Fingerprint, Kernel, ModuleKey};
pub use context::{Backend, DeviceDescriptor};
pub use launch::{KernelArgs, LaunchCommand, LaunchGeometry, LaunchReport, LaunchState};
pub use memory::MemObject;

#[cfg(any(use_cpu, test))]
pub use handle::common_cpu;

#[cfg(use_cuda)]
pub mod cuda {
    pub use crate::handle::cuda::*;
}

use ir::{KernelIr, ModuleImage};
use std::{
    fmt,
    hash::Hash,
    path::{Path, PathBuf},
};

/// 加速器原生驱动接口。
///
/// 后端通过这个特质把命令翻译为驱动调用。所有调用都是阻塞的，
/// 同一个上下文上的调用由后端串行化。
pub trait Driver: Send + Sync + Sized + 'static {
    /// 驱动层的设备句柄。
    type Device: Send + Sync;
    /// 绑定到一个设备的执行上下文。
    type Context: Send;
    /// 不透明的设备指针。
    type DevPtr: Copy + Eq + Hash + fmt::Debug + Send + Sync;
    /// 加载到上下文中的模块。
    type Module: Send;
    /// 从模块中解析出的入口。
    type Function: Send + Sync;

    /// 驱动名，也是操作表报告的设备名。
    fn name(&self) -> &'static str;

    /// 探测驱动并按序枚举设备，第 `i` 个描述符的序号必须是 `i`。
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor<Self>>, BackendError>;

    fn create_context(&self, device: &DeviceDescriptor<Self>)
        -> Result<Self::Context, BackendError>;
    fn destroy_context(&self, ctx: Self::Context);

    fn malloc(&self, ctx: &Self::Context, size: usize) -> Result<Self::DevPtr, BackendError>;
    fn free(&self, ctx: &Self::Context, ptr: Self::DevPtr);

    fn memcpy_h2d(
        &self,
        ctx: &Self::Context,
        dst: Self::DevPtr,
        offset: usize,
        src: &[u8],
    ) -> Result<(), BackendError>;
    fn memcpy_d2h(
        &self,
        ctx: &Self::Context,
        dst: &mut [u8],
        src: Self::DevPtr,
        offset: usize,
    ) -> Result<(), BackendError>;

    /// 把内核降低为 `target` 上可加载的模块，写入 `work_dir` 并返回文件路径。
    fn lower(
        &self,
        ir: &KernelIr,
        target: &TargetArch,
        work_dir: &Path,
    ) -> Result<PathBuf, BackendError>;

    fn load_module(
        &self,
        ctx: &Self::Context,
        image: &ModuleImage,
    ) -> Result<Self::Module, BackendError>;
    fn unload_module(&self, ctx: &Self::Context, module: Self::Module);

    /// 按名字解析入口，不存在时返回 [ErrorKind::SymbolNotFound]。
    fn get_function(&self, module: &Self::Module, name: &str)
        -> Result<Self::Function, BackendError>;

    /// 发射内核，`params` 与内核声明的参数一一对应。
    fn launch(
        &self,
        ctx: &Self::Context,
        module: &Self::Module,
        function: &Self::Function,
        geometry: &LaunchGeometry,
        params: &[Self::DevPtr],
    ) -> Result<(), BackendError>;

    fn synchronize(&self, ctx: &Self::Context) -> Result<(), BackendError>;
}

pub type PtrOf<D> = <D as Driver>::DevPtr;
