//! 内核发射翻译。

use crate::{
    args_not_support, argument_not_bound, invalid_geometry, symbol_not_found, Backend,
    ir::Access, BackendError, DeviceLimits, Dims3, Driver, Kernel, MemObject,
};
use log::{trace, warn};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

/// 发射命令的状态。
///
/// 每个状态表示正在进行的步骤：`Compiling` 编译，`Loaded` 加载模块并解析入口，
/// `ParamsBound` 组装参数并提交。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LaunchState {
    Queued,
    Compiling,
    Loaded,
    ParamsBound,
    Submitted,
    Completed,
    Failed,
}

impl LaunchState {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub const fn can_transition(self, next: Self) -> bool {
        use LaunchState::*;
        matches!(
            (self, next),
            (Queued, Compiling)
                | (Compiling, Loaded)
                | (Loaded, ParamsBound)
                | (ParamsBound, Submitted)
                | (Submitted, Completed)
                | (Compiling | Loaded | ParamsBound, Failed)
        )
    }
}

struct Progress<'a> {
    entry: &'a str,
    state: LaunchState,
}

impl<'a> Progress<'a> {
    fn new(entry: &'a str) -> Self {
        Self {
            entry,
            state: LaunchState::Queued,
        }
    }

    fn advance(&mut self, next: LaunchState) {
        debug_assert!(self.state.can_transition(next), "{:?} -> {next:?}", self.state);
        trace!("launch `{}`: {:?} -> {next:?}", self.entry, self.state);
        self.state = next;
    }

    fn fail(&mut self, e: BackendError) -> BackendError {
        warn!("launch `{}` failed while {:?}: {e}", self.entry, self.state);
        self.advance(LaunchState::Failed);
        e
    }
}

/// 原生发射参数。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LaunchGeometry {
    /// 工作组大小。
    pub block: Dims3,
    /// 工作组数量。
    pub grid: Dims3,
}

impl LaunchGeometry {
    /// 工作组大小与数量直接对应原生的块与网格，不做缩放。
    ///
    /// 超出设备限制的几何不会被截断，而是被拒绝。
    pub fn translate(
        local: Dims3,
        groups: Dims3,
        limits: &DeviceLimits,
    ) -> Result<Self, BackendError> {
        let geometry = Self {
            block: local,
            grid: groups,
        };
        let err = |what: String| invalid_geometry(format!("local {local} groups {groups}: {what}"));

        for dim in 0..3 {
            let (b, g) = (local.get(dim), groups.get(dim));
            if b == 0 || g == 0 {
                return Err(err(format!("empty dimension {dim}")));
            }
            if b > limits.max_block.get(dim) {
                return Err(err(format!(
                    "block dimension {dim} over {}",
                    limits.max_block.get(dim)
                )));
            }
            if g > limits.max_grid.get(dim) {
                return Err(err(format!(
                    "grid dimension {dim} over {}",
                    limits.max_grid.get(dim)
                )));
            }
            if b.checked_mul(g).is_none() {
                return Err(err(format!("global size overflows in dimension {dim}")));
            }
        }
        match local.x.checked_mul(local.y).and_then(|n| n.checked_mul(local.z)) {
            Some(n) if n <= limits.max_threads_block => Ok(geometry),
            _ => Err(err(format!(
                "more than {} threads per block",
                limits.max_threads_block
            ))),
        }
    }

    /// 每个维度上的工作项总数。
    #[inline]
    pub fn global(&self) -> Dims3 {
        Dims3::new(
            self.block.x * self.grid.x,
            self.block.y * self.grid.y,
            self.block.z * self.grid.z,
        )
    }

    #[inline]
    pub fn threads_per_block(&self) -> usize {
        self.block.product()
    }
}

/// 有序的内核参数，顺序与内核声明的参数一致。
pub struct KernelArgs<D: Driver>(Vec<Arc<MemObject<D>>>);

impl<D: Driver> Default for KernelArgs<D> {
    #[inline]
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<D: Driver> Clone for KernelArgs<D> {
    #[inline]
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<D: Driver> KernelArgs<D> {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, object: Arc<MemObject<D>>) {
        self.0.push(object)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &MemObject<D>> {
        self.0.iter().map(|a| &**a)
    }
}

impl<D: Driver> FromIterator<Arc<MemObject<D>>> for KernelArgs<D> {
    #[inline]
    fn from_iter<T: IntoIterator<Item = Arc<MemObject<D>>>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// 一次内核调用。由调度器创建，后端只消费一次。
pub struct LaunchCommand<D: Driver> {
    pub kernel: Arc<Kernel>,
    /// 入口名，默认为内核名。
    pub entry: String,
    pub args: KernelArgs<D>,
    pub local: Dims3,
    pub groups: Dims3,
    pub device: usize,
    /// 模块文件的工作目录，缺省时使用 [Backend::work_dir_for]。
    pub work_dir: Option<PathBuf>,
}

impl<D: Driver> LaunchCommand<D> {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self {
            entry: kernel.name().into(),
            kernel,
            args: KernelArgs::new(),
            local: Dims3::ONE,
            groups: Dims3::ONE,
            device: 0,
            work_dir: None,
        }
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = entry.into();
        self
    }

    pub fn with_arg(mut self, object: &Arc<MemObject<D>>) -> Self {
        self.args.push(object.clone());
        self
    }

    pub fn with_local(mut self, local: impl Into<Dims3>) -> Self {
        self.local = local.into();
        self
    }

    pub fn with_groups(mut self, groups: impl Into<Dims3>) -> Self {
        self.groups = groups.into();
        self
    }

    pub fn on_device(mut self, device: usize) -> Self {
        self.device = device;
        self
    }

    pub fn in_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LaunchReport {
    pub geometry: LaunchGeometry,
    pub state: LaunchState,
    /// 模块是否来自缓存。
    pub cache_hit: bool,
}

impl<D: Driver> Backend<D> {
    /// 编译、加载并发射内核，返回时内核已执行完毕。
    ///
    /// 任何一步失败都只使本命令失败。参数未绑定、入口不存在或几何非法时不会调用驱动的发射。
    pub fn launch(&self, cmd: &LaunchCommand<D>) -> Result<LaunchReport, BackendError> {
        use LaunchState::*;

        let mut progress = Progress::new(&cmd.entry);
        progress.advance(Compiling);
        let (compiled, cache_hit) = self
            .compile(&cmd.kernel, cmd.device, cmd.work_dir.as_deref())
            .map_err(|e| progress.fail(e))?;

        progress.advance(Loaded);
        if !compiled.image().has_entry(&cmd.entry) {
            return Err(progress.fail(symbol_not_found(format!(
                "`{}` in module {}",
                cmd.entry,
                compiled.key()
            ))));
        }
        self.0
            .with_module(cmd.device, &compiled, |driver, _, module| {
                driver.get_function(module, &cmd.entry).map(drop)
            })
            .map_err(|e| progress.fail(e))?;

        progress.advance(ParamsBound);
        let geometry = self
            .params_check(cmd)
            .and_then(|_| {
                let limits = self.0.device(cmd.device)?.limits();
                LaunchGeometry::translate(cmd.local, cmd.groups, limits)
            })
            .map_err(|e| progress.fail(e))?;

        // 按对象序号加锁，发射期间参数的存储不会被释放
        let mut objects = cmd.args.iter().collect::<Vec<_>>();
        objects.sort_unstable_by_key(|o| o.id());
        objects.dedup_by_key(|o| o.id());
        let tables = objects
            .into_iter()
            .map(|o| (o.id(), o.table()))
            .collect::<HashMap<_, _>>();
        let params = cmd
            .args
            .iter()
            .enumerate()
            .map(|(i, o)| {
                tables[&o.id()].get(&cmd.device).copied().ok_or_else(|| {
                    argument_not_bound(format!(
                        "argument #{i} (buffer #{}) of `{}` on device #{}",
                        o.id(),
                        cmd.entry,
                        cmd.device
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| progress.fail(e))?;

        // 函数与发射在同一次上下文占用中完成，期间模块不会被卸载
        self.0
            .with_module(cmd.device, &compiled, |driver, ctx, module| {
                let function = driver.get_function(module, &cmd.entry)?;
                driver.launch(ctx, module, &function, &geometry, &params)?;
                driver.synchronize(ctx)
            })
            .map_err(|e| progress.fail(e))?;
        drop(tables);

        progress.advance(Submitted);
        progress.advance(Completed);
        Ok(LaunchReport {
            geometry,
            state: progress.state,
            cache_hit,
        })
    }

    fn params_check(&self, cmd: &LaunchCommand<D>) -> Result<(), BackendError> {
        let declared = cmd.kernel.ir().params.len();
        if cmd.args.len() != declared {
            return Err(args_not_support(format!(
                "`{}` declares {declared} parameter(s), {} given",
                cmd.entry,
                cmd.args.len()
            )));
        }
        cmd.args.iter().try_for_each(|o| self.check_owner(o))?;

        // 被写入的参数不能同时出现在其他位置
        let params = &cmd.kernel.ir().params;
        for (i, (o, p)) in cmd.args.iter().zip(params).enumerate() {
            if p.access != Access::ReadWrite {
                continue;
            }
            let twin = (0..cmd.args.len()).find(|&j| j != i && cmd.args.0[j].id() == o.id());
            if let Some(j) = twin {
                return Err(args_not_support(format!(
                    "buffer #{} passed to `{}` as both argument #{i} ({}, written) and #{j} ({})",
                    o.id(),
                    cmd.entry,
                    p.name,
                    params[j].name,
                )));
            }
        }
        Ok(())
    }
}
