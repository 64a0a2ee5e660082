//! 逻辑缓冲区与设备存储的绑定。

use crate::{
    args_not_support, context::Internal, Backend, BackendError, Driver, PtrOf,
};
use log::warn;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

/// 逻辑缓冲区。
///
/// 在每个使用过它的设备上各有一份存储，设备序号到设备指针的映射只由
/// [Backend::bind] 和 [Backend::release] 修改。对象释放时归还所有设备存储。
pub struct MemObject<D: Driver> {
    id: u64,
    size: usize,
    backend: Weak<Internal<D>>,
    ptrs: Mutex<HashMap<usize, PtrOf<D>>>,
}

impl<D: Driver> MemObject<D> {
    #[inline]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// 对象在 `device` 上的存储，未绑定时为 `None`。
    #[inline]
    pub fn device_ptr(&self, device: usize) -> Option<PtrOf<D>> {
        self.table().get(&device).copied()
    }

    /// 已绑定的设备序号，升序。
    pub fn bound_devices(&self) -> Vec<usize> {
        let mut ans = self.table().keys().copied().collect::<Vec<_>>();
        ans.sort_unstable();
        ans
    }

    #[inline]
    pub(crate) fn table(&self) -> MutexGuard<HashMap<usize, PtrOf<D>>> {
        self.ptrs.lock().unwrap()
    }
}

impl<D: Driver> fmt::Debug for MemObject<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemObject")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("devices", &self.bound_devices())
            .finish()
    }
}

impl<D: Driver> Drop for MemObject<D> {
    fn drop(&mut self) {
        let ptrs = self.ptrs.get_mut().unwrap();
        if ptrs.is_empty() {
            return;
        }
        let Some(backend) = self.backend.upgrade() else {
            return;
        };
        for (device, ptr) in ptrs.drain() {
            if let Err(e) = backend.free(device, ptr) {
                warn!("buffer #{} leaks on device #{device}: {e}", self.id)
            }
        }
    }
}

impl<D: Driver> Backend<D> {
    /// 创建 `size` 字节的逻辑缓冲区，此时不分配任何设备存储。
    pub fn create_buffer(&self, size: usize) -> Result<Arc<MemObject<D>>, BackendError> {
        self.0.check_open()?;
        if size == 0 {
            return Err(args_not_support("zero-sized buffer"));
        }
        Ok(Arc::new(MemObject {
            id: self.0.next_object_id(),
            size,
            backend: Arc::downgrade(&self.0),
            ptrs: Default::default(),
        }))
    }

    /// 确保 `object` 在 `device` 上有存储并返回设备指针。
    ///
    /// 每个 (对象, 设备) 在对象生命期内只分配一次，重复绑定返回同一个指针。
    pub fn bind(&self, object: &MemObject<D>, device: usize) -> Result<PtrOf<D>, BackendError> {
        self.check_owner(object)?;
        self.0.check_open()?;
        self.0.device(device)?;

        let mut ptrs = object.table();
        if let Some(&ptr) = ptrs.get(&device) {
            return Ok(ptr);
        }
        let ptr = self.0.alloc(device, object.size)?;
        ptrs.insert(device, ptr);
        Ok(ptr)
    }

    /// 释放 `object` 在 `device` 上的存储。未绑定时什么也不做。
    pub fn release(&self, object: &MemObject<D>, device: usize) -> Result<(), BackendError> {
        self.check_owner(object)?;
        let mut ptrs = object.table();
        if let Some(ptr) = ptrs.remove(&device) {
            self.0.free(device, ptr)?;
        }
        Ok(())
    }

    pub(crate) fn check_owner(&self, object: &MemObject<D>) -> Result<(), BackendError> {
        if self.owns(object.backend.as_ptr()) {
            Ok(())
        } else {
            Err(args_not_support(format!(
                "buffer #{} belongs to another backend",
                object.id
            )))
        }
    }
}
