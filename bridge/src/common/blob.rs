use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    ops::Range,
    ptr::NonNull,
};

/// 一段对齐的、清零的主机存储，用作模拟设备的显存。
pub struct Blob {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Blob 独占其存储区域。
unsafe impl Send for Blob {}
unsafe impl Sync for Blob {}

impl Blob {
    /// 分配失败时返回 `None`。
    pub fn new(size: usize, alignment: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, alignment).ok()?;
        if layout.size() == 0 {
            return None;
        }
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// 存储区域的地址范围。
    #[inline]
    pub fn addr_range(&self) -> Range<usize> {
        let start = self.ptr.as_ptr() as usize;
        start..start + self.layout.size()
    }
}

impl Drop for Blob {
    #[inline]
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[test]
fn test_blob() {
    let blob = Blob::new(1024, 256).unwrap();
    assert_eq!(blob.len(), 1024);
    assert_eq!(blob.addr_range().start % 256, 0);
    assert!(Blob::new(0, 256).is_none());
    assert!(Blob::new(16, 3).is_none());
}
