//! 主机与设备间的同步拷贝。

use crate::{transfer_failed, Backend, BackendError, Driver, MemObject};

impl<D: Driver> Backend<D> {
    /// 把 `src` 拷贝到 `dst` 在 `device` 上的存储起点。返回时拷贝已完成。
    #[inline]
    pub fn upload(&self, dst: &MemObject<D>, device: usize, src: &[u8]) -> Result<(), BackendError> {
        self.upload_at(dst, device, 0, src)
    }

    /// 把 `src` 在 `device` 上的存储拷贝到 `dst_host`。返回时拷贝已完成。
    #[inline]
    pub fn download(
        &self,
        dst_host: &mut [u8],
        src: &MemObject<D>,
        device: usize,
    ) -> Result<(), BackendError> {
        self.download_at(dst_host, src, device, 0)
    }

    pub fn upload_at(
        &self,
        dst: &MemObject<D>,
        device: usize,
        offset: usize,
        src: &[u8],
    ) -> Result<(), BackendError> {
        self.check_owner(dst)?;
        check_range(dst, offset, src.len())?;
        // 拷贝期间持有对象锁，存储不会被并发释放
        let ptrs = dst.table();
        let &ptr = ptrs.get(&device).ok_or_else(|| not_bound(dst, device))?;
        self.0.apply(device, |driver, slot| {
            driver.memcpy_h2d(&slot.context, ptr, offset, src)
        })
    }

    pub fn download_at(
        &self,
        dst: &mut [u8],
        src: &MemObject<D>,
        device: usize,
        offset: usize,
    ) -> Result<(), BackendError> {
        self.check_owner(src)?;
        check_range(src, offset, dst.len())?;
        let ptrs = src.table();
        let &ptr = ptrs.get(&device).ok_or_else(|| not_bound(src, device))?;
        self.0.apply(device, |driver, slot| {
            driver.memcpy_d2h(&slot.context, dst, ptr, offset)
        })
    }
}

fn check_range<D: Driver>(
    object: &MemObject<D>,
    offset: usize,
    len: usize,
) -> Result<(), BackendError> {
    match offset.checked_add(len) {
        Some(end) if end <= object.size() => Ok(()),
        _ => Err(transfer_failed(format!(
            "{len} bytes at offset {offset} exceeds buffer #{} of {} bytes",
            object.id(),
            object.size(),
        ))),
    }
}

fn not_bound<D: Driver>(object: &MemObject<D>, device: usize) -> BackendError {
    transfer_failed(format!(
        "buffer #{} not bound on device #{device}",
        object.id()
    ))
}

#[cfg(test)]
mod test {
    use crate::{
        common_cpu::{Cpu, CpuConfig},
        Backend, Config, ErrorKind,
    };
    use rand::Rng;

    fn backend() -> Backend<Cpu> {
        let cpu = Cpu::new(CpuConfig {
            devices: 2,
            ..Default::default()
        });
        Backend::initialize(cpu, Config::default()).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let backend = backend();
        let mut rng = rand::thread_rng();
        for n in [1, 3, 255, 4096, 10000] {
            let data = (0..n).map(|_| rng.gen::<u8>()).collect::<Vec<_>>();
            let buf = backend.create_buffer(n + rng.gen_range(0..64)).unwrap();
            for device in 0..2 {
                backend.bind(&buf, device).unwrap();
                backend.upload(&buf, device, &data).unwrap();
                let mut back = vec![0u8; n];
                backend.download(&mut back, &buf, device).unwrap();
                assert_eq!(back, data);
            }
        }
    }

    #[test]
    fn test_offset() {
        let backend = backend();
        let buf = backend.create_buffer(8).unwrap();
        backend.bind(&buf, 0).unwrap();
        backend.upload(&buf, 0, &[1; 8]).unwrap();
        backend.upload_at(&buf, 0, 6, &[9, 9]).unwrap();

        let mut all = [0u8; 8];
        backend.download(&mut all, &buf, 0).unwrap();
        assert_eq!(all, [1, 1, 1, 1, 1, 1, 9, 9]);

        let mut tail = [0u8; 3];
        backend.download_at(&mut tail, &buf, 0, 5).unwrap();
        assert_eq!(tail, [1, 9, 9]);
    }

    #[test]
    fn test_checks() {
        let backend = backend();
        let buf = backend.create_buffer(4).unwrap();

        let e = backend.upload(&buf, 0, &[0; 4]).unwrap_err();
        assert_eq!(e.kind, ErrorKind::TransferFailed);

        backend.bind(&buf, 0).unwrap();
        let e = backend.upload(&buf, 0, &[0; 5]).unwrap_err();
        assert_eq!(e.kind, ErrorKind::TransferFailed);
        let e = backend.upload_at(&buf, 0, usize::MAX, &[0]).unwrap_err();
        assert_eq!(e.kind, ErrorKind::TransferFailed);
        let e = backend.download_at(&mut [0; 2], &buf, 0, 3).unwrap_err();
        assert_eq!(e.kind, ErrorKind::TransferFailed);

        // 另一个设备上没有存储
        let e = backend.download(&mut [0; 4], &buf, 1).unwrap_err();
        assert_eq!(e.kind, ErrorKind::TransferFailed);
    }
}
