use std::{error::Error, fmt};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    /// 驱动不可用或没有可用设备，启动期致命错误。
    DriverInit,
    DeviceNotFound,
    OutOfMemory,
    TransferFailed,
    CompileFailed,
    ModuleLoadFailed,
    SymbolNotFound,
    /// 参数缓冲区未绑定到目标设备。
    ArgumentNotBound,
    ArgsNotSupport,
    InvalidGeometry,
    ExecutionFailed,
    ShutDown,
}

#[derive(Clone, Debug)]
pub struct BackendError {
    pub kind: ErrorKind,
    pub info: String,
}

impl BackendError {
    /// 除驱动初始化失败以外的错误都只影响当前命令。
    #[inline]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::DriverInit)
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.info.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {}", self.kind, self.info)
        }
    }
}

impl Error for BackendError {}

pub(super) mod functions {
    use super::{BackendError, ErrorKind::*};

    macro_rules! builder {
        ($ty:ident: $name:ident $kind:expr) => {
            #[inline]
            pub fn $name(info: impl Into<String>) -> $ty {
                $ty {
                    kind: $kind,
                    info: info.into(),
                }
            }
        };
    }

    builder!(BackendError: driver_init        DriverInit      );
    builder!(BackendError: device_not_found   DeviceNotFound  );
    builder!(BackendError: out_of_memory      OutOfMemory     );
    builder!(BackendError: transfer_failed    TransferFailed  );
    builder!(BackendError: compile_failed     CompileFailed   );
    builder!(BackendError: module_load_failed ModuleLoadFailed);
    builder!(BackendError: symbol_not_found   SymbolNotFound  );
    builder!(BackendError: argument_not_bound ArgumentNotBound);
    builder!(BackendError: args_not_support   ArgsNotSupport  );
    builder!(BackendError: invalid_geometry   InvalidGeometry );
    builder!(BackendError: execution_failed   ExecutionFailed );
    builder!(BackendError: shut_down          ShutDown        );
}

#[test]
fn test_display() {
    use functions::*;

    let e = symbol_not_found("`mul` in module for nvptx64-nvidia-cuda/sm_80");
    assert_eq!(
        e.to_string(),
        "SymbolNotFound: `mul` in module for nvptx64-nvidia-cuda/sm_80"
    );
    assert!(!e.is_fatal());
    assert_eq!(shut_down("").to_string(), "ShutDown");
    assert!(driver_init("no device").is_fatal());
}
