mod blob;
mod calculator;
mod config;
mod dims;
mod error;
mod target;

pub use config::Config;
pub use dims::{DeviceLimits, Dims3};
pub use error::{functions::*, BackendError, ErrorKind};
pub use target::TargetArch;

#[allow(unused_imports)]
pub(crate) use {blob::Blob, calculator::FreeList};

pub mod utils {
    use std::path::Path;

    /// 合法的 C 标识符，用作内核与参数名。
    pub fn is_identifier(name: &str) -> bool {
        let mut chars = name.chars();
        matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
            && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
    }

    /// 创建工作目录，失败时给出路径信息。
    pub(crate) fn ensure_dir(dir: &Path) -> Result<(), String> {
        std::fs::create_dir_all(dir).map_err(|e| format!("{}: {e}", dir.display()))
    }

    #[test]
    fn test_identifier() {
        assert!(is_identifier("add"));
        assert!(is_identifier("_vec_add2"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("2add"));
        assert!(!is_identifier("add-1"));
    }
}
