use crate::{module_load_failed, BackendError, TargetArch};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// 降低步骤在工作目录中产出的模块文件名。
pub const MODULE_FILE: &str = "kernel.module";

/// 设备原生模块的文件形式。
///
/// `payload` 的内容由产出它的驱动解释，后端只依赖 `target` 和 `entries`。
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ModuleImage {
    pub version: u32,
    pub target: TargetArch,
    pub entries: Vec<String>,
    pub payload: String,
}

impl ModuleImage {
    pub const VERSION: u32 = 1;

    #[inline]
    pub fn new(target: TargetArch, entries: Vec<String>, payload: String) -> Self {
        Self {
            version: Self::VERSION,
            target,
            entries,
            payload,
        }
    }

    #[inline]
    pub fn has_entry(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e == name)
    }

    /// 写入 `<dir>/kernel.module`。
    pub fn write_to(&self, dir: &Path) -> Result<std::path::PathBuf, String> {
        let path = dir.join(MODULE_FILE);
        let bytes = serde_json::to_vec(self).map_err(|e| e.to_string())?;
        fs::write(&path, bytes).map_err(|e| format!("{}: {e}", path.display()))?;
        Ok(path)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BackendError> {
        let image = serde_json::from_slice::<Self>(bytes)
            .map_err(|e| module_load_failed(format!("corrupt module image: {e}")))?;
        if image.version != Self::VERSION {
            return Err(module_load_failed(format!(
                "module image version {} not supported",
                image.version
            )));
        }
        Ok(image)
    }

    /// 加载前检查模块是否为目标设备生成。
    pub fn check_target(&self, target: &TargetArch) -> Result<(), BackendError> {
        if &self.target == target {
            Ok(())
        } else {
            Err(module_load_failed(format!(
                "module built for {}, device is {target}",
                self.target
            )))
        }
    }
}
