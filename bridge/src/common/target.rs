use serde::{Deserialize, Serialize};
use std::fmt;

/// 设备的编译目标：目标三元组与微架构标签。
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct TargetArch {
    pub triple: String,
    pub cpu: String,
}

impl TargetArch {
    #[inline]
    pub fn new(triple: impl Into<String>, cpu: impl Into<String>) -> Self {
        Self {
            triple: triple.into(),
            cpu: cpu.into(),
        }
    }

    /// 运行本进程的主机。
    pub fn host() -> Self {
        Self::new(
            format!("{}-unknown-{}", std::env::consts::ARCH, std::env::consts::OS),
            "generic",
        )
    }
}

impl fmt::Display for TargetArch {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.triple, self.cpu)
    }
}

#[test]
fn test_display() {
    let arch = TargetArch::new("nvptx64-nvidia-cuda", "sm_80");
    assert_eq!(arch.to_string(), "nvptx64-nvidia-cuda/sm_80");
    assert!(TargetArch::host().triple.contains(std::env::consts::OS));
}
