use std::{env, env::temp_dir, path::PathBuf};

#[derive(Clone, Debug)]
pub struct Config {
    /// 已编译模块缓存容量。
    pub module_cache: usize,
    /// 默认工作目录的根，每个内核在其下拥有独立的子目录。
    pub work_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            module_cache: 16,
            work_root: Self::default_work_root(),
        }
    }
}

impl Config {
    pub const ENV_MODULE_CACHE: &'static str = "BRIDGE_MODULE_CACHE";
    pub const ENV_WORK_DIR: &'static str = "BRIDGE_WORK_DIR";

    /// 临时目录下按进程区分的默认工作目录根。
    ///
    /// 使用它的后端实例在其下各自占用一个子目录，关闭时删除。
    pub fn default_work_root() -> PathBuf {
        temp_dir().join(format!("bridge{:08x}", std::process::id()))
    }

    /// 以默认配置为基础，读取环境变量覆盖。无法解析的值被忽略。
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env::var(Self::ENV_MODULE_CACHE)
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
        {
            config.module_cache = n;
        }
        if let Some(dir) = env::var_os(Self::ENV_WORK_DIR).filter(|s| !s.is_empty()) {
            config.work_root = dir.into();
        }
        config
    }
}

#[cfg(test)]
mod test {
    use super::Config;

    #[test]
    fn test_default() {
        let config = Config::default();
        assert_eq!(config.module_cache, 16);
        assert!(config
            .work_root
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("bridge"));
    }

    #[test]
    fn test_from_env() {
        std::env::set_var(Config::ENV_MODULE_CACHE, "3");
        std::env::set_var(Config::ENV_WORK_DIR, "/tmp/bridge-env-test");
        let config = Config::from_env();
        std::env::remove_var(Config::ENV_MODULE_CACHE);
        std::env::remove_var(Config::ENV_WORK_DIR);

        assert_eq!(config.module_cache, 3);
        assert_eq!(config.work_root, std::path::Path::new("/tmp/bridge-env-test"));
    }
}
