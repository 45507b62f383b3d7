use std::path::PathBuf;

#[cfg(target_os = "windows")]
pub(crate) mod dirs_win;

#[cfg(target_os = "windows")]
pub(crate) use dirs_win as dirs;

#[cfg(not(target_os = "windows"))]
pub(crate) mod dirs_unix;

#[cfg(not(target_os = "windows"))]
pub(crate) use dirs_unix as dirs;

const CONFIG_FILE: &str = "wsproxy/config.toml";

/// Per-user configuration file, e.g. `~/.config/wsproxy/config.toml`.
pub(crate) fn user_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_FILE))
}
