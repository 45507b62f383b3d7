extern crate dirs_sys;

use std::path::PathBuf;

/// `%APPDATA%`.
pub fn config_dir() -> Option<PathBuf> {
    dirs_sys::known_folder_roaming_app_data()
}
