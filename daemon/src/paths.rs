/// Canonical file locations for PlantWatch data.
///
/// Everything lives in one directory, by default `<config dir>/PlantWatch/`
/// (`%APPDATA%\PlantWatch\` on Windows):
///   - config.toml       Settings and game profiles.
///   - status.toml       Written by the daemon for overlays and scripts.
///   - templates/        Reference images for the vision sensor.
///   - debug_frame.png   Latest captured region while debug mode is on.
///
/// Passing `--config <file>` moves the whole set next to that file.
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "PlantWatch";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";
pub const TEMPLATES_DIR_NAME: &str = "templates";
pub const DEBUG_FRAME_FILE_NAME: &str = "debug_frame.png";

/// Returns the PlantWatch application data directory.  Falls back to the
/// working directory when the platform reports no config directory.
pub fn app_data_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppPaths {
    root: PathBuf,
    config_file: PathBuf,
}

impl AppPaths {
    /// The default layout under [`app_data_dir`].
    pub fn default_location() -> Self {
        let root = app_data_dir();
        Self { config_file: root.join(CONFIG_FILE_NAME), root }
    }

    /// Uses `config_file` and keeps the other files beside it. A relative
    /// path is resolved against the working directory, so the config file
    /// always has a parent directory to watch.
    pub fn from_config_file(config_file: PathBuf) -> Self {
        let config_file = if config_file.has_root() {
            config_file
        } else {
            match std::env::current_dir() {
                Ok(cwd) => cwd.join(config_file),
                Err(_) => config_file,
            }
        };
        let root = match config_file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let config_file = match config_file.file_name() {
            Some(name) => root.join(name),
            None => config_file,
        };
        Self { root, config_file }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn status_file(&self) -> PathBuf {
        self.root.join(STATUS_FILE_NAME)
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root.join(TEMPLATES_DIR_NAME)
    }

    pub fn debug_frame_file(&self) -> PathBuf {
        self.root.join(DEBUG_FRAME_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_ends_with_plantwatch() {
        let dir = app_data_dir();
        assert_eq!(dir.file_name().unwrap(), "PlantWatch");
    }

    #[test]
    fn default_config_file_has_correct_name() {
        let paths = AppPaths::default_location();
        assert_eq!(paths.config_file().file_name().unwrap(), CONFIG_FILE_NAME);
    }

    #[test]
    fn all_files_share_the_root() {
        let paths = AppPaths::default_location();
        assert_eq!(paths.config_file().parent(), Some(paths.root()));
        assert_eq!(paths.status_file().parent(), Some(paths.root()));
        assert_eq!(paths.templates_dir().parent(), Some(paths.root()));
        assert_eq!(paths.debug_frame_file().parent(), Some(paths.root()));
    }

    #[test]
    fn custom_config_file_moves_the_root() {
        let paths = AppPaths::from_config_file(PathBuf::from("/srv/pw/settings.toml"));
        assert_eq!(paths.root(), Path::new("/srv/pw"));
        assert_eq!(paths.config_file(), Path::new("/srv/pw/settings.toml"));
        assert_eq!(paths.status_file(), Path::new("/srv/pw").join(STATUS_FILE_NAME));
    }

    #[test]
    fn bare_file_name_uses_working_dir() {
        let cwd = std::env::current_dir().unwrap();
        let paths = AppPaths::from_config_file(PathBuf::from("config.toml"));
        assert_eq!(paths.root(), cwd);
        assert_eq!(paths.config_file(), cwd.join("config.toml"));
    }

    #[test]
    fn relative_config_file_has_a_watchable_parent() {
        for given in ["settings.toml", "sub/settings.toml"] {
            let paths = AppPaths::from_config_file(PathBuf::from(given));
            let parent = paths.config_file().parent().unwrap();
            assert!(!parent.as_os_str().is_empty(), "{given}");
            assert_eq!(parent, paths.root(), "{given}");
            assert!(paths.root().has_root(), "{given}");
        }
    }
}
