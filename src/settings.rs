use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Value-stack slots reserved per call frame.
const SLOTS_PER_FRAME: usize = 256;
const DEFAULT_FRAMES_MAX: usize = 64;

/// Interpreter limits and diagnostic switches, loadable from a JSON file.
/// Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Maximum call depth; exceeding it is a stack overflow.
    pub frames_max: usize,
    /// Maximum value-stack depth.
    pub stack_max: usize,
    /// Log every instruction as it executes.
    pub trace_execution: bool,
    /// Log the disassembly of each compiled chunk.
    pub print_code: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            frames_max: DEFAULT_FRAMES_MAX,
            stack_max: DEFAULT_FRAMES_MAX * SLOTS_PER_FRAME,
            trace_execution: false,
            print_code: false,
        }
    }
}

/// Load settings from a JSON file.
pub fn load_settings(path: &Path) -> Result<Settings, AppError> {
    let data = std::fs::read_to_string(path).map_err(|e| AppError::SettingsError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let settings: Settings = serde_json::from_str(&data).map_err(|e| AppError::SettingsError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    if settings.frames_max == 0 || settings.stack_max == 0 {
        return Err(AppError::SettingsError {
            path: path.display().to_string(),
            message: "frames_max and stack_max must be positive".to_string(),
        });
    }
    tracing::debug!(?settings, "loaded settings");
    Ok(settings)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.frames_max, 64);
        assert_eq!(settings.stack_max, 64 * 256);
        assert!(!settings.trace_execution);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = std::env::temp_dir().join("zap_test_settings_partial");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, r#"{ "frames_max": 8, "print_code": true }"#).unwrap();

        let loaded = load_settings(&path).expect("should load");
        assert_eq!(loaded.frames_max, 8);
        assert!(loaded.print_code);
        assert_eq!(loaded.stack_max, Settings::default().stack_max);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_round_trip() {
        let settings = Settings { trace_execution: true, ..Settings::default() };
        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn test_missing_and_invalid_files() {
        let missing = std::env::temp_dir().join("zap_test_settings_missing/settings.json");
        assert!(matches!(load_settings(&missing), Err(AppError::SettingsError { .. })));

        let dir = std::env::temp_dir().join("zap_test_settings_invalid");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, r#"{ "frames_max": 0 }"#).unwrap();
        let err = load_settings(&path).unwrap_err();
        assert!(err.to_string().contains("must be positive"), "{err}");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
