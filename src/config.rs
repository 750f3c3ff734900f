use std::{path::PathBuf, time::Duration};

use exerciser_core::emulated::EmulatedConfig;

/// Everything that controls a single run of the exerciser
#[derive(Debug, Clone)]
pub struct ExerciserConfig {
    /// Only run cases whose name contains this string
    pub filter: Option<String>,
    /// Timeout for a single command
    pub timeout: Duration,
    /// Number of entries of both admin rings
    pub admin_depth: u16,
    /// Number of entries of both I/O rings
    pub io_depth: u16,
    /// Directory for per case dump files, written when a case fails
    pub dump_dir: Option<PathBuf>,
    /// Continue with the remaining cases after a failure
    pub keep_going: bool,
    pub device: EmulatedConfig,
}

impl Default for ExerciserConfig {
    fn default() -> Self {
        Self {
            filter: None,
            timeout: Duration::from_millis(1000),
            admin_depth: 16,
            io_depth: 64,
            dump_dir: None,
            keep_going: false,
            device: EmulatedConfig::default(),
        }
    }
}

impl ExerciserConfig {
    /// `true` if the case called `name` passes the filter
    pub fn selects(&self, name: &str) -> bool {
        self.filter
            .as_deref()
            .map_or(true, |filter| name.contains(filter))
    }
}
