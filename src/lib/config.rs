//! Driver selection shared by every binary.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use serde::Serialize;
use tracing::info;

use crate::driver::{Driver, Timeout};
use crate::kernel::ModuleLocator;
use crate::level_zero::LevelZeroDriver;
use crate::reference::{ReferenceConfig, ReferenceDriver};
use crate::tracer::{call_counter, TracingDriver};

/// Default module directory for the Level Zero backend.
pub const DEFAULT_KERNEL_DIR: &str = "kernels";

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriverKind {
    /// In-process software device
    #[default]
    Reference,
    /// System Level Zero loader
    LevelZero,
}

impl DriverKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DriverKind::Reference => "reference",
            DriverKind::LevelZero => "level-zero",
        }
    }
}

#[derive(Args, Debug, Clone, Default, Serialize)]
pub struct DriverArgs {
    /// Driver backend
    #[arg(long, value_enum, default_value_t = DriverKind::Reference)]
    pub driver: DriverKind,

    /// Path to libze_loader (level-zero only)
    #[arg(long)]
    pub loader: Option<PathBuf>,

    /// JSON file describing reference devices
    #[arg(long)]
    pub device_config: Option<PathBuf>,

    /// Directory holding the SPIR-V modules
    #[arg(long)]
    pub kernel_dir: Option<PathBuf>,

    /// Count driver API calls and log them on exit
    #[arg(long)]
    pub trace_api: bool,

    /// Host synchronize timeout in milliseconds (0 waits forever)
    #[arg(long, default_value = "0")]
    pub sync_timeout_ms: u64,
}

/// Per-entry-point call counts collected by `--trace-api`.
pub type CallCounts = Arc<Mutex<BTreeMap<&'static str, u64>>>;

/// An opened driver and, when tracing, its call counts.
pub struct OpenedDriver {
    pub driver: Arc<dyn Driver>,
    pub calls: Option<CallCounts>,
}

impl OpenedDriver {
    /// Logs the collected call counts, if tracing was requested.
    pub fn log_calls(&self, tag: &str) {
        let Some(calls) = &self.calls else {
            return;
        };
        let calls = calls.lock().unwrap_or_else(|e| e.into_inner());
        let total: u64 = calls.values().sum();
        info!("[{}:API] {} driver calls", tag, total);
        for (name, count) in calls.iter() {
            info!("[{}:API]   {:<44} {}", tag, name, count);
        }
    }
}

impl DriverArgs {
    pub fn timeout(&self) -> Timeout {
        match self.sync_timeout_ms {
            0 => Timeout::Infinite,
            ms => Timeout::After(Duration::from_millis(ms)),
        }
    }

    pub fn locator(&self) -> ModuleLocator {
        match (&self.kernel_dir, self.driver) {
            (Some(dir), _) => ModuleLocator::new(dir),
            (None, DriverKind::LevelZero) => ModuleLocator::new(DEFAULT_KERNEL_DIR),
            (None, DriverKind::Reference) => ModuleLocator::builtin(),
        }
    }

    /// Flags that reproduce this selection in a child process.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["--driver".to_string(), self.driver.as_str().to_string()];
        let paths = [
            ("--loader", &self.loader),
            ("--device-config", &self.device_config),
            ("--kernel-dir", &self.kernel_dir),
        ];
        for (flag, path) in paths {
            if let Some(path) = path {
                args.push(flag.to_string());
                args.push(path.display().to_string());
            }
        }
        if self.trace_api {
            args.push("--trace-api".to_string());
        }
        if self.sync_timeout_ms != 0 {
            args.push("--sync-timeout-ms".to_string());
            args.push(self.sync_timeout_ms.to_string());
        }
        args
    }

    /// Opens the selected backend, wrapped in a call counter if requested.
    pub fn open(&self) -> Result<OpenedDriver> {
        let driver: Arc<dyn Driver> = match self.driver {
            DriverKind::Reference => {
                let config = match &self.device_config {
                    Some(path) => ReferenceConfig::load(path)?,
                    None => ReferenceConfig::default(),
                };
                Arc::new(ReferenceDriver::from_config(config))
            }
            DriverKind::LevelZero => {
                let driver = match &self.loader {
                    Some(path) => LevelZeroDriver::load_from(path),
                    None => LevelZeroDriver::load(),
                }
                .context("Failed to load the Level Zero loader")?;
                Arc::new(driver)
            }
        };

        if !self.trace_api {
            return Ok(OpenedDriver {
                driver,
                calls: None,
            });
        }

        let traced = TracingDriver::new(driver);
        let (desc, calls) = call_counter();
        let tracer = traced.create_tracer(desc);
        traced.enable_tracer(tracer)?;
        Ok(OpenedDriver {
            driver: Arc::new(traced),
            calls: Some(calls),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn test_forwarded_args() {
        let args = DriverArgs {
            device_config: Some(PathBuf::from("devices.json")),
            trace_api: true,
            ..DriverArgs::default()
        };
        assert_eq!(
            args.to_args(),
            vec![
                "--driver",
                "reference",
                "--device-config",
                "devices.json",
                "--trace-api"
            ]
        );
    }

    #[test]
    fn test_timeout_zero_is_infinite() {
        assert_eq!(DriverArgs::default().timeout(), Timeout::Infinite);
        let args = DriverArgs {
            sync_timeout_ms: 250,
            ..DriverArgs::default()
        };
        assert_eq!(args.timeout(), Timeout::After(Duration::from_millis(250)));
    }

    #[test]
    fn test_open_traced_reference() {
        let args = DriverArgs {
            trace_api: true,
            ..DriverArgs::default()
        };
        let opened = args.open().unwrap();
        Runtime::init(opened.driver.clone()).unwrap();
        let calls = opened.calls.as_ref().unwrap().lock().unwrap();
        assert_eq!(calls.get("zeInit"), Some(&1));
    }

    #[test]
    fn test_missing_loader_path() {
        let args = DriverArgs {
            driver: DriverKind::LevelZero,
            loader: Some(PathBuf::from("/nonexistent/libze_loader.so")),
            ..DriverArgs::default()
        };
        assert!(args.open().is_err());
    }
}
