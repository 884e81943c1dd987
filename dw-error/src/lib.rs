//! Unified error handling for Drivewatch
//!
//! This crate provides the single error type used across all Drivewatch
//! components, plus the process exit codes of the daemon. It uses thiserror
//! for ergonomic error definitions with proper Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using DwError
pub type Result<T> = std::result::Result<T, DwError>;

/// Daemon exit codes.
///
/// These are part of the external interface and must stay stable; init
/// scripts and service units key off them.
pub mod exit {
    /// Normal exit
    pub const OK: i32 = 0;
    /// Command line did not parse
    pub const BADCMD: i32 = 1;
    /// Syntax error in config file
    pub const BADCONF: i32 = 2;
    /// Problem forking daemon
    pub const STARTUP: i32 = 3;
    /// Problem creating PID file
    pub const PID: i32 = 4;
    /// Config file does not exist
    pub const NOCONF: i32 = 5;
    /// Config file exists but cannot be read
    pub const READCONF: i32 = 6;
    /// Out of memory
    pub const NOMEM: i32 = 8;
    /// Internal error, should never happen
    pub const BADCODE: i32 = 10;
    /// A listed device cannot be monitored
    pub const BADDEV: i32 = 16;
    /// No devices to monitor
    pub const NODEV: i32 = 17;
    /// Abort on unexpected signal
    pub const SIGNAL: i32 = 254;
}

/// Unified error type for all Drivewatch operations
#[derive(thiserror::Error, Debug)]
pub enum DwError {
    // ========================================================================
    // I/O and File System Errors
    // ========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    #[error("Configuration file {path} not found")]
    ConfigMissing { path: PathBuf },

    #[error("Configuration file {path} is unreadable: {source}")]
    ConfigUnreadable {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Configuration file {file} line {lineno}: {reason}")]
    ConfigSyntax {
        file: String,
        lineno: u32,
        reason: String,
    },

    // ========================================================================
    // Device Access Errors
    // ========================================================================
    #[error("Failed to open device: {0}")]
    DeviceOpen(String),

    #[error("Device command failed: {0}")]
    DeviceIo(String),

    #[error("Device does not support {0}")]
    NotSupported(String),

    #[error("Device type unknown or unsupported: {0}")]
    UnknownDeviceType(String),

    // ========================================================================
    // State Persistence Errors
    // ========================================================================
    #[error("State file {path} has no parseable content")]
    StateFormat { path: PathBuf },

    // ========================================================================
    // Warning Dispatch Errors
    // ========================================================================
    #[error("Failed to run warning script: {0}")]
    NotifierSpawn(String),

    // ========================================================================
    // Generic Errors
    // ========================================================================
    #[error("{0}")]
    Generic(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DwError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a device I/O error from a string
    pub fn device(msg: impl Into<String>) -> Self {
        Self::DeviceIo(msg.into())
    }

    /// Create an unsupported-feature error from a string
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// True for transient device I/O failures which the caller should
    /// translate into a warning event rather than propagate.
    pub fn is_device_io(&self) -> bool {
        matches!(
            self,
            Self::DeviceOpen(_) | Self::DeviceIo(_) | Self::NotSupported(_)
        )
    }
}

impl From<String> for DwError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

impl From<&str> for DwError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
