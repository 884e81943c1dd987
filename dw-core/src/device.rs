//! Transport abstraction over monitored block devices.
//!
//! The daemon never builds raw ATA/SCSI/NVMe commands itself; it talks to a
//! per-transport *port* which hands back decoded telemetry. The port traits
//! here are the integration seam for the platform I/O layer, and everything
//! above them is testable against scripted implementations.

use dw_error::{DwError, Result};

/// Number of entries in the ATA SMART attribute table.
pub const NUM_ATA_ATTRIBUTES: usize = 30;

/// NVMe broadcast namespace id.
pub const NVME_BROADCAST_NSID: u32 = 0xffff_ffff;

// ============================================================================
// ATA telemetry
// ============================================================================

/// One slot of the ATA SMART attribute table as reported by the drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AtaAttribute {
    pub id: u8,
    pub flags: u16,
    pub current: u8,
    pub worst: u8,
    pub raw: [u8; 6],
    pub reserv: u8,
}

impl AtaAttribute {
    /// Prefailure vs usage classification bit.
    pub fn is_prefailure(&self) -> bool {
        self.flags & 0x0001 != 0
    }

    /// Raw value: six little-endian bytes packed into a u64.
    pub fn raw_value(&self) -> u64 {
        u64::from(self.raw[0])
            | u64::from(self.raw[1]) << 8
            | u64::from(self.raw[2]) << 16
            | u64::from(self.raw[3]) << 24
            | u64::from(self.raw[4]) << 32
            | u64::from(self.raw[5]) << 40
    }

    pub fn set_raw_value(&mut self, raw: u64) {
        for (i, b) in self.raw.iter_mut().enumerate() {
            *b = (raw >> (8 * i)) as u8;
        }
    }
}

/// Decoded SMART READ DATA response.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtaSmartValues {
    pub attributes: [AtaAttribute; NUM_ATA_ATTRIBUTES],
    pub offline_collection_status: u8,
    pub self_test_exec_status: u8,
    /// Offline data collection capability byte (word 367 of the data block).
    pub offline_collection_capability: u8,
}

impl AtaSmartValues {
    pub fn find_attribute(&self, id: u8) -> Option<usize> {
        if id == 0 {
            return None;
        }
        self.attributes.iter().position(|a| a.id == id)
    }

    pub fn supports_offline_immediate(&self) -> bool {
        self.offline_collection_capability & 0x01 != 0
    }

    pub fn supports_self_test(&self) -> bool {
        self.offline_collection_capability & 0x10 != 0
    }

    pub fn supports_conveyance_test(&self) -> bool {
        self.offline_collection_capability & 0x20 != 0
    }

    pub fn supports_selective_test(&self) -> bool {
        self.offline_collection_capability & 0x40 != 0
    }
}

/// Offline data collection currently running.
pub fn offline_collection_in_progress(status: u8) -> bool {
    status & 0x7f == 0x03
}

/// Self-test execution status reports a test in progress.
pub fn self_test_in_progress(status: u8) -> bool {
    status >> 4 == 0xf
}

/// One entry of the SMART threshold table.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtaThresholdEntry {
    pub id: u8,
    pub threshold: u8,
}

/// Decoded SMART READ THRESHOLDS response.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtaThresholds {
    pub entries: [AtaThresholdEntry; NUM_ATA_ATTRIBUTES],
}

/// Evaluation of an attribute against its threshold slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrState {
    NonExisting,
    NoThreshold,
    Ok,
    FailedNow,
}

/// Classify one attribute table slot. The threshold table is parallel to
/// the value table; a slot only counts when the ids agree.
pub fn attribute_state(
    attr: &AtaAttribute,
    index: usize,
    thresholds: &AtaThresholds,
) -> AttrState {
    if attr.id == 0 {
        return AttrState::NonExisting;
    }
    let thres = &thresholds.entries[index];
    if thres.id != attr.id || thres.threshold == 0 || thres.threshold == 0xff {
        return AttrState::NoThreshold;
    }
    if attr.current <= thres.threshold && attr.current >= 1 {
        return AttrState::FailedNow;
    }
    AttrState::Ok
}

/// SMART support as declared by IDENTIFY DEVICE words 82-83.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SmartSupport {
    Supported,
    NotSupported,
    /// Words 82-83 don't specify
    #[default]
    Unknown,
}

/// Identity and geometry from IDENTIFY DEVICE.
#[derive(Debug, Clone, Default)]
pub struct AtaIdentity {
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub capacity_bytes: u64,
    pub sectors: u64,
    /// 0 = unknown, 1 = SSD, >1 = rotation rate in rpm
    pub rotation_rate: i32,
    /// Formatted world wide name, if reported
    pub wwn: Option<String>,
    pub smart_support: SmartSupport,
    pub smart_enabled: bool,
    /// ATA security LOCKED|ENABLED|SUPPORTED all set
    pub security_locked: bool,
}

/// SMART RETURN STATUS result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Passed,
    Failed,
}

/// ATA CHECK POWER MODE result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtaPowerMode {
    Sleep,
    Standby,
    StandbyY,
    Idle,
    IdleA,
    IdleB,
    IdleC,
    Active,
    ActiveIdle,
    Unknown(u8),
}

impl AtaPowerMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sleep => "SLEEP",
            Self::Standby => "STANDBY",
            Self::StandbyY => "STANDBY_Y",
            Self::Idle => "IDLE",
            Self::IdleA => "IDLE_A",
            Self::IdleB => "IDLE_B",
            Self::IdleC => "IDLE_C",
            Self::Active | Self::ActiveIdle => "ACTIVE or IDLE",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    /// Raw power condition code, for change logging.
    pub fn code(&self) -> u8 {
        match self {
            Self::Sleep => 0xfe, // reported via aborted command; synthetic code
            Self::Standby => 0x00,
            Self::StandbyY => 0x01,
            Self::Idle => 0x80,
            Self::IdleA => 0x81,
            Self::IdleB => 0x82,
            Self::IdleC => 0x83,
            Self::Active => 0x40,
            Self::ActiveIdle => 0xff,
            Self::Unknown(c) => *c,
        }
    }

    pub fn is_fully_awake(&self) -> bool {
        matches!(self, Self::Active | Self::ActiveIdle)
    }
}

/// On-open device setting requested by an `-e` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtaFeature {
    /// None disables AAM, Some sets the level 0..=254
    Aam(Option<u8>),
    /// None disables APM, Some sets the level 1..=254
    Apm(Option<u8>),
    ReadLookahead(bool),
    WriteCache(bool),
    Dsn(bool),
    /// Standby timer value 0..=255
    StandbyTimer(u8),
    SecurityFreeze,
}

/// Self-test kinds an ATA drive can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtaTestKind {
    OfflineImmediate,
    Short,
    Long,
    Conveyance,
}

/// Span selection mode for a selective self-test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectiveMode {
    Next,
    Redo,
    Continue,
}

/// Failed self-test bookkeeping from a self-test log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelfTestSummary {
    pub error_count: u32,
    /// Power-on hour of the most recent failure, 0 if none
    pub last_error_hour: u64,
}

// ============================================================================
// SCSI telemetry
// ============================================================================

/// Decoded INQUIRY plus capacity.
#[derive(Debug, Clone, Default)]
pub struct ScsiInquiry {
    pub vendor: String,
    pub model: String,
    pub revision: String,
    pub serial: String,
    pub lu_id: String,
    pub capacity_bytes: u64,
    pub peripheral_type: u8,
}

impl ScsiInquiry {
    /// Peripheral device types this daemon will monitor.
    pub fn is_disk_like(&self) -> bool {
        // direct access, write-once, CD/DVD, optical, RBC, host managed zoned
        matches!(self.peripheral_type, 0x00 | 0x04 | 0x05 | 0x07 | 0x0e | 0x14)
    }
}

/// TEST UNIT READY outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitReady {
    Ready,
    NotReady,
    NoMedium,
    BecomingReady,
}

/// Informational exceptions mode page state.
#[derive(Debug, Clone, Copy, Default)]
pub struct IecPage {
    pub exception_control_enabled: bool,
}

/// Log pages relevant to monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiLogPage {
    Temperature,
    InformationalExceptions,
    ReadErrorCounters,
    WriteErrorCounters,
    VerifyErrorCounters,
    NonMediumErrors,
}

/// Informational-exception report with temperatures.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScsiIeReport {
    pub asc: u8,
    pub ascq: u8,
    pub current_temp: u8,
    pub trip_temp: u8,
}

impl ScsiIeReport {
    /// Failure-prediction message for asc/ascq pairs that indicate one.
    pub fn failure_message(&self) -> Option<String> {
        match (self.asc, self.ascq) {
            (0, _) => None,
            (0x5d, 0xff) => Some("FAILURE PREDICTION THRESHOLD EXCEEDED (false positive)".into()),
            (0x5d, ascq) => Some(format!(
                "FAILURE PREDICTION THRESHOLD EXCEEDED: ascq=0x{:02x}",
                ascq
            )),
            (0x0b, ascq) => Some(format!("WARNING: ascq=0x{:02x}", ascq)),
            _ => None,
        }
    }

    pub fn self_test_in_progress(&self) -> bool {
        self.asc == 0x04 && self.ascq == 0x09
    }
}

/// Error counter log page kinds, in attrlog order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiCounterPage {
    Read,
    Write,
    Verify,
}

impl ScsiCounterPage {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Verify => "verify",
        }
    }
}

/// One decoded error counter page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScsiErrorCounters {
    pub corrected_by_ecc_fast: u64,
    pub corrected_by_ecc_delayed: u64,
    pub corrected_by_retry: u64,
    pub total_errors_corrected: u64,
    pub correction_algorithm_invocations: u64,
    pub bytes_processed: u64,
    pub total_uncorrected_errors: u64,
}

// ============================================================================
// NVMe telemetry
// ============================================================================

/// Identify Controller fields the daemon consumes.
#[derive(Debug, Clone, Default)]
pub struct NvmeControllerInfo {
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub capacity_bytes: u64,
    /// Error log page capacity (ELPE + 1)
    pub error_log_capacity: u32,
    pub namespace_count: u32,
    /// Optional Admin Command Support bit 4
    pub supports_self_test: bool,
}

/// SMART / Health Information log page, 128-bit counters already narrowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NvmeHealthLog {
    pub critical_warning: u8,
    pub temperature_kelvin: u16,
    pub available_spare: u8,
    pub spare_threshold: u8,
    pub percentage_used: u8,
    pub data_units_read: u64,
    pub data_units_written: u64,
    pub host_reads: u64,
    pub host_writes: u64,
    pub controller_busy_time: u64,
    pub power_cycles: u64,
    pub power_on_hours: u64,
    pub unsafe_shutdowns: u64,
    pub media_errors: u64,
    pub error_log_entries: u64,
}

impl NvmeHealthLog {
    /// Temperature in positive Celsius, clamped to 1..=255.
    pub fn temperature_celsius(&self) -> u8 {
        let c = i32::from(self.temperature_kelvin) - 273;
        c.clamp(1, 255) as u8
    }
}

/// Names of the critical-warning byte bits, lowest first.
pub const NVME_CRITICAL_WARNING_NAMES: [&str; 8] = [
    "LowSpare",
    "Temperature",
    "Reliability",
    "R/O",
    "VolMemBackup",
    "PersistMem",
    "Bit_6",
    "Bit_7",
];

/// One Error Information log entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NvmeErrorLogEntry {
    pub error_count: u64,
    pub status_field: u16,
}

impl NvmeErrorLogEntry {
    /// True when the status encodes a device-related error. Successful
    /// completions and invalid-field rejections (host side) don't count.
    pub fn is_device_error(&self) -> bool {
        let status = self.status_field >> 1;
        if status == 0 {
            return false;
        }
        let sct = (status >> 8) & 0x7;
        let sc = status & 0xff;
        !(sct == 0 && sc == 0x02) // Invalid Field in Command
    }
}

/// One device self-test result entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NvmeSelfTestResult {
    /// Upper nibble: operation, lower nibble: result (0xf = unused entry)
    pub status: u8,
    /// Bit 0: nsid field valid
    pub valid: u8,
    pub nsid: u32,
    pub power_on_hours: u64,
}

/// Device self-test log page.
#[derive(Debug, Clone, Copy)]
pub struct NvmeSelfTestLog {
    pub current_operation: u8,
    pub current_completion: u8,
    pub results: [NvmeSelfTestResult; 20],
}

impl Default for NvmeSelfTestLog {
    fn default() -> Self {
        Self {
            current_operation: 0,
            current_completion: 0,
            results: [NvmeSelfTestResult::default(); 20],
        }
    }
}

// ============================================================================
// Port traits
// ============================================================================

/// ATA/SATA command port.
pub trait AtaPort {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);

    /// OS-level standby probe usable before `open()`; used by the `-n`
    /// power gate to avoid spinning up a sleeping disk just to look at it.
    fn is_powered_down(&mut self) -> bool {
        false
    }

    fn read_identity(&mut self) -> Result<AtaIdentity>;
    fn enable_smart(&mut self) -> Result<()>;
    fn set_attribute_autosave(&mut self, enable: bool) -> Result<()>;
    fn set_auto_offline(&mut self, enable: bool) -> Result<()>;
    fn smart_status(&mut self) -> Result<HealthStatus>;
    fn read_smart_values(&mut self) -> Result<AtaSmartValues>;
    fn read_smart_thresholds(&mut self) -> Result<AtaThresholds>;

    /// Failed-test count and most recent failure hour from the self-test log.
    fn self_test_log_summary(&mut self) -> Result<SelfTestSummary>;

    /// Error count from the summary or extended comprehensive error log.
    fn error_count(&mut self, extended: bool) -> Result<u32>;

    fn check_power_mode(&mut self) -> Result<AtaPowerMode>;
    fn set_feature(&mut self, feature: AtaFeature) -> Result<()>;
    /// SCT Error Recovery Control times in deciseconds.
    fn set_sct_erc(&mut self, read_time: u16, write_time: u16) -> Result<()>;

    fn start_self_test(&mut self, kind: AtaTestKind) -> Result<()>;

    /// Prepare and start a selective self-test. The span arithmetic for
    /// `next`/`redo` lives in the port; the caller only persists the span.
    /// Returns the (start, end) LBA actually selected.
    fn start_selective_self_test(
        &mut self,
        mode: SelectiveMode,
        prev_start: u64,
        prev_end: u64,
        num_sectors: u64,
    ) -> Result<(u64, u64)>;
}

/// SCSI/SAS command port.
pub trait ScsiPort {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);

    fn inquiry(&mut self) -> Result<ScsiInquiry>;
    fn test_unit_ready(&mut self) -> Result<UnitReady>;
    fn fetch_iec_page(&mut self) -> Result<IecPage>;
    fn supported_log_pages(&mut self) -> Result<Vec<ScsiLogPage>>;
    fn check_ie(&mut self, smart_page: bool, temp_page: bool) -> Result<ScsiIeReport>;

    /// Combined return: failed-test count in the low 8 bits, power-on hour
    /// of the most recent failure in bits 8..24.
    fn count_failed_self_tests(&mut self) -> Result<u32>;

    fn error_counters(&mut self, page: ScsiCounterPage) -> Result<ScsiErrorCounters>;
    fn non_medium_error_count(&mut self) -> Result<u64>;

    fn set_gltsd(&mut self, disable_save: bool) -> Result<()>;
    fn self_test_in_progress(&mut self) -> Result<bool>;
    fn start_self_test(&mut self, extended: bool) -> Result<()>;
}

/// NVMe admin command port, optionally bound to a namespace.
pub trait NvmePort {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);

    fn namespace_id(&self) -> u32;
    fn identify_controller(&mut self) -> Result<NvmeControllerInfo>;
    fn read_smart_log(&mut self) -> Result<NvmeHealthLog>;
    /// Newest entries first, at most `entries` of them.
    fn read_error_log(&mut self, entries: u32) -> Result<Vec<NvmeErrorLogEntry>>;
    fn read_self_test_log(&mut self) -> Result<NvmeSelfTestLog>;
    fn start_self_test(&mut self, extended: bool) -> Result<()>;
}

// ============================================================================
// Device
// ============================================================================

/// Transport family of a monitored device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Ata,
    Scsi,
    Nvme,
}

impl Transport {
    /// Suffix used in state and attribute log file names.
    pub fn file_tag(&self) -> &'static str {
        match self {
            Self::Ata => "ata",
            Self::Scsi => "scsi",
            Self::Nvme => "nvme",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Ata => "ATA",
            Self::Scsi => "SCSI",
            Self::Nvme => "NVMe",
        }
    }
}

/// A monitored device: one port behind a transport tag. Per-transport code
/// is selected by a match on the tag, nothing else.
pub enum Device {
    Ata(Box<dyn AtaPort + Send>),
    Scsi(Box<dyn ScsiPort + Send>),
    Nvme(Box<dyn NvmePort + Send>),
}

impl Device {
    pub fn transport(&self) -> Transport {
        match self {
            Self::Ata(_) => Transport::Ata,
            Self::Scsi(_) => Transport::Scsi,
            Self::Nvme(_) => Transport::Nvme,
        }
    }

    pub fn open(&mut self) -> Result<()> {
        match self {
            Self::Ata(p) => p.open(),
            Self::Scsi(p) => p.open(),
            Self::Nvme(p) => p.open(),
        }
    }

    pub fn close(&mut self) {
        match self {
            Self::Ata(p) => p.close(),
            Self::Scsi(p) => p.close(),
            Self::Nvme(p) => p.close(),
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Device::{}", self.transport().label())
    }
}

/// A device produced by a system scan, with the names the scanner saw.
pub struct ScannedDevice {
    pub name: String,
    pub dev_name: String,
    pub dev_type: String,
    pub device: Device,
}

/// Platform integration seam: opens named devices, scans the system for
/// candidates, and controls system auto-standby. Implemented by the OS
/// backend; mocked in tests.
pub trait PortFactory {
    /// Open a device by configured name and declared type ("" = auto).
    fn open_device(&self, name: &str, dev_type: &str) -> Result<Device>;

    /// Scan the system for monitorable devices, optionally restricted to
    /// the listed types.
    fn scan(&self, types: &[String]) -> Result<Vec<ScannedDevice>>;

    /// Resolved unique name (symlinks followed) for duplicate detection.
    fn unique_name(&self, name: &str, dev_type: &str) -> String {
        if dev_type.is_empty() {
            name.to_string()
        } else {
            format!("{} [{}]", name, dev_type)
        }
    }

    /// Disable or re-enable system auto standby while self-tests run.
    fn set_system_auto_standby(&self, enable: bool) -> Result<()> {
        let _ = enable;
        Err(DwError::not_supported("system auto standby control"))
    }
}

/// Format a capacity with SI units the way identity lines print it.
pub fn format_capacity(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    if bytes == 0 {
        return String::new();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else if value < 10.0 {
        format!("{:.2} {}", value, UNITS[unit])
    } else if value < 100.0 {
        format!("{:.1} {}", value, UNITS[unit])
    } else {
        format!("{:.0} {}", value, UNITS[unit])
    }
}
