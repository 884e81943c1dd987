//! Per-device state and its on-disk persistence.
//!
//! Each device owns a [`DeviceState`]: a persistent part written to a
//! textual state file (and reloaded across daemon restarts), plus runtime
//! fields reinitialized every start. A second, append-only CSV-style file
//! logs one telemetry row per check cycle.
//!
//! State file grammar: `# comment` lines and `key = integer` pairs.
//! Zero-valued keys are omitted on write, so a missing key reads as 0.
//! Unknown keys and malformed lines are tolerated as long as at least one
//! line parses.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Local};
use dw_error::{DwError, Result};
use tracing::info;

use crate::device::{
    AtaSmartValues, AtaThresholds, NvmeHealthLog, ScsiErrorCounters, NUM_ATA_ATTRIBUTES,
};

/// Number of warning kinds with persistent send history.
pub const NUM_MAIL_TYPES: usize = 13;
/// Index of the `-M test` mail kind, which is never persisted.
pub const MAILTYPE_TEST: usize = 0;

/// Send history for one warning kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailInfo {
    /// Number of times this warning was dispatched
    pub logged: u32,
    pub first_sent: i64,
    pub last_sent: i64,
}

/// Persistent snapshot of one ATA attribute slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistedAttribute {
    pub id: u8,
    pub val: u8,
    pub worst: u8,
    pub raw: u64,
    pub resvd: u8,
}

/// The part of a device's state that survives restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentState {
    pub temp_min: u8,
    pub temp_max: u8,
    pub selftest_error_count: u8,
    pub selftest_last_error_hour: u64,
    pub scheduled_test_next_check: i64,
    pub selective_last_start: u64,
    pub selective_last_end: u64,
    pub mail: [MailInfo; NUM_MAIL_TYPES],
    pub ata_error_count: i32,
    pub ata_attributes: [PersistedAttribute; NUM_ATA_ATTRIBUTES],
    pub nvme_err_log_entries: u64,
    pub nvme_available_spare: u8,
    pub nvme_percentage_used: u8,
    pub nvme_media_errors: u64,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            temp_min: 0,
            temp_max: 0,
            selftest_error_count: 0,
            selftest_last_error_hour: 0,
            scheduled_test_next_check: 0,
            selective_last_start: 0,
            selective_last_end: 0,
            mail: [MailInfo::default(); NUM_MAIL_TYPES],
            ata_error_count: 0,
            ata_attributes: [PersistedAttribute::default(); NUM_ATA_ATTRIBUTES],
            nvme_err_log_entries: 0,
            nvme_available_spare: 0,
            nvme_percentage_used: 0,
            nvme_media_errors: 0,
        }
    }
}

/// Which transport's telemetry is staged for the next attribute log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrlogKind {
    Ata,
    Scsi,
    Nvme,
}

/// Power mode observed when a check was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkippedPowerMode {
    /// OS-level standby detected before opening the device
    Os,
    /// ATA CHECK POWER MODE condition code
    Mode(u8),
}

/// SCSI capability flags and cached counters.
#[derive(Debug, Clone, Default)]
pub struct ScsiRuntime {
    pub smart_page_supported: bool,
    pub temp_page_supported: bool,
    pub read_counters_supported: bool,
    pub write_counters_supported: bool,
    pub verify_counters_supported: bool,
    pub non_medium_supported: bool,
    /// Minimize nuisance reports after a failed IE fetch
    pub suppress_report: bool,
    /// read / write / verify counter pages staged for the attrlog
    pub error_counters: [Option<ScsiErrorCounters>; 3],
    pub non_medium_errors: Option<u64>,
}

/// Full per-device state: the persistent part plus runtime fields.
#[derive(Debug, Default)]
pub struct DeviceState {
    pub saved: PersistentState,

    /// True if the persistent part must be rewritten
    pub must_write: bool,
    /// Skip this device during the next check cycle
    pub skip: bool,
    /// Next wakeup time for individual check intervals, 0 if global
    pub wakeup_time: i64,

    pub not_cap_offline: bool,
    pub not_cap_conveyance: bool,
    pub not_cap_short: bool,
    pub not_cap_long: bool,
    pub not_cap_selective: bool,

    /// Last recorded temperature in Celsius, 0 = none yet
    pub temperature: u8,
    /// Epoch until which min-temperature sampling is delayed
    pub temp_min_delay: i64,

    /// True if open() failed for a removable device
    pub removed: bool,

    pub power_mode_fail: bool,
    pub power_skip_count: u32,
    pub last_power_mode_skipped: Option<SkippedPowerMode>,

    /// Telemetry staged for the next attribute log row
    pub attrlog: Option<AttrlogKind>,

    // ATA
    pub num_sectors: u64,
    pub smart_values: AtaSmartValues,
    pub smart_thresholds: AtaThresholds,
    pub offline_started: bool,

    // ATA and NVMe
    pub selftest_started: bool,

    // NVMe
    pub nvme_selftest_op: u8,
    pub nvme_selftest_compl: u8,
    pub nvme_health: NvmeHealthLog,

    // SCSI
    pub scsi: ScsiRuntime,
}

impl DeviceState {
    /// Copy the runtime ATA attribute table into the persistent snapshot.
    pub fn sync_ata_attributes_to_saved(&mut self) {
        for i in 0..NUM_ATA_ATTRIBUTES {
            let ta = &self.smart_values.attributes[i];
            let pa = &mut self.saved.ata_attributes[i];
            pa.id = ta.id;
            if ta.id == 0 {
                *pa = PersistedAttribute::default();
                continue;
            }
            pa.val = ta.current;
            pa.worst = ta.worst;
            pa.raw = ta.raw_value();
            pa.resvd = ta.reserv;
        }
    }

    /// Load the persistent attribute snapshot into the runtime table, so
    /// the first check after a restart has a baseline for delta detection.
    pub fn load_ata_attributes_from_saved(&mut self) {
        for i in 0..NUM_ATA_ATTRIBUTES {
            let pa = &self.saved.ata_attributes[i];
            let ta = &mut self.smart_values.attributes[i];
            ta.id = pa.id;
            if pa.id == 0 {
                ta.current = 0;
                ta.worst = 0;
                ta.raw = [0; 6];
                ta.reserv = 0;
                continue;
            }
            ta.current = pa.val;
            ta.worst = pa.worst;
            ta.set_raw_value(pa.raw);
            ta.reserv = pa.resvd;
        }
    }
}

// ============================================================================
// State file
// ============================================================================

/// Parse one `key = value` line into `state`. Returns false for malformed
/// or unknown lines.
fn parse_state_line(line: &str, state: &mut PersistentState) -> bool {
    let Some((key, value)) = line.split_once('=') else {
        return false;
    };
    let key = key.trim();
    let value = value.trim();
    let Ok(val) = value.parse::<u64>() else {
        return false;
    };

    match key {
        "temperature-min" => state.temp_min = val as u8,
        "temperature-max" => state.temp_max = val as u8,
        "self-test-errors" => state.selftest_error_count = val as u8,
        "self-test-last-err-hour" => state.selftest_last_error_hour = val,
        "scheduled-test-next-check" => state.scheduled_test_next_check = val as i64,
        "selective-test-last-start" => state.selective_last_start = val,
        "selective-test-last-end" => state.selective_last_end = val,
        "ata-error-count" => state.ata_error_count = val as i32,
        "nvme-err-log-entries" => state.nvme_err_log_entries = val,
        "nvme-available-spare" => state.nvme_available_spare = val as u8,
        "nvme-percentage-used" => state.nvme_percentage_used = val as u8,
        "nvme-media-errors" => state.nvme_media_errors = val,
        _ => {
            if let Some(rest) = key.strip_prefix("mail.") {
                let Some((idx, field)) = rest.split_once('.') else {
                    return false;
                };
                let Ok(i) = idx.parse::<usize>() else {
                    return false;
                };
                if i >= NUM_MAIL_TYPES {
                    return false;
                }
                if i == MAILTYPE_TEST {
                    // Don't suppress test mails
                    return true;
                }
                match field {
                    "count" => state.mail[i].logged = val as u32,
                    "first-sent-time" => state.mail[i].first_sent = val as i64,
                    "last-sent-time" => state.mail[i].last_sent = val as i64,
                    _ => return false,
                }
            } else if let Some(rest) = key.strip_prefix("ata-smart-attribute.") {
                let Some((idx, field)) = rest.split_once('.') else {
                    return false;
                };
                let Ok(i) = idx.parse::<usize>() else {
                    return false;
                };
                if i >= NUM_ATA_ATTRIBUTES {
                    return false;
                }
                match field {
                    "id" => state.ata_attributes[i].id = val as u8,
                    "val" => state.ata_attributes[i].val = val as u8,
                    "worst" => state.ata_attributes[i].worst = val as u8,
                    "raw" => state.ata_attributes[i].raw = val,
                    "resvd" => state.ata_attributes[i].resvd = val as u8,
                    _ => return false,
                }
            } else {
                return false;
            }
        }
    }
    true
}

/// Read a state file. `Ok(None)` means the file does not exist yet.
pub fn read_state_file(path: &Path) -> Result<Option<PersistentState>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(DwError::FileRead {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let mut state = PersistentState::default();
    let mut good = 0u32;
    let mut bad = 0u32;
    for line in content.lines() {
        let s = line.trim_start();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        if parse_state_line(s, &mut state) {
            good += 1;
        } else {
            bad += 1;
        }
    }

    if bad > 0 {
        if good == 0 {
            return Err(DwError::StateFormat {
                path: path.to_path_buf(),
            });
        }
        info!("{}: {} invalid line(s) ignored", path.display(), bad);
    }
    Ok(Some(state))
}

fn state_line(out: &mut String, name: &str, val: u64) {
    if val != 0 {
        out.push_str(&format!("{} = {}\n", name, val));
    }
}

fn state_line_indexed(out: &mut String, name1: &str, idx: usize, name2: &str, val: u64) {
    if val != 0 {
        out.push_str(&format!("{}.{}.{} = {}\n", name1, idx, name2, val));
    }
}

/// Write a state file. The previous file is first renamed to `<path>~`
/// (best effort), so a partial write never corrupts the old state.
pub fn write_state_file(path: &Path, state: &PersistentState) -> Result<()> {
    let mut backup = path.as_os_str().to_owned();
    backup.push("~");
    let _ = fs::remove_file(&backup);
    let _ = fs::rename(path, &backup);

    let mut out = String::with_capacity(1024);
    out.push_str("# drivewatchd state file\n");
    state_line(&mut out, "temperature-min", state.temp_min.into());
    state_line(&mut out, "temperature-max", state.temp_max.into());
    state_line(&mut out, "self-test-errors", state.selftest_error_count.into());
    state_line(
        &mut out,
        "self-test-last-err-hour",
        state.selftest_last_error_hour,
    );
    state_line(
        &mut out,
        "scheduled-test-next-check",
        state.scheduled_test_next_check.max(0) as u64,
    );
    state_line(
        &mut out,
        "selective-test-last-start",
        state.selective_last_start,
    );
    state_line(&mut out, "selective-test-last-end", state.selective_last_end);

    for (i, mi) in state.mail.iter().enumerate() {
        if i == MAILTYPE_TEST || mi.logged == 0 {
            continue;
        }
        state_line_indexed(&mut out, "mail", i, "count", mi.logged.into());
        state_line_indexed(&mut out, "mail", i, "first-sent-time", mi.first_sent.max(0) as u64);
        state_line_indexed(&mut out, "mail", i, "last-sent-time", mi.last_sent.max(0) as u64);
    }

    state_line(&mut out, "ata-error-count", state.ata_error_count.max(0) as u64);

    for (i, pa) in state.ata_attributes.iter().enumerate() {
        if pa.id == 0 {
            continue;
        }
        state_line_indexed(&mut out, "ata-smart-attribute", i, "id", pa.id.into());
        state_line_indexed(&mut out, "ata-smart-attribute", i, "val", pa.val.into());
        state_line_indexed(&mut out, "ata-smart-attribute", i, "worst", pa.worst.into());
        state_line_indexed(&mut out, "ata-smart-attribute", i, "raw", pa.raw);
        state_line_indexed(&mut out, "ata-smart-attribute", i, "resvd", pa.resvd.into());
    }

    state_line(&mut out, "nvme-err-log-entries", state.nvme_err_log_entries);
    state_line(
        &mut out,
        "nvme-available-spare",
        state.nvme_available_spare.into(),
    );
    state_line(
        &mut out,
        "nvme-percentage-used",
        state.nvme_percentage_used.into(),
    );
    state_line(&mut out, "nvme-media-errors", state.nvme_media_errors);

    fs::write(path, out).map_err(|e| DwError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })
}

// ============================================================================
// Attribute log
// ============================================================================

fn format_ata_attrlog(out: &mut String, state: &DeviceState) {
    for pa in &state.saved.ata_attributes {
        if pa.id == 0 {
            continue;
        }
        out.push_str(&format!("\t{};{};{};", pa.id, pa.val, pa.raw));
    }
}

fn format_scsi_attrlog(out: &mut String, state: &DeviceState) {
    const PAGES: [&str; 3] = ["read", "write", "verify"];
    for (k, page) in PAGES.iter().enumerate() {
        let Some(ec) = &state.scsi.error_counters[k] else {
            continue;
        };
        out.push_str(&format!(
            "\t{p}-corr-by-ecc-fast;{};\t{p}-corr-by-ecc-delayed;{};\
             \t{p}-corr-by-retry;{};\t{p}-total-err-corrected;{};\
             \t{p}-corr-algorithm-invocations;{};\t{p}-gb-processed;{:.3};\
             \t{p}-total-unc-errors;{};",
            ec.corrected_by_ecc_fast,
            ec.corrected_by_ecc_delayed,
            ec.corrected_by_retry,
            ec.total_errors_corrected,
            ec.correction_algorithm_invocations,
            ec.bytes_processed as f64 / 1_000_000_000.0,
            ec.total_uncorrected_errors,
            p = page,
        ));
    }
    if let Some(nme) = state.scsi.non_medium_errors {
        out.push_str(&format!("\tnon-medium-errors;{};", nme));
    }
    if state.temperature != 0 {
        out.push_str(&format!("\ttemperature;{};", state.temperature));
    }
}

fn format_nvme_attrlog(out: &mut String, state: &DeviceState) {
    let h = &state.nvme_health;
    out.push_str(&format!(
        "\tcritical-warning;{};\ttemperature;{};\tavailable-spare;{};\
         \tavailable-spare-threshold;{};\tpercentage-used;{};\
         \tdata-units-read;{};\tdata-units-written;{};\thost-reads;{};\
         \thost-writes;{};\tcontroller-busy-time;{};\tpower-cycles;{};\
         \tpower-on-hours;{};\tunsafe-shutdowns;{};\tmedia-errors;{};\
         \tnum-err-log-entries;{};",
        h.critical_warning,
        i32::from(h.temperature_kelvin) - 273,
        h.available_spare,
        h.spare_threshold,
        h.percentage_used,
        h.data_units_read,
        h.data_units_written,
        h.host_reads,
        h.host_writes,
        h.controller_busy_time,
        h.power_cycles,
        h.power_on_hours,
        h.unsafe_shutdowns,
        h.media_errors,
        h.error_log_entries,
    ));
}

/// Append one telemetry row for the staged transport. No-op when nothing
/// is staged; the staging tag is cleared by the caller.
pub fn append_attrlog(path: &Path, when: DateTime<Local>, state: &DeviceState) -> Result<()> {
    let Some(kind) = state.attrlog else {
        return Ok(());
    };

    let mut row = when.format("%Y-%m-%d %H:%M:%S;").to_string();
    match kind {
        AttrlogKind::Ata => format_ata_attrlog(&mut row, state),
        AttrlogKind::Scsi => format_scsi_attrlog(&mut row, state),
        AttrlogKind::Nvme => format_nvme_attrlog(&mut row, state),
    }
    row.push('\n');

    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| DwError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        })?;
    f.write_all(row.as_bytes()).map_err(|e| DwError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Replace characters not allowed in state file names.
pub fn sanitize_filename_part(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
