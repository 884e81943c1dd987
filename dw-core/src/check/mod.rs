//! Per-transport health evaluation.
//!
//! One submodule per transport family implements the probe phase
//! (capability discovery, identity, baselines) and the periodic check
//! phase. Logic shared between transports lives here: device-open
//! bookkeeping, temperature tracking, and self-test-log delta reporting.

pub mod ata;
pub mod nvme;
pub mod scsi;

use std::path::PathBuf;

use dw_error::Result;
use tracing::{error, info};

use crate::config::{DeviceConfig, EmailFreq};
use crate::device::Transport;
use crate::state::{self, DeviceState, SkippedPowerMode};
use crate::warning::{mail_warning, reset_warning, WarnKind, Warner};
use crate::DEFAULT_CHECKTIME;

/// Context for the one-time probe phase of a device.
pub struct ProbeContext<'a> {
    /// Already-registered configs, for duplicate identity detection
    pub prev_configs: &'a [DeviceConfig],
    pub state_prefix: Option<&'a str>,
    pub attrlog_prefix: Option<&'a str>,
    pub warner: &'a Warner,
    pub now: i64,
}

/// Probe result for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Device is monitorable; config and state are initialized
    Registered,
    /// Same identity as an already-registered device
    Duplicate,
    /// Device cannot be monitored
    NotCapable,
    /// Device is fine but no requested monitor survived capability checks
    NothingToMonitor,
}

/// Context for one periodic check of a device.
pub struct CheckContext<'a> {
    pub warner: &'a Warner,
    pub first_pass: bool,
    pub allow_selftests: bool,
    pub debug: bool,
    pub now: i64,
}

/// Replace control characters and a leading `~` in an identity string so
/// it is safe for mail commands; returns true if anything was replaced.
pub fn sanitize_id_info(s: &mut String) -> bool {
    let mut changed = false;
    let mut out = String::with_capacity(s.len());
    for (i, c) in s.chars().enumerate() {
        if (' '..='~').contains(&c) && !(i == 0 && c == '~') {
            out.push(c);
        } else {
            out.push('?');
            changed = true;
        }
    }
    if changed {
        *s = out;
    }
    changed
}

/// Log and report a duplicate identity against already-registered devices.
pub fn is_duplicate_identity(cfg: &DeviceConfig, prev: &[DeviceConfig]) -> bool {
    if !cfg.id_is_unique {
        return false;
    }
    for p in prev {
        if !p.id_is_unique {
            continue;
        }
        let same = cfg.id_info == p.id_info
            || (!cfg.id_info_bc.is_empty() && cfg.id_info_bc == p.id_info)
            || (!p.id_info_bc.is_empty() && cfg.id_info == p.id_info_bc);
        if same {
            info!(
                "Device: {}, same identity as {}, ignored",
                cfg.dev_name, p.dev_name
            );
            return true;
        }
    }
    false
}

/// Build state and attribute-log paths from identity parts and load any
/// previous persistent state.
pub fn attach_state_files(
    cfg: &mut DeviceConfig,
    state: &mut DeviceState,
    ctx: &ProbeContext<'_>,
    transport: Transport,
    name_parts: &[&str],
    nsid: Option<u32>,
) {
    if ctx.state_prefix.is_none() && ctx.attrlog_prefix.is_none() {
        return;
    }

    let mut base = name_parts
        .iter()
        .map(|p| state::sanitize_filename_part(p))
        .collect::<Vec<_>>()
        .join("-");
    if let Some(n) = nsid {
        base.push_str(&format!("-n{}", n));
    }

    if let Some(prefix) = ctx.state_prefix {
        let path = PathBuf::from(format!(
            "{}{}.{}.state",
            prefix,
            base,
            transport.file_tag()
        ));
        match state::read_state_file(&path) {
            Ok(Some(saved)) => {
                info!("Device: {}, state read from {}", cfg.name, path.display());
                state.saved = saved;
                if transport == Transport::Ata {
                    state.load_ata_attributes_from_saved();
                }
            }
            Ok(None) => {}
            Err(e) => info!("Cannot read state file {}: {}", path.display(), e),
        }
        cfg.state_file = Some(path);
    }
    if let Some(prefix) = ctx.attrlog_prefix {
        cfg.attrlog_file = Some(PathBuf::from(format!(
            "{}{}.{}.csv",
            prefix,
            base,
            transport.file_tag()
        )));
    }
}

/// Post-probe fixups shared by all transports.
pub fn finish_device_scan(cfg: &mut DeviceConfig, state: &mut DeviceState, now: i64) {
    // Pick a default notifier frequency the user did not set. Without a
    // state file 'once' is safe; with one, 'daily' avoids suppressing
    // warnings forever through persistence.
    if cfg.wants_warnings() && cfg.email_freq == EmailFreq::Unknown {
        cfg.email_freq = if cfg.state_file.is_none() {
            EmailFreq::Once
        } else {
            EmailFreq::Daily
        };
    }

    // Start the self-test schedule now if no checkpoint came from the
    // state file
    if cfg.test_regex.is_some() && state.saved.scheduled_test_next_check == 0 {
        state.saved.scheduled_test_next_check = now;
    }
}

/// Open a device for a periodic check, with removable-device and
/// failed-open bookkeeping. `os_standby` is the ATA-only OS-level standby
/// probe result, queried before the real open. Returns false if the check
/// should be skipped this cycle.
pub fn open_for_check(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    ctx: &CheckContext<'_>,
    type_label: &str,
    os_standby: bool,
    open: &mut dyn FnMut() -> Result<()>,
) -> bool {
    // If the user asked, test the warning system on every cycle
    if cfg.email_test {
        mail_warning(
            ctx.warner,
            cfg,
            state,
            WarnKind::EmailTest,
            &format!("TEST EMAIL from drivewatchd for device: {}", cfg.name),
        );
    }

    // The '-n' gate may be answerable without opening the device at all;
    // never wake a disk the OS already put in standby.
    if os_standby && (cfg.power_skip_max == 0 || state.power_skip_count < cfg.power_skip_max) {
        let changed = state.last_power_mode_skipped != Some(SkippedPowerMode::Os);
        if (state.power_skip_count == 0 || changed) && !cfg.power_quiet {
            info!(
                "Device: {}, is in STANDBY (OS) mode, suspending checks",
                cfg.name
            );
            state.last_power_mode_skipped = Some(SkippedPowerMode::Os);
        }
        state.power_skip_count += 1;
        return false;
    }

    // If we can't open the device, fail gracefully rather than hard;
    // perhaps the next time around we'll be able to open it.
    if let Err(e) = open() {
        if !cfg.removable {
            info!(
                "Device: {}, open() of {} device failed: {}",
                cfg.name, type_label, e
            );
            mail_warning(
                ctx.warner,
                cfg,
                state,
                WarnKind::FailedOpenDevice,
                &format!("Device: {}, unable to open {} device", cfg.name, type_label),
            );
        } else if !state.removed {
            info!("Device: {}, removed {} device: {}", cfg.name, type_label, e);
            state.removed = true;
        } else if ctx.debug {
            info!(
                "Device: {}, {} device still removed: {}",
                cfg.name, type_label, e
            );
        }
        return false;
    }

    if ctx.debug {
        info!("Device: {}, opened {} device", cfg.name, type_label);
    }

    if !cfg.removable {
        reset_warning(
            cfg,
            state,
            WarnKind::FailedOpenDevice,
            &format!("open of {} device worked again", type_label),
        );
    } else if state.removed {
        info!("Device: {}, reconnected {} device", cfg.name, type_label);
        state.removed = false;
    }

    true
}

fn fmt_temp(t: u8) -> String {
    if t == 0 {
        "??".to_string()
    } else {
        t.to_string()
    }
}

/// Shared temperature tracking and limit checks.
pub fn check_temperature(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    warner: &Warner,
    currtemp: u8,
    triptemp: u8,
    now: i64,
) {
    if currtemp == 0 || currtemp == 255 {
        info!("Device: {}, failed to read Temperature", cfg.name);
        return;
    }

    let mut minchg = "";
    let mut maxchg = "";
    if currtemp > state.saved.temp_max {
        if state.saved.temp_max != 0 {
            maxchg = "!";
        }
        state.saved.temp_max = currtemp;
        state.must_write = true;
    }

    if state.temperature == 0 {
        // First reading: delay Min Temperature sampling by ~30 minutes to
        // skip the cold start
        if state.saved.temp_min == 0 || currtemp < state.saved.temp_min {
            state.temp_min_delay = now + i64::from(DEFAULT_CHECKTIME) - 60;
        }
        info!(
            "Device: {}, initial Temperature is {} Celsius (Min/Max {}/{}{})",
            cfg.name,
            currtemp,
            fmt_temp(state.saved.temp_min),
            state.saved.temp_max,
            maxchg
        );
        if triptemp != 0 {
            info!("    [trip Temperature is {} Celsius]", triptemp);
        }
        state.temperature = currtemp;
    } else {
        if state.temp_min_delay != 0 {
            // End the delay once the temperature rises above the recorded
            // minimum or the delay time is over
            if (state.saved.temp_min != 0 && currtemp > state.saved.temp_min)
                || state.temp_min_delay <= now
            {
                state.temp_min_delay = 0;
                if state.saved.temp_min == 0 {
                    state.saved.temp_min = 255;
                }
            }
        }

        if state.temp_min_delay == 0 && currtemp < state.saved.temp_min {
            state.saved.temp_min = currtemp;
            state.must_write = true;
            if currtemp != state.temperature {
                minchg = "!";
            }
        }

        let delta = i32::from(currtemp) - i32::from(state.temperature);
        if cfg.temp_diff != 0
            && (!minchg.is_empty() || !maxchg.is_empty() || delta.unsigned_abs() >= u32::from(cfg.temp_diff))
        {
            info!(
                "Device: {}, Temperature changed {:+} Celsius to {} Celsius (Min/Max {}{}/{}{})",
                cfg.name,
                delta,
                currtemp,
                fmt_temp(state.saved.temp_min),
                minchg,
                state.saved.temp_max,
                maxchg
            );
            state.temperature = currtemp;
        }
    }

    if cfg.temp_crit != 0 && currtemp >= cfg.temp_crit {
        let msg = format!(
            "Device: {}, Temperature {} Celsius reached critical limit of {} Celsius (Min/Max {}{}/{}{})",
            cfg.name,
            currtemp,
            cfg.temp_crit,
            fmt_temp(state.saved.temp_min),
            minchg,
            state.saved.temp_max,
            maxchg
        );
        error!("{}", msg);
        mail_warning(warner, cfg, state, WarnKind::Temperature, &msg);
    } else if cfg.temp_info != 0 && currtemp >= cfg.temp_info {
        info!(
            "Device: {}, Temperature {} Celsius reached limit of {} Celsius (Min/Max {}{}/{}{})",
            cfg.name,
            currtemp,
            cfg.temp_info,
            fmt_temp(state.saved.temp_min),
            minchg,
            state.saved.temp_max,
            maxchg
        );
    } else if cfg.temp_crit != 0 {
        let limit = if cfg.temp_info != 0 {
            cfg.temp_info
        } else {
            cfg.temp_crit - 5
        };
        if currtemp < limit {
            reset_warning(
                cfg,
                state,
                WarnKind::Temperature,
                &format!("Temperature {} Celsius dropped below {} Celsius", currtemp, limit),
            );
        }
    }
}

/// Shared self-test-log delta reporting. `errcnt` is `None` when reading
/// the log failed this cycle.
pub fn report_self_test_changes(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    warner: &Warner,
    errcnt: Option<u32>,
    hour: u64,
) {
    let Some(errcnt) = errcnt else {
        mail_warning(
            warner,
            cfg,
            state,
            WarnKind::FailedReadSmartSelfTestLog,
            &format!("Device: {}, Read SMART Self-Test Log Failed", cfg.name),
        );
        return;
    };

    reset_warning(
        cfg,
        state,
        WarnKind::FailedReadSmartSelfTestLog,
        "Read SMART Self-Test Log worked again",
    );

    let old_count = u32::from(state.saved.selftest_error_count);
    if old_count < errcnt {
        let msg = format!(
            "Device: {}, Self-Test Log error count increased from {} to {}",
            cfg.name, old_count, errcnt
        );
        error!("{}", msg);
        mail_warning(warner, cfg, state, WarnKind::SelfTest, &msg);
        state.must_write = true;
    } else if errcnt > 0 && state.saved.selftest_last_error_hour != hour {
        // A 'more recent' error may have a smaller hour number if the
        // 16 bit hour counter wrapped.
        let msg = format!(
            "Device: {}, new Self-Test Log error at hour timestamp {}",
            cfg.name, hour
        );
        error!("{}", msg);
        mail_warning(warner, cfg, state, WarnKind::SelfTest, &msg);
        state.must_write = true;
    }

    // Entries can also disappear, e.g. after a newer successful extended
    // self-test
    if old_count > errcnt {
        info!(
            "Device: {}, Self-Test Log error count decreased from {} to {}",
            cfg.name, old_count, errcnt
        );
        if errcnt == 0 {
            reset_warning(
                cfg,
                state,
                WarnKind::SelfTest,
                "Self-Test Log does no longer report errors",
            );
        }
    }

    state.saved.selftest_error_count = errcnt.min(255) as u8;
    state.saved.selftest_last_error_hour = hour;
}

/// Built-in display names for the common ATA attributes. The drive
/// database may refine these in the port layer; the daemon only needs
/// something readable for log and mail text.
pub fn attribute_name(id: u8, rotation_rate: i32) -> &'static str {
    match id {
        1 => "Raw_Read_Error_Rate",
        2 => "Throughput_Performance",
        3 => "Spin_Up_Time",
        4 => "Start_Stop_Count",
        5 => "Reallocated_Sector_Ct",
        7 => "Seek_Error_Rate",
        8 => "Seek_Time_Performance",
        9 => "Power_On_Hours",
        10 => "Spin_Retry_Count",
        11 => "Calibration_Retry_Count",
        12 => "Power_Cycle_Count",
        173 => "Wear_Leveling_Count",
        177 => "Wear_Leveling_Count",
        179 => "Used_Rsvd_Blk_Cnt_Tot",
        181 => "Program_Fail_Cnt_Total",
        182 => "Erase_Fail_Count_Total",
        184 => "End-to-End_Error",
        187 => "Reported_Uncorrect",
        188 => "Command_Timeout",
        189 => {
            if rotation_rate == 1 {
                "Airflow_Temperature_Cel"
            } else {
                "High_Fly_Writes"
            }
        }
        190 => "Airflow_Temperature_Cel",
        191 => "G-Sense_Error_Rate",
        192 => "Power-Off_Retract_Count",
        193 => "Load_Cycle_Count",
        194 => "Temperature_Celsius",
        196 => "Reallocated_Event_Count",
        197 => "Current_Pending_Sector",
        198 => "Offline_Uncorrectable",
        199 => "UDMA_CRC_Error_Count",
        200 => "Multi_Zone_Error_Rate",
        201 => "Soft_Read_Error_Rate",
        202 => "Data_Address_Mark_Errs",
        230 => "Head_Amplitude",
        231 => "Temperature_Celsius",
        232 => "Available_Reservd_Space",
        233 => "Media_Wearout_Indicator",
        240 => "Head_Flying_Hours",
        241 => "Total_LBAs_Written",
        242 => "Total_LBAs_Read",
        254 => "Free_Fall_Sensor",
        _ => "Unknown_Attribute",
    }
}
