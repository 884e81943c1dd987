//! ATA/SATA probe and periodic check.

use dw_error::DwError;
use tracing::{error, info};

use crate::config::{attr_flag, DeviceConfig, PowerGate, PresetPolicy};
use crate::device::{
    attribute_state, format_capacity, offline_collection_in_progress, self_test_in_progress,
    AtaAttribute, AtaFeature, AtaPort, AtaPowerMode, AtaSmartValues, AtaTestKind, AtaThresholds,
    HealthStatus, SelectiveMode, SmartSupport, Transport,
};
use crate::schedule::{next_scheduled_test, TestType};
use crate::state::{AttrlogKind, DeviceState, SkippedPowerMode};
use crate::warning::{mail_warning, reset_warning, WarnKind, Warner};
use crate::DEFAULT_CHECKTIME;

use super::{
    attach_state_files, attribute_name, check_temperature, finish_device_scan,
    is_duplicate_identity, open_for_check, report_self_test_changes, sanitize_id_info,
    CheckContext, ProbeContext, ProbeOutcome,
};

/// Default Current_Pending_Sector / Offline_Uncorrectable attribute ids.
const DEFAULT_CURR_PENDING_ID: u8 = 197;
const DEFAULT_OFFL_PENDING_ID: u8 = 198;

/// Auto offline timer support bit in the offline collection capability.
fn supports_auto_offline_timer(values: &AtaSmartValues) -> bool {
    values.offline_collection_capability & 0x02 != 0
}

/// Temperature in Celsius from the attribute table: 194, then 190 with
/// the 100-minus convention excluded. 0 = no usable sensor.
pub fn ata_temperature(values: &AtaSmartValues) -> u8 {
    for id in [194u8, 190] {
        if let Some(i) = values.find_attribute(id) {
            let t = values.attributes[i].raw_value() & 0xff;
            if (1..128).contains(&t) {
                return t as u8;
            }
        }
    }
    0
}

/// Probe-time sanity check of a pending-sector attribute id.
fn check_pending_id(cfg: &DeviceConfig, state: &DeviceState, id: u8, what: &str) -> bool {
    let Some(i) = state.smart_values.find_attribute(id) else {
        info!(
            "Device: {}, can't monitor {} count - no Attribute {}",
            cfg.name, what, id
        );
        return false;
    };

    let rawval = state.smart_values.attributes[i].raw_value();
    let bound = if state.num_sectors != 0 {
        state.num_sectors
    } else {
        0xffff_ffff
    };
    if rawval >= bound {
        info!(
            "Device: {}, ignoring {} count - bogus Attribute {} value {} (0x{:x})",
            cfg.name, what, id, rawval, rawval
        );
        return false;
    }
    true
}

/// Format one entry of the combined "ATA settings applied" line.
fn format_set_result(msg: &mut String, name: &str, ok: bool, set_option: i32, has_value: bool) {
    if !msg.is_empty() {
        msg.push_str(", ");
    }
    msg.push_str(name);
    if !ok {
        msg.push_str(":--");
    } else if set_option < 0 {
        msg.push_str(":off");
    } else if has_value {
        msg.push_str(&format!(":{}", set_option - 1));
    } else if set_option > 0 {
        msg.push_str(":on");
    }
}

fn apply_on_open_settings(cfg: &DeviceConfig, port: &mut dyn AtaPort, locked: bool) {
    let mut msg = String::new();

    if cfg.set_aam != 0 {
        let feature = if cfg.set_aam > 0 {
            AtaFeature::Aam(Some((cfg.set_aam - 1) as u8))
        } else {
            AtaFeature::Aam(None)
        };
        format_set_result(&mut msg, "AAM", port.set_feature(feature).is_ok(), cfg.set_aam, true);
    }
    if cfg.set_apm != 0 {
        let feature = if cfg.set_apm > 0 {
            AtaFeature::Apm(Some((cfg.set_apm - 1) as u8))
        } else {
            AtaFeature::Apm(None)
        };
        format_set_result(&mut msg, "APM", port.set_feature(feature).is_ok(), cfg.set_apm, true);
    }
    if cfg.set_lookahead != 0 {
        format_set_result(
            &mut msg,
            "Rd-ahead",
            port.set_feature(AtaFeature::ReadLookahead(cfg.set_lookahead > 0)).is_ok(),
            cfg.set_lookahead,
            false,
        );
    }
    if cfg.set_wcache != 0 {
        format_set_result(
            &mut msg,
            "Wr-cache",
            port.set_feature(AtaFeature::WriteCache(cfg.set_wcache > 0)).is_ok(),
            cfg.set_wcache,
            false,
        );
    }
    if cfg.set_dsn != 0 {
        format_set_result(
            &mut msg,
            "DSN",
            port.set_feature(AtaFeature::Dsn(cfg.set_dsn > 0)).is_ok(),
            cfg.set_dsn,
            false,
        );
    }
    if cfg.set_security_freeze {
        format_set_result(
            &mut msg,
            "Security freeze",
            port.set_feature(AtaFeature::SecurityFreeze).is_ok(),
            1,
            false,
        );
    }
    if cfg.set_standby != 0 {
        format_set_result(
            &mut msg,
            "Standby",
            port.set_feature(AtaFeature::StandbyTimer((cfg.set_standby - 1) as u8)).is_ok(),
            cfg.set_standby,
            true,
        );
    }

    if !msg.is_empty() {
        info!("Device: {}, ATA settings applied: {}", cfg.name, msg);
    }

    if let Some((rt, wt)) = cfg.sct_erc {
        if locked {
            info!(
                "Device: {}, no SCT support if ATA Security is LOCKED, ignoring -l scterc",
                cfg.name
            );
        } else {
            match port.set_sct_erc(rt, wt) {
                Ok(()) => info!(
                    "Device: {}, SCT Error Recovery Control set to: Read: {}, Write: {}",
                    cfg.name, rt, wt
                ),
                Err(DwError::NotSupported(_)) => info!(
                    "Device: {}, no SCT Error Recovery Control support, ignoring -l scterc",
                    cfg.name
                ),
                Err(_) => info!(
                    "Device: {}, set of SCT Error Recovery Control failed",
                    cfg.name
                ),
            }
        }
    }
}

/// One-time capability discovery and baseline setup. The port must be
/// open; the caller closes it afterwards.
pub fn probe_ata(
    cfg: &mut DeviceConfig,
    state: &mut DeviceState,
    port: &mut dyn AtaPort,
    ctx: &ProbeContext<'_>,
) -> ProbeOutcome {
    let identity = match port.read_identity() {
        Ok(id) => id,
        Err(_) => {
            info!(
                "Device: {}, not ATA, no IDENTIFY DEVICE Structure",
                cfg.name
            );
            return ProbeOutcome::NotCapable;
        }
    };

    state.num_sectors = identity.sectors;
    cfg.rotation_rate = identity.rotation_rate;

    let wwn_part = identity
        .wwn
        .as_ref()
        .map(|w| format!("{}, ", w))
        .unwrap_or_default();
    cfg.id_info = format!(
        "{}, S/N:{}, {}FW:{}, {}",
        identity.model,
        identity.serial,
        wwn_part,
        identity.firmware,
        format_capacity(identity.capacity_bytes)
    );
    cfg.id_is_unique = !sanitize_id_info(&mut cfg.id_info);

    info!("Device: {}, {}", cfg.name, cfg.id_info);

    if is_duplicate_identity(cfg, ctx.prev_configs) {
        return ProbeOutcome::Duplicate;
    }

    if cfg.preset_policy == PresetPolicy::Ignore {
        info!(
            "Device: {}, drive database not searched (Directive: -P ignore).",
            cfg.name
        );
    }

    if identity.security_locked {
        info!("Device: {}, ATA Security is **LOCKED**", cfg.name);
    }

    // Default pending-sector attributes unless set explicitly
    if !cfg.curr_pending_set {
        cfg.curr_pending_id = DEFAULT_CURR_PENDING_ID;
        cfg.curr_pending_incr = false;
    }
    if !cfg.offl_pending_set {
        cfg.offl_pending_id = DEFAULT_OFFL_PENDING_ID;
        cfg.offl_pending_incr = false;
    }

    match identity.smart_support {
        SmartSupport::Supported => {}
        SmartSupport::NotSupported | SmartSupport::Unknown => {
            if identity.smart_support == SmartSupport::NotSupported {
                info!("Device: {}, lacks SMART capability", cfg.name);
            } else {
                info!(
                    "Device: {}, ATA IDENTIFY DEVICE words 82-83 don't specify if SMART capable.",
                    cfg.name
                );
            }
            if cfg.permissive {
                info!(
                    "Device: {}, proceeding since '-T permissive' Directive given.",
                    cfg.name
                );
            } else {
                info!(
                    "Device: {}, to proceed anyway, use '-T permissive' Directive.",
                    cfg.name
                );
                return ProbeOutcome::NotCapable;
            }
        }
    }

    if port.enable_smart().is_err() {
        info!("Device: {}, could not enable SMART capability", cfg.name);
        if !identity.smart_enabled {
            if !cfg.permissive {
                info!(
                    "Device: {}, to proceed anyway, use '-T permissive' Directive.",
                    cfg.name
                );
                return ProbeOutcome::NotCapable;
            }
            info!(
                "Device: {}, proceeding since '-T permissive' Directive given.",
                cfg.name
            );
        } else {
            info!(
                "Device: {}, proceeding since SMART is already enabled",
                cfg.name
            );
        }
    }

    if let Some(enable) = cfg.autosave {
        let what = if enable { "enable" } else { "disable" };
        if port.set_attribute_autosave(enable).is_err() {
            info!(
                "Device: {}, could not {} SMART Attribute Autosave.",
                cfg.name, what
            );
        } else {
            info!("Device: {}, {}d SMART Attribute Autosave.", cfg.name, what);
        }
    }

    // Capability check: SMART status
    if cfg.smart_check && port.smart_status().is_err() {
        info!(
            "Device: {}, not capable of SMART Health Status check",
            cfg.name
        );
        cfg.smart_check = false;
    }

    // SMART values are needed even when only log monitoring is requested,
    // since capability bits live in the data block
    let mut smart_val_ok = false;
    if cfg.auto_offline.is_some()
        || cfg.track_selftest_log
        || cfg.track_error_log
        || cfg.track_xerror_log
        || cfg.track_offline_status
        || cfg.track_selftest_status
        || cfg.track_usage_failed
        || cfg.track_prefail
        || cfg.track_usage
        || cfg.temp_diff != 0
        || cfg.temp_info != 0
        || cfg.temp_crit != 0
        || cfg.curr_pending_id != 0
        || cfg.offl_pending_id != 0
    {
        match port.read_smart_values() {
            Err(_) => {
                info!("Device: {}, Read SMART Values failed", cfg.name);
                cfg.track_usage_failed = false;
                cfg.track_prefail = false;
                cfg.track_usage = false;
                cfg.temp_diff = 0;
                cfg.temp_info = 0;
                cfg.temp_crit = 0;
                cfg.curr_pending_id = 0;
                cfg.offl_pending_id = 0;
            }
            Ok(values) => {
                smart_val_ok = true;
                state.smart_values = values;
                match port.read_smart_thresholds() {
                    Ok(thres) => state.smart_thresholds = thres,
                    Err(_) => {
                        info!(
                            "Device: {}, Read SMART Thresholds failed{}",
                            cfg.name,
                            if cfg.track_usage_failed {
                                ", ignoring -f Directive"
                            } else {
                                ""
                            }
                        );
                        cfg.track_usage_failed = false;
                        state.smart_thresholds = AtaThresholds::default();
                    }
                }
            }
        }

        if cfg.curr_pending_id != 0
            && !check_pending_id(cfg, state, cfg.curr_pending_id, "Current_Pending_Sector")
        {
            cfg.curr_pending_id = 0;
        }
        if cfg.offl_pending_id != 0
            && !check_pending_id(cfg, state, cfg.offl_pending_id, "Offline_Uncorrectable")
        {
            cfg.offl_pending_id = 0;
        }

        if (cfg.temp_diff != 0 || cfg.temp_info != 0 || cfg.temp_crit != 0)
            && ata_temperature(&state.smart_values) == 0
        {
            info!(
                "Device: {}, can't monitor Temperature, ignoring -W {},{},{}",
                cfg.name, cfg.temp_diff, cfg.temp_info, cfg.temp_crit
            );
            cfg.temp_diff = 0;
            cfg.temp_info = 0;
            cfg.temp_crit = 0;
        }

        // Report ignored '-r' and '-R' directives
        for id in 1..=255u8 {
            if !cfg.attr_flags.is_set(id, attr_flag::RAW_PRINT) {
                continue;
            }
            let opt = if cfg.attr_flags.is_set(id, attr_flag::RAW_TRACK) {
                'R'
            } else {
                'r'
            };
            let excl_flag = if opt == 'r' {
                attr_flag::AS_CRIT
            } else {
                attr_flag::RAW_AS_CRIT
            };
            let excl = if cfg.attr_flags.is_set(id, excl_flag) {
                "!"
            } else {
                ""
            };
            match state.smart_values.find_attribute(id) {
                None => info!(
                    "Device: {}, no Attribute {}, ignoring -{} {}{}",
                    cfg.name, id, opt, id, excl
                ),
                Some(i) => {
                    let prefail = state.smart_values.attributes[i].is_prefailure();
                    if !((prefail && cfg.track_prefail) || (!prefail && cfg.track_usage)) {
                        info!(
                            "Device: {}, not monitoring {} Attributes, ignoring -{} {}{}",
                            cfg.name,
                            if prefail { "Prefailure" } else { "Usage" },
                            opt,
                            id,
                            excl
                        );
                    }
                }
            }
        }
    }

    if let Some(enable) = cfg.auto_offline {
        let what = if enable { "enable" } else { "disable" };
        if !smart_val_ok {
            info!(
                "Device: {}, could not {} SMART Automatic Offline Testing.",
                cfg.name, what
            );
        } else {
            if !supports_auto_offline_timer(&state.smart_values) {
                info!(
                    "Device: {}, SMART Automatic Offline Testing unsupported...",
                    cfg.name
                );
            }
            // try anyway
            if port.set_auto_offline(enable).is_err() {
                info!(
                    "Device: {}, {} SMART Automatic Offline Testing failed.",
                    cfg.name, what
                );
            } else {
                info!(
                    "Device: {}, {}d SMART Automatic Offline Testing.",
                    cfg.name, what
                );
            }
        }
    }

    // Capability check: self-test log
    state.saved.selftest_error_count = 0;
    state.saved.selftest_last_error_hour = 0;
    if cfg.track_selftest_log {
        match port.self_test_log_summary() {
            Ok(summary) => {
                state.saved.selftest_error_count = summary.error_count.min(255) as u8;
                state.saved.selftest_last_error_hour = summary.last_error_hour;
            }
            Err(_) => {
                info!(
                    "Device: {}, no SMART Self-test Log, ignoring -l selftest",
                    cfg.name
                );
                cfg.track_selftest_log = false;
            }
        }
    }

    // Capability check: error logs
    state.saved.ata_error_count = 0;
    if cfg.track_error_log {
        match port.error_count(false) {
            Ok(n) => state.saved.ata_error_count = n as i32,
            Err(_) => {
                info!("Device: {}, no SMART Error Log, ignoring -l error", cfg.name);
                cfg.track_error_log = false;
            }
        }
    }
    if cfg.track_xerror_log {
        match port.error_count(true) {
            Ok(n) => {
                let n = n as i32;
                if cfg.track_error_log && state.saved.ata_error_count != n {
                    info!(
                        "Device: {}, SMART Error Logs report different error counts: {} != {}",
                        cfg.name, state.saved.ata_error_count, n
                    );
                    // Record the maximum
                    state.saved.ata_error_count = state.saved.ata_error_count.max(n);
                } else {
                    state.saved.ata_error_count = n;
                }
            }
            Err(_) => {
                info!(
                    "Device: {}, no Extended Comprehensive SMART Error Log, ignoring -l xerror",
                    cfg.name
                );
                cfg.track_xerror_log = false;
            }
        }
    }

    // Capability check: self-test and offline collection status
    if (cfg.track_offline_status || cfg.track_selftest_status)
        && !(cfg.permissive
            || (smart_val_ok && state.smart_values.offline_collection_capability != 0))
    {
        if cfg.track_offline_status {
            info!(
                "Device: {}, no SMART Offline Data Collection capability, ignoring -l offlinests (override with -T permissive)",
                cfg.name
            );
        }
        if cfg.track_selftest_status {
            info!(
                "Device: {}, no SMART Self-test capability, ignoring -l selfteststs (override with -T permissive)",
                cfg.name
            );
        }
        cfg.track_offline_status = false;
        cfg.track_selftest_status = false;
    }

    // Capability check: power mode
    if cfg.power_gate.is_some() {
        match port.check_power_mode() {
            Err(_) => {
                error!(
                    "Device: {}, no ATA CHECK POWER STATUS support, ignoring -n Directive",
                    cfg.name
                );
                cfg.power_gate = None;
            }
            Ok(AtaPowerMode::Unknown(code)) => {
                error!(
                    "Device: {}, CHECK POWER STATUS returned {}, not ATA compliant, ignoring -n Directive",
                    cfg.name, code
                );
                cfg.power_gate = None;
            }
            Ok(_) => {}
        }
    }

    apply_on_open_settings(cfg, port, identity.security_locked);

    if !cfg.any_monitor_enabled() {
        return ProbeOutcome::NothingToMonitor;
    }

    info!(
        "Device: {}, is SMART capable. Adding to \"monitor\" list.",
        cfg.name
    );

    attach_state_files(
        cfg,
        state,
        ctx,
        Transport::Ata,
        &[&identity.model, &identity.serial],
        None,
    );
    finish_device_scan(cfg, state, ctx.now);

    ProbeOutcome::Registered
}

fn log_offline_status(name: &str, status: u8) {
    let msg = match status & 0x7f {
        0x00 => Some("was never started"),
        0x02 => Some("was completed without error"),
        0x03 => Some("is in progress"),
        0x04 => Some("was suspended by an interrupting command from host"),
        0x05 => Some("was aborted by an interrupting command from host"),
        0x06 => Some("was aborted by the device with a fatal error"),
        _ => None,
    };
    match msg {
        Some(m) => {
            let auto = if status & 0x80 != 0 { " (auto:on)" } else { "" };
            if status & 0x7f == 0x06 {
                error!("Device: {}, offline data collection {}{}", name, m, auto);
            } else {
                info!("Device: {}, offline data collection {}{}", name, m, auto);
            }
        }
        None => info!(
            "Device: {}, unknown offline data collection status 0x{:02x}",
            name, status
        ),
    }
}

fn log_selftest_status(name: &str, status: u8) {
    let msg = match status >> 4 {
        0x0 => Some("completed without error"),
        0x1 => Some("was aborted by the host"),
        0x2 => Some("was interrupted by the host with a reset"),
        0x3 => Some("could not complete due to a fatal or unknown error"),
        0x4 => Some("completed with error (unknown test element)"),
        0x5 => Some("completed with error (electrical test element)"),
        0x6 => Some("completed with error (servo/seek test element)"),
        0x7 => Some("completed with error (read test element)"),
        0x8 => Some("completed with error (handling damage?)"),
        _ => None,
    };
    match msg {
        Some(m) => {
            if status >> 4 >= 0x4 {
                error!("Device: {}, previous self-test {}", name, m);
            } else {
                info!("Device: {}, previous self-test {}", name, m);
            }
        }
        None if status >> 4 == 0xf => info!(
            "Device: {}, self-test in progress, {}0% remaining",
            name,
            status & 0x0f
        ),
        None => info!("Device: {}, unknown self-test status 0x{:02x}", name, status),
    }
}

/// Pending-sector check of one attribute id against the previous values.
fn check_pending(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    warner: &Warner,
    id: u8,
    increase_only: bool,
    new_values: &AtaSmartValues,
    kind: WarnKind,
    what: &str,
) {
    // Attribute must exist at the same table slot as before
    let Some(i) = new_values.find_attribute(id) else {
        return;
    };
    if state.smart_values.find_attribute(id) != Some(i) {
        return;
    }

    let rawval = new_values.attributes[i].raw_value();
    if rawval == 0 {
        reset_warning(cfg, state, kind, &format!("No more {}", what));
        return;
    }

    // If the attribute does not reset, report only increases
    let prev_rawval = state.smart_values.attributes[i].raw_value();
    if increase_only && prev_rawval >= rawval {
        return;
    }

    let mut msg = format!("Device: {}, {} {}", cfg.name, rawval, what);
    if prev_rawval > 0 && rawval != prev_rawval {
        msg.push_str(&format!(" (changed {:+})", rawval as i64 - prev_rawval as i64));
    }
    error!("{}", msg);
    mail_warning(warner, cfg, state, kind, &msg);
    state.must_write = true;
}

/// Compare one attribute against its previous snapshot and report
/// failures and changes.
fn check_attribute(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    warner: &Warner,
    attr: &AtaAttribute,
    prev: &AtaAttribute,
    index: usize,
    thresholds: &AtaThresholds,
) {
    use crate::device::AttrState;

    let attrstate = attribute_state(attr, index, thresholds);
    if attrstate == AttrState::NonExisting {
        return;
    }

    // Failed usage attributes are reported regardless of tracking
    if cfg.track_usage_failed
        && attrstate == AttrState::FailedNow
        && !attr.is_prefailure()
        && !cfg.attr_flags.is_set(attr.id, attr_flag::IGNORE_FAILED_USAGE)
    {
        let msg = format!(
            "Device: {}, Failed SMART usage Attribute: {} {}.",
            cfg.name,
            attr.id,
            attribute_name(attr.id, cfg.rotation_rate)
        );
        error!("{}", msg);
        mail_warning(warner, cfg, state, WarnKind::Usage, &msg);
        state.must_write = true;
    }

    // Tracking only applies to the requested attribute class
    let prefail = attr.is_prefailure();
    if !((prefail && cfg.track_prefail) || (!prefail && cfg.track_usage)) {
        return;
    }
    if cfg.attr_flags.is_set(attr.id, attr_flag::IGNORE) {
        return;
    }

    if attr.id != prev.id {
        info!(
            "Device: {}, same Attribute has different ID numbers: {} = {}",
            cfg.name, attr.id, prev.id
        );
        return;
    }

    let valchanged = attr.current != prev.current;
    let rawchanged = cfg.attr_flags.is_set(attr.id, attr_flag::RAW_TRACK)
        && attr.raw_value() != prev.raw_value();
    if !(valchanged || rawchanged) {
        return;
    }

    let (currstr, prevstr) = if cfg.attr_flags.is_set(attr.id, attr_flag::RAW_PRINT) {
        (
            format!("{} [Raw {}]", attr.current, attr.raw_value()),
            format!("{} [Raw {}]", prev.current, prev.raw_value()),
        )
    } else {
        (attr.current.to_string(), prev.current.to_string())
    };

    let msg = format!(
        "Device: {}, SMART {} Attribute: {} {} changed from {} to {}",
        cfg.name,
        if prefail { "Prefailure" } else { "Usage" },
        attr.id,
        attribute_name(attr.id, cfg.rotation_rate),
        prevstr,
        currstr
    );

    let critical = (valchanged && cfg.attr_flags.is_set(attr.id, attr_flag::AS_CRIT))
        || (rawchanged && cfg.attr_flags.is_set(attr.id, attr_flag::RAW_AS_CRIT));
    if critical {
        error!("{}", msg);
        mail_warning(warner, cfg, state, WarnKind::Usage, &msg);
    } else {
        info!("{}", msg);
    }
    state.must_write = true;
}

/// Wait for a possible spin-up between two power mode queries.
fn spinup_wait() {
    std::thread::sleep(std::time::Duration::from_secs(5));
}

/// Power gate decision: returns the mode label if the check should be
/// suspended at this power level.
fn gated(mode: AtaPowerMode, gate: PowerGate) -> bool {
    match mode {
        AtaPowerMode::Sleep => true, // any gate level skips a sleeping disk
        AtaPowerMode::Standby | AtaPowerMode::StandbyY => {
            matches!(gate, PowerGate::Standby | PowerGate::Idle)
        }
        AtaPowerMode::Idle | AtaPowerMode::IdleA | AtaPowerMode::IdleB | AtaPowerMode::IdleC => {
            matches!(gate, PowerGate::Idle)
        }
        _ => false,
    }
}

/// One periodic check of an ATA device.
pub fn check_ata(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    port: &mut dyn AtaPort,
    ctx: &CheckContext<'_>,
) {
    let os_standby = cfg.power_gate.is_some()
        && !state.power_mode_fail
        && !state.removed
        && port.is_powered_down();
    if !open_for_check(cfg, state, ctx, "ATA", os_standby, &mut || port.open()) {
        return;
    }

    // Leave the disk alone if it is in a low power mode (-n Directive)
    if let Some(gate) = cfg.power_gate.filter(|_| !state.power_mode_fail) {
        let mode = match port.check_power_mode() {
            Ok(m) => m,
            Err(_) => AtaPowerMode::Sleep,
        };
        let mode = if !mode.is_fully_awake() && !matches!(mode, AtaPowerMode::Sleep) {
            // wait for a possible spin up and check again
            spinup_wait();
            let again = port.check_power_mode().unwrap_or(mode);
            if again.code() > mode.code() {
                info!(
                    "Device: {}, CHECK POWER STATUS spins up disk (0x{:02x} -> 0x{:02x})",
                    cfg.name,
                    mode.code(),
                    again.code()
                );
            }
            again
        } else {
            mode
        };

        if let AtaPowerMode::Unknown(code) = mode {
            error!(
                "Device: {}, CHECK POWER STATUS returned {}, not ATA compliant, ignoring -n Directive",
                cfg.name, code
            );
            state.power_mode_fail = true;
        } else if gated(mode, gate) {
            if cfg.power_skip_max == 0 || state.power_skip_count < cfg.power_skip_max {
                port.close();
                let skipped = SkippedPowerMode::Mode(mode.code());
                if (state.power_skip_count == 0
                    || state.last_power_mode_skipped != Some(skipped))
                    && !cfg.power_quiet
                {
                    info!(
                        "Device: {}, is in {} mode, suspending checks",
                        cfg.name,
                        mode.label()
                    );
                    state.last_power_mode_skipped = Some(skipped);
                }
                state.power_skip_count += 1;
                return;
            }
            info!(
                "Device: {}, {} mode ignored due to reached limit of skipped checks ({} check{} skipped)",
                cfg.name,
                mode.label(),
                state.power_skip_count,
                if state.power_skip_count == 1 { "" } else { "s" }
            );
            state.power_skip_count = 0;
            state.temp_min_delay = ctx.now + i64::from(DEFAULT_CHECKTIME) - 60;
        } else if state.power_skip_count > 0 {
            info!(
                "Device: {}, is back in {} mode, resuming checks ({} check{} skipped)",
                cfg.name,
                mode.label(),
                state.power_skip_count,
                if state.power_skip_count == 1 { "" } else { "s" }
            );
            state.power_skip_count = 0;
            state.temp_min_delay = ctx.now + i64::from(DEFAULT_CHECKTIME) - 60;
        }
    }

    // SMART health status
    if cfg.smart_check {
        match port.smart_status() {
            Err(_) => {
                info!("Device: {}, not capable of SMART self-check", cfg.name);
                mail_warning(
                    ctx.warner,
                    cfg,
                    state,
                    WarnKind::FailedHealthCheck,
                    &format!("Device: {}, not capable of SMART self-check", cfg.name),
                );
                state.must_write = true;
            }
            Ok(HealthStatus::Failed) => {
                let msg = format!(
                    "Device: {}, FAILED SMART self-check. BACK UP DATA NOW!",
                    cfg.name
                );
                error!("{}", msg);
                mail_warning(ctx.warner, cfg, state, WarnKind::Health, &msg);
                state.must_write = true;
            }
            Ok(HealthStatus::Passed) => {}
        }
    }

    // Everything that depends on the SMART data block
    if cfg.track_usage_failed
        || cfg.track_prefail
        || cfg.track_usage
        || cfg.curr_pending_id != 0
        || cfg.offl_pending_id != 0
        || cfg.temp_diff != 0
        || cfg.temp_info != 0
        || cfg.temp_crit != 0
        || cfg.track_selftest_log
        || cfg.track_offline_status
        || cfg.track_selftest_status
    {
        match port.read_smart_values() {
            Err(_) => {
                let msg = format!("Device: {}, failed to read SMART Attribute Data", cfg.name);
                error!("{}", msg);
                mail_warning(ctx.warner, cfg, state, WarnKind::FailedReadSmartData, &msg);
                state.must_write = true;
            }
            Ok(curval) => {
                reset_warning(
                    cfg,
                    state,
                    WarnKind::FailedReadSmartData,
                    "read SMART Attribute Data worked again",
                );

                if cfg.curr_pending_id != 0 {
                    check_pending(
                        cfg,
                        state,
                        ctx.warner,
                        cfg.curr_pending_id,
                        cfg.curr_pending_incr,
                        &curval,
                        WarnKind::CurrentPendingSector,
                        if cfg.curr_pending_incr {
                            "Total unreadable (pending) sectors"
                        } else {
                            "Currently unreadable (pending) sectors"
                        },
                    );
                }
                if cfg.offl_pending_id != 0 {
                    check_pending(
                        cfg,
                        state,
                        ctx.warner,
                        cfg.offl_pending_id,
                        cfg.offl_pending_incr,
                        &curval,
                        WarnKind::OfflineUncorrectableSector,
                        if cfg.offl_pending_incr {
                            "Total offline uncorrectable sectors"
                        } else {
                            "Offline uncorrectable sectors"
                        },
                    );
                }

                if cfg.temp_diff != 0 || cfg.temp_info != 0 || cfg.temp_crit != 0 {
                    check_temperature(
                        cfg,
                        state,
                        ctx.warner,
                        ata_temperature(&curval),
                        0,
                        ctx.now,
                    );
                }

                if cfg.track_usage_failed || cfg.track_prefail || cfg.track_usage {
                    let prev_values = state.smart_values;
                    let thresholds = state.smart_thresholds;
                    for i in 0..curval.attributes.len() {
                        check_attribute(
                            cfg,
                            state,
                            ctx.warner,
                            &curval.attributes[i],
                            &prev_values.attributes[i],
                            i,
                            &thresholds,
                        );
                    }
                }

                if cfg.track_offline_status {
                    let changed = curval.offline_collection_status
                        != state.smart_values.offline_collection_status;
                    if changed
                        || state.offline_started
                        || (ctx.first_pass
                            && (ctx.debug || curval.offline_collection_status & 0x7d != 0))
                    {
                        log_offline_status(&cfg.name, curval.offline_collection_status);
                    }
                }

                if cfg.track_selftest_status {
                    let changed =
                        curval.self_test_exec_status != state.smart_values.self_test_exec_status;
                    if changed
                        || state.selftest_started
                        || (ctx.first_pass
                            && (ctx.debug || curval.self_test_exec_status & 0xf0 != 0))
                    {
                        log_selftest_status(&cfg.name, curval.self_test_exec_status);
                    }
                }

                state.smart_values = curval;
                state.sync_ata_attributes_to_saved();
                state.attrlog = Some(AttrlogKind::Ata);
            }
        }
    }
    state.offline_started = false;
    state.selftest_started = false;

    // Self-test log deltas (the error count may also decrease)
    if cfg.track_selftest_log {
        match port.self_test_log_summary() {
            Ok(summary) => report_self_test_changes(
                cfg,
                state,
                ctx.warner,
                Some(summary.error_count),
                summary.last_error_hour,
            ),
            Err(_) => {
                info!("Device: {}, Read SMART Self Test Log Failed", cfg.name);
                report_self_test_changes(cfg, state, ctx.warner, None, 0);
            }
        }
    }

    // Error log growth
    if cfg.track_error_log || cfg.track_xerror_log {
        let errcnt1 = if cfg.track_error_log {
            match port.error_count(false) {
                Ok(n) => Some(n as i32),
                Err(_) => {
                    info!("Device: {}, Read Summary SMART Error Log failed", cfg.name);
                    None
                }
            }
        } else {
            None
        };
        let errcnt2 = if cfg.track_xerror_log {
            match port.error_count(true) {
                Ok(n) => Some(n as i32),
                Err(_) => {
                    info!(
                        "Device: {}, Read Extended Comprehensive SMART Error Log failed",
                        cfg.name
                    );
                    None
                }
            }
        } else {
            None
        };

        // New error count is the maximum of both logs
        let newc = errcnt1.into_iter().chain(errcnt2).max();
        match newc {
            None => {
                mail_warning(
                    ctx.warner,
                    cfg,
                    state,
                    WarnKind::FailedReadSmartErrorLog,
                    &format!("Device: {}, Read SMART Error Log Failed", cfg.name),
                );
            }
            Some(newc) => {
                let oldc = state.saved.ata_error_count;
                if newc > oldc {
                    let msg = format!(
                        "Device: {}, ATA error count increased from {} to {}",
                        cfg.name, oldc, newc
                    );
                    error!("{}", msg);
                    mail_warning(ctx.warner, cfg, state, WarnKind::ErrorCount, &msg);
                    state.must_write = true;
                }
                state.saved.ata_error_count = newc;
            }
        }
    }

    // Scheduled self-tests
    if ctx.allow_selftests && cfg.test_regex.is_some() {
        if let Some(test) = next_scheduled_test(cfg, state, ctx.now, true) {
            start_ata_self_test(cfg, state, port, test);
        }
    }

    // Don't leave the device open; the OS or user may want it before the
    // next cycle
    port.close();
}

/// Start an offline, self, or selective test. Refuses if one is already
/// running, unless a known firmware bug makes the status byte unreliable.
pub fn start_ata_self_test(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    port: &mut dyn AtaPort,
    test: TestType,
) {
    let data = match port.read_smart_values() {
        Ok(d) if d.offline_collection_capability != 0 => d,
        _ => {
            error!(
                "Device: {}, not capable of Offline or Self-Testing.",
                cfg.name
            );
            return;
        }
    };

    let (testname, kind) = match test {
        TestType::Offline => {
            if !data.supports_offline_immediate() {
                state.not_cap_offline = true;
                error!("Device: {}, not capable of Offline Immediate Test", cfg.name);
                return;
            }
            ("Offline Immediate ", Some(AtaTestKind::OfflineImmediate))
        }
        TestType::Conveyance => {
            if !data.supports_conveyance_test() {
                state.not_cap_conveyance = true;
                error!("Device: {}, not capable of Conveyance Self-Test", cfg.name);
                return;
            }
            ("Conveyance Self-", Some(AtaTestKind::Conveyance))
        }
        TestType::Short => {
            if !data.supports_self_test() {
                state.not_cap_short = true;
                error!("Device: {}, not capable of Short Self-Test", cfg.name);
                return;
            }
            ("Short Self-", Some(AtaTestKind::Short))
        }
        TestType::Long => {
            if !data.supports_self_test() {
                state.not_cap_long = true;
                error!("Device: {}, not capable of Long Self-Test", cfg.name);
                return;
            }
            ("Long Self-", Some(AtaTestKind::Long))
        }
        TestType::SelectiveNext | TestType::SelectiveContinue | TestType::SelectiveRedo => {
            if !data.supports_selective_test() {
                state.not_cap_selective = true;
                error!("Device: {}, not capable of Selective Self-Test", cfg.name);
                return;
            }
            ("Selective Self-", None)
        }
    };

    // Never interrupt a running self-test to start another
    if self_test_in_progress(data.self_test_exec_status) {
        if cfg.firmware_bugs.samsung3 && data.self_test_exec_status == 0xf0 {
            info!(
                "Device: {}, will not skip scheduled {}Test despite unclear Self-Test byte (SAMSUNG Firmware bug).",
                cfg.name, testname
            );
        } else {
            info!(
                "Device: {}, skip scheduled {}Test; {}0% remaining of current Self-Test.",
                cfg.name,
                testname,
                data.self_test_exec_status & 0x0f
            );
            return;
        }
    }

    match kind {
        Some(kind) => {
            if port.start_self_test(kind).is_err() {
                error!("Device: {}, execute {}Test failed.", cfg.name, testname);
                return;
            }
        }
        None => {
            let mode = match test {
                TestType::SelectiveNext => SelectiveMode::Next,
                TestType::SelectiveContinue => SelectiveMode::Continue,
                _ => SelectiveMode::Redo,
            };
            let span = port.start_selective_self_test(
                mode,
                state.saved.selective_last_start,
                state.saved.selective_last_end,
                state.num_sectors,
            );
            let (start, end) = match span {
                Ok(s) => s,
                Err(_) => {
                    error!("Device: {}, prepare {}Test failed", cfg.name, testname);
                    return;
                }
            };
            let sectors = state.num_sectors.max(1);
            info!(
                "Device: {}, {} test span at LBA {} - {} ({} sectors, {}% - {}% of disk).",
                cfg.name,
                if mode == SelectiveMode::Next { "next" } else { "redo" },
                start,
                end,
                end - start + 1,
                (100 * start + sectors / 2) / sectors,
                (100 * end + sectors / 2) / sectors
            );
            state.saved.selective_last_start = start;
            state.saved.selective_last_end = end;
        }
    }

    // Report the start to the auto-standby policy and force a log of the
    // next status read even if the device reports it unchanged
    if test == TestType::Offline {
        state.offline_started = true;
    } else {
        state.selftest_started = true;
    }
    info!("Device: {}, starting scheduled {}Test.", cfg.name, testname);
}

/// Offline collection or self-test activity relevant for the auto-standby
/// policy.
pub fn test_in_progress_for_standby(cfg: &DeviceConfig, state: &DeviceState) -> bool {
    (cfg.offline_status_ns
        && (state.offline_started
            || offline_collection_in_progress(state.smart_values.offline_collection_status)))
        || (cfg.selftest_status_ns
            && (state.selftest_started
                || self_test_in_progress(state.smart_values.self_test_exec_status)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmailFreq;
    use crate::device::{AtaIdentity, AtaThresholdEntry, SelfTestSummary};
    use dw_error::Result;

    /// Scripted ATA port for exercising probe and check logic.
    #[derive(Default)]
    struct MockAta {
        identity: AtaIdentity,
        values: Vec<AtaSmartValues>,
        thresholds: AtaThresholds,
        selftest: Vec<Result<SelfTestSummary>>,
        errors: Vec<Result<u32>>,
        power_mode: Option<AtaPowerMode>,
        health: Option<HealthStatus>,
        started_tests: Vec<AtaTestKind>,
        selective_starts: Vec<(SelectiveMode, u64, u64)>,
        open_fails: bool,
        opens: u32,
        closes: u32,
    }

    impl MockAta {
        fn next_values(&mut self) -> AtaSmartValues {
            if self.values.len() > 1 {
                self.values.remove(0)
            } else {
                self.values[0]
            }
        }
    }

    impl AtaPort for MockAta {
        fn open(&mut self) -> Result<()> {
            if self.open_fails {
                return Err(DwError::DeviceOpen("no such device".into()));
            }
            self.opens += 1;
            Ok(())
        }
        fn close(&mut self) {
            self.closes += 1;
        }
        fn read_identity(&mut self) -> Result<AtaIdentity> {
            Ok(self.identity.clone())
        }
        fn enable_smart(&mut self) -> Result<()> {
            Ok(())
        }
        fn set_attribute_autosave(&mut self, _enable: bool) -> Result<()> {
            Ok(())
        }
        fn set_auto_offline(&mut self, _enable: bool) -> Result<()> {
            Ok(())
        }
        fn smart_status(&mut self) -> Result<HealthStatus> {
            self.health.ok_or_else(|| DwError::not_supported("SMART status"))
        }
        fn read_smart_values(&mut self) -> Result<AtaSmartValues> {
            if self.values.is_empty() {
                Err(DwError::device("read SMART values"))
            } else {
                Ok(self.next_values())
            }
        }
        fn read_smart_thresholds(&mut self) -> Result<AtaThresholds> {
            Ok(self.thresholds)
        }
        fn self_test_log_summary(&mut self) -> Result<SelfTestSummary> {
            if self.selftest.is_empty() {
                Err(DwError::not_supported("self-test log"))
            } else if self.selftest.len() > 1 {
                self.selftest.remove(0)
            } else {
                self.selftest[0].as_ref().copied().map_err(|_| DwError::device("log"))
            }
        }
        fn error_count(&mut self, _extended: bool) -> Result<u32> {
            if self.errors.is_empty() {
                Err(DwError::not_supported("error log"))
            } else if self.errors.len() > 1 {
                self.errors.remove(0)
            } else {
                self.errors[0].as_ref().copied().map_err(|_| DwError::device("log"))
            }
        }
        fn check_power_mode(&mut self) -> Result<AtaPowerMode> {
            self.power_mode.ok_or_else(|| DwError::not_supported("power mode"))
        }
        fn set_feature(&mut self, _feature: AtaFeature) -> Result<()> {
            Ok(())
        }
        fn set_sct_erc(&mut self, _r: u16, _w: u16) -> Result<()> {
            Ok(())
        }
        fn start_self_test(&mut self, kind: AtaTestKind) -> Result<()> {
            self.started_tests.push(kind);
            Ok(())
        }
        fn start_selective_self_test(
            &mut self,
            mode: SelectiveMode,
            prev_start: u64,
            prev_end: u64,
            _num_sectors: u64,
        ) -> Result<(u64, u64)> {
            self.selective_starts.push((mode, prev_start, prev_end));
            Ok((prev_end + 1, prev_end + 1000))
        }
    }

    fn values_with(attrs: &[(u8, u16, u8, u64)]) -> AtaSmartValues {
        let mut v = AtaSmartValues {
            offline_collection_capability: 0x7b,
            ..AtaSmartValues::default()
        };
        for (i, &(id, flags, current, raw)) in attrs.iter().enumerate() {
            v.attributes[i] = AtaAttribute {
                id,
                flags,
                current,
                worst: current,
                raw: [0; 6],
                reserv: 0,
            };
            v.attributes[i].set_raw_value(raw);
        }
        v
    }

    fn warn_cfg() -> DeviceConfig {
        DeviceConfig {
            name: "/dev/sda".into(),
            dev_name: "/dev/sda".into(),
            email_address: "ops@example.org".into(),
            email_freq: EmailFreq::Once,
            ..DeviceConfig::default()
        }
    }

    fn ctx<'a>(warner: &'a Warner) -> CheckContext<'a> {
        CheckContext {
            warner,
            first_pass: false,
            allow_selftests: true,
            debug: false,
            now: 1_700_000_000,
        }
    }

    #[test]
    fn test_check_health_failed_sends_mail() {
        let warner = Warner::default();
        let mut cfg = warn_cfg();
        cfg.smart_check = true;
        let mut state = DeviceState::default();
        let mut port = MockAta {
            health: Some(HealthStatus::Failed),
            ..MockAta::default()
        };

        check_ata(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(state.saved.mail[WarnKind::Health.index()].logged, 1);
        assert!(state.must_write);
        assert_eq!(port.closes, 1);
    }

    #[test]
    fn test_attribute_change_tracking_and_crit_flag() {
        let warner = Warner::default();
        let mut cfg = warn_cfg();
        cfg.track_prefail = true;
        cfg.track_usage = true;
        cfg.attr_flags.set(5, attr_flag::RAW_PRINT | attr_flag::AS_CRIT);

        let mut state = DeviceState::default();
        state.smart_values = values_with(&[(5, 0x33, 100, 0), (9, 0x32, 98, 4000)]);
        let mut port = MockAta {
            values: vec![values_with(&[(5, 0x33, 95, 2), (9, 0x32, 98, 4000)])],
            ..MockAta::default()
        };

        check_ata(&cfg, &mut state, &mut port, &ctx(&warner));
        // attribute 5 changed and is flagged critical: Usage mail sent
        assert_eq!(state.saved.mail[WarnKind::Usage.index()].logged, 1);
        // new values became the baseline
        assert_eq!(state.smart_values.attributes[0].current, 95);
        assert_eq!(state.attrlog, Some(AttrlogKind::Ata));
    }

    #[test]
    fn test_failed_usage_attribute_mails() {
        let warner = Warner::default();
        let mut cfg = warn_cfg();
        cfg.track_usage_failed = true;
        let mut state = DeviceState::default();
        let mut values = values_with(&[(202, 0x0032, 10, 0)]);
        values.attributes[0].worst = 10;
        state.smart_values = values;

        let mut port = MockAta {
            values: vec![values],
            thresholds: AtaThresholds {
                entries: {
                    let mut e = [AtaThresholdEntry::default(); 30];
                    e[0] = AtaThresholdEntry { id: 202, threshold: 25 };
                    e
                },
            },
            ..MockAta::default()
        };
        // thresholds are read at probe time; seed them directly here
        state.smart_thresholds = port.thresholds;

        check_ata(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(state.saved.mail[WarnKind::Usage.index()].logged, 1);
    }

    #[test]
    fn test_pending_sector_report_and_clear() {
        let warner = Warner::default();
        let mut cfg = warn_cfg();
        cfg.curr_pending_id = 197;
        let mut state = DeviceState::default();
        state.num_sectors = 1_000_000;
        state.smart_values = values_with(&[(197, 0x0032, 100, 0)]);

        let mut port = MockAta {
            values: vec![values_with(&[(197, 0x0032, 100, 12)])],
            ..MockAta::default()
        };
        check_ata(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(
            state.saved.mail[WarnKind::CurrentPendingSector.index()].logged,
            1
        );

        // raw back to zero clears the warning history
        let mut port = MockAta {
            values: vec![values_with(&[(197, 0x0032, 100, 0)])],
            ..MockAta::default()
        };
        check_ata(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(
            state.saved.mail[WarnKind::CurrentPendingSector.index()].logged,
            0
        );
    }

    #[test]
    fn test_pending_sector_increase_only() {
        let warner = Warner::default();
        let mut cfg = warn_cfg();
        cfg.curr_pending_id = 197;
        cfg.curr_pending_incr = true;
        cfg.email_freq = EmailFreq::Always;
        let mut state = DeviceState::default();
        state.num_sectors = 1_000_000;
        state.smart_values = values_with(&[(197, 0x0032, 100, 8)]);

        // equal value: no report
        let mut port = MockAta {
            values: vec![values_with(&[(197, 0x0032, 100, 8)])],
            ..MockAta::default()
        };
        check_ata(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(
            state.saved.mail[WarnKind::CurrentPendingSector.index()].logged,
            0
        );

        // strict increase: report
        let mut port = MockAta {
            values: vec![values_with(&[(197, 0x0032, 100, 9)])],
            ..MockAta::default()
        };
        check_ata(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(
            state.saved.mail[WarnKind::CurrentPendingSector.index()].logged,
            1
        );
    }

    #[test]
    fn test_error_log_growth_mails() {
        let warner = Warner::default();
        let mut cfg = warn_cfg();
        cfg.track_error_log = true;
        let mut state = DeviceState::default();
        state.saved.ata_error_count = 2;

        let mut port = MockAta {
            errors: vec![Ok(5)],
            ..MockAta::default()
        };
        check_ata(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(state.saved.ata_error_count, 5);
        assert_eq!(state.saved.mail[WarnKind::ErrorCount.index()].logged, 1);

        // decrease: recorded, no mail reset
        let mut port = MockAta {
            errors: vec![Ok(3)],
            ..MockAta::default()
        };
        check_ata(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(state.saved.ata_error_count, 3);
        assert_eq!(state.saved.mail[WarnKind::ErrorCount.index()].logged, 1);
    }

    #[test]
    fn test_failed_open_mails_once_per_policy() {
        let warner = Warner::default();
        let cfg = warn_cfg(); // freq Once
        let mut state = DeviceState::default();
        let mut port = MockAta {
            open_fails: true,
            ..MockAta::default()
        };

        check_ata(&cfg, &mut state, &mut port, &ctx(&warner));
        check_ata(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(state.saved.mail[WarnKind::FailedOpenDevice.index()].logged, 1);

        // a successful open resets the history
        port.open_fails = false;
        check_ata(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(state.saved.mail[WarnKind::FailedOpenDevice.index()].logged, 0);
    }

    #[test]
    fn test_removable_device_squelches_mail() {
        let warner = Warner::default();
        let mut cfg = warn_cfg();
        cfg.removable = true;
        let mut state = DeviceState::default();
        let mut port = MockAta {
            open_fails: true,
            ..MockAta::default()
        };

        check_ata(&cfg, &mut state, &mut port, &ctx(&warner));
        assert!(state.removed);
        assert_eq!(state.saved.mail[WarnKind::FailedOpenDevice.index()].logged, 0);

        port.open_fails = false;
        check_ata(&cfg, &mut state, &mut port, &ctx(&warner));
        assert!(!state.removed);
    }

    #[test]
    fn test_scheduled_test_starts_and_skips_when_running() {
        let warner = Warner::default();
        let mut cfg = warn_cfg();
        cfg.test_regex = Some(crate::schedule::TestRegex::compile("S/../../../..").unwrap());
        let mut state = DeviceState::default();
        state.saved.scheduled_test_next_check = 1_700_000_000;

        let mut port = MockAta {
            values: vec![values_with(&[(9, 0x32, 98, 100)])],
            ..MockAta::default()
        };
        check_ata(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(port.started_tests, vec![AtaTestKind::Short]);
        assert!(state.selftest_started);

        // next cycle: a test is already in progress, don't start another
        let mut running = values_with(&[(9, 0x32, 98, 100)]);
        running.self_test_exec_status = 0xf5;
        let mut state2 = DeviceState::default();
        state2.saved.scheduled_test_next_check = 1_700_000_000;
        let mut port2 = MockAta {
            values: vec![running],
            ..MockAta::default()
        };
        check_ata(&cfg, &mut state2, &mut port2, &ctx(&warner));
        assert!(port2.started_tests.is_empty());
    }

    #[test]
    fn test_selective_test_persists_span() {
        let warner = Warner::default();
        let cfg = warn_cfg();
        let mut state = DeviceState::default();
        state.num_sectors = 1_000_000;
        state.saved.selective_last_start = 0;
        state.saved.selective_last_end = 9999;

        let mut port = MockAta {
            values: vec![values_with(&[(9, 0x32, 98, 100)])],
            ..MockAta::default()
        };
        start_ata_self_test(&cfg, &mut state, &mut port, TestType::SelectiveNext);
        assert_eq!(port.selective_starts, vec![(SelectiveMode::Next, 0, 9999)]);
        assert_eq!(state.saved.selective_last_start, 10000);
        assert_eq!(state.saved.selective_last_end, 10999);
        assert!(state.selftest_started);
    }

    #[test]
    fn test_probe_disables_unsupported_monitors() {
        let warner = Warner::default();
        let mut cfg = warn_cfg();
        cfg.smart_check = true;
        cfg.track_selftest_log = true;
        cfg.track_error_log = true;
        cfg.track_prefail = true;
        cfg.temp_crit = 60;
        let mut state = DeviceState::default();

        let mut port = MockAta {
            identity: AtaIdentity {
                model: "ST4000DM004".into(),
                serial: "ZDH0ABCD".into(),
                firmware: "0001".into(),
                capacity_bytes: 4_000_787_030_016,
                sectors: 7_814_037_168,
                rotation_rate: 5400,
                smart_support: SmartSupport::Supported,
                smart_enabled: true,
                ..AtaIdentity::default()
            },
            // no temperature attribute in the table
            values: vec![values_with(&[(5, 0x33, 100, 0)])],
            health: Some(HealthStatus::Passed),
            selftest: vec![],  // unsupported
            errors: vec![],    // unsupported
            ..MockAta::default()
        };

        let probe_ctx = ProbeContext {
            prev_configs: &[],
            state_prefix: None,
            attrlog_prefix: None,
            warner: &warner,
            now: 1_700_000_000,
        };
        let outcome = probe_ata(&mut cfg, &mut state, &mut port, &probe_ctx);
        assert_eq!(outcome, ProbeOutcome::Registered);
        assert!(cfg.smart_check);
        assert!(!cfg.track_selftest_log);
        assert!(!cfg.track_error_log);
        assert_eq!(cfg.temp_crit, 0);
        // defaults applied
        assert_eq!(cfg.curr_pending_id, 197);
        assert_eq!(cfg.offl_pending_id, 198);
        assert!(cfg.id_info.starts_with("ST4000DM004, S/N:ZDH0ABCD"));
        assert!(cfg.id_is_unique);
    }

    #[test]
    fn test_probe_duplicate_identity_rejected() {
        let warner = Warner::default();
        let mut first = warn_cfg();
        first.id_info = "ST4000DM004, S/N:ZDH0ABCD, FW:0001, 4.00 TB".into();
        first.id_is_unique = true;

        let mut cfg = warn_cfg();
        let mut state = DeviceState::default();
        let mut port = MockAta {
            identity: AtaIdentity {
                model: "ST4000DM004".into(),
                serial: "ZDH0ABCD".into(),
                firmware: "0001".into(),
                capacity_bytes: 4_000_787_030_016,
                smart_support: SmartSupport::Supported,
                smart_enabled: true,
                ..AtaIdentity::default()
            },
            values: vec![values_with(&[(5, 0x33, 100, 0)])],
            ..MockAta::default()
        };
        let probe_ctx = ProbeContext {
            prev_configs: std::slice::from_ref(&first),
            state_prefix: None,
            attrlog_prefix: None,
            warner: &warner,
            now: 1_700_000_000,
        };
        assert_eq!(
            probe_ata(&mut cfg, &mut state, &mut port, &probe_ctx),
            ProbeOutcome::Duplicate
        );
    }

    #[test]
    fn test_probe_state_file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let prefix = format!("{}/", dir.path().display());
        let warner = Warner::default();
        let mut cfg = warn_cfg();
        cfg.smart_check = true;
        let mut state = DeviceState::default();
        let mut port = MockAta {
            identity: AtaIdentity {
                model: "ST4000DM004".into(),
                serial: "ZDH0ABCD".into(),
                firmware: "0001".into(),
                capacity_bytes: 4_000_787_030_016,
                smart_support: SmartSupport::Supported,
                smart_enabled: true,
                ..AtaIdentity::default()
            },
            health: Some(HealthStatus::Passed),
            values: vec![values_with(&[(5, 0x33, 100, 0)])],
            ..MockAta::default()
        };
        let probe_ctx = ProbeContext {
            prev_configs: &[],
            state_prefix: Some(&prefix),
            attrlog_prefix: Some(&prefix),
            warner: &warner,
            now: 1_700_000_000,
        };
        assert_eq!(
            probe_ata(&mut cfg, &mut state, &mut port, &probe_ctx),
            ProbeOutcome::Registered
        );
        let state_file = cfg.state_file.as_ref().unwrap();
        assert!(state_file
            .to_string_lossy()
            .ends_with("ST4000DM004-ZDH0ABCD.ata.state"));
        assert!(cfg
            .attrlog_file
            .as_ref()
            .unwrap()
            .to_string_lossy()
            .ends_with("ST4000DM004-ZDH0ABCD.ata.csv"));
    }

    #[test]
    fn test_ata_temperature_lookup() {
        let v = values_with(&[(194, 0x0022, 65, 38)]);
        assert_eq!(ata_temperature(&v), 38);
        let v = values_with(&[(190, 0x0022, 60, 40)]);
        assert_eq!(ata_temperature(&v), 40);
        let v = values_with(&[(9, 0x0032, 98, 10000)]);
        assert_eq!(ata_temperature(&v), 0);
    }
}
