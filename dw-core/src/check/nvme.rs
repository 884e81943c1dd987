//! NVMe probe and periodic check.

use tracing::{error, info};

use crate::config::DeviceConfig;
use crate::device::{
    format_capacity, NvmePort, NvmeSelfTestLog, Transport, NVME_BROADCAST_NSID,
    NVME_CRITICAL_WARNING_NAMES,
};
use crate::schedule::{next_scheduled_test, TestType};
use crate::state::{AttrlogKind, DeviceState};
use crate::warning::{mail_warning, reset_warning, WarnKind, Warner};

use super::{
    attach_state_files, check_temperature, finish_device_scan, is_duplicate_identity,
    open_for_check, report_self_test_changes, sanitize_id_info, CheckContext, ProbeContext,
    ProbeOutcome,
};

/// Transfer at most one page (64 entries) of the error log to stay below
/// pass-through and MDTS limits.
const ERROR_LOG_MAX_TRANSFER: u32 = 64;

/// One-time capability discovery for an NVMe device. The port must be
/// open; the caller closes it afterwards.
pub fn probe_nvme(
    cfg: &mut DeviceConfig,
    state: &mut DeviceState,
    port: &mut dyn NvmePort,
    ctx: &ProbeContext<'_>,
) -> ProbeOutcome {
    let ctrl = match port.identify_controller() {
        Ok(c) => c,
        Err(_) => {
            info!("Device: {}, NVMe Identify Controller failed", cfg.name);
            return ProbeOutcome::NotCapable;
        }
    };

    let nsid = port.namespace_id();
    let nsstr = if nsid != NVME_BROADCAST_NSID {
        format!(", NSID:{}", nsid)
    } else {
        String::new()
    };
    let cap = format_capacity(ctrl.capacity_bytes);
    let cap_part = if cap.is_empty() {
        String::new()
    } else {
        format!(", {}", cap)
    };

    cfg.id_info = format!(
        "{}, S/N:{}, FW:{}{}{}",
        ctrl.model, ctrl.serial, ctrl.firmware, nsstr, cap_part
    );
    // Keep a variant without the namespace id for duplicate detection when
    // the controller only has a single namespace
    if !nsstr.is_empty() && ctrl.namespace_count == 1 {
        cfg.id_info_bc = format!(
            "{}, S/N:{}, FW:{}{}",
            ctrl.model, ctrl.serial, ctrl.firmware, cap_part
        );
    }
    cfg.id_is_unique = !sanitize_id_info(&mut cfg.id_info);

    info!("Device: {}, {}", cfg.name, cfg.id_info);

    if is_duplicate_identity(cfg, ctx.prev_configs) {
        return ProbeOutcome::Duplicate;
    }

    let smart_log = match port.read_smart_log() {
        Ok(l) => l,
        Err(_) => {
            info!(
                "Device: {}, failed to read NVMe SMART/Health Information",
                cfg.name
            );
            return ProbeOutcome::NotCapable;
        }
    };

    if (cfg.temp_diff != 0 || cfg.temp_info != 0 || cfg.temp_crit != 0)
        && smart_log.temperature_kelvin == 0
    {
        info!(
            "Device: {}, no Temperature sensors, ignoring -W {},{},{}",
            cfg.name, cfg.temp_diff, cfg.temp_info, cfg.temp_crit
        );
        cfg.temp_diff = 0;
        cfg.temp_info = 0;
        cfg.temp_crit = 0;
    }

    cfg.nvme_err_log_max_entries = ctrl.error_log_capacity;
    if cfg.track_error_log || cfg.track_xerror_log {
        if !check_nvme_error_log(cfg, state, port, ctx.warner, None) {
            info!(
                "Device: {}, Error Information unavailable, ignoring -l [x]error",
                cfg.name
            );
            cfg.track_error_log = false;
            cfg.track_xerror_log = false;
        } else {
            state.saved.nvme_err_log_entries = smart_log.error_log_entries;
        }
    }

    // Self-test support
    state.not_cap_short = !ctrl.supports_self_test;
    state.not_cap_long = !ctrl.supports_self_test;
    state.saved.selftest_error_count = 0;
    state.saved.selftest_last_error_hour = 0;
    if cfg.track_selftest_log || cfg.track_selftest_status || cfg.test_regex.is_some() {
        if !state.not_cap_short && port.read_self_test_log().is_err() {
            info!("Device: {}, Read NVMe Self-test Log failed", cfg.name);
            state.not_cap_short = true;
            state.not_cap_long = true;
        }
        if state.not_cap_short {
            info!(
                "Device: {}, does not support NVMe Self-tests, ignoring{}{}{}{}",
                cfg.name,
                if cfg.track_selftest_log { " -l selftest" } else { "" },
                if cfg.track_selftest_status {
                    " -l selfteststs"
                } else {
                    ""
                },
                if cfg.test_regex.is_some() { " -s " } else { "" },
                cfg.test_regex
                    .as_ref()
                    .map(|r| r.pattern())
                    .unwrap_or_default()
            );
            cfg.track_selftest_log = false;
            cfg.track_selftest_status = false;
            cfg.test_regex = None;
        }
    }

    if !(cfg.any_monitor_enabled() || cfg.test_regex.is_some()) {
        return ProbeOutcome::NothingToMonitor;
    }

    info!(
        "Device: {}, is SMART capable. Adding to \"monitor\" list.",
        cfg.name
    );

    // ATA-only self-test types never apply here
    state.not_cap_conveyance = true;
    state.not_cap_offline = true;
    state.not_cap_selective = true;

    // The auto-standby policy only knows ATA devices
    cfg.offline_status_ns = false;
    cfg.selftest_status_ns = false;

    // Baselines: the state file, if any, wins over the live log for the
    // persistent health fields so changes across restarts are reported
    state.nvme_health = smart_log;
    state.saved.nvme_available_spare = smart_log.available_spare;
    state.saved.nvme_percentage_used = smart_log.percentage_used;
    state.saved.nvme_media_errors = smart_log.media_errors;

    attach_state_files(
        cfg,
        state,
        ctx,
        Transport::Nvme,
        &[&ctrl.model, &ctrl.serial],
        (nsid != NVME_BROADCAST_NSID).then_some(nsid),
    );
    state.nvme_health.available_spare = state.saved.nvme_available_spare;
    state.nvme_health.percentage_used = state.saved.nvme_percentage_used;
    state.nvme_health.media_errors = state.saved.nvme_media_errors;

    finish_device_scan(cfg, state, ctx.now);

    ProbeOutcome::Registered
}

/// Scan the Error Information log for device related errors. With
/// `newcnt == None` this is only a support probe. Returns false when the
/// log cannot be read.
fn check_nvme_error_log(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    port: &mut dyn NvmePort,
    warner: &Warner,
    newcnt: Option<u64>,
) -> bool {
    let want_entries = ERROR_LOG_MAX_TRANSFER.min(cfg.nvme_err_log_max_entries.max(1));
    let entries = match port.read_error_log(want_entries) {
        Ok(e) if !e.is_empty() => e,
        _ => {
            info!(
                "Device: {}, Read {} entries from Error Information Log failed",
                cfg.name, want_entries
            );
            return false;
        }
    };

    let Some(mut newcnt) = newcnt else {
        return true; // support check only
    };

    let oldcnt = state.saved.nvme_err_log_entries;
    let mut mincnt = newcnt;
    let mut err = 0u32;
    let mut ign = 0u32;
    for (i, e) in entries.iter().enumerate() {
        if e.error_count == 0 {
            continue; // unused entry
        }
        if e.error_count <= oldcnt {
            break; // first old entry
        }
        if e.error_count < mincnt {
            mincnt = e.error_count;
        }
        if e.error_count > newcnt {
            newcnt = e.error_count;
        }
        if !e.is_device_error() {
            ign += 1;
            continue;
        }

        // Log the most recent 8 device errors individually
        err += 1;
        if err <= 8 {
            info!(
                "Device: {}, NVMe error [{}], count {}, status 0x{:04x}",
                cfg.name, i, e.error_count, e.status_field
            );
        }
    }

    let unknown = if mincnt > oldcnt + 1 {
        mincnt - oldcnt - 1
    } else {
        0
    };
    let msg = format!(
        "Device: {}, NVMe error count increased from {} to {} ({} new, {} ignored, {} unknown)",
        cfg.name, oldcnt, newcnt, err, ign, unknown
    );
    // Critical only if device related errors are found
    if err == 0 {
        info!("{}", msg);
    } else {
        error!("{}", msg);
        mail_warning(warner, cfg, state, WarnKind::ErrorCount, &msg);
    }

    state.saved.nvme_err_log_entries = newcnt;
    state.must_write = true;
    true
}

/// Report a change of one SMART/Health value.
fn log_health_change(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    warner: &Warner,
    valname: &str,
    oldval: u64,
    newval: u64,
    critical: bool,
    informational: bool,
) {
    if newval == oldval || !(critical || informational) {
        return;
    }
    let msg = format!(
        "Device: {}, SMART/Health value: {} changed from {} to {}",
        cfg.name, valname, oldval, newval
    );
    if critical {
        error!("{}", msg);
        mail_warning(warner, cfg, state, WarnKind::Usage, &msg);
    } else {
        info!("{}", msg);
    }
    state.must_write = true;
}

/// Count failed entries in the self-test log; returns the count and the
/// power-on hour of the most recent failure.
fn count_failed_nvme_self_tests(nsid: u32, log: &NvmeSelfTestLog) -> (u32, u64) {
    let mut errcnt = 0u32;
    let mut hour = 0u64;
    for r in &log.results {
        let op = r.status >> 4;
        let res = r.status & 0xf;
        if op == 0 || res == 0xf {
            continue; // unused entry
        }
        // Skip results for a different individual namespace
        if !(nsid == NVME_BROADCAST_NSID
            || r.valid & 0x01 == 0
            || r.nsid == NVME_BROADCAST_NSID
            || r.nsid == nsid)
        {
            continue;
        }
        if op == 0x2 && res == 0 {
            break; // stop at the first successful extended test
        }
        if !(0x5..=0x7).contains(&res) {
            continue; // no error, or aborted
        }
        errcnt += 1;
        if errcnt == 1 {
            hour = r.power_on_hours;
        }
    }
    (errcnt, hour)
}

/// Log self-test execution status changes.
fn log_nvme_selftest_status(
    name: &str,
    state: &mut DeviceState,
    first_pass: bool,
    debug: bool,
    log: &NvmeSelfTestLog,
) {
    let curr_op = log.current_operation & 0xf;
    let curr_compl = log.current_completion & 0x7f;

    if !(curr_op != state.nvme_selftest_op
        || curr_compl != state.nvme_selftest_compl
        || state.selftest_started
        || (first_pass && (debug || curr_op != 0)))
    {
        return;
    }

    state.nvme_selftest_op = curr_op;
    state.nvme_selftest_compl = curr_compl;

    let r = &log.results[0];
    let op0 = r.status >> 4;
    let res0 = r.status & 0xf;

    let op = if curr_op != 0 { curr_op } else { op0 };
    let kind = match op {
        0x0 => String::new(),
        0x1 => "short".to_string(),
        0x2 => "extended".to_string(),
        0xe => "vendor specific".to_string(),
        other => format!("unknown (0x{:x})", other),
    };

    if curr_op != 0 {
        info!(
            "Device {}, {} self-test in progress, {}% remaining",
            name,
            kind,
            100 - i32::from(curr_compl)
        );
    } else if op0 == 0 || res0 == 0xf {
        info!("Device {}, no self-test has ever been run", name);
    } else {
        let result = match res0 {
            0x0 => "completed without error".to_string(),
            0x1 => "was aborted by a self-test command".to_string(),
            0x2 => "was aborted by a controller reset".to_string(),
            0x3 => "was aborted due to a namespace removal".to_string(),
            0x4 => "was aborted by a format NVM command".to_string(),
            0x5 => "completed with error (fatal or unknown error)".to_string(),
            0x6 => "completed with error (unknown failed segment)".to_string(),
            0x7 => "completed with error (failed segments)".to_string(),
            0x8 => "was aborted (unknown reason)".to_string(),
            0x9 => "was aborted due to a sanitize operation".to_string(),
            other => format!("returned an unknown result (0x{:x})", other),
        };
        let ns = if r.valid & 0x01 != 0 {
            format!(" of NSID 0x{:x}", r.nsid)
        } else {
            String::new()
        };
        if (0x5..=0x7).contains(&res0) {
            error!("Device {}, previous {} self-test{} {}", name, kind, ns, result);
        } else {
            info!("Device {}, previous {} self-test{} {}", name, kind, ns, result);
        }
    }
}

/// One periodic check of an NVMe device.
pub fn check_nvme(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    port: &mut dyn NvmePort,
    ctx: &CheckContext<'_>,
) {
    if !open_for_check(cfg, state, ctx, "NVMe", false, &mut || port.open()) {
        return;
    }

    let smart_log = match port.read_smart_log() {
        Ok(l) => l,
        Err(_) => {
            port.close();
            let msg = format!(
                "Device: {}, failed to read NVMe SMART/Health Information",
                cfg.name
            );
            info!("{}", msg);
            mail_warning(ctx.warner, cfg, state, WarnKind::FailedReadSmartData, &msg);
            state.must_write = true;
            return;
        }
    };

    // Critical Warning bits, masked by the -H argument
    let warning = smart_log.critical_warning;
    let masked = warning & cfg.nvme_warning_mask;
    if cfg.smart_check && masked != 0 {
        let mut names = String::new();
        let mut count = 0;
        for (bit, name) in NVME_CRITICAL_WARNING_NAMES.iter().enumerate() {
            let mask = 1u8 << bit;
            if warning & mask == 0 {
                continue;
            }
            if count > 0 {
                names.push_str(", ");
            }
            count += 1;
            if count > 3 {
                names.push_str("...");
                break;
            }
            // Bits outside the monitored mask are shown bracketed
            if masked & mask == 0 {
                names.push('[');
                names.push_str(name);
                names.push(']');
            } else {
                names.push_str(name);
            }
        }
        let msg = format!(
            "Device: {}, Critical Warning (0x{:02x}): {}",
            cfg.name, warning, names
        );
        error!("{}", msg);
        mail_warning(ctx.warner, cfg, state, WarnKind::Health, &msg);
        state.must_write = true;
    }

    // SMART/Health value tracking
    if cfg.track_prefail {
        log_health_change(
            cfg,
            state,
            ctx.warner,
            "Available Spare",
            u64::from(state.nvme_health.available_spare),
            u64::from(smart_log.available_spare),
            smart_log.available_spare < smart_log.spare_threshold
                && smart_log.spare_threshold <= 100, // 101-255 is reserved
            true,
        );
    }
    if cfg.track_usage || cfg.track_usage_failed {
        log_health_change(
            cfg,
            state,
            ctx.warner,
            "Percentage Used",
            u64::from(state.nvme_health.percentage_used),
            u64::from(smart_log.percentage_used),
            cfg.track_usage_failed && smart_log.percentage_used > 95,
            cfg.track_usage,
        );
        log_health_change(
            cfg,
            state,
            ctx.warner,
            "Media and Data Integrity Errors",
            state.nvme_health.media_errors,
            smart_log.media_errors,
            cfg.track_usage_failed && smart_log.media_errors > state.nvme_health.media_errors,
            cfg.track_usage,
        );
    }

    if cfg.temp_diff != 0 || cfg.temp_info != 0 || cfg.temp_crit != 0 {
        check_temperature(
            cfg,
            state,
            ctx.warner,
            smart_log.temperature_celsius(),
            0,
            ctx.now,
        );
    }

    let mut scheduled = if ctx.allow_selftests && cfg.test_regex.is_some() {
        next_scheduled_test(cfg, state, ctx.now, true)
    } else {
        None
    };

    // Read the self-test log when anything needs it
    let mut self_test_log = None;
    if scheduled.is_some() || cfg.track_selftest_log || cfg.track_selftest_status {
        match port.read_self_test_log() {
            Err(_) => {
                let msg = format!("Device: {}, Read Self-test Log failed", cfg.name);
                error!("{}", msg);
                mail_warning(
                    ctx.warner,
                    cfg,
                    state,
                    WarnKind::FailedReadSmartSelfTestLog,
                    &msg,
                );
                scheduled = None;
            }
            Ok(log) => {
                reset_warning(
                    cfg,
                    state,
                    WarnKind::FailedReadSmartSelfTestLog,
                    "Read Self-Test Log worked again",
                );

                if cfg.track_selftest_status {
                    log_nvme_selftest_status(&cfg.name, state, ctx.first_pass, ctx.debug, &log);
                }
                if cfg.track_selftest_log {
                    let (errcnt, hour) = count_failed_nvme_self_tests(port.namespace_id(), &log);
                    report_self_test_changes(cfg, state, ctx.warner, Some(errcnt), hour);
                }
                self_test_log = Some(log);
            }
        }
    }
    state.selftest_started = false;

    // Error log growth; warn only when device related errors are found
    if (cfg.track_error_log || cfg.track_xerror_log)
        && smart_log.error_log_entries > state.saved.nvme_err_log_entries
    {
        check_nvme_error_log(
            cfg,
            state,
            port,
            ctx.warner,
            Some(smart_log.error_log_entries),
        );
    }

    if let (Some(test), Some(log)) = (scheduled, self_test_log.as_ref()) {
        start_nvme_self_test(cfg, state, port, test, log);
    }

    port.close();

    // Preserve the new health info for the state file and attribute log
    state.nvme_health = smart_log;
    state.saved.nvme_available_spare = smart_log.available_spare;
    state.saved.nvme_percentage_used = smart_log.percentage_used;
    state.saved.nvme_media_errors = smart_log.media_errors;
    state.attrlog = Some(AttrlogKind::Nvme);
}

/// Start a short or extended device self-test.
pub fn start_nvme_self_test(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    port: &mut dyn NvmePort,
    test: TestType,
    log: &NvmeSelfTestLog,
) {
    let nsid = port.namespace_id();
    let (testname, extended) = match test {
        TestType::Short => ("Short", false),
        TestType::Long => ("Extended", true),
        other => {
            info!(
                "Device: {}, not capable of {} Self-Test",
                cfg.name,
                other.as_char()
            );
            return;
        }
    };

    // Never try to start a test while one is running
    if log.current_operation & 0xf != 0 {
        info!(
            "Device: {}, skip scheduled {} Self-Test (NSID 0x{:x}); {}% remaining of current Self-Test.",
            cfg.name,
            testname,
            nsid,
            100 - i32::from(log.current_completion & 0x7f)
        );
        return;
    }

    if let Err(e) = port.start_self_test(extended) {
        error!(
            "Device: {}, execute {} Self-Test failed (NSID 0x{:x}): {}.",
            cfg.name, testname, nsid, e
        );
        return;
    }

    state.selftest_started = true;
    info!(
        "Device: {}, starting scheduled {} Self-Test (NSID 0x{:x}).",
        cfg.name, testname, nsid
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmailFreq;
    use crate::device::{
        NvmeControllerInfo, NvmeErrorLogEntry, NvmeHealthLog, NvmeSelfTestResult,
    };
    use dw_error::{DwError, Result};

    #[derive(Default)]
    struct MockNvme {
        nsid: u32,
        ctrl: NvmeControllerInfo,
        health: Vec<Result<NvmeHealthLog>>,
        error_log: Vec<NvmeErrorLogEntry>,
        error_log_fails: bool,
        self_test_log: Option<NvmeSelfTestLog>,
        started: Vec<bool>,
    }

    impl NvmePort for MockNvme {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) {}
        fn namespace_id(&self) -> u32 {
            self.nsid
        }
        fn identify_controller(&mut self) -> Result<NvmeControllerInfo> {
            Ok(self.ctrl.clone())
        }
        fn read_smart_log(&mut self) -> Result<NvmeHealthLog> {
            if self.health.is_empty() {
                Err(DwError::device("read smart log"))
            } else if self.health.len() > 1 {
                self.health.remove(0)
            } else {
                self.health[0]
                    .as_ref()
                    .copied()
                    .map_err(|_| DwError::device("read smart log"))
            }
        }
        fn read_error_log(&mut self, _entries: u32) -> Result<Vec<NvmeErrorLogEntry>> {
            if self.error_log_fails {
                Err(DwError::device("read error log"))
            } else {
                Ok(self.error_log.clone())
            }
        }
        fn read_self_test_log(&mut self) -> Result<NvmeSelfTestLog> {
            self.self_test_log
                .ok_or_else(|| DwError::not_supported("self-test log"))
        }
        fn start_self_test(&mut self, extended: bool) -> Result<()> {
            self.started.push(extended);
            Ok(())
        }
    }

    fn nvme_cfg() -> DeviceConfig {
        DeviceConfig {
            name: "/dev/nvme0".into(),
            dev_name: "/dev/nvme0".into(),
            smart_check: true,
            nvme_warning_mask: 0xff,
            email_address: "ops@example.org".into(),
            email_freq: EmailFreq::Once,
            ..DeviceConfig::default()
        }
    }

    fn healthy() -> NvmeHealthLog {
        NvmeHealthLog {
            temperature_kelvin: 310,
            available_spare: 100,
            spare_threshold: 10,
            percentage_used: 2,
            error_log_entries: 0,
            ..NvmeHealthLog::default()
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
    fn test_critical_warning_masking() {
        // -H 0x11 with critical_warning 0x13: bits 0 and 4 fire, bit 1 is
        // shown bracketed and does not fire on its own
        let warner = Warner::default();
        let mut cfg = nvme_cfg();
        cfg.nvme_warning_mask = 0x11;
        let mut state = DeviceState::default();
        let mut log = healthy();
        log.critical_warning = 0x13;
        let mut port = MockNvme {
            health: vec![Ok(log)],
            ..MockNvme::default()
        };

        check_nvme(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(state.saved.mail[WarnKind::Health.index()].logged, 1);
        assert!(state.must_write);
    }

    #[test]
    fn test_unmasked_bits_alone_do_not_mail() {
        let warner = Warner::default();
        let mut cfg = nvme_cfg();
        cfg.nvme_warning_mask = 0x11;
        let mut state = DeviceState::default();
        let mut log = healthy();
        log.critical_warning = 0x02; // only the unmonitored temperature bit
        let mut port = MockNvme {
            health: vec![Ok(log)],
            ..MockNvme::default()
        };

        check_nvme(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(state.saved.mail[WarnKind::Health.index()].logged, 0);
    }

    #[test]
    fn test_health_value_tracking() {
        let warner = Warner::default();
        let mut cfg = nvme_cfg();
        cfg.track_prefail = true;
        cfg.track_usage = true;
        cfg.track_usage_failed = true;
        let mut state = DeviceState::default();
        state.nvme_health = healthy();

        // spare drops below threshold: critical
        let mut log = healthy();
        log.available_spare = 5;
        log.media_errors = 3;
        let mut port = MockNvme {
            health: vec![Ok(log)],
            ..MockNvme::default()
        };
        check_nvme(&cfg, &mut state, &mut port, &ctx(&warner));
        // Available Spare (prefail, critical) and Media Errors (usage,
        // critical) both dispatch the Usage kind; 'once' caps it at 1
        assert_eq!(state.saved.mail[WarnKind::Usage.index()].logged, 1);
        assert_eq!(state.nvme_health.available_spare, 5);
        assert_eq!(state.saved.nvme_media_errors, 3);
        assert_eq!(state.attrlog, Some(AttrlogKind::Nvme));
    }

    #[test]
    fn test_error_log_device_error_filtering() {
        let warner = Warner::default();
        let mut cfg = nvme_cfg();
        cfg.track_error_log = true;
        cfg.nvme_err_log_max_entries = 64;
        let mut state = DeviceState::default();
        state.nvme_health = healthy();
        state.saved.nvme_err_log_entries = 10;

        // Three new entries: one media error, one invalid-field (host
        // side), one successful completion
        let mut log = healthy();
        log.error_log_entries = 13;
        let mut port = MockNvme {
            health: vec![Ok(log)],
            error_log: vec![
                NvmeErrorLogEntry {
                    error_count: 13,
                    status_field: ((0x2 << 8) | 0x81) << 1,
                },
                NvmeErrorLogEntry {
                    error_count: 12,
                    status_field: 0x02 << 1,
                },
                NvmeErrorLogEntry {
                    error_count: 11,
                    status_field: 0,
                },
            ],
            ..MockNvme::default()
        };
        check_nvme(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(state.saved.nvme_err_log_entries, 13);
        assert_eq!(state.saved.mail[WarnKind::ErrorCount.index()].logged, 1);
    }

    #[test]
    fn test_error_log_only_host_errors_is_informational() {
        let warner = Warner::default();
        let mut cfg = nvme_cfg();
        cfg.track_error_log = true;
        cfg.nvme_err_log_max_entries = 64;
        let mut state = DeviceState::default();
        state.nvme_health = healthy();
        state.saved.nvme_err_log_entries = 1;

        let mut log = healthy();
        log.error_log_entries = 2;
        let mut port = MockNvme {
            health: vec![Ok(log)],
            error_log: vec![NvmeErrorLogEntry {
                error_count: 2,
                status_field: 0x02 << 1, // invalid field: host side
            }],
            ..MockNvme::default()
        };
        check_nvme(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(state.saved.nvme_err_log_entries, 2);
        assert_eq!(state.saved.mail[WarnKind::ErrorCount.index()].logged, 0);
    }

    #[test]
    fn test_count_failed_self_tests() {
        let mut log = NvmeSelfTestLog::default();
        // newest first: a failed short test, a successful extended test,
        // then an older failure that must not be counted
        log.results[0] = NvmeSelfTestResult {
            status: 0x15, // short, fatal error
            valid: 0,
            nsid: 0,
            power_on_hours: 500,
        };
        log.results[1] = NvmeSelfTestResult {
            status: 0x20, // extended, completed
            valid: 0,
            nsid: 0,
            power_on_hours: 400,
        };
        log.results[2] = NvmeSelfTestResult {
            status: 0x16,
            valid: 0,
            nsid: 0,
            power_on_hours: 300,
        };
        let (count, hour) = count_failed_nvme_self_tests(NVME_BROADCAST_NSID, &log);
        assert_eq!(count, 1);
        assert_eq!(hour, 500);
    }

    #[test]
    fn test_count_skips_other_namespaces() {
        let mut log = NvmeSelfTestLog::default();
        log.results[0] = NvmeSelfTestResult {
            status: 0x15,
            valid: 0x01,
            nsid: 2,
            power_on_hours: 100,
        };
        assert_eq!(count_failed_nvme_self_tests(1, &log), (0, 0));
        assert_eq!(count_failed_nvme_self_tests(2, &log), (1, 100));
        assert_eq!(count_failed_nvme_self_tests(NVME_BROADCAST_NSID, &log), (1, 100));
    }

    #[test]
    fn test_scheduled_test_start_and_skip_when_running() {
        let warner = Warner::default();
        let mut cfg = nvme_cfg();
        cfg.test_regex = Some(crate::schedule::TestRegex::compile("L/../../../..").unwrap());
        let mut state = DeviceState::default();
        state.nvme_health = healthy();
        state.saved.scheduled_test_next_check = 1_700_000_000;

        let mut port = MockNvme {
            health: vec![Ok(healthy())],
            self_test_log: Some(NvmeSelfTestLog::default()),
            ..MockNvme::default()
        };
        check_nvme(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(port.started, vec![true]);
        assert!(state.selftest_started);

        // a running test defers the start
        let mut running = NvmeSelfTestLog::default();
        running.current_operation = 0x2;
        running.current_completion = 30;
        let mut state2 = DeviceState::default();
        state2.nvme_health = healthy();
        state2.saved.scheduled_test_next_check = 1_700_000_000;
        let mut port2 = MockNvme {
            health: vec![Ok(healthy())],
            self_test_log: Some(running),
            ..MockNvme::default()
        };
        check_nvme(&cfg, &mut state2, &mut port2, &ctx(&warner));
        assert!(port2.started.is_empty());
    }

    #[test]
    fn test_probe_namespace_aware_identity() {
        let warner = Warner::default();
        let mut cfg = nvme_cfg();
        let mut state = DeviceState::default();
        let mut port = MockNvme {
            nsid: 1,
            ctrl: NvmeControllerInfo {
                model: "Samsung SSD 980 PRO 1TB".into(),
                serial: "S5GXNX0T".into(),
                firmware: "5B2QGXA7".into(),
                capacity_bytes: 1_000_204_886_016,
                error_log_capacity: 64,
                namespace_count: 1,
                supports_self_test: true,
            },
            health: vec![Ok(healthy())],
            self_test_log: Some(NvmeSelfTestLog::default()),
            ..MockNvme::default()
        };
        let probe_ctx = ProbeContext {
            prev_configs: &[],
            state_prefix: None,
            attrlog_prefix: None,
            warner: &warner,
            now: 1_700_000_000,
        };
        assert_eq!(
            probe_nvme(&mut cfg, &mut state, &mut port, &probe_ctx),
            ProbeOutcome::Registered
        );
        assert!(cfg.id_info.contains("NSID:1"));
        assert!(!cfg.id_info_bc.is_empty());
        assert!(!cfg.id_info_bc.contains("NSID"));
        assert!(state.not_cap_conveyance && state.not_cap_offline && state.not_cap_selective);
        assert!(!state.not_cap_short && !state.not_cap_long);
    }

    #[test]
    fn test_probe_without_self_test_support_drops_schedule() {
        let warner = Warner::default();
        let mut cfg = nvme_cfg();
        cfg.track_selftest_log = true;
        cfg.test_regex = Some(crate::schedule::TestRegex::compile("S/../../../..").unwrap());
        let mut state = DeviceState::default();
        let mut port = MockNvme {
            nsid: NVME_BROADCAST_NSID,
            ctrl: NvmeControllerInfo {
                model: "M".into(),
                serial: "1".into(),
                firmware: "F".into(),
                error_log_capacity: 4,
                namespace_count: 1,
                supports_self_test: false,
                ..NvmeControllerInfo::default()
            },
            health: vec![Ok(healthy())],
            ..MockNvme::default()
        };
        let probe_ctx = ProbeContext {
            prev_configs: &[],
            state_prefix: None,
            attrlog_prefix: None,
            warner: &warner,
            now: 1_700_000_000,
        };
        assert_eq!(
            probe_nvme(&mut cfg, &mut state, &mut port, &probe_ctx),
            ProbeOutcome::Registered
        );
        assert!(!cfg.track_selftest_log);
        assert!(cfg.test_regex.is_none());
        assert!(state.not_cap_short && state.not_cap_long);
    }
}
