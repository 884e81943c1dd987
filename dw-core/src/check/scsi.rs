//! SCSI/SAS probe and periodic check.

use dw_error::DwError;
use tracing::{error, info};

use crate::config::DeviceConfig;
use crate::device::{format_capacity, ScsiCounterPage, ScsiLogPage, ScsiPort, Transport, UnitReady};
use crate::schedule::{next_scheduled_test, TestType};
use crate::state::{AttrlogKind, DeviceState};
use crate::warning::{mail_warning, WarnKind};

use super::{
    attach_state_files, check_temperature, finish_device_scan, is_duplicate_identity,
    open_for_check, report_self_test_changes, sanitize_id_info, CheckContext, ProbeContext,
    ProbeOutcome,
};

/// Split the combined self-test return: failed count in the low byte,
/// power-on hour of the most recent failure in bits 8..24.
fn split_self_test_result(combined: u32) -> (u32, u64) {
    (combined & 0xff, u64::from((combined >> 8) & 0xffff))
}

/// One-time capability discovery for a SCSI device. The port must be
/// open; the caller closes it afterwards.
pub fn probe_scsi(
    cfg: &mut DeviceConfig,
    state: &mut DeviceState,
    port: &mut dyn ScsiPort,
    ctx: &ProbeContext<'_>,
) -> ProbeOutcome {
    let inq = match port.inquiry() {
        Ok(i) => i,
        Err(e) => {
            info!("Device: {}, INQUIRY failed; skip device [{}]", cfg.name, e);
            return ProbeOutcome::NotCapable;
        }
    };

    if !inq.is_disk_like() {
        info!(
            "Device: {}, not a disk like device [PDT=0x{:x}], skip",
            cfg.name, inq.peripheral_type
        );
        return ProbeOutcome::NotCapable;
    }

    let cap = format_capacity(inq.capacity_bytes);
    cfg.id_info = format!(
        "[{} {} {}]{}{}{}{}{}{}",
        inq.vendor,
        inq.model,
        inq.revision,
        if inq.lu_id.is_empty() { "" } else { ", lu id: " },
        inq.lu_id,
        if inq.serial.is_empty() { "" } else { ", S/N: " },
        inq.serial,
        if cap.is_empty() { "" } else { ", " },
        cap
    );
    cfg.id_is_unique = !inq.lu_id.is_empty() || !inq.serial.is_empty();
    if sanitize_id_info(&mut cfg.id_info) {
        cfg.id_is_unique = false;
    }

    info!("Device: {}, {}", cfg.name, cfg.id_info);

    if is_duplicate_identity(cfg, ctx.prev_configs) {
        return ProbeOutcome::Duplicate;
    }

    // The device must be ready for commands; IE data lives on the media
    match port.test_unit_ready() {
        Ok(UnitReady::Ready) => {}
        Ok(UnitReady::NotReady) => {
            info!(
                "Device: {}, NOT READY (e.g. spun down); skip device",
                cfg.name
            );
            return ProbeOutcome::NotCapable;
        }
        Ok(UnitReady::NoMedium) => {
            info!("Device: {}, NO MEDIUM present; skip device", cfg.name);
            return ProbeOutcome::NotCapable;
        }
        Ok(UnitReady::BecomingReady) => {
            info!(
                "Device: {}, BECOMING (but not yet) READY; skip device",
                cfg.name
            );
            return ProbeOutcome::NotCapable;
        }
        Err(e) => {
            error!("Device: {}, failed Test Unit Ready [{}]", cfg.name, e);
            return ProbeOutcome::NotCapable;
        }
    }

    // Badly conforming USB bridges lock up when asked for log pages after
    // malforming this response, so bail out early on anything unexpected.
    let iec = match port.fetch_iec_page() {
        Ok(p) => Some(p),
        Err(DwError::NotSupported(_)) => None, // reasonable not to support IE
        Err(e) => {
            info!(
                "Device: {}, Bad IEC (SMART) mode page, err={}, skip device",
                cfg.name, e
            );
            return ProbeOutcome::NotCapable;
        }
    };

    if !iec.map(|p| p.exception_control_enabled).unwrap_or(false) {
        info!("Device: {}, IE (SMART) not enabled, skip device", cfg.name);
        return ProbeOutcome::NotCapable;
    }

    if let Ok(pages) = port.supported_log_pages() {
        for page in pages {
            match page {
                ScsiLogPage::Temperature => state.scsi.temp_page_supported = true,
                ScsiLogPage::InformationalExceptions => state.scsi.smart_page_supported = true,
                ScsiLogPage::ReadErrorCounters => state.scsi.read_counters_supported = true,
                ScsiLogPage::WriteErrorCounters => state.scsi.write_counters_supported = true,
                ScsiLogPage::VerifyErrorCounters => state.scsi.verify_counters_supported = true,
                ScsiLogPage::NonMediumErrors => state.scsi.non_medium_supported = true,
            }
        }
    }

    // Check whether the IE report is going to work
    match port.check_ie(state.scsi.smart_page_supported, state.scsi.temp_page_supported) {
        Ok(report) => {
            if report.current_temp == 0
                && (cfg.temp_diff != 0 || cfg.temp_info != 0 || cfg.temp_crit != 0)
            {
                info!(
                    "Device: {}, can't monitor Temperature, ignoring -W {},{},{}",
                    cfg.name, cfg.temp_diff, cfg.temp_info, cfg.temp_crit
                );
                cfg.temp_diff = 0;
                cfg.temp_info = 0;
                cfg.temp_crit = 0;
            }
        }
        Err(_) => {
            info!(
                "Device: {}, unexpectedly failed to read SMART values",
                cfg.name
            );
            state.scsi.suppress_report = true;
            if cfg.temp_diff != 0 || cfg.temp_info != 0 || cfg.temp_crit != 0 {
                info!(
                    "Device: {}, can't monitor Temperature, ignoring -W {},{},{}",
                    cfg.name, cfg.temp_diff, cfg.temp_info, cfg.temp_crit
                );
                cfg.temp_diff = 0;
                cfg.temp_info = 0;
                cfg.temp_crit = 0;
            }
        }
    }

    // Capability check: self-test log
    if cfg.track_selftest_log {
        match port.count_failed_self_tests() {
            Ok(combined) => {
                let (count, hour) = split_self_test_result(combined);
                state.saved.selftest_error_count = count.min(255) as u8;
                state.saved.selftest_last_error_hour = hour;
            }
            Err(_) => {
                info!(
                    "Device: {}, does not support SMART Self-Test Log.",
                    cfg.name
                );
                cfg.track_selftest_log = false;
                state.saved.selftest_error_count = 0;
                state.saved.selftest_last_error_hour = 0;
            }
        }
    }

    if let Some(enable) = cfg.autosave {
        // GLTSD bit is inverted: set disables saving
        let (verb, detail) = if enable {
            ("enable", "cleared GLTSD bit")
        } else {
            ("disable", "set GLTSD bit")
        };
        if port.set_gltsd(!enable).is_err() {
            info!(
                "Device: {}, could not {} autosave ({}).",
                cfg.name, verb, detail
            );
        } else {
            info!("Device: {}, {}d autosave ({}).", cfg.name, verb, detail);
        }
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

    attach_state_files(
        cfg,
        state,
        ctx,
        Transport::Scsi,
        &[&inq.vendor, &inq.model, &inq.serial],
        None,
    );
    finish_device_scan(cfg, state, ctx.now);

    ProbeOutcome::Registered
}

/// One periodic check of a SCSI device.
pub fn check_scsi(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    port: &mut dyn ScsiPort,
    ctx: &CheckContext<'_>,
) {
    if !open_for_check(cfg, state, ctx, "SCSI", false, &mut || port.open()) {
        return;
    }

    let mut report = None;
    if !state.scsi.suppress_report {
        match port.check_ie(state.scsi.smart_page_supported, state.scsi.temp_page_supported) {
            Ok(r) => report = Some(r),
            Err(_) => {
                info!("Device: {}, failed to read SMART values", cfg.name);
                mail_warning(
                    ctx.warner,
                    cfg,
                    state,
                    WarnKind::FailedReadSmartData,
                    &format!("Device: {}, failed to read SMART values", cfg.name),
                );
                state.scsi.suppress_report = true;
            }
        }
    }

    let (current_temp, trip_temp) = report
        .map(|r| (r.current_temp, r.trip_temp))
        .unwrap_or((0, 0));

    if let Some(r) = report.filter(|r| r.asc > 0) {
        if let Some(failure) = r.failure_message() {
            let msg = format!("Device: {}, SMART Failure: {}", cfg.name, failure);
            error!("{}", msg);
            mail_warning(ctx.warner, cfg, state, WarnKind::Health, &msg);
        } else if r.self_test_in_progress() {
            info!("Device: {}, self-test in progress", cfg.name);
        } else if ctx.debug {
            info!(
                "Device: {}, non-SMART asc,ascq: {},{}",
                cfg.name, r.asc, r.ascq
            );
        }
    } else if report.is_some() && ctx.debug {
        info!("Device: {}, SMART health: passed", cfg.name);
    }

    if cfg.temp_diff != 0 || cfg.temp_info != 0 || cfg.temp_crit != 0 {
        check_temperature(cfg, state, ctx.warner, current_temp, trip_temp, ctx.now);
    }

    // Self-test log deltas (the error count may also decrease)
    if cfg.track_selftest_log {
        match port.count_failed_self_tests() {
            Ok(combined) => {
                let (count, hour) = split_self_test_result(combined);
                report_self_test_changes(cfg, state, ctx.warner, Some(count), hour);
            }
            Err(_) => report_self_test_changes(cfg, state, ctx.warner, None, 0),
        }
    }

    if ctx.allow_selftests && cfg.test_regex.is_some() {
        if let Some(test) = next_scheduled_test(cfg, state, ctx.now, true) {
            start_scsi_self_test(cfg, state, port, test);
        }
    }

    // Collect counters for the attribute log
    if cfg.attrlog_file.is_some() {
        state.scsi.error_counters = [None, None, None];
        state.scsi.non_medium_errors = None;
        let mut found = false;

        let pages = [
            (state.scsi.read_counters_supported, ScsiCounterPage::Read, 0usize),
            (state.scsi.write_counters_supported, ScsiCounterPage::Write, 1),
            (state.scsi.verify_counters_supported, ScsiCounterPage::Verify, 2),
        ];
        for (supported, page, slot) in pages {
            if !supported {
                continue;
            }
            if let Ok(counters) = port.error_counters(page) {
                state.scsi.error_counters[slot] = Some(counters);
                found = true;
            }
        }
        if state.scsi.non_medium_supported {
            if let Ok(count) = port.non_medium_error_count() {
                state.scsi.non_medium_errors = Some(count);
                found = true;
            }
        }

        // Store the temperature if the -W handler above did not
        if cfg.temp_diff == 0 && cfg.temp_info == 0 && cfg.temp_crit == 0 {
            state.temperature = current_temp;
        }

        if found || state.temperature != 0 {
            state.attrlog = Some(AttrlogKind::Scsi);
        }
    }

    port.close();
}

/// Start a background short or extended self-test.
pub fn start_scsi_self_test(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    port: &mut dyn ScsiPort,
    test: TestType,
) {
    match port.self_test_in_progress() {
        Err(_) => {
            error!("Device: {}, does not support Self-Tests", cfg.name);
            state.not_cap_short = true;
            state.not_cap_long = true;
            return;
        }
        Ok(true) => {
            info!(
                "Device: {}, skip since Self-Test already in progress.",
                cfg.name
            );
            return;
        }
        Ok(false) => {}
    }

    let (testname, extended) = match test {
        TestType::Short => ("Short Self", false),
        TestType::Long => ("Long Self", true),
        other => {
            error!(
                "Device: {}, not capable of {} Self-Test",
                cfg.name,
                other.as_char()
            );
            return;
        }
    };

    match port.start_self_test(extended) {
        Ok(()) => info!(
            "Device: {}, starting scheduled {}-Test.",
            cfg.name, testname
        ),
        Err(DwError::NotSupported(_)) => {
            error!("Device: {}, not capable of {}-Test", cfg.name, testname);
            if extended {
                state.not_cap_long = true;
            } else {
                state.not_cap_short = true;
            }
        }
        Err(e) => {
            error!(
                "Device: {}, execute {}-Test failed (err: {})",
                cfg.name, testname, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmailFreq;
    use crate::device::{IecPage, ScsiErrorCounters, ScsiIeReport, ScsiInquiry};
    use crate::warning::Warner;
    use dw_error::Result;

    #[derive(Default)]
    struct MockScsi {
        inquiry: ScsiInquiry,
        unit_ready: Option<UnitReady>,
        iec_enabled: bool,
        pages: Vec<ScsiLogPage>,
        ie_reports: Vec<Result<ScsiIeReport>>,
        failed_tests: Vec<Result<u32>>,
        counters: Option<ScsiErrorCounters>,
        non_medium: Option<u64>,
        in_progress: Option<bool>,
        started: Vec<bool>,
    }

    impl ScsiPort for MockScsi {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) {}
        fn inquiry(&mut self) -> Result<ScsiInquiry> {
            Ok(self.inquiry.clone())
        }
        fn test_unit_ready(&mut self) -> Result<UnitReady> {
            Ok(self.unit_ready.unwrap_or(UnitReady::Ready))
        }
        fn fetch_iec_page(&mut self) -> Result<IecPage> {
            Ok(IecPage {
                exception_control_enabled: self.iec_enabled,
            })
        }
        fn supported_log_pages(&mut self) -> Result<Vec<ScsiLogPage>> {
            Ok(self.pages.clone())
        }
        fn check_ie(&mut self, _smart: bool, _temp: bool) -> Result<ScsiIeReport> {
            if self.ie_reports.is_empty() {
                Err(DwError::device("check IE"))
            } else if self.ie_reports.len() > 1 {
                self.ie_reports.remove(0)
            } else {
                self.ie_reports[0]
                    .as_ref()
                    .copied()
                    .map_err(|_| DwError::device("check IE"))
            }
        }
        fn count_failed_self_tests(&mut self) -> Result<u32> {
            if self.failed_tests.is_empty() {
                Err(DwError::not_supported("self-test log"))
            } else if self.failed_tests.len() > 1 {
                self.failed_tests.remove(0)
            } else {
                self.failed_tests[0]
                    .as_ref()
                    .copied()
                    .map_err(|_| DwError::device("log"))
            }
        }
        fn error_counters(&mut self, _page: ScsiCounterPage) -> Result<ScsiErrorCounters> {
            self.counters
                .ok_or_else(|| DwError::not_supported("error counters"))
        }
        fn non_medium_error_count(&mut self) -> Result<u64> {
            self.non_medium
                .ok_or_else(|| DwError::not_supported("non-medium errors"))
        }
        fn set_gltsd(&mut self, _disable_save: bool) -> Result<()> {
            Ok(())
        }
        fn self_test_in_progress(&mut self) -> Result<bool> {
            self.in_progress
                .ok_or_else(|| DwError::not_supported("self-tests"))
        }
        fn start_self_test(&mut self, extended: bool) -> Result<()> {
            self.started.push(extended);
            Ok(())
        }
    }

    fn scsi_cfg() -> DeviceConfig {
        DeviceConfig {
            name: "/dev/sg1".into(),
            dev_name: "/dev/sg1".into(),
            email_address: "ops@example.org".into(),
            email_freq: EmailFreq::Once,
            ..DeviceConfig::default()
        }
    }

    fn inquiry() -> ScsiInquiry {
        ScsiInquiry {
            vendor: "SEAGATE".into(),
            model: "ST8000NM0075".into(),
            revision: "E001".into(),
            serial: "ZA1XYZ".into(),
            lu_id: "0x5000c500a1b2c3d4".into(),
            capacity_bytes: 8_001_563_222_016,
            peripheral_type: 0,
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
    fn test_split_self_test_result() {
        let combined = (9731u32 << 8) | 3;
        assert_eq!(split_self_test_result(combined), (3, 9731));
    }

    #[test]
    fn test_probe_requires_ie_enabled() {
        let warner = Warner::default();
        let mut cfg = scsi_cfg();
        cfg.smart_check = true;
        let mut state = DeviceState::default();
        let mut port = MockScsi {
            inquiry: inquiry(),
            iec_enabled: false,
            ..MockScsi::default()
        };
        let probe_ctx = ProbeContext {
            prev_configs: &[],
            state_prefix: None,
            attrlog_prefix: None,
            warner: &warner,
            now: 1_700_000_000,
        };
        assert_eq!(
            probe_scsi(&mut cfg, &mut state, &mut port, &probe_ctx),
            ProbeOutcome::NotCapable
        );
    }

    #[test]
    fn test_probe_registers_and_disables_ata_tests() {
        let warner = Warner::default();
        let mut cfg = scsi_cfg();
        cfg.smart_check = true;
        cfg.track_selftest_log = true;
        let mut state = DeviceState::default();
        let mut port = MockScsi {
            inquiry: inquiry(),
            iec_enabled: true,
            pages: vec![
                ScsiLogPage::Temperature,
                ScsiLogPage::InformationalExceptions,
                ScsiLogPage::ReadErrorCounters,
            ],
            ie_reports: vec![Ok(ScsiIeReport {
                asc: 0,
                ascq: 0,
                current_temp: 31,
                trip_temp: 65,
            })],
            failed_tests: vec![Ok((100u32 << 8) | 1)],
            ..MockScsi::default()
        };
        let probe_ctx = ProbeContext {
            prev_configs: &[],
            state_prefix: None,
            attrlog_prefix: None,
            warner: &warner,
            now: 1_700_000_000,
        };
        assert_eq!(
            probe_scsi(&mut cfg, &mut state, &mut port, &probe_ctx),
            ProbeOutcome::Registered
        );
        assert!(state.not_cap_conveyance && state.not_cap_offline && state.not_cap_selective);
        assert!(state.scsi.temp_page_supported && state.scsi.read_counters_supported);
        assert_eq!(state.saved.selftest_error_count, 1);
        assert_eq!(state.saved.selftest_last_error_hour, 100);
        assert!(cfg.id_info.starts_with("[SEAGATE ST8000NM0075 E001]"));
        assert!(cfg.id_is_unique);
    }

    #[test]
    fn test_check_reports_ie_failure_as_health() {
        let warner = Warner::default();
        let mut cfg = scsi_cfg();
        cfg.smart_check = true;
        let mut state = DeviceState::default();
        let mut port = MockScsi {
            ie_reports: vec![Ok(ScsiIeReport {
                asc: 0x5d,
                ascq: 0x10,
                current_temp: 30,
                trip_temp: 0,
            })],
            ..MockScsi::default()
        };
        check_scsi(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(state.saved.mail[WarnKind::Health.index()].logged, 1);
    }

    #[test]
    fn test_check_ie_read_failure_suppresses_future_reads() {
        let warner = Warner::default();
        let cfg = scsi_cfg();
        let mut state = DeviceState::default();
        let mut port = MockScsi {
            ie_reports: vec![Err(DwError::device("boom"))],
            ..MockScsi::default()
        };
        check_scsi(&cfg, &mut state, &mut port, &ctx(&warner));
        assert!(state.scsi.suppress_report);
        assert_eq!(
            state.saved.mail[WarnKind::FailedReadSmartData.index()].logged,
            1
        );
    }

    #[test]
    fn test_selftest_delta_via_combined_return() {
        let warner = Warner::default();
        let mut cfg = scsi_cfg();
        cfg.track_selftest_log = true;
        let mut state = DeviceState::default();
        state.scsi.suppress_report = true;
        state.saved.selftest_error_count = 1;
        state.saved.selftest_last_error_hour = 100;

        let mut port = MockScsi {
            failed_tests: vec![Ok((200u32 << 8) | 2)],
            ..MockScsi::default()
        };
        check_scsi(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(state.saved.selftest_error_count, 2);
        assert_eq!(state.saved.selftest_last_error_hour, 200);
        assert_eq!(state.saved.mail[WarnKind::SelfTest.index()].logged, 1);
    }

    #[test]
    fn test_attrlog_collection() {
        let warner = Warner::default();
        let mut cfg = scsi_cfg();
        cfg.attrlog_file = Some("/tmp/x.scsi.csv".into());
        let mut state = DeviceState::default();
        state.scsi.suppress_report = true;
        state.scsi.read_counters_supported = true;
        state.scsi.non_medium_supported = true;

        let mut port = MockScsi {
            counters: Some(ScsiErrorCounters {
                total_errors_corrected: 12,
                ..ScsiErrorCounters::default()
            }),
            non_medium: Some(4),
            ..MockScsi::default()
        };
        check_scsi(&cfg, &mut state, &mut port, &ctx(&warner));
        assert_eq!(state.attrlog, Some(AttrlogKind::Scsi));
        assert_eq!(
            state.scsi.error_counters[0].unwrap().total_errors_corrected,
            12
        );
        assert_eq!(state.scsi.non_medium_errors, Some(4));
    }

    #[test]
    fn test_start_self_test_skips_when_running() {
        let cfg = scsi_cfg();
        let mut state = DeviceState::default();
        let mut port = MockScsi {
            in_progress: Some(true),
            ..MockScsi::default()
        };
        start_scsi_self_test(&cfg, &mut state, &mut port, TestType::Long);
        assert!(port.started.is_empty());

        port.in_progress = Some(false);
        start_scsi_self_test(&cfg, &mut state, &mut port, TestType::Long);
        assert_eq!(port.started, vec![true]);
    }

    #[test]
    fn test_start_self_test_unsupported_sets_not_cap() {
        let cfg = scsi_cfg();
        let mut state = DeviceState::default();
        let mut port = MockScsi::default(); // in_progress None: Err
        start_scsi_self_test(&cfg, &mut state, &mut port, TestType::Short);
        assert!(state.not_cap_short && state.not_cap_long);
    }
}
