//! Cross-module tests: a scripted ATA device driven through probe,
//! periodic checks, state persistence, and restart.

use dw_core::check::ata::{check_ata, probe_ata};
use dw_core::check::{CheckContext, ProbeContext, ProbeOutcome};
use dw_core::config::{parse_config_str, DeviceConfig, EmailFreq};
use dw_core::device::{
    AtaAttribute, AtaFeature, AtaIdentity, AtaPort, AtaPowerMode, AtaSmartValues, AtaTestKind,
    AtaThresholds, HealthStatus, SelectiveMode, SelfTestSummary, SmartSupport,
};
use dw_core::state::{read_state_file, write_state_file, DeviceState};
use dw_core::warning::{WarnKind, Warner};
use dw_error::{DwError, Result};

struct ScriptedAta {
    identity: AtaIdentity,
    values: Vec<AtaSmartValues>,
    thresholds: AtaThresholds,
    selftest: SelfTestSummary,
    error_count: u32,
}

impl ScriptedAta {
    fn new(first_values: AtaSmartValues) -> Self {
        Self {
            identity: AtaIdentity {
                model: "ST4000DM004".into(),
                serial: "ZDH0ABCD".into(),
                firmware: "0001".into(),
                capacity_bytes: 4_000_787_030_016,
                sectors: 7_814_037_168,
                rotation_rate: 5400,
                wwn: None,
                smart_support: SmartSupport::Supported,
                smart_enabled: true,
                security_locked: false,
            },
            values: vec![first_values],
            thresholds: AtaThresholds::default(),
            selftest: SelfTestSummary::default(),
            error_count: 0,
        }
    }

    /// Replace the telemetry returned by the next reads.
    fn set_values(&mut self, v: AtaSmartValues) {
        self.values = vec![v];
    }
}

impl AtaPort for ScriptedAta {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }
    fn close(&mut self) {}
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
        Ok(HealthStatus::Passed)
    }
    fn read_smart_values(&mut self) -> Result<AtaSmartValues> {
        if self.values.len() > 1 {
            Ok(self.values.remove(0))
        } else {
            Ok(self.values[0])
        }
    }
    fn read_smart_thresholds(&mut self) -> Result<AtaThresholds> {
        Ok(self.thresholds)
    }
    fn self_test_log_summary(&mut self) -> Result<SelfTestSummary> {
        Ok(self.selftest)
    }
    fn error_count(&mut self, _extended: bool) -> Result<u32> {
        Ok(self.error_count)
    }
    fn check_power_mode(&mut self) -> Result<AtaPowerMode> {
        Ok(AtaPowerMode::ActiveIdle)
    }
    fn set_feature(&mut self, _feature: AtaFeature) -> Result<()> {
        Ok(())
    }
    fn set_sct_erc(&mut self, _r: u16, _w: u16) -> Result<()> {
        Err(DwError::not_supported("SCT ERC"))
    }
    fn start_self_test(&mut self, _kind: AtaTestKind) -> Result<()> {
        Ok(())
    }
    fn start_selective_self_test(
        &mut self,
        _mode: SelectiveMode,
        _prev_start: u64,
        _prev_end: u64,
        _num_sectors: u64,
    ) -> Result<(u64, u64)> {
        Err(DwError::not_supported("selective self-test"))
    }
}

fn values(temp_raw: u64, pending_raw: u64) -> AtaSmartValues {
    let mut v = AtaSmartValues {
        offline_collection_capability: 0x5b,
        ..AtaSmartValues::default()
    };
    v.attributes[0] = AtaAttribute {
        id: 194,
        flags: 0x0022,
        current: 100,
        worst: 100,
        raw: [0; 6],
        reserv: 0,
    };
    v.attributes[0].set_raw_value(temp_raw);
    v.attributes[1] = AtaAttribute {
        id: 197,
        flags: 0x0032,
        current: 100,
        worst: 100,
        raw: [0; 6],
        reserv: 0,
    };
    v.attributes[1].set_raw_value(pending_raw);
    v
}

fn config_from_directives(directives: &str) -> DeviceConfig {
    let parsed = parse_config_str(&format!("/dev/sda {}\n", directives), "test.conf").unwrap();
    parsed.entries.into_iter().next().unwrap()
}

fn check_ctx<'a>(warner: &'a Warner, now: i64) -> CheckContext<'a> {
    CheckContext {
        warner,
        first_pass: false,
        allow_selftests: true,
        debug: false,
        now,
    }
}

#[test]
fn temperature_escalation_and_clear_across_checks() {
    let warner = Warner::default();
    let mut cfg = config_from_directives("-a -W 4,55,60 -m ops@example.org");
    let mut state = DeviceState::default();
    let mut port = ScriptedAta::new(values(42, 0));

    let now = 1_700_000_000;
    let probe_ctx = ProbeContext {
        prev_configs: &[],
        state_prefix: None,
        attrlog_prefix: None,
        warner: &warner,
        now,
    };
    assert_eq!(
        probe_ata(&mut cfg, &mut state, &mut port, &probe_ctx),
        ProbeOutcome::Registered
    );
    assert_eq!(cfg.email_freq, EmailFreq::Once);

    // baseline 42, then info threshold, then critical, then cool-down
    port.set_values(values(42, 0));
    check_ata(&cfg, &mut state, &mut port, &check_ctx(&warner, now));
    assert_eq!(state.temperature, 42);

    port.set_values(values(58, 0));
    check_ata(&cfg, &mut state, &mut port, &check_ctx(&warner, now + 1800));
    assert_eq!(state.saved.mail[WarnKind::Temperature.index()].logged, 0);

    port.set_values(values(61, 0));
    check_ata(&cfg, &mut state, &mut port, &check_ctx(&warner, now + 3600));
    assert_eq!(state.saved.mail[WarnKind::Temperature.index()].logged, 1);
    assert_eq!(state.saved.temp_max, 61);

    port.set_values(values(54, 0));
    check_ata(&cfg, &mut state, &mut port, &check_ctx(&warner, now + 5400));
    // cleared: counter reset so a future excursion mails again
    assert_eq!(state.saved.mail[WarnKind::Temperature.index()].logged, 0);
}

#[test]
fn state_survives_restart_and_drives_delta_detection() {
    let dir = tempfile::TempDir::new().unwrap();
    let prefix = format!("{}/", dir.path().display());
    let warner = Warner::default();
    let now = 1_700_000_000;

    // First daemon lifetime: probe, one check, pending sectors appear
    let mut cfg = config_from_directives("-a -m ops@example.org");
    let mut state = DeviceState::default();
    let mut port = ScriptedAta::new(values(40, 0));
    let probe_ctx = ProbeContext {
        prev_configs: &[],
        state_prefix: Some(&prefix),
        attrlog_prefix: Some(&prefix),
        warner: &warner,
        now,
    };
    assert_eq!(
        probe_ata(&mut cfg, &mut state, &mut port, &probe_ctx),
        ProbeOutcome::Registered
    );
    // with a state file configured the default notifier policy is daily
    assert_eq!(cfg.email_freq, EmailFreq::Daily);

    port.set_values(values(40, 12));
    check_ata(&cfg, &mut state, &mut port, &check_ctx(&warner, now));
    assert_eq!(
        state.saved.mail[WarnKind::CurrentPendingSector.index()].logged,
        1
    );
    assert!(state.must_write);

    let state_path = cfg.state_file.clone().unwrap();
    write_state_file(&state_path, &state.saved).unwrap();

    // Second lifetime: probe reloads the state file; the pending-sector
    // mail history and the attribute baseline survive
    let mut cfg2 = config_from_directives("-a -m ops@example.org");
    let mut state2 = DeviceState::default();
    let mut port2 = ScriptedAta::new(values(40, 12));
    let probe_ctx2 = ProbeContext {
        prev_configs: &[],
        state_prefix: Some(&prefix),
        attrlog_prefix: Some(&prefix),
        warner: &warner,
        now: now + 7200,
    };
    assert_eq!(
        probe_ata(&mut cfg2, &mut state2, &mut port2, &probe_ctx2),
        ProbeOutcome::Registered
    );
    assert_eq!(
        state2.saved.mail[WarnKind::CurrentPendingSector.index()].logged,
        1
    );
    assert_eq!(state2.smart_values.attributes[1].raw_value(), 12);

    // an unchanged pending count within the daily window stays quiet
    port2.set_values(values(40, 12));
    check_ata(&cfg2, &mut state2, &mut port2, &check_ctx(&warner, now + 7200));
    assert_eq!(
        state2.saved.mail[WarnKind::CurrentPendingSector.index()].logged,
        1
    );

    let reread = read_state_file(&state_path).unwrap().unwrap();
    assert_eq!(
        reread.mail[WarnKind::CurrentPendingSector.index()].logged,
        1
    );
}

#[test]
fn scheduled_test_missed_during_downtime_runs_once_after_restart() {
    use dw_core::schedule::{next_scheduled_test, TestType};
    use chrono::{Local, TimeZone, Timelike};

    let now_raw = 1_700_000_000;
    let dt = Local.timestamp_opt(now_raw, 0).single().unwrap();
    let now = now_raw - i64::from(dt.minute()) * 60 - i64::from(dt.second());

    // pattern for the hour 10 hours ago, "missed" while the host was down
    let missed = now - 10 * 3600;
    let m = Local.timestamp_opt(missed, 0).single().unwrap();
    let pattern = format!(
        "L/{:02}/{:02}/./{:02}",
        chrono::Datelike::month(&m),
        chrono::Datelike::day(&m),
        m.hour()
    );

    let mut cfg = config_from_directives(&format!("-a -s {}", pattern));
    let mut state = DeviceState::default();
    state.saved.scheduled_test_next_check = missed - 3600;

    assert_eq!(
        next_scheduled_test(&cfg, &mut state, now, false),
        Some(TestType::Long)
    );

    // persists the checkpoint so the test is not replayed again
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("sched.ata.state");
    write_state_file(&path, &state.saved).unwrap();
    let mut state2 = DeviceState::default();
    state2.saved = read_state_file(&path).unwrap().unwrap();
    cfg.test_offset_factor = 0;
    assert_eq!(next_scheduled_test(&cfg, &mut state2, now + 60, false), None);
}
