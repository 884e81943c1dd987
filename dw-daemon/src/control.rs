//! The monitoring control loop.
//!
//! Single threaded and cooperative: one pass probes and registers devices
//! from the configuration, then each tick checks every non-skipped device,
//! persists dirty state, and sleeps until the next cadence point. Signals
//! only set flags, polled between devices and once per second during the
//! tick sleep.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Local, TimeZone};
use signal_hook::consts::signal::{SIGQUIT, SIGTERM};
use tracing::{debug, error, info};

use dw_core::check::{ata, nvme, scsi, CheckContext, ProbeContext, ProbeOutcome};
use dw_core::config::{
    implicit_scan_config, parse_config_file, parse_config_str, DeviceConfig, ParsedConfig,
};
use dw_core::device::{Device, PortFactory, Transport};
use dw_core::schedule::{next_scheduled_test, TEST_PRIORITY};
use dw_core::state::{self, DeviceState};
use dw_core::warning::Warner;
use dw_core::DEFAULT_CHECKTIME;
use dw_error::{exit, DwError};

use crate::notify::Notify;
use crate::signals::{SignalFlags, RELOAD_INT};

/// When to give up and exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitPolicy {
    /// Exit if no devices can be monitored (default)
    NoDev,
    /// Exit if no devices can be monitored at startup only
    NoDevStartup,
    /// Exit on config file errors too
    Errors,
    /// Keep running no matter what
    Never,
    /// Check all devices once, then exit
    OneCheck,
    /// Print the self-test schedule, then exit
    ShowTests,
}

/// Where the configuration comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(PathBuf),
    Stdin,
}

impl ConfigSource {
    fn display(&self) -> String {
        match self {
            Self::File(p) => p.display().to_string(),
            Self::Stdin => "<stdin>".to_string(),
        }
    }
}

/// Resolved command line options.
pub struct Options {
    pub config: ConfigSource,
    /// True when no `-c` was given, which makes a missing file non-fatal
    pub config_is_default: bool,
    pub interval: u32,
    pub quit: QuitPolicy,
    pub quit_nodev0: bool,
    pub debug: bool,
    pub pid_file: Option<PathBuf>,
    pub state_prefix: Option<String>,
    pub attrlog_prefix: Option<String>,
    pub warner: Warner,
}

/// System auto-standby handling while self-tests run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StandbyState {
    /// No `,ns` directive in the configuration
    NotUsed,
    /// Standby enabled, no tests running
    Enabled,
    /// Disable was rejected by the OS
    DisableRejected,
    /// Standby disabled while tests run
    Disabled,
}

fn unix_now() -> i64 {
    Local::now().timestamp()
}

/// Next cadence point at or after `timenow` on the `ct` grid anchored at
/// `wakeuptime`.
fn calc_next_wakeuptime(wakeuptime: i64, timenow: i64, ct: i64) -> i64 {
    if timenow < wakeuptime {
        wakeuptime
    } else {
        timenow + ct - (timenow - wakeuptime) % ct
    }
}

pub struct Daemon<'a> {
    opts: Options,
    backend: &'a dyn PortFactory,
    flags: Arc<SignalFlags>,
    notify: Notify,

    configs: Vec<DeviceConfig>,
    states: Vec<DeviceState>,
    devices: Vec<Device>,

    /// Minimum of the individual check intervals, 0 when all global
    checktime_min: i64,
    standby_state: StandbyState,
    /// Devices seen or failed before, to suppress scan re-registration
    prev_unique_names: HashMap<String, String>,
}

impl<'a> Daemon<'a> {
    pub fn new(opts: Options, backend: &'a dyn PortFactory, flags: Arc<SignalFlags>) -> Self {
        let notify = Notify::from_env(opts.debug);
        Self {
            opts,
            backend,
            flags,
            notify,
            configs: Vec::new(),
            states: Vec::new(),
            devices: Vec::new(),
            checktime_min: 0,
            standby_state: StandbyState::NotUsed,
            prev_unique_names: HashMap::new(),
        }
    }

    fn checktime(&self) -> i64 {
        i64::from(if self.opts.interval != 0 {
            self.opts.interval
        } else {
            DEFAULT_CHECKTIME
        })
    }

    // ========================================================================
    // Configuration loading and device registration
    // ========================================================================

    /// Read the configuration and expand `DEVICESCAN`. Returns the entry
    /// list with a parallel vector of pre-opened scanned devices, or the
    /// exit status for a fatal config error.
    fn read_config_entries(
        &mut self,
    ) -> Result<(Vec<DeviceConfig>, Vec<Option<Device>>), i32> {
        let file_label = self.opts.config.display();
        let parsed = match &self.opts.config {
            ConfigSource::Stdin => {
                let mut content = String::new();
                if let Err(e) = std::io::stdin().read_to_string(&mut content) {
                    error!("Unable to read configuration from stdin: {}", e);
                    return Err(exit::READCONF);
                }
                parse_config_str(&content, &file_label).map_err(|e| {
                    error!("{}", e);
                    error!("Configuration file {} has fatal syntax errors.", file_label);
                    exit::BADCONF
                })?
            }
            ConfigSource::File(path) => match parse_config_file(path) {
                Ok(p) => {
                    info!("Opened configuration file {}", file_label);
                    p
                }
                Err(DwError::ConfigMissing { .. }) if self.opts.config_is_default => {
                    info!(
                        "No configuration file {} found, scanning devices",
                        file_label
                    );
                    implicit_scan_config()
                }
                Err(e @ DwError::ConfigMissing { .. }) => {
                    error!("{}", e);
                    return Err(exit::NOCONF);
                }
                Err(e @ DwError::ConfigUnreadable { .. }) => {
                    error!("{}", e);
                    return Err(exit::READCONF);
                }
                Err(e) => {
                    error!("{}", e);
                    error!("Configuration file {} has fatal syntax errors.", file_label);
                    return Err(exit::BADCONF);
                }
            },
        };

        let ParsedConfig { mut entries, scan } = parsed;
        let mut scanned: Vec<Option<Device>> = entries.iter().map(|_| None).collect();

        match scan {
            None => {
                if !entries.is_empty() {
                    info!("Configuration file {} parsed.", file_label);
                } else {
                    error!(
                        "Configuration file {} parsed but has no entries",
                        file_label
                    );
                }
            }
            Some(scan) => {
                if scan.base.lineno != 0 {
                    info!(
                        "Configuration file {} was parsed, found DEVICESCAN, scanning devices",
                        file_label
                    );
                }
                match self.backend.scan(&scan.types) {
                    Err(e) => error!("DEVICESCAN failed: {}", e),
                    Ok(found) => {
                        for dev in found {
                            let mut cfg = scan.base.clone();
                            cfg.name = dev.name;
                            cfg.dev_name = dev.dev_name;
                            // Remember the type only when scanning was
                            // restricted; otherwise the notifier sees "auto"
                            cfg.dev_type = if scan.types.is_empty() {
                                String::new()
                            } else {
                                dev.dev_type
                            };
                            entries.push(cfg);
                            scanned.push(Some(dev.device));
                        }
                    }
                }
                if entries.is_empty() {
                    error!("In the system's table of devices NO devices found to scan");
                }
            }
        }

        Ok((entries, scanned))
    }

    /// Open and probe one device. Returns the device when it was
    /// registered successfully.
    fn register_device(
        &self,
        prev_configs: &[DeviceConfig],
        cfg: &mut DeviceConfig,
        state: &mut DeviceState,
        device: Option<Device>,
        scanning: bool,
    ) -> Option<Device> {
        let mut device = match device {
            Some(d) => d,
            None => match self.backend.open_device(&cfg.dev_name, &cfg.dev_type) {
                Ok(d) => d,
                Err(e) => {
                    if cfg.dev_type.is_empty() {
                        info!(
                            "Device: {}, unable to autodetect device type: {}",
                            cfg.name, e
                        );
                    } else {
                        info!(
                            "Device: {}, unsupported device type '{}': {}",
                            cfg.name, cfg.dev_type, e
                        );
                    }
                    return None;
                }
            },
        };

        if let Err(e) = device.open() {
            if self.opts.debug || !scanning {
                info!("Device: {}, open() failed: {}", cfg.name, e);
            }
            return None;
        }
        info!("Device: {}, opened", cfg.name);

        let transport = device.transport();
        let probe_ctx = ProbeContext {
            prev_configs,
            state_prefix: self.opts.state_prefix.as_deref(),
            attrlog_prefix: self.opts.attrlog_prefix.as_deref(),
            warner: &self.opts.warner,
            now: unix_now(),
        };
        let outcome = match &mut device {
            Device::Ata(p) => ata::probe_ata(cfg, state, p.as_mut(), &probe_ctx),
            Device::Scsi(p) => scsi::probe_scsi(cfg, state, p.as_mut(), &probe_ctx),
            Device::Nvme(p) => nvme::probe_nvme(cfg, state, p.as_mut(), &probe_ctx),
        };
        device.close();

        if outcome != ProbeOutcome::Registered {
            if !scanning || self.opts.debug {
                let msg = if cfg.lineno != 0 {
                    format!(
                        "Unable to register {} device {} at line {} of file {}",
                        transport.label(),
                        cfg.name,
                        cfg.lineno,
                        self.opts.config.display()
                    )
                } else {
                    format!(
                        "Unable to register {} device {}",
                        transport.label(),
                        cfg.name
                    )
                };
                if scanning {
                    info!("{}", msg);
                } else {
                    error!("{}", msg);
                }
            }
            return None;
        }
        Some(device)
    }

    /// Register every config entry. The new device set replaces the old
    /// one only when this returns true; a false return means a
    /// non-removable explicit device failed and the daemon must exit.
    fn register_devices(
        &mut self,
        conf_entries: Vec<DeviceConfig>,
        mut scanned_devs: Vec<Option<Device>>,
    ) -> bool {
        let mut configs: Vec<DeviceConfig> = Vec::new();
        let mut states: Vec<DeviceState> = Vec::new();
        let mut devices: Vec<Device> = Vec::new();
        self.prev_unique_names.clear();

        for (i, mut cfg) in conf_entries.into_iter().enumerate() {
            let unique_name = self.backend.unique_name(&cfg.dev_name, &cfg.dev_type);
            if self.opts.debug && unique_name != cfg.dev_name {
                debug!("Device: {}, unique name: {}", cfg.name, unique_name);
            }

            if cfg.ignore {
                info!(
                    "Device: {}{}{}{}, ignored",
                    cfg.name,
                    if cfg.dev_type.is_empty() { "" } else { " [" },
                    cfg.dev_type,
                    if cfg.dev_type.is_empty() { "" } else { "]" }
                );
                self.prev_unique_names
                    .insert(unique_name, cfg.name.clone());
                continue;
            }

            let device = scanned_devs.get_mut(i).and_then(|d| d.take());
            let scanning = device.is_some();

            // A preceding explicit entry for the same device wins over a
            // scan hit
            if scanning {
                if let Some(prev) = self.prev_unique_names.get(&unique_name) {
                    let same_name = *prev == cfg.name;
                    info!(
                        "Device: {}, {}{}, ignored",
                        cfg.name,
                        if same_name { "duplicate" } else { "same as " },
                        if same_name { "" } else { prev.as_str() }
                    );
                    continue;
                }
            }

            self.notify.extend_timeout();

            let mut state = DeviceState::default();
            match self.register_device(&configs, &mut cfg, &mut state, device, scanning) {
                None => {
                    if !scanning {
                        if !(cfg.removable || self.opts.quit == QuitPolicy::Never) {
                            error!(
                                "Unable to register device {} (no Directive -d removable). Exiting.",
                                cfg.name
                            );
                            return false;
                        }
                        info!("Device: {}, not available", cfg.name);
                        self.prev_unique_names.insert(unique_name, cfg.name.clone());
                    }
                }
                Some(device) => {
                    if !scanning {
                        self.prev_unique_names
                            .insert(unique_name, cfg.name.clone());
                    }
                    configs.push(cfg);
                    states.push(state);
                    devices.push(device);
                }
            }
        }

        // Minimum individual check time, and stagger factors for devices
        // with scheduled tests
        self.checktime_min = 0;
        let mut factor = 0u32;
        for cfg in &mut configs {
            let ct = i64::from(cfg.check_interval);
            if ct != 0 && (self.checktime_min == 0 || self.checktime_min > ct) {
                self.checktime_min = ct;
            }
            if cfg.test_regex.is_some() {
                cfg.test_offset_factor = factor;
                factor += 1;
            }
        }
        if self.checktime_min != 0 && self.checktime_min > self.checktime() {
            self.checktime_min = self.checktime();
        }

        self.configs = configs;
        self.states = states;
        self.devices = devices;

        self.init_disable_standby_check();
        true
    }

    // ========================================================================
    // Auto-standby policy
    // ========================================================================

    fn init_disable_standby_check(&mut self) {
        let mut sts1 = self.configs.iter().any(|c| c.offline_status_ns);
        let mut sts2 = self.configs.iter().any(|c| c.selftest_status_ns);

        // Re-enable standby if the config was reread while it was disabled
        if sts1 || sts2 || self.standby_state == StandbyState::Disabled {
            if let Err(e) = self.backend.set_system_auto_standby(true) {
                if self.standby_state == StandbyState::Disabled {
                    error!("System auto standby enable failed: {}", e);
                }
                if sts1 || sts2 {
                    info!(
                        "Disable auto standby not supported, ignoring ',ns' from {}{}{}",
                        if sts1 { "-l offlinests,ns" } else { "" },
                        if sts1 && sts2 { " and " } else { "" },
                        if sts2 { "-l selfteststs,ns" } else { "" }
                    );
                    sts1 = false;
                    sts2 = false;
                }
            }
        }

        self.standby_state = if sts1 || sts2 {
            StandbyState::Enabled
        } else {
            StandbyState::NotUsed
        };
    }

    fn do_disable_standby_check(&mut self) {
        if self.standby_state == StandbyState::NotUsed {
            return;
        }

        let running = self
            .configs
            .iter()
            .zip(&self.states)
            .any(|(cfg, state)| ata::test_in_progress_for_standby(cfg, state));

        if !running {
            if self.standby_state != StandbyState::Enabled {
                match self.backend.set_system_auto_standby(true) {
                    Err(e) => error!(
                        "Self-test(s) completed, system auto standby enable failed: {}",
                        e
                    ),
                    Ok(()) => info!("Self-test(s) completed, system auto standby enabled"),
                }
                self.standby_state = StandbyState::Enabled;
            }
        } else {
            match self.backend.set_system_auto_standby(false) {
                Err(e) => {
                    if self.standby_state != StandbyState::DisableRejected {
                        info!(
                            "Self-test(s) in progress, system auto standby disable rejected: {}",
                            e
                        );
                        self.standby_state = StandbyState::DisableRejected;
                    }
                }
                Ok(()) => {
                    if self.standby_state != StandbyState::Disabled {
                        info!("Self-test(s) in progress, system auto standby disabled");
                        self.standby_state = StandbyState::Disabled;
                    }
                }
            }
        }
    }

    // ========================================================================
    // Checking and persistence
    // ========================================================================

    fn check_devices_once(&mut self, first_pass: bool, allow_selftests: bool) {
        let global_interval = self.checktime();
        for i in 0..self.devices.len() {
            let cfg = &self.configs[i];
            let state = &mut self.states[i];
            if state.skip {
                if self.opts.debug {
                    info!(
                        "Device: {}, skipped (interval={})",
                        cfg.name,
                        if cfg.check_interval != 0 {
                            i64::from(cfg.check_interval)
                        } else {
                            global_interval
                        }
                    );
                }
                continue;
            }

            let ctx = CheckContext {
                warner: &self.opts.warner,
                first_pass,
                allow_selftests,
                debug: self.opts.debug,
                now: unix_now(),
            };
            match &mut self.devices[i] {
                Device::Ata(p) => ata::check_ata(cfg, state, p.as_mut(), &ctx),
                Device::Scsi(p) => scsi::check_scsi(cfg, state, p.as_mut(), &ctx),
                Device::Nvme(p) => nvme::check_nvme(cfg, state, p.as_mut(), &ctx),
            }

            // Don't let a supervisor time out while many devices are probed
            self.notify.extend_timeout();
        }

        self.do_disable_standby_check();
    }

    fn write_all_states(&mut self, write_always: bool) {
        for (cfg, state) in self.configs.iter().zip(&mut self.states) {
            let Some(path) = &cfg.state_file else {
                continue;
            };
            if !write_always && !state.must_write {
                continue;
            }
            match state::write_state_file(path, &state.saved) {
                Err(e) => info!("{}", e),
                Ok(()) => {
                    state.must_write = false;
                    if write_always || self.opts.debug {
                        info!(
                            "Device: {}, state written to {}",
                            cfg.name,
                            path.display()
                        );
                    }
                }
            }
        }
    }

    fn write_all_attrlogs(&mut self) {
        let now = Local::now();
        for (cfg, state) in self.configs.iter().zip(&mut self.states) {
            let Some(path) = &cfg.attrlog_file else {
                continue;
            };
            if state.attrlog.is_none() {
                continue;
            }
            if let Err(e) = state::append_attrlog(path, now, state) {
                info!("{}", e);
            } else if self.opts.debug {
                info!(
                    "Device: {}, attribute log written to {}",
                    cfg.name,
                    path.display()
                );
            }
            state.attrlog = None;
        }
    }

    // ========================================================================
    // Sleeping
    // ========================================================================

    /// Sleep until the next cadence point or a signal, with robustness to
    /// clock adjustments and suspend/resume. Returns the adjusted wakeup
    /// time and computes per-device skip flags for the next cycle.
    fn dosleep(&mut self, mut wakeuptime: i64, write_states_always: &mut bool) -> i64 {
        let mut timenow = unix_now();

        let ct;
        if self.checktime_min == 0 {
            wakeuptime = calc_next_wakeuptime(wakeuptime, timenow, self.checktime());
            ct = self.checktime();
        } else {
            // Wakeup time of the soonest device
            wakeuptime = 0;
            let global = self.checktime();
            for (cfg, state) in self.configs.iter().zip(&mut self.states) {
                if !state.skip {
                    let dev_ct = if cfg.check_interval != 0 {
                        i64::from(cfg.check_interval)
                    } else {
                        global
                    };
                    let anchor = if state.wakeup_time != 0 {
                        state.wakeup_time
                    } else {
                        timenow
                    };
                    state.wakeup_time = calc_next_wakeuptime(anchor, timenow, dev_ct);
                }
                if wakeuptime == 0 || state.wakeup_time < wakeuptime {
                    wakeuptime = state.wakeup_time;
                }
            }
            ct = self.checktime_min;
        }

        self.notify.wait(wakeuptime, self.devices.len());

        let mut no_skip = false;
        let mut addtime: i64 = 0;
        while timenow < wakeuptime + addtime && !self.flags.any_pending() {
            // Restart if the system clock was adjusted to the past
            if wakeuptime > timenow + ct {
                info!("System clock time adjusted to the past. Resetting next wakeup time.");
                wakeuptime = timenow + ct;
                for state in &mut self.states {
                    state.wakeup_time = 0;
                }
                no_skip = true;
            }

            // Sleep in one second slices so signal flags stay responsive
            std::thread::sleep(std::time::Duration::from_secs(1));
            timenow = unix_now();

            // Actual sleep time much too long: assume resume from standby
            // and pad with quiet time to avoid I/O errors during spin-up
            if addtime == 0 && timenow > wakeuptime + 60 {
                if self.opts.debug {
                    info!(
                        "Sleep time was {} seconds too long, assuming wakeup from standby mode.",
                        timenow - wakeuptime
                    );
                }
                addtime = timenow - wakeuptime + 20;
                // Merge with the next cadence point if close
                let nextcheck = ct - addtime % ct;
                if nextcheck <= 20 {
                    addtime += nextcheck;
                }
            }
        }

        if self.flags.take_check_now() {
            let left = (wakeuptime - timenow).max(0);
            info!(
                "Signal USR1 - checking devices now rather than in {} seconds.",
                left
            );
            no_skip = true;
            *write_states_always = true;
        }

        // Which devices are skipped in this cycle
        if self.checktime_min != 0 {
            for state in &mut self.states {
                state.skip = !no_skip && timenow < state.wakeup_time;
            }
        }

        wakeuptime
    }

    // ========================================================================
    // Test schedule preview (-q showtests)
    // ========================================================================

    fn print_test_schedule(&mut self) {
        if self.configs.is_empty() {
            return;
        }
        info!("Next scheduled self tests (at most 5 of each type per device):");

        let now = unix_now();
        let numtypes = TEST_PRIORITY.len();
        let mut counts = vec![0u32; self.configs.len() * numtypes];

        let checktime = self.checktime();
        let mut seconds = checktime;
        while seconds < 3600 * 24 * 90 {
            let testtime = now + seconds;
            for (i, (cfg, state)) in self.configs.iter().zip(&mut self.states).enumerate() {
                if let Some(test) = next_scheduled_test(cfg, state, testtime, false) {
                    let t = TEST_PRIORITY.iter().position(|x| *x == test).unwrap();
                    counts[i * numtypes + t] += 1;
                    if counts[i * numtypes + t] <= 5 {
                        let date = Local
                            .timestamp_opt(testtime, 0)
                            .single()
                            .map(|d| d.format("%Y-%m-%d %H:%M:%S %Z").to_string())
                            .unwrap_or_default();
                        info!(
                            "Device: {}, will do test {} of type {} at {}",
                            cfg.name,
                            counts[i * numtypes + t],
                            test.as_char(),
                            date
                        );
                    }
                }
            }
            seconds += checktime;
        }

        info!("Totals [next 90 days]:");
        for (i, cfg) in self.configs.iter().enumerate() {
            let always_shown: &[char] = match self.devices[i].transport() {
                Transport::Ata => &['L', 'S', 'C', 'O'],
                _ => &['L', 'S'],
            };
            for (t, test) in TEST_PRIORITY.iter().enumerate() {
                let cnt = counts[i * numtypes + t];
                if cnt == 0 && !always_shown.contains(&test.as_char()) {
                    continue;
                }
                info!(
                    "Device: {}, will do {:3} test{} of type {}",
                    cfg.name,
                    cnt,
                    if cnt == 1 { "" } else { "s" },
                    test.as_char()
                );
            }
        }
    }

    // ========================================================================
    // PID file
    // ========================================================================

    fn write_pid_file(&self) -> bool {
        let Some(path) = &self.opts.pid_file else {
            return true;
        };

        // Refuse when another instance appears to be alive
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(old_pid) = content.trim().parse::<i32>() {
                if unsafe { libc::kill(old_pid, 0) } == 0 {
                    error!(
                        "PID file {} holds running process {} - exiting.",
                        path.display(),
                        old_pid
                    );
                    return false;
                }
            }
            let _ = std::fs::remove_file(path);
        }

        let pid = std::process::id();
        if std::fs::write(path, format!("{}\n", pid)).is_err() {
            error!("unable to write PID file {} - exiting.", path.display());
            return false;
        }
        info!("file {} written containing PID {}", path.display(), pid);
        true
    }

    fn remove_pid_file(&self) {
        if let Some(path) = &self.opts.pid_file {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!("Can't unlink PID file {} ({}).", path.display(), e);
                }
            }
        }
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    pub fn run(&mut self) -> i32 {
        let mut status: Option<i32> = None;
        let mut firstpass = true;
        let mut write_states_always = true;
        let mut wakeuptime = 0i64;

        self.notify.msg("Initializing ...");

        loop {
            let reload = self.flags.take_reload();
            if firstpass || reload != 0 {
                if !firstpass {
                    if self.opts.state_prefix.is_some() {
                        self.write_all_states(true);
                    }
                    if reload == RELOAD_INT {
                        info!(
                            "Signal INT - rereading configuration file {} (SIGQUIT quits)",
                            self.opts.config.display()
                        );
                    } else {
                        info!(
                            "Signal HUP - rereading configuration file {}",
                            self.opts.config.display()
                        );
                    }
                    self.notify.msg("Reloading ...");
                }

                match self.read_config_entries() {
                    Ok((entries, scanned)) => {
                        if !self.register_devices(entries, scanned) {
                            status = Some(exit::BADDEV);
                            break;
                        }
                    }
                    Err(code) => {
                        let reuse = self.opts.quit == QuitPolicy::Never
                            || (matches!(
                                self.opts.quit,
                                QuitPolicy::NoDev | QuitPolicy::NoDevStartup
                            ) && !firstpass);
                        if reuse {
                            if !firstpass {
                                info!("Reusing previous configuration");
                            }
                        } else {
                            status = Some(code);
                            break;
                        }
                    }
                }

                let keep_running = !self.devices.is_empty()
                    || self.opts.quit == QuitPolicy::Never
                    || (self.opts.quit == QuitPolicy::NoDevStartup && !firstpass);
                if !keep_running {
                    let st = if self.opts.quit_nodev0 { 0 } else { exit::NODEV };
                    if st != 0 {
                        error!("Unable to monitor any SMART enabled devices. Exiting.");
                    } else {
                        info!("Unable to monitor any SMART enabled devices. Exiting.");
                    }
                    status = Some(st);
                    break;
                }

                let numata = self
                    .devices
                    .iter()
                    .filter(|d| d.transport() == Transport::Ata)
                    .count();
                let numscsi = self
                    .devices
                    .iter()
                    .filter(|d| d.transport() == Transport::Scsi)
                    .count();
                info!(
                    "Monitoring {} ATA/SATA, {} SCSI/SAS and {} NVMe devices",
                    numata,
                    numscsi,
                    self.devices.len() - numata - numscsi
                );

                if self.opts.quit == QuitPolicy::ShowTests {
                    self.print_test_schedule();
                    return exit::OK;
                }

                // Always write state files after (re)configuration
                write_states_always = true;
            }

            // Check all devices once; self-tests are not started on the
            // first pass unless '-q onecheck' was given
            self.notify.check(self.devices.len());
            let allow_selftests = !firstpass || self.opts.quit == QuitPolicy::OneCheck;
            self.check_devices_once(firstpass, allow_selftests);

            if self.opts.state_prefix.is_some() {
                self.write_all_states(write_states_always);
            }
            write_states_always = false;
            if self.opts.attrlog_prefix.is_some() {
                self.write_all_attrlogs();
            }

            if self.opts.quit == QuitPolicy::OneCheck {
                info!(
                    "Started with '-q onecheck' option. All devices successfully checked once."
                );
                info!("drivewatchd is exiting (exit status 0)");
                return exit::OK;
            }

            if firstpass {
                if !self.opts.debug && !self.write_pid_file() {
                    return exit::PID;
                }
                wakeuptime = unix_now();
                firstpass = false;
            }

            wakeuptime = self.dosleep(wakeuptime, &mut write_states_always);

            if self.flags.exit_signal().is_some() {
                break;
            }
        }

        if let Some(sig) = self.flags.exit_signal() {
            if status.is_none() {
                if sig == SIGTERM || (self.opts.debug && sig == SIGQUIT) {
                    info!("drivewatchd received signal {}", sig);
                } else {
                    error!("drivewatchd received unexpected signal {}", sig);
                    status = Some(exit::SIGNAL);
                }
            }
        }
        let status = status.unwrap_or(exit::OK);

        if !firstpass {
            // Write state files only on a normal exit
            if status == exit::OK && self.opts.state_prefix.is_some() {
                self.write_all_states(true);
            }
            if !self.opts.debug {
                self.remove_pid_file();
            }
        }

        if status != exit::OK {
            error!("drivewatchd is exiting (exit status {})", status);
        } else {
            info!("drivewatchd is exiting (exit status {})", status);
        }
        self.notify.exit(status);
        status
    }
}
