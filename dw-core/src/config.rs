//! Device configuration model and directive-file parser.
//!
//! The configuration file is line oriented: one device per line followed by
//! directives, `DEFAULT` lines carrying defaults forward, a `DEVICESCAN`
//! sentinel expanding to every auto-detected device, `#` comments, and
//! backslash line continuation. The grammar is fixed by the installed base;
//! it is parsed by hand rather than through a serde format.

use std::path::PathBuf;

use dw_error::{DwError, Result};
use tracing::info;

use crate::schedule::TestRegex;

/// Maximum length of one physical config line.
const MAX_LINE_LEN: usize = 256;
/// Maximum length of a backslash-continued logical line.
const MAX_CONT_LINE_LEN: usize = 1023;

/// Sentinel device name expanding to all scanned devices.
pub const SCAN_DIRECTIVE: &str = "DEVICESCAN";

// ============================================================================
// Attribute monitoring flags
// ============================================================================

/// Per-attribute monitoring flag bits.
pub mod attr_flag {
    /// `-i ID`: ignore failure of this usage attribute
    pub const IGNORE_FAILED_USAGE: u8 = 0x01;
    /// `-I ID`: ignore this attribute for tracking
    pub const IGNORE: u8 = 0x02;
    /// `-r ID`: print raw value when tracking
    pub const RAW_PRINT: u8 = 0x04;
    /// `-R ID`: track changes in the raw value
    pub const RAW_TRACK: u8 = 0x08;
    /// `-r ID!`: normalized value change is critical
    pub const AS_CRIT: u8 = 0x10;
    /// `-R ID!`: raw value change is critical
    pub const RAW_AS_CRIT: u8 = 0x20;
}

/// 256-entry flag bitmap, one slot per attribute id.
#[derive(Clone)]
pub struct AttributeFlags {
    flags: [u8; 256],
}

impl Default for AttributeFlags {
    fn default() -> Self {
        Self { flags: [0; 256] }
    }
}

impl AttributeFlags {
    pub fn is_set(&self, id: u8, flag: u8) -> bool {
        id != 0 && self.flags[id as usize] & flag != 0
    }

    pub fn set(&mut self, id: u8, flags: u8) {
        if id != 0 {
            self.flags[id as usize] |= flags;
        }
    }
}

impl std::fmt::Debug for AttributeFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set: Vec<String> = self
            .flags
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0)
            .map(|(i, v)| format!("{}:0x{:02x}", i, v))
            .collect();
        write!(f, "AttributeFlags[{}]", set.join(", "))
    }
}

// ============================================================================
// Directive argument types
// ============================================================================

/// How often warnings of one kind are dispatched to the notifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmailFreq {
    /// Not set by the user; resolved at registration time
    #[default]
    Unknown,
    Once,
    Always,
    Daily,
    Diminishing,
}

/// `-n` power mode gate: skip the check when the drive is at or below
/// this power level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerGate {
    Sleep,
    Standby,
    Idle,
}

/// Firmware bug workarounds carried through to the port layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirmwareBugs {
    pub samsung: bool,
    pub samsung2: bool,
    pub samsung3: bool,
    pub xerrorlba: bool,
    pub nologdir: bool,
}

impl FirmwareBugs {
    fn parse(arg: &str) -> Option<Self> {
        let mut bugs = Self::default();
        match arg {
            "none" => {}
            "samsung" => bugs.samsung = true,
            "samsung2" => bugs.samsung2 = true,
            "samsung3" => bugs.samsung3 = true,
            "xerrorlba" => bugs.xerrorlba = true,
            "nologdir" => bugs.nologdir = true,
            _ => return None,
        }
        Some(bugs)
    }

    fn merge(&mut self, other: Self) {
        self.samsung |= other.samsung;
        self.samsung2 |= other.samsung2;
        self.samsung3 |= other.samsung3;
        self.xerrorlba |= other.xerrorlba;
        self.nologdir |= other.nologdir;
    }
}

/// Drive-database preset policy (`-P`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PresetPolicy {
    #[default]
    Use,
    Ignore,
    Show,
}

// ============================================================================
// DeviceConfig
// ============================================================================

/// Configuration for one monitored device, immutable after registration.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    /// Line number of the entry in the config file, 0 for synthetic entries
    pub lineno: u32,
    /// Device name with optional extra info
    pub name: String,
    /// Plain device name, exported to the notifier
    pub dev_name: String,
    /// Declared type from `-d`, empty for auto
    pub dev_type: String,
    /// Identity string for warning messages and duplicate detection
    pub id_info: String,
    /// Identity without namespace id, for NVMe duplicate detection
    pub id_info_bc: String,
    /// True once the identity is known to carry a serial or WWN
    pub id_is_unique: bool,

    pub state_file: Option<PathBuf>,
    pub attrlog_file: Option<PathBuf>,

    /// Individual check interval in seconds, 0 = use the global interval
    pub check_interval: u32,
    /// `-d ignore`
    pub ignore: bool,
    /// `-d removable`
    pub removable: bool,

    pub smart_check: bool,
    /// Monitored bits of the NVMe critical-warning byte
    pub nvme_warning_mask: u8,
    pub track_usage_failed: bool,
    pub track_prefail: bool,
    pub track_usage: bool,
    pub track_selftest_log: bool,
    pub track_error_log: bool,
    pub track_xerror_log: bool,
    pub track_offline_status: bool,
    pub offline_status_ns: bool,
    pub track_selftest_status: bool,
    pub selftest_status_ns: bool,

    /// `-T permissive`: ignore failed mandatory SMART commands
    pub permissive: bool,
    /// `-S on/off`
    pub autosave: Option<bool>,
    /// `-o on/off`
    pub auto_offline: Option<bool>,
    pub firmware_bugs: FirmwareBugs,
    pub preset_policy: PresetPolicy,
    /// Raw `-v` vendor attribute redefinitions, applied by the port layer
    pub vendor_attr_defs: Vec<String>,

    pub power_gate: Option<PowerGate>,
    pub power_quiet: bool,
    pub power_skip_max: u32,

    pub temp_diff: u8,
    pub temp_info: u8,
    pub temp_crit: u8,

    pub test_regex: Option<TestRegex>,
    /// Stagger factor assigned at registration
    pub test_offset_factor: u32,

    pub email_address: String,
    pub email_exec: String,
    pub email_freq: EmailFreq,
    pub email_test: bool,

    // ATA only
    /// 0 = unknown, 1 = SSD, >1 = rpm; filled at probe time
    pub rotation_rate: i32,
    /// 0 = leave alone, -1 = disable, 1..=255 = value+1
    pub set_aam: i32,
    pub set_apm: i32,
    pub set_lookahead: i32,
    pub set_standby: i32,
    pub set_wcache: i32,
    pub set_dsn: i32,
    pub set_security_freeze: bool,
    pub sct_erc: Option<(u16, u16)>,

    pub curr_pending_id: u8,
    pub offl_pending_id: u8,
    pub curr_pending_incr: bool,
    pub offl_pending_incr: bool,
    pub curr_pending_set: bool,
    pub offl_pending_set: bool,

    pub attr_flags: AttributeFlags,

    // NVMe only
    /// Error log page capacity, filled at probe time
    pub nvme_err_log_max_entries: u32,
}

impl DeviceConfig {
    /// True if any monitoring directive is active.
    pub fn any_monitor_enabled(&self) -> bool {
        self.smart_check
            || self.track_selftest_log
            || self.track_error_log
            || self.track_xerror_log
            || self.track_offline_status
            || self.track_selftest_status
            || self.track_usage_failed
            || self.track_prefail
            || self.track_usage
            || self.temp_diff != 0
            || self.temp_info != 0
            || self.temp_crit != 0
    }

    /// Apply the `-a` shorthand.
    pub fn enable_default_monitors(&mut self) {
        self.smart_check = true;
        self.nvme_warning_mask = 0xff;
        self.track_usage_failed = true;
        self.track_prefail = true;
        self.track_usage = true;
        self.track_selftest_log = true;
        self.track_error_log = true;
        self.track_selftest_status = true;
    }

    /// True if a notifier target is configured.
    pub fn wants_warnings(&self) -> bool {
        !self.email_address.is_empty() || !self.email_exec.is_empty()
    }
}

/// A parsed configuration file.
#[derive(Debug, Default)]
pub struct ParsedConfig {
    /// Explicit device entries in file order
    pub entries: Vec<DeviceConfig>,
    /// `DEVICESCAN` request, if the sentinel was present
    pub scan: Option<ScanRequest>,
}

/// Pending device scan carrying the sentinel's directives.
#[derive(Debug)]
pub struct ScanRequest {
    pub base: DeviceConfig,
    /// `-d TYPE` restrictions, empty = all types
    pub types: Vec<String>,
}

// ============================================================================
// Parser
// ============================================================================

struct Tokens<'a> {
    items: Vec<&'a str>,
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            items: line.split_whitespace().collect(),
            pos: 0,
        }
    }

    fn next(&mut self) -> Option<&'a str> {
        let t = self.items.get(self.pos).copied();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }
}

fn syntax_error(file: &str, lineno: u32, reason: impl Into<String>) -> DwError {
    DwError::ConfigSyntax {
        file: file.to_string(),
        lineno,
        reason: reason.into(),
    }
}

/// Parse an integer argument in `min..=max`, with an optional one-char
/// suffix (`+` or `!`). Returns (value, suffix_present).
fn parse_int_arg(
    arg: Option<&str>,
    file: &str,
    lineno: u32,
    name: &str,
    token: &str,
    min: i64,
    max: i64,
    suffix: Option<char>,
) -> Result<(i64, bool)> {
    let arg = arg.ok_or_else(|| {
        syntax_error(
            file,
            lineno,
            format!(
                "(drive {}): Directive: {} takes integer argument from {} to {}",
                name, token, min, max
            ),
        )
    })?;

    let (digits, has_suffix) = match suffix {
        Some(c) if arg.ends_with(c) => (&arg[..arg.len() - c.len_utf8()], true),
        _ => (arg, false),
    };

    match digits.parse::<i64>() {
        Ok(v) if (min..=max).contains(&v) => Ok((v, has_suffix)),
        _ => Err(syntax_error(
            file,
            lineno,
            format!(
                "(drive {}): Directive: {} has argument: {}; needs integer from {} to {}",
                name, token, arg, min, max
            ),
        )),
    }
}

/// Parse the `-W D[,I[,C]]` temperature triple.
fn parse_temp_triple(arg: Option<&str>, file: &str, lineno: u32, name: &str) -> Result<(u8, u8, u8)> {
    let err = || {
        syntax_error(
            file,
            lineno,
            format!(
                "(drive {}): Directive: -W needs 1-3 integer(s) from 0 to 255",
                name
            ),
        )
    };
    let arg = arg.ok_or_else(|| err())?;
    let mut vals = [0u8; 3];
    let parts: Vec<&str> = arg.split(',').collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(err());
    }
    for (i, p) in parts.iter().enumerate() {
        vals[i] = p.parse::<u8>().map_err(|_| err())?;
    }
    Ok((vals[0], vals[1], vals[2]))
}

/// What a logical config line turned out to be.
enum LineKind {
    Nothing,
    Entry,
    Scan,
}

/// Parse one logical line into a config entry or an update of the defaults.
fn parse_config_line(
    file: &str,
    lineno: u32,
    line: &str,
    default_conf: &mut DeviceConfig,
    entries: &mut Vec<DeviceConfig>,
    scan_types: &mut Vec<String>,
) -> Result<LineKind> {
    let mut tokens = Tokens::new(line);
    let name = match tokens.next() {
        Some(n) if !n.starts_with('#') => n,
        _ => return Ok(LineKind::Nothing),
    };

    let kind;
    let cfg: &mut DeviceConfig;
    if name == "DEFAULT" {
        // Restart with empty defaults
        *default_conf = DeviceConfig::default();
        kind = LineKind::Nothing;
        cfg = default_conf;
    } else {
        kind = if name == SCAN_DIRECTIVE {
            LineKind::Scan
        } else {
            LineKind::Entry
        };
        entries.push(default_conf.clone());
        cfg = entries.last_mut().unwrap();
    }

    cfg.name = name.to_string();
    cfg.dev_name = name.to_string();
    cfg.lineno = lineno;

    parse_directives(file, lineno, &mut tokens, cfg, scan_types)?;

    if !matches!(kind, LineKind::Scan) && scan_types.len() > 1 {
        return Err(syntax_error(
            file,
            lineno,
            format!("Drive: {}, invalid multiple -d TYPE Directives", cfg.name),
        ));
    }

    // Nothing more to check for DEFAULT lines
    if matches!(kind, LineKind::Nothing) {
        return Ok(kind);
    }

    // If no monitoring directives are set, set all of them
    if !cfg.any_monitor_enabled() {
        info!(
            "Drive: {}, implied '-a' Directive on line {} of file {}",
            cfg.name, cfg.lineno, file
        );
        cfg.enable_default_monitors();
    }

    // -M options without -m make no sense
    if cfg.email_address.is_empty()
        && (!cfg.email_exec.is_empty() || cfg.email_freq != EmailFreq::Unknown || cfg.email_test)
    {
        return Err(syntax_error(
            file,
            lineno,
            format!(
                "Drive: {}, -M Directive(s) need -m ADDRESS Directive",
                cfg.name
            ),
        ));
    }

    // '-m <nomailer>' requires '-M exec'; from here on the empty address
    // plus a non-empty exec path is the sign of <nomailer>
    if cfg.email_address == "<nomailer>" {
        if cfg.email_exec.is_empty() {
            return Err(syntax_error(
                file,
                lineno,
                format!(
                    "Drive: {}, -m <nomailer> Directive needs -M exec Directive",
                    cfg.name
                ),
            ));
        }
        cfg.email_address.clear();
    }

    Ok(kind)
}

/// Parse all directive tokens of one line onto `cfg`.
fn parse_directives(
    file: &str,
    lineno: u32,
    tokens: &mut Tokens<'_>,
    cfg: &mut DeviceConfig,
    scan_types: &mut Vec<String>,
) -> Result<()> {
    let name = cfg.name.clone();
    let unknown = |token: &str| {
        syntax_error(
            file,
            lineno,
            format!(
                "(drive {}): unknown Directive: {}; run drivewatchd -D for a list",
                name, token
            ),
        )
    };
    let missing = |token: &str| {
        syntax_error(
            file,
            lineno,
            format!("(drive {}): Missing argument to {} Directive", name, token),
        )
    };
    let bad = |token: &str, arg: &str| {
        syntax_error(
            file,
            lineno,
            format!(
                "(drive {}): Invalid argument to {} Directive: {}",
                name, token, arg
            ),
        )
    };

    // Lookahead slot for '-H [MASK]'
    let mut pending: Option<&str> = None;

    loop {
        let token = match pending.take().or_else(|| tokens.next()) {
            Some(t) => t,
            None => return Ok(()),
        };
        if token.starts_with('#') {
            return Ok(());
        }
        if !token.starts_with('-') || token.len() != 2 {
            return Err(unknown(token));
        }

        match token.as_bytes()[1] {
            b'C' => {
                let (v, plus) =
                    parse_int_arg(tokens.next(), file, lineno, &name, token, 0, 255, Some('+'))?;
                cfg.curr_pending_id = v as u8;
                cfg.curr_pending_incr = plus;
                cfg.curr_pending_set = true;
            }
            b'U' => {
                let (v, plus) =
                    parse_int_arg(tokens.next(), file, lineno, &name, token, 0, 255, Some('+'))?;
                cfg.offl_pending_id = v as u8;
                cfg.offl_pending_incr = plus;
                cfg.offl_pending_set = true;
            }
            b'T' => match tokens.next() {
                None => return Err(missing(token)),
                Some("normal") => cfg.permissive = false,
                Some("permissive") => cfg.permissive = true,
                Some(a) => return Err(bad(token, a)),
            },
            b'd' => match tokens.next() {
                None => return Err(missing(token)),
                Some("ignore") => cfg.ignore = true,
                Some("removable") => cfg.removable = true,
                Some("auto") => {
                    cfg.dev_type.clear();
                    scan_types.clear();
                }
                Some(a) => {
                    cfg.dev_type = a.to_string();
                    scan_types.push(a.to_string());
                }
            },
            b'F' => match tokens.next() {
                None => return Err(missing(token)),
                Some(a) => match FirmwareBugs::parse(a) {
                    Some(b) => cfg.firmware_bugs.merge(b),
                    None => return Err(bad(token, a)),
                },
            },
            b'H' => {
                cfg.smart_check = true;
                cfg.nvme_warning_mask = 0xff;
                // Lookahead for the optional NVMe bitmask
                match tokens.next() {
                    None => return Ok(()),
                    Some(next) if next.starts_with('-') => pending = Some(next),
                    Some(arg) => {
                        let mask = arg
                            .strip_prefix("0x")
                            .and_then(|h| u16::from_str_radix(h, 16).ok())
                            .filter(|v| *v <= 0xff);
                        match mask {
                            Some(m) => cfg.nvme_warning_mask = m as u8,
                            None => return Err(bad(token, arg)),
                        }
                    }
                }
            }
            b'f' => cfg.track_usage_failed = true,
            b't' => {
                cfg.track_prefail = true;
                cfg.track_usage = true;
            }
            b'p' => cfg.track_prefail = true,
            b'u' => cfg.track_usage = true,
            b'l' => match tokens.next() {
                None => return Err(missing(token)),
                Some("selftest") => cfg.track_selftest_log = true,
                Some("error") => cfg.track_error_log = true,
                Some("xerror") => cfg.track_xerror_log = true,
                Some("offlinests") => cfg.track_offline_status = true,
                Some("offlinests,ns") => {
                    cfg.track_offline_status = true;
                    cfg.offline_status_ns = true;
                }
                Some("selfteststs") => cfg.track_selftest_status = true,
                Some("selfteststs,ns") => {
                    cfg.track_selftest_status = true;
                    cfg.selftest_status_ns = true;
                }
                Some(a) if a.starts_with("scterc,") => {
                    let mut it = a["scterc,".len()..].split(',');
                    let rt = it.next().and_then(|s| s.parse::<u16>().ok());
                    let wt = it.next().and_then(|s| s.parse::<u16>().ok());
                    match (rt, wt, it.next()) {
                        (Some(r), Some(w), None) if r <= 999 && w <= 999 => {
                            cfg.sct_erc = Some((r, w));
                        }
                        _ => return Err(bad(token, a)),
                    }
                }
                Some(a) => return Err(bad(token, a)),
            },
            b'a' => cfg.enable_default_monitors(),
            b'o' => match tokens.next() {
                None => return Err(missing(token)),
                Some("on") => cfg.auto_offline = Some(true),
                Some("off") => cfg.auto_offline = Some(false),
                Some(a) => return Err(bad(token, a)),
            },
            b'n' => {
                let arg = tokens.next().ok_or_else(|| missing(token))?;
                let mut parts = arg.split(',');
                cfg.power_quiet = false;
                cfg.power_skip_max = 0;
                match parts.next() {
                    Some("never") => cfg.power_gate = None,
                    Some("sleep") => cfg.power_gate = Some(PowerGate::Sleep),
                    Some("standby") => cfg.power_gate = Some(PowerGate::Standby),
                    Some("idle") => cfg.power_gate = Some(PowerGate::Idle),
                    _ => return Err(bad(token, arg)),
                }
                for extra in parts {
                    if extra == "q" {
                        cfg.power_quiet = true;
                    } else {
                        match extra.parse::<u32>() {
                            Ok(n) if n > 0 => cfg.power_skip_max = n,
                            _ => return Err(bad(token, arg)),
                        }
                    }
                }
            }
            b'S' => match tokens.next() {
                None => return Err(missing(token)),
                Some("on") => cfg.autosave = Some(true),
                Some("off") => cfg.autosave = Some(false),
                Some(a) => return Err(bad(token, a)),
            },
            b's' => {
                if let Some(prev) = &cfg.test_regex {
                    info!(
                        "File {} line {} (drive {}): ignoring previous Test Directive -s {}",
                        file,
                        lineno,
                        name,
                        prev.pattern()
                    );
                    cfg.test_regex = None;
                }
                let arg = tokens.next().ok_or_else(|| missing(token))?;
                match TestRegex::compile(arg) {
                    Ok(re) => {
                        if let Some(odd) = re.odd_looking_part() {
                            info!(
                                "File {} line {} (drive {}): warning, \"{}\" looks odd in \
                                 extended regular expression \"{}\"",
                                file, lineno, name, odd, arg
                            );
                        }
                        cfg.test_regex = Some(re);
                    }
                    Err(e) => {
                        return Err(syntax_error(
                            file,
                            lineno,
                            format!(
                                "(drive {}): -s argument \"{}\" is INVALID extended regular expression: {}",
                                name, arg, e
                            ),
                        ))
                    }
                }
            }
            b'm' => {
                let arg = tokens.next().ok_or_else(|| missing(token))?;
                if !cfg.email_address.is_empty() {
                    info!(
                        "File {} line {} (drive {}): ignoring previous Address Directive -m {}",
                        file, lineno, name, cfg.email_address
                    );
                }
                cfg.email_address = arg.to_string();
            }
            b'M' => match tokens.next() {
                None => return Err(missing(token)),
                Some("once") => cfg.email_freq = EmailFreq::Once,
                Some("always") => cfg.email_freq = EmailFreq::Always,
                Some("daily") => cfg.email_freq = EmailFreq::Daily,
                Some("diminishing") => cfg.email_freq = EmailFreq::Diminishing,
                Some("test") => cfg.email_test = true,
                Some("exec") => {
                    let arg = tokens.next().ok_or_else(|| {
                        syntax_error(
                            file,
                            lineno,
                            format!(
                                "(drive {}): Directive -M 'exec' argument must be followed by executable path",
                                name
                            ),
                        )
                    })?;
                    if !cfg.email_exec.is_empty() {
                        info!(
                            "File {} line {} (drive {}): ignoring previous mail Directive -M exec {}",
                            file, lineno, name, cfg.email_exec
                        );
                    }
                    cfg.email_exec = arg.to_string();
                }
                Some(a) => return Err(bad(token, a)),
            },
            b'i' => {
                let (v, _) =
                    parse_int_arg(tokens.next(), file, lineno, &name, token, 1, 255, None)?;
                cfg.attr_flags.set(v as u8, attr_flag::IGNORE_FAILED_USAGE);
            }
            b'I' => {
                let (v, _) =
                    parse_int_arg(tokens.next(), file, lineno, &name, token, 1, 255, None)?;
                cfg.attr_flags.set(v as u8, attr_flag::IGNORE);
            }
            b'r' => {
                let (v, excl) =
                    parse_int_arg(tokens.next(), file, lineno, &name, token, 1, 255, Some('!'))?;
                cfg.attr_flags.set(v as u8, attr_flag::RAW_PRINT);
                if excl {
                    cfg.attr_flags.set(v as u8, attr_flag::AS_CRIT);
                }
            }
            b'R' => {
                let (v, excl) =
                    parse_int_arg(tokens.next(), file, lineno, &name, token, 1, 255, Some('!'))?;
                cfg.attr_flags
                    .set(v as u8, attr_flag::RAW_PRINT | attr_flag::RAW_TRACK);
                if excl {
                    cfg.attr_flags.set(v as u8, attr_flag::RAW_AS_CRIT);
                }
            }
            b'W' => {
                let (d, i, c) = parse_temp_triple(tokens.next(), file, lineno, &name)?;
                cfg.temp_diff = d;
                cfg.temp_info = i;
                cfg.temp_crit = c;
            }
            b'v' => {
                let arg = tokens.next().ok_or_else(|| missing(token))?;
                if !is_valid_vendor_attr_def(arg) {
                    return Err(bad(token, arg));
                }
                cfg.vendor_attr_defs.push(arg.to_string());
            }
            b'P' => match tokens.next() {
                None => return Err(missing(token)),
                Some("use") => cfg.preset_policy = PresetPolicy::Use,
                Some("ignore") => cfg.preset_policy = PresetPolicy::Ignore,
                Some("show") => cfg.preset_policy = PresetPolicy::Show,
                Some("showall") => {} // informational only
                Some(a) => return Err(bad(token, a)),
            },
            b'e' => {
                let arg = tokens.next().ok_or_else(|| missing(token))?;
                parse_ata_setting(arg, cfg).map_err(|_| bad(token, arg))?;
            }
            b'c' => {
                let arg = tokens.next().ok_or_else(|| missing(token))?;
                let val = arg
                    .strip_prefix("i=")
                    .or_else(|| arg.strip_prefix("interval="))
                    .and_then(|v| v.parse::<u32>().ok())
                    .filter(|n| *n >= 10);
                match val {
                    Some(n) => cfg.check_interval = n,
                    None => return Err(bad(token, arg)),
                }
            }
            _ => return Err(unknown(token)),
        }
    }
}

/// Parse one `-e` on-open ATA setting.
fn parse_ata_setting(arg: &str, cfg: &mut DeviceConfig) -> std::result::Result<(), ()> {
    if arg == "security-freeze" {
        cfg.set_security_freeze = true;
        return Ok(());
    }
    let (key, value) = arg.split_once(',').ok_or(())?;
    let on = value == "on";
    let off = value == "off";
    let num = value.parse::<u32>().ok();
    match key {
        "aam" => {
            if off {
                cfg.set_aam = -1;
            } else {
                match num {
                    Some(v) if v <= 254 => cfg.set_aam = v as i32 + 1,
                    _ => return Err(()),
                }
            }
        }
        "apm" => {
            if off {
                cfg.set_apm = -1;
            } else {
                match num {
                    Some(v) if (1..=254).contains(&v) => cfg.set_apm = v as i32 + 1,
                    _ => return Err(()),
                }
            }
        }
        "lookahead" => {
            cfg.set_lookahead = if on {
                1
            } else if off {
                -1
            } else {
                return Err(());
            }
        }
        "wcache" => {
            cfg.set_wcache = if on {
                1
            } else if off {
                -1
            } else {
                return Err(());
            }
        }
        "dsn" => {
            cfg.set_dsn = if on {
                1
            } else if off {
                -1
            } else {
                return Err(());
            }
        }
        "standby" => {
            if off {
                cfg.set_standby = 1;
            } else {
                match num {
                    Some(v) if v <= 255 => cfg.set_standby = v as i32 + 1,
                    _ => return Err(()),
                }
            }
        }
        _ => return Err(()),
    }
    Ok(())
}

/// `-v N,FORMAT[,NAME]` with 1 <= N <= 255.
fn is_valid_vendor_attr_def(arg: &str) -> bool {
    let mut parts = arg.splitn(2, ',');
    let id_ok = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .map(|id| (1..=255).contains(&id))
        .unwrap_or(false);
    id_ok && parts.next().map(|rest| !rest.is_empty()).unwrap_or(false)
}

/// Parse a full configuration file from its text content.
///
/// `file` is only used in messages. Stops at a `DEVICESCAN` line; anything
/// after it is intentionally unread.
pub fn parse_config_str(content: &str, file: &str) -> Result<ParsedConfig> {
    let mut parsed = ParsedConfig::default();
    let mut default_conf = DeviceConfig::default();

    let mut logical = String::new();
    let mut logical_start: u32 = 0;
    let mut physical_lineno: u32 = 0;

    for raw_line in content.lines() {
        physical_lineno += 1;

        if raw_line.len() > MAX_LINE_LEN {
            return Err(syntax_error(
                file,
                physical_lineno,
                format!("line is more than {} characters", MAX_LINE_LEN),
            ));
        }

        // Strip comments before looking for a continuation
        let line = match raw_line.find('#') {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        };

        if logical.is_empty() {
            logical_start = physical_lineno;
        }
        if logical.len() + line.len() > MAX_CONT_LINE_LEN {
            return Err(syntax_error(
                file,
                physical_lineno,
                format!(
                    "continued line {} is more than {} characters",
                    logical_start, MAX_CONT_LINE_LEN
                ),
            ));
        }

        // Continuation: backslash as the last non-whitespace character
        let trimmed = line.trim_end();
        if let Some(stripped) = trimmed.strip_suffix('\\') {
            logical.push_str(stripped);
            logical.push(' ');
            continue;
        }

        logical.push_str(line);
        let mut scan_types = Vec::new();
        let kind = parse_config_line(
            file,
            logical_start.max(1),
            &logical,
            &mut default_conf,
            &mut parsed.entries,
            &mut scan_types,
        )?;
        logical.clear();

        if matches!(kind, LineKind::Scan) {
            let base = parsed.entries.pop().expect("scan entry was just pushed");
            parsed.scan = Some(ScanRequest {
                base,
                types: scan_types,
            });
            return Ok(parsed);
        }
    }

    // Trailing continuation line without a newline still parses
    if !logical.trim().is_empty() {
        let mut scan_types = Vec::new();
        let kind = parse_config_line(
            file,
            logical_start.max(1),
            &logical,
            &mut default_conf,
            &mut parsed.entries,
            &mut scan_types,
        )?;
        if matches!(kind, LineKind::Scan) {
            let base = parsed.entries.pop().expect("scan entry was just pushed");
            parsed.scan = Some(ScanRequest {
                base,
                types: scan_types,
            });
        }
    }

    Ok(parsed)
}

/// Read and parse a configuration file from disk.
pub fn parse_config_file(path: &std::path::Path) -> Result<ParsedConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DwError::ConfigMissing {
                path: path.to_path_buf(),
            }
        } else {
            DwError::ConfigUnreadable {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;
    parse_config_str(&content, &path.display().to_string())
}

/// Synthesize the configuration used when no config file exists at all:
/// `DEVICESCAN -a`.
pub fn implicit_scan_config() -> ParsedConfig {
    let mut base = DeviceConfig {
        name: SCAN_DIRECTIVE.to_string(),
        dev_name: SCAN_DIRECTIVE.to_string(),
        ..DeviceConfig::default()
    };
    base.enable_default_monitors();
    ParsedConfig {
        entries: Vec::new(),
        scan: Some(ScanRequest {
            base,
            types: Vec::new(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> ParsedConfig {
        parse_config_str(s, "test.conf").expect("config should parse")
    }

    fn parse_err(s: &str) -> DwError {
        parse_config_str(s, "test.conf").expect_err("config should fail")
    }

    #[test]
    fn test_comment_and_blank_lines() {
        let p = parse("# nothing here\n\n   \n");
        assert!(p.entries.is_empty());
        assert!(p.scan.is_none());
    }

    #[test]
    fn test_single_device_explicit_monitors() {
        let p = parse("/dev/sda -H -l error -l selftest -f\n");
        assert_eq!(p.entries.len(), 1);
        let c = &p.entries[0];
        assert_eq!(c.name, "/dev/sda");
        assert!(c.smart_check);
        assert_eq!(c.nvme_warning_mask, 0xff);
        assert!(c.track_error_log);
        assert!(c.track_selftest_log);
        assert!(c.track_usage_failed);
        assert!(!c.track_prefail);
    }

    #[test]
    fn test_implied_a_when_no_monitors() {
        let p = parse("/dev/sda -m root@localhost\n");
        let c = &p.entries[0];
        assert!(c.smart_check && c.track_prefail && c.track_usage && c.track_usage_failed);
        assert!(c.track_selftest_log && c.track_error_log && c.track_selftest_status);
        assert!(!c.track_xerror_log && !c.track_offline_status);
    }

    #[test]
    fn test_devicescan_with_directives() {
        let p = parse("DEVICESCAN -a -m admin@example.org\n/dev/sdz -H\n");
        let scan = p.scan.expect("scan request");
        assert!(scan.base.smart_check);
        assert_eq!(scan.base.email_address, "admin@example.org");
        // everything after DEVICESCAN is unread
        assert!(p.entries.is_empty());
    }

    #[test]
    fn test_default_carry_forward_and_reset() {
        let p = parse(
            "DEFAULT -m ops@example.org -M daily\n\
             /dev/sda -a\n\
             DEFAULT\n\
             /dev/sdb -a\n",
        );
        assert_eq!(p.entries.len(), 2);
        assert_eq!(p.entries[0].email_address, "ops@example.org");
        assert_eq!(p.entries[0].email_freq, EmailFreq::Daily);
        assert!(p.entries[1].email_address.is_empty());
        assert_eq!(p.entries[1].email_freq, EmailFreq::Unknown);
    }

    #[test]
    fn test_line_continuation() {
        let p = parse("/dev/sda -a \\\n  -W 4,45,55 \\\n  -m x@y\n");
        let c = &p.entries[0];
        assert_eq!((c.temp_diff, c.temp_info, c.temp_crit), (4, 45, 55));
        assert_eq!(c.email_address, "x@y");
    }

    #[test]
    fn test_physical_line_too_long() {
        let long = format!("/dev/sda {}\n", "-H ".repeat(120));
        assert!(matches!(
            parse_err(&long),
            DwError::ConfigSyntax { lineno: 1, .. }
        ));
    }

    #[test]
    fn test_unknown_directive_reports_line() {
        let e = parse_err("/dev/sda -a\n/dev/sdb -Z\n");
        match e {
            DwError::ConfigSyntax { lineno, reason, .. } => {
                assert_eq!(lineno, 2);
                assert!(reason.contains("unknown Directive"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_pending_sector_directives() {
        let p = parse("/dev/sda -a -C 197+ -U 0\n");
        let c = &p.entries[0];
        assert_eq!(c.curr_pending_id, 197);
        assert!(c.curr_pending_incr && c.curr_pending_set);
        assert_eq!(c.offl_pending_id, 0);
        assert!(c.offl_pending_set);
    }

    #[test]
    fn test_attribute_flag_directives() {
        let p = parse("/dev/sda -a -r 5 -R 197! -i 9 -I 194\n");
        let f = &p.entries[0].attr_flags;
        assert!(f.is_set(5, attr_flag::RAW_PRINT));
        assert!(!f.is_set(5, attr_flag::AS_CRIT));
        assert!(f.is_set(197, attr_flag::RAW_TRACK));
        assert!(f.is_set(197, attr_flag::RAW_AS_CRIT));
        assert!(f.is_set(9, attr_flag::IGNORE_FAILED_USAGE));
        assert!(f.is_set(194, attr_flag::IGNORE));
    }

    #[test]
    fn test_nvme_warning_mask() {
        let p = parse("/dev/nvme0 -H 0x11\n");
        assert_eq!(p.entries[0].nvme_warning_mask, 0x11);
        // -H followed by another directive keeps the default mask
        let p = parse("/dev/nvme0 -H -l error\n");
        assert_eq!(p.entries[0].nvme_warning_mask, 0xff);
        assert!(p.entries[0].track_error_log);
    }

    #[test]
    fn test_power_mode_gate() {
        let p = parse("/dev/sda -a -n standby,10,q\n");
        let c = &p.entries[0];
        assert_eq!(c.power_gate, Some(PowerGate::Standby));
        assert_eq!(c.power_skip_max, 10);
        assert!(c.power_quiet);

        let p = parse("/dev/sda -a -n never\n");
        assert_eq!(p.entries[0].power_gate, None);

        assert!(matches!(
            parse_err("/dev/sda -a -n standby,0\n"),
            DwError::ConfigSyntax { .. }
        ));
    }

    #[test]
    fn test_scterc_and_settings() {
        let p = parse("/dev/sda -a -l scterc,70,70 -e aam,128 -e wcache,on -e standby,off\n");
        let c = &p.entries[0];
        assert_eq!(c.sct_erc, Some((70, 70)));
        assert_eq!(c.set_aam, 129);
        assert_eq!(c.set_wcache, 1);
        assert_eq!(c.set_standby, 1);
    }

    #[test]
    fn test_check_interval_override() {
        let p = parse("/dev/sda -a -c i=300\n");
        assert_eq!(p.entries[0].check_interval, 300);
        assert!(matches!(
            parse_err("/dev/sda -a -c i=5\n"),
            DwError::ConfigSyntax { .. }
        ));
    }

    #[test]
    fn test_mail_directive_sanity() {
        assert!(matches!(
            parse_err("/dev/sda -a -M daily\n"),
            DwError::ConfigSyntax { .. }
        ));
        assert!(matches!(
            parse_err("/dev/sda -a -m <nomailer>\n"),
            DwError::ConfigSyntax { .. }
        ));
        let p = parse("/dev/sda -a -m <nomailer> -M exec /usr/local/bin/notify\n");
        assert!(p.entries[0].email_address.is_empty());
        assert_eq!(p.entries[0].email_exec, "/usr/local/bin/notify");
    }

    #[test]
    fn test_test_regex_directive() {
        let p = parse("/dev/sda -a -s L/../../[1-5]/02\n");
        let re = p.entries[0].test_regex.as_ref().expect("regex");
        assert!(re.matches_full("L/03/14/5/02"));
        assert!(!re.matches_full("L/03/14/6/02"));
    }

    #[test]
    fn test_multiple_d_types_rejected_for_devices() {
        assert!(matches!(
            parse_err("/dev/sda -d sat -d scsi -a\n"),
            DwError::ConfigSyntax { .. }
        ));
        // but allowed on DEVICESCAN
        let p = parse("DEVICESCAN -d sat -d nvme -a\n");
        assert_eq!(p.scan.unwrap().types, vec!["sat", "nvme"]);
    }

    #[test]
    fn test_implicit_scan_config() {
        let p = implicit_scan_config();
        let scan = p.scan.unwrap();
        assert!(scan.base.smart_check && scan.base.track_selftest_log);
        assert!(scan.types.is_empty());
    }
}
