//! drivewatchd - storage health monitoring daemon
//!
//! Periodically interrogates locally attached block devices (ATA/SATA,
//! SCSI/SAS, NVMe), detects health regressions, drives scheduled vendor
//! self-tests, keeps per-device state across restarts, and dispatches
//! warnings to the system log and an external notifier script.

mod backend;
mod control;
mod notify;
mod signals;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, info};

use dw_core::warning::{RunAs, Warner};
use dw_error::exit;

use control::{ConfigSource, Daemon, Options, QuitPolicy};

const DEFAULT_CONFIG_FILE: &str = "/etc/drivewatchd.conf";
const DEFAULT_WARNING_SCRIPT: &str = "/usr/share/drivewatch/warning.sh";

#[derive(Parser, Debug)]
#[command(
    name = "drivewatchd",
    version,
    about = "Storage health monitoring daemon"
)]
struct Cli {
    /// Read configuration file NAME, or stdin when NAME is '-'
    #[arg(short = 'c', long = "configfile", value_name = "NAME")]
    configfile: Option<String>,

    /// Set interval between disk checks to N seconds, N >= 10
    #[arg(short = 'i', long = "interval", value_name = "N")]
    interval: Option<u32>,

    /// When to exit: nodev, nodev0, nodevstartup, nodev0startup,
    /// errors[,nodev0], never, onecheck, showtests
    #[arg(short = 'q', long = "quit", value_name = "WHEN")]
    quit: Option<String>,

    /// Start in debug mode (no daemon, log to stdout)
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Print the configuration file Directives and exit
    #[arg(short = 'D', long = "showdirectives")]
    show_directives: bool,

    /// Do not fork into background
    #[arg(short = 'n', long = "no-fork")]
    no_fork: bool,

    /// Write PID file NAME
    #[arg(short = 'p', long = "pidfile", value_name = "NAME")]
    pidfile: Option<PathBuf>,

    /// Use syslog facility daemon or local0 - local7
    #[arg(
        short = 'l',
        long = "logfacility",
        value_name = "FACILITY",
        default_value = "daemon"
    )]
    logfacility: String,

    /// Report device I/O transactions: ioctl, ataioctl, scsiioctl,
    /// nvmeioctl, each with an optional ,1 to ,4 level
    #[arg(short = 'r', long = "report", value_name = "TYPE")]
    report: Vec<String>,

    /// Save disk states to {PREFIX}MODEL-SERIAL.TYPE.state; '-' disables
    #[arg(short = 's', long = "savestates", value_name = "PREFIX")]
    savestates: Option<String>,

    /// Log attribute information to {PREFIX}MODEL-SERIAL.TYPE.csv; '-' disables
    #[arg(short = 'A', long = "attributelog", value_name = "PREFIX")]
    attributelog: Option<String>,

    /// Read and replace (prefix with '+' to add) the drive database from FILE
    #[arg(short = 'B', long = "drivedb", value_name = "[+]FILE")]
    drivedb: Option<String>,

    /// Run executable NAME on warnings
    #[arg(short = 'w', long = "warnexec", value_name = "NAME")]
    warnexec: Option<String>,

    /// Run the warning script as USER[:GROUP]; '-' keeps the daemon identity
    #[arg(short = 'u', long = "warn-as-user", value_name = "USER[:GROUP]")]
    warn_as_user: Option<String>,
}

fn init_logging(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_env("DRIVEWATCH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    // Debug mode logs to stdout; otherwise prefer the journal when the
    // system runs one
    if !debug && Path::new("/run/systemd/journal/socket").exists() {
        match tracing_journald::layer() {
            Ok(layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(layer.with_syslog_identifier("drivewatchd".to_string()))
                    .with(filter)
                    .init();
                return;
            }
            Err(e) => {
                eprintln!(
                    "Failed to create journald layer: {}, falling back to stdout",
                    e
                );
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();
}

fn print_directives() {
    println!("Configuration file Directives (after device name):");
    println!("  -d TYPE Set the device type: auto, ignore, removable, or a port type");
    println!("  -T TYPE Set the tolerance to one of: normal, permissive");
    println!("  -o VAL  Enable/disable automatic offline tests (on/off)");
    println!("  -S VAL  Enable/disable attribute autosave (on/off)");
    println!("  -n MODE No check if: never, sleep[,N][,q], standby[,N][,q], idle[,N][,q]");
    println!("  -H      Monitor SMART Health Status, report if failed");
    println!("  -H MASK Monitor specific NVMe Critical Warning bits");
    println!("  -s REG  Do Self-Test at time(s) given by regular expression REG");
    println!("  -l TYPE Monitor SMART log or self-test status:");
    println!("          error, selftest, xerror, offlinests[,ns], selfteststs[,ns]");
    println!("  -l scterc,R,W  Set SCT Error Recovery Control");
    println!("  -e      Change device setting: aam,[N|off], apm,[N|off], dsn,[on|off],");
    println!("          lookahead,[on|off], security-freeze, standby,[N|off], wcache,[on|off]");
    println!("  -f      Monitor 'Usage' Attributes, report failures");
    println!("  -m ADD  Send email warning to address ADD");
    println!("  -M TYPE Modify email warning behavior (once, always, daily, diminishing,");
    println!("          test, exec PATH)");
    println!("  -p      Report changes in 'Prefailure' Attributes");
    println!("  -u      Report changes in 'Usage' Attributes");
    println!("  -t      Equivalent to -p and -u Directives");
    println!("  -r ID   Also report Raw values of Attribute ID with -p, -u or -t");
    println!("  -R ID   Track changes in Attribute ID Raw value with -p, -u or -t");
    println!("  -i ID   Ignore Attribute ID for -f Directive");
    println!("  -I ID   Ignore Attribute ID for -p, -u or -t Directive");
    println!("  -C ID[+] Monitor [increases of] Current Pending Sectors in Attribute ID");
    println!("  -U ID[+] Monitor [increases of] Offline Uncorrectable Sectors in Attribute ID");
    println!("  -W D,I,C Monitor Temperature D)ifference, I)nformal limit, C)ritical limit");
    println!("  -v N,ST Modifies labeling of Attribute N");
    println!("  -P TYPE Drive-specific presets: use, ignore, show, showall");
    println!("  -a      Default: -H -f -t -l error -l selftest -l selfteststs -C 197 -U 198");
    println!("  -F TYPE Use firmware bug workaround:");
    println!("          none, samsung, samsung2, samsung3, xerrorlba, nologdir");
    println!("  -c i=N  Set interval between disk checks to N seconds");
    println!("   #      Comment: text after a hash sign is ignored");
    println!("   \\      Line continuation character");
    println!("Attribute ID is a decimal integer 1 <= ID <= 255");
    println!("Use ID = 0 to turn off -C and/or -U Directives");
    println!("Example: /dev/sda -a");
}

fn parse_quit(arg: &str) -> Option<(QuitPolicy, bool, bool)> {
    // (policy, nodev0, implies debug)
    Some(match arg {
        "nodev" => (QuitPolicy::NoDev, false, false),
        "nodev0" => (QuitPolicy::NoDev, true, false),
        "nodevstartup" => (QuitPolicy::NoDevStartup, false, false),
        "nodev0startup" => (QuitPolicy::NoDevStartup, true, false),
        "errors" => (QuitPolicy::Errors, false, false),
        "errors,nodev0" => (QuitPolicy::Errors, true, false),
        "never" => (QuitPolicy::Never, false, false),
        "onecheck" => (QuitPolicy::OneCheck, false, true),
        "showtests" => (QuitPolicy::ShowTests, false, true),
        _ => return None,
    })
}

fn valid_facility(arg: &str) -> bool {
    matches!(
        arg,
        "daemon"
            | "local0"
            | "local1"
            | "local2"
            | "local3"
            | "local4"
            | "local5"
            | "local6"
            | "local7"
    )
}

fn valid_report(arg: &str) -> bool {
    let (name, level) = match arg.split_once(',') {
        Some((n, l)) => (n, Some(l)),
        None => (arg, None),
    };
    let name_ok = matches!(name, "ioctl" | "ataioctl" | "scsiioctl" | "nvmeioctl");
    let level_ok = match level {
        None => true,
        Some(l) => matches!(l.parse::<u8>(), Ok(1..=4)),
    };
    name_ok && level_ok
}

/// Resolve `USER[:GROUP]` to numeric ids, accepting names and numbers.
#[cfg(unix)]
fn parse_run_as(arg: &str) -> Result<RunAs, String> {
    use std::ffi::CString;

    fn lookup_user(name: &str) -> Option<(u32, u32)> {
        if let Ok(uid) = name.parse::<u32>() {
            return Some((uid, uid));
        }
        let cname = CString::new(name).ok()?;
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buf = [0i8; 4096];
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwnam_r(
                cname.as_ptr(),
                &mut pwd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut result,
            )
        };
        if rc != 0 || result.is_null() {
            return None;
        }
        Some((pwd.pw_uid, pwd.pw_gid))
    }

    fn lookup_group(name: &str) -> Option<u32> {
        if let Ok(gid) = name.parse::<u32>() {
            return Some(gid);
        }
        let cname = CString::new(name).ok()?;
        let mut grp: libc::group = unsafe { std::mem::zeroed() };
        let mut buf = [0i8; 4096];
        let mut result: *mut libc::group = std::ptr::null_mut();
        let rc = unsafe {
            libc::getgrnam_r(
                cname.as_ptr(),
                &mut grp,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut result,
            )
        };
        if rc != 0 || result.is_null() {
            return None;
        }
        Some(grp.gr_gid)
    }

    let (user, group) = match arg.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (arg, None),
    };

    let (uid, default_gid) =
        lookup_user(user).ok_or_else(|| format!("unknown user name '{}'", user))?;
    let gid = match group {
        None => default_gid,
        Some(g) => lookup_group(g).ok_or_else(|| format!("unknown group name '{}'", g))?,
    };

    Ok(RunAs {
        uid,
        gid,
        uname: user.to_string(),
        gname: group.map(str::to_string).unwrap_or_else(|| gid.to_string()),
    })
}

fn bad_cmdline(msg: &str) -> i32 {
    eprintln!("=======> {} <=======", msg);
    eprintln!();
    eprintln!("Use drivewatchd -h to get a usage summary");
    exit::BADCMD
}

/// Relative paths break once a service manager changes the working
/// directory; require absolute ones outside debug mode.
fn check_abs_path(option: char, path: &str) -> Option<i32> {
    if path.is_empty() || path.starts_with('/') {
        return None;
    }
    Some(bad_cmdline(&format!(
        "INVALID ARGUMENT TO -{}: {}: relative path names are not allowed",
        option, path
    )))
}

fn run(cli: Cli) -> i32 {
    if cli.show_directives {
        print_directives();
        return exit::OK;
    }

    let mut debug = cli.debug;

    let (quit, quit_nodev0) = match &cli.quit {
        None => (QuitPolicy::NoDev, false),
        Some(arg) => match parse_quit(arg) {
            Some((policy, nodev0, implies_debug)) => {
                debug |= implies_debug;
                (policy, nodev0)
            }
            None => return bad_cmdline(&format!("INVALID ARGUMENT TO -q: {}", arg)),
        },
    };

    let interval = match cli.interval {
        None => dw_core::DEFAULT_CHECKTIME,
        Some(n) if n >= 10 => n,
        Some(n) => {
            return bad_cmdline(&format!(
                "INVALID INTERVAL: {}: must be an integer >= 10",
                n
            ))
        }
    };

    if !valid_facility(&cli.logfacility) {
        return bad_cmdline(&format!("INVALID ARGUMENT TO -l: {}", cli.logfacility));
    }
    for report in &cli.report {
        if !valid_report(report) {
            return bad_cmdline(&format!("INVALID ARGUMENT TO -r: {}", report));
        }
    }

    if debug && cli.pidfile.is_some() {
        return bad_cmdline("INVALID CHOICE OF OPTIONS: -d and -p");
    }

    let none_if_dash = |v: &Option<String>| -> Option<String> {
        v.as_deref().filter(|s| *s != "-").map(str::to_string)
    };
    let state_prefix = none_if_dash(&cli.savestates);
    let attrlog_prefix = none_if_dash(&cli.attributelog);

    if !debug {
        for (opt, value) in [
            ('p', cli.pidfile.as_ref().map(|p| p.display().to_string())),
            ('s', state_prefix.clone()),
            ('A', attrlog_prefix.clone()),
        ] {
            if let Some(v) = value {
                if let Some(code) = check_abs_path(opt, &v) {
                    return code;
                }
            }
        }
    }

    let run_as = match cli.warn_as_user.as_deref().filter(|s| *s != "-") {
        None => None,
        Some(arg) => match parse_run_as(arg) {
            Ok(r) => Some(r),
            Err(e) => return bad_cmdline(&format!("INVALID ARGUMENT TO -u: {}: {}", arg, e)),
        },
    };

    init_logging(debug);
    info!("drivewatchd {}", env!("CARGO_PKG_VERSION"));

    // 'Type=notify' supervision requires foreground operation
    if std::env::var_os("NOTIFY_SOCKET").is_some() && !cli.no_fork && !debug {
        error!("Option -n (--no-fork) is required if 'Type=notify' is set.");
        return exit::BADCMD;
    }

    if let Some(db) = &cli.drivedb {
        let path = db.strip_prefix('+').unwrap_or(db);
        if !Path::new(path).is_file() {
            error!("drive database file {} not found", path);
            return exit::BADCMD;
        }
        info!(
            "drive database {} {}; presets are applied by the device backend",
            if db.starts_with('+') { "augmented from" } else { "replaced by" },
            path
        );
    }
    for report in &cli.report {
        info!(
            "device I/O report level '{}' is handled by the device backend",
            report
        );
    }

    let (config, config_is_default) = match cli.configfile.as_deref() {
        None => (
            ConfigSource::File(PathBuf::from(DEFAULT_CONFIG_FILE)),
            true,
        ),
        Some("-") => (ConfigSource::Stdin, false),
        Some(path) => (ConfigSource::File(PathBuf::from(path)), false),
    };

    let warner = Warner {
        script: cli
            .warnexec
            .clone()
            .unwrap_or_else(|| DEFAULT_WARNING_SCRIPT.to_string()),
        run_as,
    };

    let opts = Options {
        config,
        config_is_default,
        interval,
        quit,
        quit_nodev0,
        debug,
        pid_file: cli.pidfile.clone(),
        state_prefix,
        attrlog_prefix,
        warner,
    };

    let flags = Arc::new(signals::SignalFlags::default());
    if let Err(e) = signals::install(&flags, debug) {
        error!("unable to install signal handlers: {}", e);
        return exit::STARTUP;
    }

    let backend = backend::OsBackend;
    Daemon::new(opts, &backend, flags).run()
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(c) => c,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit::OK,
                _ => exit::BADCMD,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    // Impossible states must not take the whole process down silently
    let status = match std::panic::catch_unwind(move || run(cli)) {
        Ok(status) => status,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            eprintln!("drivewatchd: internal error: {}", msg);
            exit::BADCODE
        }
    };
    std::process::exit(status);
}
