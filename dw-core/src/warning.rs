//! Typed, rate-limited warning dispatch.
//!
//! Every CRIT-level event is logged and, when the device has a notifier
//! configured, handed to an external executable with the event context in
//! environment variables. Per-kind send history lives in the device's
//! persistent state so frequency policies survive restarts.

use std::io::Read;
use std::process::{Command, Stdio};

use chrono::{Local, TimeZone};
use tracing::{error, info};

use crate::config::{DeviceConfig, EmailFreq};
use crate::state::{DeviceState, MailInfo, NUM_MAIL_TYPES};

/// First log chunk of the notifier's output, bytes.
const OUTPUT_LOG_LIMIT: usize = 1024;
/// Total notifier output drained before the pipe is broken, bytes.
const OUTPUT_DRAIN_LIMIT: usize = 1024 * 1024;

/// Warning kinds, in the order of their persistent `mail.<i>` slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarnKind {
    EmailTest = 0,
    Health = 1,
    Usage = 2,
    SelfTest = 3,
    ErrorCount = 4,
    FailedHealthCheck = 5,
    FailedReadSmartData = 6,
    FailedReadSmartErrorLog = 7,
    FailedReadSmartSelfTestLog = 8,
    FailedOpenDevice = 9,
    CurrentPendingSector = 10,
    OfflineUncorrectableSector = 11,
    Temperature = 12,
}

const _: () = assert!(WarnKind::Temperature as usize + 1 == NUM_MAIL_TYPES);

impl WarnKind {
    pub fn index(self) -> usize {
        self as usize
    }

    /// Value of `SMARTD_FAILTYPE` in the notifier environment.
    pub fn fail_type(self) -> &'static str {
        match self {
            Self::EmailTest => "EmailTest",
            Self::Health => "Health",
            Self::Usage => "Usage",
            Self::SelfTest => "SelfTest",
            Self::ErrorCount => "ErrorCount",
            Self::FailedHealthCheck => "FailedHealthCheck",
            Self::FailedReadSmartData => "FailedReadSmartData",
            Self::FailedReadSmartErrorLog => "FailedReadSmartErrorLog",
            Self::FailedReadSmartSelfTestLog => "FailedReadSmartSelfTestLog",
            Self::FailedOpenDevice => "FailedOpenDevice",
            Self::CurrentPendingSector => "CurrentPendingSector",
            Self::OfflineUncorrectableSector => "OfflineUncorrectableSector",
            Self::Temperature => "Temperature",
        }
    }
}

/// Identity the notifier child runs under (`-u user[:group]`).
#[derive(Debug, Clone)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
    pub uname: String,
    pub gname: String,
}

/// Process-wide notifier configuration.
#[derive(Debug, Clone, Default)]
pub struct Warner {
    /// Warning script path (`-w`), empty disables dispatch
    pub script: String,
    pub run_as: Option<RunAs>,
}

/// Decision of the frequency policy: dispatch now, with `next_days` the
/// reminder interval exported to the script (negative = never again).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendPlan {
    pub next_days: i32,
}

/// Apply the frequency policy for one warning kind. Pure so the §8
/// properties are directly testable.
pub fn should_send(
    freq: EmailFreq,
    kind: WarnKind,
    mail: &MailInfo,
    now: i64,
) -> Option<SendPlan> {
    let (days, next_days): (i32, i32) = if kind == WarnKind::EmailTest {
        (-1, -1)
    } else {
        match freq {
            EmailFreq::Once => (-1, -1),
            EmailFreq::Always => (0, 0),
            EmailFreq::Daily => (1, 1),
            EmailFreq::Diminishing => {
                // send count 0, 1, 2, 3, 4, >=5  =>  wait 1, 2, 4, 8, 16, 32 days
                let next = 1i32 << mail.logged.min(5);
                let days = if mail.logged <= 5 { next >> 1 } else { next };
                (days, next)
            }
            EmailFreq::Unknown => {
                error!("Internal error in warning dispatch: email frequency unset");
                return None;
            }
        }
    };

    if mail.logged > 0 {
        if days < 0 {
            return None; // 'once' or test mail bookkeeping
        }
        if days > 0 && now < mail.last_sent + i64::from(days) * 24 * 3600 {
            return None; // reminder not due yet
        }
    }
    Some(SendPlan { next_days })
}

/// Dispatch a warning of the given kind, subject to the device's frequency
/// policy, and update its send history.
pub fn mail_warning(
    warner: &Warner,
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    kind: WarnKind,
    message: &str,
) {
    if !cfg.wants_warnings() {
        return;
    }

    let now = Local::now().timestamp();
    let mail = &mut state.saved.mail[kind.index()];
    let Some(plan) = should_send(cfg.email_freq, kind, mail, now) else {
        return;
    };

    if mail.logged == 0 {
        mail.first_sent = now;
    }
    mail.last_sent = now;

    let prev_count = mail.logged;
    let first_sent = mail.first_sent;

    run_notifier(warner, cfg, kind, message, prev_count, first_sent, plan);

    state.saved.mail[kind.index()].logged += 1;
}

/// Log a condition-cleared event and reset the kind's send history so a
/// future occurrence restarts the frequency policy.
pub fn reset_warning(cfg: &DeviceConfig, state: &mut DeviceState, kind: WarnKind, message: &str) {
    let mail = &mut state.saved.mail[kind.index()];
    if mail.logged == 0 {
        return;
    }
    info!(
        "Device: {}, {}, warning condition reset after {} email{}",
        cfg.name,
        message,
        mail.logged,
        if mail.logged == 1 { "" } else { "s" }
    );
    *mail = MailInfo::default();
    state.must_write = true;
}

fn human_time(epoch: i64) -> String {
    Local
        .timestamp_opt(epoch, 0)
        .single()
        .map(|d| d.format("%a %b %e %H:%M:%S %Y %Z").to_string())
        .unwrap_or_default()
}

fn run_notifier(
    warner: &Warner,
    cfg: &DeviceConfig,
    kind: WarnKind,
    message: &str,
    prev_count: u32,
    first_sent: i64,
    plan: SendPlan,
) {
    // Separate recipients with spaces for the script
    let address = cfg.email_address.replace(',', " ");

    let executable = if cfg.email_exec.is_empty() {
        "<mail>"
    } else {
        cfg.email_exec.as_str()
    };
    let shown_address = if address.is_empty() {
        "<nomailer>"
    } else {
        address.as_str()
    };
    let action = if kind == WarnKind::EmailTest {
        "Test of"
    } else {
        "Warning via"
    };

    let next_days = if plan.next_days >= 0 {
        plan.next_days.to_string()
    } else {
        String::new()
    };

    let env: Vec<(&str, String)> = vec![
        ("SMARTD_MAILER", cfg.email_exec.clone()),
        ("SMARTD_MESSAGE", message.to_string()),
        ("SMARTD_PREVCNT", prev_count.to_string()),
        ("SMARTD_TFIRST", human_time(first_sent)),
        ("SMARTD_TFIRSTEPOCH", first_sent.to_string()),
        ("SMARTD_FAILTYPE", kind.fail_type().to_string()),
        ("SMARTD_ADDRESS", address.clone()),
        ("SMARTD_DEVICESTRING", cfg.name.clone()),
        (
            "SMARTD_DEVICETYPE",
            if cfg.dev_type.is_empty() {
                "auto".to_string()
            } else {
                cfg.dev_type.clone()
            },
        ),
        ("SMARTD_DEVICE", cfg.dev_name.clone()),
        ("SMARTD_DEVICEINFO", cfg.id_info.clone()),
        ("SMARTD_NEXTDAYS", next_days),
        // Avoid false positive recursion detection in warning scripts
        ("SMARTD_SUBJECT", String::new()),
    ];

    let run_as_note = warner
        .run_as
        .as_ref()
        .map(|r| format!(" (uid={}({}) gid={}({}))", r.uid, r.uname, r.gid, r.gname))
        .unwrap_or_default();
    info!(
        "{} {} to {}{} ...",
        if kind == WarnKind::EmailTest {
            "Executing test of"
        } else {
            "Sending warning via"
        },
        executable,
        shown_address,
        run_as_note
    );

    if warner.script.is_empty() {
        error!(
            "{} {} to {}: no warning script configured (-w)",
            action, executable, shown_address
        );
        return;
    }

    let mut command = Command::new("/bin/sh");
    command
        .arg("-c")
        .arg(format!("{} 2>&1", warner.script))
        .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group so daemon shutdown signals don't hit the child
        command.process_group(0);
        if let Some(run_as) = &warner.run_as {
            command.uid(run_as.uid).gid(run_as.gid);
        }
    }

    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(
                "{} {} to {}: failed (fork or pipe failed, or no memory) {}",
                action, executable, shown_address, e
            );
            return;
        }
    };

    // Unexpected output on stdout/stderr: log the first chunk, then drain
    // a bounded amount and break the pipe.
    if let Some(mut stdout) = child.stdout.take() {
        let mut buf = vec![0u8; OUTPUT_LOG_LIMIT];
        let mut got = 0usize;
        while got < buf.len() {
            match stdout.read(&mut buf[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(_) => break,
            }
        }
        if got > 0 {
            error!(
                "{} {} to {} produced unexpected output ({} bytes) to STDOUT/STDERR: \n{}",
                action,
                executable,
                shown_address,
                got,
                String::from_utf8_lossy(&buf[..got])
            );

            let mut drained = got;
            let mut sink = [0u8; 4096];
            let broke_pipe = loop {
                match stdout.read(&mut sink) {
                    Ok(0) => break false,
                    Ok(n) => {
                        drained += n;
                        if drained > OUTPUT_DRAIN_LIMIT {
                            break true;
                        }
                    }
                    Err(_) => break false,
                }
            };
            if broke_pipe {
                error!(
                    "{} {} to {}: more than 1 MB STDOUT/STDERR flushed, breaking pipe",
                    action, executable, shown_address
                );
                let _ = child.kill();
            } else if drained > got {
                error!(
                    "{} {} to {}: flushed remaining STDOUT/STDERR",
                    action, executable, shown_address
                );
            }
        }
    }

    match child.wait() {
        Err(e) => error!(
            "{} {} to {}: wait failed {}",
            action, executable, shown_address, e
        ),
        Ok(status) => {
            if let Some(code) = status.code() {
                if code == 0 {
                    info!("{} {} to {}: successful", action, executable, shown_address);
                } else if code > 128 {
                    error!(
                        "{} {} to {}: failed (32-bit/8-bit exit status: {}/{}) perhaps caught signal {}",
                        action,
                        executable,
                        shown_address,
                        code << 8,
                        code,
                        code - 128
                    );
                } else {
                    error!(
                        "{} {} to {}: failed (32-bit/8-bit exit status: {}/{})",
                        action,
                        executable,
                        shown_address,
                        code << 8,
                        code
                    );
                    if warner.run_as.is_some() {
                        info!(
                            "If mail notification does not work with '-u {}', \
                             check the warning script's permissions",
                            warner
                                .run_as
                                .as_ref()
                                .map(|r| r.uname.as_str())
                                .unwrap_or("")
                        );
                    }
                }
            } else {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    if let Some(sig) = status.signal() {
                        info!(
                            "{} {} to {}: exited because of uncaught signal {}",
                            action, executable, shown_address, sig
                        );
                    }
                }
            }
        }
    }
}
