//! Service-manager readiness and liveness notification.
//!
//! Speaks the NOTIFY_SOCKET datagram protocol so a supervisor with
//! `Type=notify` can tolerate lengthy first-pass probes and learns when
//! the first complete check pass is done. In debug mode the messages are
//! logged instead of sent.

use chrono::{Local, TimeZone};
use tracing::info;

#[cfg(unix)]
use std::os::unix::net::UnixDatagram;

use dw_error::exit;

pub struct Notify {
    enabled: bool,
    ready: bool,
    debug: bool,
    #[cfg(unix)]
    socket: Option<(UnixDatagram, String)>,
}

impl Notify {
    /// Probe `$NOTIFY_SOCKET`. The socket stays unconnected; datagrams
    /// carry the target address on each send.
    pub fn from_env(debug: bool) -> Self {
        let path = std::env::var("NOTIFY_SOCKET").ok();
        let enabled = path.is_some();
        #[cfg(unix)]
        let socket = path.filter(|p| !p.starts_with('@')).and_then(|p| {
            let sock = UnixDatagram::unbound().ok()?;
            Some((sock, p))
        });
        Self {
            enabled,
            ready: false,
            debug,
            #[cfg(unix)]
            socket,
        }
    }

    fn send(&self, payload: &str) {
        if self.debug {
            info!("sd_notify(0, \"{}\")", payload.replace('\n', "\\n"));
            return;
        }
        #[cfg(unix)]
        if let Some((sock, path)) = &self.socket {
            let _ = sock.send_to(payload.as_bytes(), path);
        }
    }

    /// Keep the unit startup timeout from firing while devices are probed;
    /// a typical drive spinup takes 20 seconds tops.
    pub fn extend_timeout(&self) {
        if !self.enabled || self.ready {
            return;
        }
        self.send("EXTEND_TIMEOUT_USEC=20000000");
    }

    pub fn msg(&mut self, msg: &str) {
        if !self.enabled {
            return;
        }
        self.send(&format!("STATUS={}", msg));
    }

    pub fn check(&mut self, numdev: usize) {
        if !self.enabled {
            return;
        }
        self.send(&format!(
            "STATUS=Checking {} device{} ...",
            numdev,
            if numdev == 1 { "" } else { "s" }
        ));
    }

    /// Status before the tick sleep; the first call also reports READY=1.
    pub fn wait(&mut self, wakeuptime: i64, numdev: usize) {
        if !self.enabled {
            return;
        }
        let ts = Local
            .timestamp_opt(wakeuptime, 0)
            .single()
            .map(|d| d.format("%H:%M:%S").to_string())
            .unwrap_or_default();
        let status = format!(
            "Next check of {} device{} will start at {}",
            numdev,
            if numdev == 1 { "" } else { "s" },
            ts
        );
        if !self.ready {
            self.send(&format!("READY=1\nSTATUS={}", status));
            self.ready = true;
        } else {
            self.send(&format!("STATUS={}", status));
        }
    }

    pub fn exit(&mut self, status: i32) {
        if !self.enabled {
            return;
        }
        let msg = match status {
            exit::OK => "Exiting ...",
            exit::BADCMD => "Error in command line (see SYSLOG)",
            exit::BADCONF | exit::NOCONF | exit::READCONF => "Error in config file (see SYSLOG)",
            exit::BADDEV => "Unable to register a device (see SYSLOG)",
            exit::NODEV => "No devices to monitor",
            _ => "Error (see SYSLOG)",
        };
        // READY=1 must be out before a clean exit(0), else the supervisor
        // reports a protocol failure
        if status == exit::OK && !self.ready {
            self.send(&format!("READY=1\nSTATUS={}", msg));
            self.ready = true;
        } else {
            self.send(&format!("STATUS={}", msg));
        }
    }
}
