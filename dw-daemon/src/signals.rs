//! Signal plumbing.
//!
//! Handlers only store into atomics owned by the daemon; the control loop
//! polls them after each device, before sleeping, and once per second
//! while sleeping.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1};
use signal_hook::low_level::register;
use signal_hook::SigId;

/// Reload request values.
pub const RELOAD_HUP: u8 = 1;
/// SIGINT in debug mode also reloads, with a different log line.
pub const RELOAD_INT: u8 = 2;

#[derive(Debug, Default)]
pub struct SignalFlags {
    /// 0 = none, RELOAD_HUP or RELOAD_INT
    reload: AtomicU8,
    /// Check devices now
    check_now: AtomicBool,
    /// Signal number that requested exit, 0 = none
    exit: AtomicI32,
}

impl SignalFlags {
    pub fn take_reload(&self) -> u8 {
        self.reload.swap(0, Ordering::SeqCst)
    }

    pub fn reload_pending(&self) -> bool {
        self.reload.load(Ordering::SeqCst) != 0
    }

    pub fn take_check_now(&self) -> bool {
        self.check_now.swap(false, Ordering::SeqCst)
    }

    pub fn check_now_pending(&self) -> bool {
        self.check_now.load(Ordering::SeqCst)
    }

    pub fn exit_signal(&self) -> Option<i32> {
        match self.exit.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig),
        }
    }

    pub fn any_pending(&self) -> bool {
        self.reload_pending() || self.check_now_pending() || self.exit_signal().is_some()
    }
}

/// Install all handlers. In debug mode SIGINT requests a reload instead of
/// an exit, like the original interactive behavior.
pub fn install(flags: &Arc<SignalFlags>, debug: bool) -> io::Result<Vec<SigId>> {
    let mut ids = Vec::new();

    let f = Arc::clone(flags);
    ids.push(unsafe {
        register(SIGHUP, move || {
            f.reload.store(RELOAD_HUP, Ordering::SeqCst);
        })?
    });

    let f = Arc::clone(flags);
    ids.push(unsafe {
        register(SIGUSR1, move || {
            f.check_now.store(true, Ordering::SeqCst);
        })?
    });

    for sig in [SIGTERM, SIGQUIT] {
        let f = Arc::clone(flags);
        ids.push(unsafe {
            register(sig, move || {
                let _ = f.exit.compare_exchange(0, sig, Ordering::SeqCst, Ordering::SeqCst);
            })?
        });
    }

    let f = Arc::clone(flags);
    if debug {
        ids.push(unsafe {
            register(SIGINT, move || {
                f.reload.store(RELOAD_INT, Ordering::SeqCst);
            })?
        });
    } else {
        ids.push(unsafe {
            register(SIGINT, move || {
                let _ = f
                    .exit
                    .compare_exchange(0, SIGINT, Ordering::SeqCst, Ordering::SeqCst);
            })?
        });
    }

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_take_once() {
        let flags = SignalFlags::default();
        flags.reload.store(RELOAD_HUP, Ordering::SeqCst);
        assert!(flags.reload_pending());
        assert_eq!(flags.take_reload(), RELOAD_HUP);
        assert_eq!(flags.take_reload(), 0);

        flags.check_now.store(true, Ordering::SeqCst);
        assert!(flags.take_check_now());
        assert!(!flags.take_check_now());
    }

    #[test]
    fn test_first_exit_signal_wins() {
        let flags = SignalFlags::default();
        let _ = flags
            .exit
            .compare_exchange(0, SIGTERM, Ordering::SeqCst, Ordering::SeqCst);
        let _ = flags
            .exit
            .compare_exchange(0, SIGQUIT, Ordering::SeqCst, Ordering::SeqCst);
        assert_eq!(flags.exit_signal(), Some(SIGTERM));
    }
}
