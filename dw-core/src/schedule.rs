//! Scheduled self-test selection.
//!
//! A device's `-s` directive is an extended regular expression matched
//! against canonical strings `T/MM/DD/d/HH` (d = 1 Monday .. 7 Sunday),
//! optionally extended with a `:NNN[-LLL]` stagger suffix. Each check cycle
//! the scheduler walks hour by hour from the device's stored checkpoint up
//! to now, so tests missed during downtime still run exactly once.

use chrono::{Datelike, Local, TimeZone, Timelike};
use dw_error::{DwError, Result};
use regex::Regex;
use tracing::info;

use crate::config::DeviceConfig;
use crate::state::DeviceState;

/// Bounded replay window for missed tests: 90 days.
const MAX_REPLAY_SECS: i64 = 3600 * 24 * 90;

/// Self-test types, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestType {
    Long,
    SelectiveNext,
    SelectiveContinue,
    SelectiveRedo,
    Short,
    Conveyance,
    Offline,
}

/// Priority order used by the scheduler.
pub const TEST_PRIORITY: [TestType; 7] = [
    TestType::Long,
    TestType::SelectiveNext,
    TestType::SelectiveContinue,
    TestType::SelectiveRedo,
    TestType::Short,
    TestType::Conveyance,
    TestType::Offline,
];

impl TestType {
    pub fn as_char(&self) -> char {
        match self {
            Self::Long => 'L',
            Self::SelectiveNext => 'n',
            Self::SelectiveContinue => 'c',
            Self::SelectiveRedo => 'r',
            Self::Short => 'S',
            Self::Conveyance => 'C',
            Self::Offline => 'O',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'L' => Self::Long,
            'n' => Self::SelectiveNext,
            'c' => Self::SelectiveContinue,
            'r' => Self::SelectiveRedo,
            'S' => Self::Short,
            'C' => Self::Conveyance,
            'O' => Self::Offline,
            _ => return None,
        })
    }

    pub fn is_selective(&self) -> bool {
        matches!(
            self,
            Self::SelectiveNext | Self::SelectiveContinue | Self::SelectiveRedo
        )
    }
}

/// A compiled `-s` pattern with its stagger suffixes pre-parsed.
#[derive(Debug, Clone)]
pub struct TestRegex {
    pattern: String,
    regex: Regex,
    /// `(offset, limit)` pairs from `:NNN[-LLL]` suffixes, without the
    /// implicit `(0, 0)` entry
    offsets: Vec<(u32, u32)>,
}

impl TestRegex {
    pub fn compile(pattern: &str) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{})$", pattern))
            .map_err(|e| DwError::generic(e.to_string()))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            offsets: parse_offsets(pattern),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches_full(&self, s: &str) -> bool {
        self.regex.is_match(s)
    }

    pub fn offsets(&self) -> &[(u32, u32)] {
        &self.offsets
    }

    /// A substring that suggests shell-glob confusion or a malformed
    /// `:NNN[-LLL]` suffix, for a parse-time warning.
    pub fn odd_looking_part(&self) -> Option<&str> {
        static PATTERN: &str = concat!(
            r"[^\]$()*+./:?^\[|0-9LSCOncr-]+",
            r"|:[0-9]{0,2}($|[^0-9])",
            r"|:[0-9]{4,}",
            r"|:[0-9]{3}-(000|[0-9]{0,2}($|[^0-9])|[0-9]{4,})",
        );
        let checker = Regex::new(PATTERN).expect("static syntax-check pattern compiles");
        checker
            .find(&self.pattern)
            .map(|m| m.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Collect valid `:NNN[-LLL]` suffixes; malformed ones are skipped here and
/// flagged by `odd_looking_part`. At most one suffix per test type plus the
/// implicit zero entry is ever useful.
fn parse_offsets(pattern: &str) -> Vec<(u32, u32)> {
    let max = TEST_PRIORITY.len();
    let mut out = Vec::new();
    let bytes = pattern.as_bytes();
    let mut i = 0;
    while out.len() < max {
        match bytes[i..].iter().position(|&b| b == b':') {
            Some(rel) => i += rel + 1,
            None => break,
        }
        let digits = |s: &[u8]| -> Option<u32> {
            if s.len() == 3 && s.iter().all(u8::is_ascii_digit) {
                std::str::from_utf8(s).ok()?.parse().ok()
            } else {
                None
            }
        };
        let three = |at: usize| bytes.get(at..at + 3).and_then(digits);

        let Some(offset) = three(i).filter(|_| {
            // exactly three digits
            !bytes.get(i + 3).is_some_and(u8::is_ascii_digit)
        }) else {
            continue;
        };
        if bytes.get(i + 3) == Some(&b'-') {
            let Some(limit) = three(i + 4).filter(|l| {
                *l > 0 && !bytes.get(i + 7).is_some_and(u8::is_ascii_digit)
            }) else {
                continue;
            };
            out.push((offset, limit));
            i += 7;
        } else {
            out.push((offset, 0));
            i += 3;
        }
    }
    out
}

/// Format the canonical match string for one hour.
fn canonical_pattern(t: i64, test: TestType, offset: Option<(u32, u32)>) -> String {
    let dt = Local
        .timestamp_opt(t, 0)
        .single()
        .unwrap_or_else(|| Local.timestamp_opt(0, 0).unwrap());
    let weekday = dt.weekday().number_from_monday();
    let mut s = format!(
        "{}/{:02}/{:02}/{}/{:02}",
        test.as_char(),
        dt.month(),
        dt.day(),
        weekday,
        dt.hour()
    );
    if let Some((offset, limit)) = offset {
        s.push_str(&format!(":{:03}", offset));
        if limit > 0 {
            s.push_str(&format!("-{:03}", limit));
        }
    }
    s
}

/// Return the highest-priority test due at or before `now` since the
/// device's stored checkpoint, advancing the checkpoint to the top of the
/// next hour. `announce` controls the "old test ... starting now" log line
/// (suppressed when previewing schedules).
pub fn next_scheduled_test(
    cfg: &DeviceConfig,
    state: &mut DeviceState,
    now: i64,
    announce: bool,
) -> Option<TestType> {
    let regex = cfg.test_regex.as_ref()?;

    // Exit if the drive can run no test at all
    if state.not_cap_long
        && state.not_cap_short
        && state.not_cap_conveyance
        && state.not_cap_offline
        && state.not_cap_selective
    {
        return None;
    }

    let checkpoint = &mut state.saved.scheduled_test_next_check;
    if now < *checkpoint {
        if *checkpoint <= now + 3600 {
            return None; // next check within one hour
        }
        // More than one hour ahead: system clock was adjusted to the past
        *checkpoint = now;
    } else if *checkpoint + MAX_REPLAY_SECS < now {
        *checkpoint = now - MAX_REPLAY_SECS;
    }

    let mut found: Option<(TestType, i64)> = None;
    let mut maxtest: i32 = TEST_PRIORITY.len() as i32 - 1;

    let mut t = *checkpoint;
    loop {
        // Offset 0 first, then every ':NNN[-LLL]' pair from the pattern
        for (i, &(offset, limit)) in std::iter::once(&(0u32, 0u32))
            .chain(regex.offsets().iter())
            .enumerate()
        {
            let mut delay = u64::from(cfg.test_offset_factor) * u64::from(offset);
            if limit > 0 && u64::from(limit) < delay {
                delay %= u64::from(limit) + 1;
            }
            let slot = t - (delay as i64) * 3600;

            for j in 0..=maxtest {
                let test = TEST_PRIORITY[j as usize];
                let not_capable = match test {
                    TestType::Long => state.not_cap_long,
                    TestType::Short => state.not_cap_short,
                    TestType::Conveyance => state.not_cap_conveyance,
                    TestType::Offline => state.not_cap_offline,
                    _ => state.not_cap_selective,
                };
                if not_capable {
                    continue;
                }
                let suffix = (i > 0).then_some((offset, limit));
                if regex.matches_full(&canonical_pattern(slot, test, suffix)) {
                    found = Some((test, t));
                    // Limit further matches to higher priority tests
                    maxtest = j - 1;
                    break;
                }
            }
        }

        if maxtest < 0 || t >= now {
            break;
        }
        t += 3600;
        if t > now {
            t = now;
        }
    }

    // Do the next check not before the top of the next hour
    let dt_now = Local
        .timestamp_opt(now, 0)
        .single()
        .unwrap_or_else(|| Local.timestamp_opt(0, 0).unwrap());
    *checkpoint = now + 3600 - i64::from(dt_now.minute()) * 60 - i64::from(dt_now.second());

    let (test, testtime) = found?;
    state.must_write = true;
    if announce && testtime / 3600 < now / 3600 {
        let when = Local
            .timestamp_opt(testtime, 0)
            .single()
            .map(|d| d.format("%Y-%m-%d %H:%M:%S %Z").to_string())
            .unwrap_or_default();
        info!(
            "Device: {}, old test of type {} not run at {}, starting now.",
            cfg.name,
            test.as_char(),
            when
        );
    }
    Some(test)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    /// An epoch at the top of an hour, local time, derived so tests are
    /// timezone independent.
    fn top_of_hour(epoch_near: i64) -> i64 {
        let dt = Local.timestamp_opt(epoch_near, 0).single().unwrap();
        epoch_near - i64::from(dt.minute()) * 60 - i64::from(dt.second())
    }

    fn local_parts(t: i64) -> (u32, u32, u32, u32) {
        let dt = Local.timestamp_opt(t, 0).single().unwrap();
        (
            dt.month(),
            dt.day(),
            dt.weekday().number_from_monday(),
            dt.hour(),
        )
    }

    fn cfg_with_pattern(pattern: &str) -> DeviceConfig {
        DeviceConfig {
            name: "/dev/sda".into(),
            test_regex: Some(TestRegex::compile(pattern).unwrap()),
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn test_offset_suffix_parsing() {
        let re = TestRegex::compile("S/../../../..:012").unwrap();
        assert_eq!(re.offsets(), &[(12, 0)]);
        let re = TestRegex::compile("L/../../../..:010-023").unwrap();
        assert_eq!(re.offsets(), &[(10, 23)]);
        // malformed suffixes are skipped
        let re = TestRegex::compile("S/../../../..:12").unwrap();
        assert!(re.offsets().is_empty());
        assert!(re.odd_looking_part().is_some());
    }

    #[test]
    fn test_simple_match_at_now() {
        let now = top_of_hour(1_700_000_000);
        let (mo, dd, wd, hh) = local_parts(now);
        let pattern = format!("S/{:02}/{:02}/{}/{:02}", mo, dd, wd, hh);
        let cfg = cfg_with_pattern(&pattern);
        let mut state = DeviceState::default();
        state.saved.scheduled_test_next_check = now;

        assert_eq!(
            next_scheduled_test(&cfg, &mut state, now, false),
            Some(TestType::Short)
        );
        assert!(state.must_write);
        // checkpoint advanced to the top of the next hour
        assert_eq!(state.saved.scheduled_test_next_check, now + 3600);
    }

    #[test]
    fn test_priority_long_over_short() {
        let now = top_of_hour(1_700_000_000);
        let (_, _, _, hh) = local_parts(now);
        let pattern = format!("[LS]/../../../{:02}", hh);
        let cfg = cfg_with_pattern(&pattern);
        let mut state = DeviceState::default();
        state.saved.scheduled_test_next_check = now;

        assert_eq!(
            next_scheduled_test(&cfg, &mut state, now, false),
            Some(TestType::Long)
        );
    }

    #[test]
    fn test_capability_gating_falls_through() {
        let now = top_of_hour(1_700_000_000);
        let (_, _, _, hh) = local_parts(now);
        let pattern = format!("[LS]/../../../{:02}", hh);
        let cfg = cfg_with_pattern(&pattern);
        let mut state = DeviceState::default();
        state.saved.scheduled_test_next_check = now;
        state.not_cap_long = true;

        assert_eq!(
            next_scheduled_test(&cfg, &mut state, now, false),
            Some(TestType::Short)
        );
    }

    #[test]
    fn test_downtime_replay_returns_missed_test_once() {
        let now = top_of_hour(1_700_000_000);
        let missed = now - 3600 * 10;
        let (mo, dd, wd, hh) = local_parts(missed);
        let pattern = format!("S/{:02}/{:02}/{}/{:02}", mo, dd, wd, hh);
        let cfg = cfg_with_pattern(&pattern);
        let mut state = DeviceState::default();
        state.saved.scheduled_test_next_check = missed - 1800;

        assert_eq!(
            next_scheduled_test(&cfg, &mut state, now, false),
            Some(TestType::Short)
        );
        // a second call finds nothing new
        assert_eq!(next_scheduled_test(&cfg, &mut state, now + 10, false), None);
    }

    #[test]
    fn test_clock_adjusted_to_past_snaps_checkpoint() {
        let now = top_of_hour(1_700_000_000);
        let (_, _, _, hh) = local_parts(now);
        let pattern = format!("S/../../../{:02}", hh);
        let cfg = cfg_with_pattern(&pattern);
        let mut state = DeviceState::default();
        // checkpoint far in the future: snap back to now, test still found
        state.saved.scheduled_test_next_check = now + 7200;
        assert_eq!(
            next_scheduled_test(&cfg, &mut state, now, false),
            Some(TestType::Short)
        );

        // checkpoint less than an hour ahead: not yet time
        let mut state = DeviceState::default();
        state.saved.scheduled_test_next_check = now + 1800;
        assert_eq!(next_scheduled_test(&cfg, &mut state, now, false), None);
        // checkpoint untouched in that case
        assert_eq!(state.saved.scheduled_test_next_check, now + 1800);
    }

    #[test]
    fn test_replay_window_bounded_to_90_days() {
        let now = top_of_hour(1_700_000_000);
        let cfg = cfg_with_pattern("X/99/99/9/99"); // never matches
        let mut state = DeviceState::default();
        state.saved.scheduled_test_next_check = now - MAX_REPLAY_SECS - 3600 * 24 * 30;
        assert_eq!(next_scheduled_test(&cfg, &mut state, now, false), None);
        assert_eq!(state.saved.scheduled_test_next_check, now + 3600 - {
            let dt = Local.timestamp_opt(now, 0).single().unwrap();
            i64::from(dt.minute()) * 60 + i64::from(dt.second())
        });
    }

    #[test]
    fn test_offset_factor_staggering() {
        // Pattern with a 1-hour offset unit: device with factor 2 matches
        // the slot two hours after the nominal hour.
        let now = top_of_hour(1_700_000_000);
        let nominal = now - 2 * 3600;
        let (mo, dd, wd, hh) = local_parts(nominal);
        let pattern = format!("S/{:02}/{:02}/{}/{:02}:001", mo, dd, wd, hh);
        let mut cfg = cfg_with_pattern(&pattern);
        cfg.test_offset_factor = 2;
        let mut state = DeviceState::default();
        state.saved.scheduled_test_next_check = now - 60;

        assert_eq!(
            next_scheduled_test(&cfg, &mut state, now, false),
            Some(TestType::Short)
        );

        // factor 0 device: nominal hour was 2h ago and outside the walk
        let mut cfg0 = cfg_with_pattern(&pattern);
        cfg0.test_offset_factor = 0;
        let mut state0 = DeviceState::default();
        state0.saved.scheduled_test_next_check = now - 60;
        assert_eq!(next_scheduled_test(&cfg0, &mut state0, now, false), None);
    }

    #[test]
    fn test_no_regex_means_no_test() {
        let cfg = DeviceConfig::default();
        let mut state = DeviceState::default();
        assert_eq!(
            next_scheduled_test(&cfg, &mut state, 1_700_000_000, false),
            None
        );
        assert!(!state.must_write);
    }
}
