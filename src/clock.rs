//! Hybrid logical clock.
//!
//! An HLC is `(physical_nanos, logical_counter)`, formatted as
//! `"%019d-%010d"` so string order and numeric order agree. The
//! authoritative sequencer lives in the metadata store (it must advance
//! atomically inside the commit transaction); this module owns the pure
//! formatting/parsing/comparison logic plus the in-memory step function
//! the store calls under its transaction.

use std::time::{SystemTime, UNIX_EPOCH};

/// An HLC timestamp, comparable as a plain string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hlc {
    pub physical: u64,
    pub logical: u32,
}

impl Hlc {
    pub const MIN: Hlc = Hlc {
        physical: 0,
        logical: 0,
    };

    pub fn format(&self) -> String {
        format!("{:019}-{:010}", self.physical, self.logical)
    }

    pub fn parse(s: &str) -> Option<Hlc> {
        let (phys, logical) = s.split_once('-')?;
        Some(Hlc {
            physical: phys.parse().ok()?,
            logical: logical.parse().ok()?,
        })
    }
}

impl std::fmt::Display for Hlc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

/// Current wallclock as nanoseconds since the epoch.
pub fn wallclock_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Advance `prev` past `wallclock_nanos`, preserving strict monotonicity
/// even under a stalled or regressed wallclock.
pub fn step(prev: &Hlc, wallclock_nanos: u64) -> Hlc {
    let phys = prev.physical.max(wallclock_nanos);
    let logical = if phys == prev.physical {
        prev.logical + 1
    } else {
        0
    };
    Hlc {
        physical: phys,
        logical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_is_fixed_width_and_sortable() {
        let a = Hlc {
            physical: 5,
            logical: 2,
        };
        assert_eq!(a.format(), "0000000000000000005-0000000002");
    }

    #[test]
    fn format_parse_roundtrip() {
        let a = Hlc {
            physical: 1_700_000_000_000_000_000,
            logical: 42,
        };
        let parsed = Hlc::parse(&a.format()).unwrap();
        assert_eq!(a, parsed);
    }

    #[test]
    fn string_order_matches_numeric_order() {
        let a = Hlc {
            physical: 5,
            logical: 9,
        };
        let b = Hlc {
            physical: 6,
            logical: 0,
        };
        assert!(a < b);
        assert!(a.format() < b.format());
    }

    #[test]
    fn step_advances_physical_when_wallclock_ahead() {
        let prev = Hlc {
            physical: 100,
            logical: 5,
        };
        let next = step(&prev, 200);
        assert_eq!(next.physical, 200);
        assert_eq!(next.logical, 0);
    }

    #[test]
    fn step_bumps_logical_when_wallclock_stalled_or_behind() {
        let prev = Hlc {
            physical: 100,
            logical: 5,
        };
        // wallclock equal
        let next = step(&prev, 100);
        assert_eq!(next.physical, 100);
        assert_eq!(next.logical, 6);

        // wallclock regressed
        let next2 = step(&next, 50);
        assert_eq!(next2.physical, 100);
        assert_eq!(next2.logical, 7);
    }

    #[test]
    fn step_is_strictly_monotonic_across_many_calls() {
        let mut cur = Hlc::MIN;
        let mut prev_fmt = cur.format();
        for i in 0..1000u64 {
            // simulate a wallclock that doesn't always advance
            let wc = if i % 3 == 0 { 1000 } else { 0 };
            cur = step(&cur, wc);
            let fmt = cur.format();
            assert!(fmt > prev_fmt);
            prev_fmt = fmt;
        }
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(Hlc::parse("not-an-hlc").is_none());
        assert!(Hlc::parse("123").is_none());
    }
}
