//! Time-sortable identifier generation.
//!
//! Downstream clients order messages and parts by raw byte comparison of
//! their ids, so every id generated here must sort lexicographically in
//! creation order: `"{prefix}_{12-hex-ms}{4-hex-counter}{10-hex-random}"`.
//! The counter disambiguates ids minted within the same millisecond; the
//! random suffix prevents collisions across processes.

use parking_lot::Mutex;
use rand::Rng as _;

const RANDOM_MASK: u64 = 0xff_ffff_ffff;

#[derive(Debug, Default)]
struct ClockState {
    last_ms: u64,
    counter: u16,
}

impl ClockState {
    /// Advance for a new id at `now_ms` and return the `(ms, counter)` pair
    /// to encode. Never moves backwards, even if the wall clock does.
    fn tick(&mut self, now_ms: u64) -> (u64, u16) {
        if now_ms > self.last_ms {
            self.last_ms = now_ms;
            self.counter = 0;
        } else if self.counter == u16::MAX {
            // Counter exhausted within one millisecond: borrow the next one.
            self.last_ms += 1;
            self.counter = 0;
        } else {
            self.counter += 1;
        }
        (self.last_ms, self.counter)
    }
}

fn format_id(prefix: &str, ms: u64, counter: u16, random: u64) -> String {
    format!("{prefix}_{ms:012x}{counter:04x}{random:010x}")
}

/// Generator with an injectable clock, for deterministic tests.
pub struct IdGenerator<C> {
    clock: C,
    state: ClockState,
}

impl<C: FnMut() -> u64> IdGenerator<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            state: ClockState::default(),
        }
    }

    pub fn generate(&mut self, prefix: &str) -> String {
        let now = (self.clock)();
        let (ms, counter) = self.state.tick(now);
        let random = rand::rng().random::<u64>() & RANDOM_MASK;
        format_id(prefix, ms, counter, random)
    }
}

static PROCESS_STATE: Mutex<ClockState> = Mutex::new(ClockState {
    last_ms: 0,
    counter: 0,
});

fn generate(prefix: &str) -> String {
    #[allow(clippy::cast_sign_loss)]
    let now = crate::model::now_ms().max(0) as u64;
    let (ms, counter) = PROCESS_STATE.lock().tick(now);
    let random = rand::rng().random::<u64>() & RANDOM_MASK;
    format_id(prefix, ms, counter, random)
}

/// New message id (`msg_…`).
#[must_use]
pub fn message_id() -> String {
    generate("msg")
}

/// New part id (`prt_…`).
#[must_use]
pub fn part_id() -> String {
    generate("prt")
}

/// New permission id (`perm_…`).
#[must_use]
pub fn permission_id() -> String {
    generate("perm")
}

/// New session id (`ses_…`) — only for adapters whose backend does not mint
/// its own.
#[must_use]
pub fn session_id() -> String {
    generate("ses")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_in_generation_order() {
        let mut prev = message_id();
        for _ in 0..1000 {
            let next = message_id();
            assert!(prev < next, "{prev} should sort before {next}");
            prev = next;
        }
    }

    #[test]
    fn counter_increments_within_one_millisecond() {
        let mut generator = IdGenerator::with_clock(|| 0x1234);
        let a = generator.generate("msg");
        let b = generator.generate("msg");
        assert_eq!(&a[4..16], "000000001234");
        assert_eq!(&a[16..20], "0000");
        assert_eq!(&b[16..20], "0001");
        assert!(a < b);
    }

    #[test]
    fn counter_resets_when_millisecond_advances() {
        let mut now = 100u64;
        let mut generator = IdGenerator::with_clock(move || {
            now += 1;
            now
        });
        let a = generator.generate("prt");
        let b = generator.generate("prt");
        assert_eq!(&a[16..20], "0000");
        assert_eq!(&b[16..20], "0000");
        assert!(a < b, "advancing ms keeps lexicographic order");
    }

    #[test]
    fn backwards_clock_does_not_break_ordering() {
        let times = [500u64, 400, 300];
        let mut i = 0;
        let mut generator = IdGenerator::with_clock(move || {
            let t = times[i.min(times.len() - 1)];
            i += 1;
            t
        });
        let a = generator.generate("msg");
        let b = generator.generate("msg");
        let c = generator.generate("msg");
        assert!(a < b && b < c);
    }

    #[test]
    fn id_shape() {
        let id = part_id();
        let (prefix, rest) = id.split_once('_').expect("prefix separator");
        assert_eq!(prefix, "prt");
        assert_eq!(rest.len(), 12 + 4 + 10);
        assert!(rest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
