use std::{
    sync::atomic::{AtomicU64, Ordering},
    sync::OnceLock,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use dlog_codec::{self as codec, Decode, Encode, Input, ItemKind, Output};

/// Nanoseconds on the monotonic timeline, as carried by every message.
pub type Timestamp = u64;

/// Relation between the monotonic timeline and the wall clock.
///
/// `steady_reference` is the monotonic reading that was taken at the same
/// instant as the wall-clock reading `system_reference` (both in
/// nanoseconds, the latter since the Unix epoch). The pair is persisted in
/// every record container header so records can be re-projected to wall
/// time during analysis, even long after the writing process is gone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EpochInfo {
    pub system_reference: u64,
    pub steady_reference: u64,
}

impl EpochInfo {
    /// Projects a monotonic timestamp onto the wall clock.
    pub fn to_system_time(&self, timestamp: Timestamp) -> SystemTime {
        let system = Duration::from_nanos(self.system_reference);
        if timestamp >= self.steady_reference {
            UNIX_EPOCH + system + Duration::from_nanos(timestamp - self.steady_reference)
        } else {
            UNIX_EPOCH + system - Duration::from_nanos(self.steady_reference - timestamp)
        }
    }
}

impl Encode for EpochInfo {
    fn encoded_size(&self) -> u64 {
        1 + self.system_reference.encoded_size() + self.steady_reference.encoded_size()
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> codec::Result<()> {
        codec::emit_array(out, 2)?;
        self.system_reference.encode(out)?;
        self.steady_reference.encode(out)
    }
}

impl Decode for EpochInfo {
    fn decode<I: Input + ?Sized>(input: &mut I) -> codec::Result<Self> {
        codec::expect_item_head(input, ItemKind::Array, 2)?;
        Ok(Self {
            system_reference: codec::parse_u64(input)?,
            steady_reference: codec::parse_u64(input)?,
        })
    }
}

struct GlobalEpoch {
    system_reference: AtomicU64,
    steady_reference: u64,
}

static EPOCH: OnceLock<GlobalEpoch> = OnceLock::new();

fn global_epoch() -> &'static GlobalEpoch {
    EPOCH.get_or_init(|| {
        let steady = monotonic_now();
        let system = system_now();
        GlobalEpoch {
            system_reference: AtomicU64::new(system),
            steady_reference: steady,
        }
    })
}

fn system_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn monotonic_now() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC is shared by every process on the host, which keeps
    // timestamps comparable across all producers attached to one bus.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(not(unix))]
fn monotonic_now() -> u64 {
    use std::time::Instant;

    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = *ANCHOR.get_or_init(Instant::now);
    Instant::now().duration_since(anchor).as_nanos() as u64
}

/// Monotonic, high-resolution clock bridged to a wall-clock epoch.
pub struct LogClock;

impl LogClock {
    /// Current monotonic time in nanoseconds.
    pub fn now() -> Timestamp {
        monotonic_now()
    }

    /// Snapshot of the global epoch.
    pub fn epoch() -> EpochInfo {
        let epoch = global_epoch();
        EpochInfo {
            system_reference: epoch.system_reference.load(Ordering::Acquire),
            steady_reference: epoch.steady_reference,
        }
    }

    /// Re-derives the wall-clock reference from the current system clock.
    ///
    /// Picks up wall-clock adjustments (NTP steps, manual changes) without
    /// moving the monotonic reference point. Returns whether the stored
    /// reference actually changed; sinks use that signal to rotate their
    /// container files so every container carries a single epoch.
    pub fn try_sync_epoch() -> bool {
        let epoch = global_epoch();
        let elapsed = monotonic_now().saturating_sub(epoch.steady_reference);
        let refreshed = system_now().saturating_sub(elapsed);
        let previous = epoch
            .system_reference
            .swap(refreshed, Ordering::AcqRel);
        previous != refreshed
    }

    /// Projects a monotonic timestamp onto the wall clock using the
    /// current global epoch.
    pub fn to_system_time(timestamp: Timestamp) -> SystemTime {
        Self::epoch().to_system_time(timestamp)
    }

    /// Projects a wall-clock instant onto the monotonic timeline using
    /// the current global epoch. Instants before the epoch clamp to zero.
    pub fn from_system_time(time: SystemTime) -> Timestamp {
        let epoch = Self::epoch();
        let since_unix = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        if since_unix >= epoch.system_reference {
            epoch
                .steady_reference
                .saturating_add(since_unix - epoch.system_reference)
        } else {
            epoch
                .steady_reference
                .saturating_sub(epoch.system_reference - since_unix)
        }
    }
}

/// Emits a timestamp in the fixed nine-byte integer form.
pub(crate) fn emit_timestamp<O: Output + ?Sized>(
    out: &mut O,
    timestamp: Timestamp,
) -> codec::Result<()> {
    codec::emit_uint_fixed(out, timestamp)
}

/// Encoded size of a timestamp; constant by design.
pub(crate) const TIMESTAMP_SIZE: u64 = 9;

#[cfg(test)]
mod tests {
    use dlog_codec::{SliceInput, VecOutput};

    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = LogClock::now();
        let b = LogClock::now();
        assert!(b >= a);
    }

    #[test]
    fn epoch_round_trips() {
        let epoch = LogClock::epoch();
        let mut out = VecOutput::new();
        epoch.encode(&mut out).unwrap();
        let bytes = out.into_bytes();
        let mut input = SliceInput::new(&bytes);
        assert_eq!(EpochInfo::decode(&mut input).unwrap(), epoch);
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let mut out = VecOutput::new();
        emit_timestamp(&mut out, 5).unwrap();
        assert_eq!(out.len() as u64, TIMESTAMP_SIZE);
    }

    #[test]
    fn projection_is_close_to_wall_clock() {
        let projected = LogClock::to_system_time(LogClock::now());
        let now = SystemTime::now();
        let delta = match now.duration_since(projected) {
            Ok(d) => d,
            Err(e) => e.duration(),
        };
        assert!(delta < Duration::from_secs(2));
    }

    #[test]
    fn projections_invert_each_other() {
        let timestamp = LogClock::now();
        let wall = LogClock::to_system_time(timestamp);
        let back = LogClock::from_system_time(wall);
        let delta = timestamp.abs_diff(back);
        assert!(delta < 1_000_000, "round trip drifted by {delta}ns");
    }

    #[test]
    fn epoch_sync_keeps_projection_stable() {
        let before = LogClock::to_system_time(0);
        let _ = LogClock::try_sync_epoch();
        let after = LogClock::to_system_time(0);
        let delta = match after.duration_since(before) {
            Ok(d) => d,
            Err(e) => e.duration(),
        };
        assert!(delta < Duration::from_secs(2));
    }
}
