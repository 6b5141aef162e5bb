//! Monotonic nanosecond clock used for header timestamps and pacing.
//!
//! Backed by `CLOCK_MONOTONIC`, so timestamps taken by two processes on the
//! same host can be subtracted.

use std::time::Duration;

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC is always available; a failure leaves `ts` zeroed.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * NANOS_PER_SEC + ts.tv_nsec as u64
}

/// Sleep until the monotonic clock reaches `deadline_ns`. Returns at once if
/// the deadline already passed.
pub fn sleep_until_ns(deadline_ns: u64) {
    if deadline_ns <= now_ns() {
        return;
    }
    sleep_abs(deadline_ns);
}

#[cfg(target_os = "linux")]
fn sleep_abs(deadline_ns: u64) {
    let ts = libc::timespec {
        tv_sec: (deadline_ns / NANOS_PER_SEC) as libc::time_t,
        tv_nsec: (deadline_ns % NANOS_PER_SEC) as libc::c_long,
    };
    // Absolute sleeps resume against the same deadline after EINTR.
    loop {
        let rc = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        };
        if rc != libc::EINTR {
            break;
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn sleep_abs(deadline_ns: u64) {
    let now = now_ns();
    if deadline_ns > now {
        std::thread::sleep(Duration::from_nanos(deadline_ns - now));
    }
}

pub fn elapsed_since(start_ns: u64) -> Duration {
    Duration::from_nanos(now_ns().saturating_sub(start_ns))
}
