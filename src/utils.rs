//! grab bag of clock and scheduling helpers used across the server.
use simple_error::bail;
use std::sync::OnceLock;
use std::time::Instant;

use crate::common::box_error::BoxError;

static CLOCK_ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds on the steady clock, anchored at first use.
///
/// Monotonic, immune to wall-clock jumps.  All the activity stamps and
/// reaper math run on this clock; zero doubles as "never".
pub fn get_nano_time() -> u64 {
    let anchor = CLOCK_ANCHOR.get_or_init(Instant::now);
    anchor.elapsed().as_nanos() as u64
}

/// Ask the OS for SCHED_FIFO at max priority for the calling thread.
///
/// Needs CAP_SYS_NICE or an rtprio limit.  Callers treat failure as a
/// warning and keep running at normal priority.
#[cfg(target_os = "linux")]
pub fn set_realtime_priority() -> Result<(), BoxError> {
    unsafe {
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        let param = libc::sched_param {
            sched_priority: max,
        };
        if libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) != 0 {
            bail!("pthread_setschedparam refused SCHED_FIFO:{}", max);
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_realtime_priority() -> Result<(), BoxError> {
    Ok(())
}

/// Pin the calling thread to one core for cache locality.
#[cfg(target_os = "linux")]
pub fn pin_to_core(core: usize) -> Result<(), BoxError> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            bail!("sched_setaffinity refused core {}", core);
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_to_core(_core: usize) -> Result<(), BoxError> {
    Ok(())
}
