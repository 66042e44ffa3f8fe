//! Real-time thread helpers shared by the worker pool, the Tx/Rx thread and the PRACH pool.

use std::io;
use std::thread::{Builder, JoinHandle};
use tracing::{debug, warn};

/// Highest SCHED_FIFO priority accepted by the kernel
pub const MAX_RT_PRIORITY: i32 = 99;

/// Apply a real-time priority to the calling thread.
///
/// A priority of zero or below leaves the thread on the default time-sharing
/// policy. Positive values select `SCHED_FIFO` with that priority (clamped to
/// 1..=99). Raising the priority needs `CAP_SYS_NICE`; the error is returned so
/// that the caller can decide how loudly to complain.
pub fn set_thread_priority(priority: i32) -> io::Result<()> {
    if priority <= 0 {
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        use libc::{pthread_self, pthread_setschedparam, sched_param, SCHED_FIFO};

        let ret = unsafe {
            let mut param: sched_param = std::mem::zeroed();
            param.sched_priority = priority.min(MAX_RT_PRIORITY);
            pthread_setschedparam(pthread_self(), SCHED_FIFO, &param)
        };
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "real-time priority not supported on this platform",
        ))
    }
}

/// Spawn a named thread that raises its own priority before running `f`.
///
/// Failing to obtain the priority is not fatal: processing continues on the
/// default policy and a warning is logged.
pub fn spawn_rt_thread<F, T>(name: String, priority: i32, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().name(name.clone()).spawn(move || {
        match set_thread_priority(priority) {
            Ok(()) => debug!("Thread {} running with priority {}", name, priority),
            Err(e) => warn!("Thread {}: could not set priority {}: {}", name, priority, e),
        }
        f()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_priority_is_noop() {
        assert!(set_thread_priority(0).is_ok());
        assert!(set_thread_priority(-5).is_ok());
    }

    #[test]
    fn test_spawn_runs_closure() {
        // Priority 50 will usually be refused in CI; the thread must still run
        let handle = spawn_rt_thread("test-rt".to_string(), 50, || 21 * 2).unwrap();
        assert_eq!(handle.join().unwrap(), 42);
    }
}
