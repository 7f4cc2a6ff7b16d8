// SPDX-License-Identifier: GPL-2.0
//
// Synchronized launch of the traced process.
//
// A two-party pthread barrier lives in MAP_SHARED|MAP_ANONYMOUS memory
// so it is visible on both sides of fork(). The child blocks on it
// before exec, which lets the controller finish arming the counter
// group before the target runs a single user instruction:
//
//   controller: open group -> arm_and_start() -> barrier.wait()
//   child:      fork -> barrier.wait() -> execvp
//
// The barrier is used exactly once per traced process.

use std::ffi::CString;
use std::io;
use std::ptr;

use anyhow::{Context, Result};
use nix::unistd::{execvp, fork, ForkResult, Pid};

// glibc return value for the one waiter released as "serial".
const PTHREAD_BARRIER_SERIAL_THREAD: i32 = -1;

pub struct LaunchBarrier {
    barrier: *mut libc::pthread_barrier_t,
}

// The pthread barrier is process-shared and safe to wait on from any
// thread; the raw pointer is only ever handed to pthread_barrier_wait.
unsafe impl Send for LaunchBarrier {}
unsafe impl Sync for LaunchBarrier {}

impl LaunchBarrier {
    pub fn new() -> Result<Self> {
        let size = std::mem::size_of::<libc::pthread_barrier_t>();
        let barrier = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if barrier == libc::MAP_FAILED {
            return Err(io::Error::last_os_error()).context("mmap launch barrier");
        }
        let barrier = barrier as *mut libc::pthread_barrier_t;

        unsafe {
            let mut attr: libc::pthread_barrierattr_t = std::mem::zeroed();
            libc::pthread_barrierattr_init(&mut attr);
            libc::pthread_barrierattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            let ret = libc::pthread_barrier_init(barrier, &attr, 2);
            libc::pthread_barrierattr_destroy(&mut attr);
            if ret != 0 {
                libc::munmap(barrier as *mut libc::c_void, size);
                return Err(io::Error::from_raw_os_error(ret)).context("pthread_barrier_init");
            }
        }

        Ok(Self { barrier })
    }

    /// Block until both parties have arrived.
    pub fn wait(&self) -> Result<()> {
        let ret = unsafe { libc::pthread_barrier_wait(self.barrier) };
        if ret != 0 && ret != PTHREAD_BARRIER_SERIAL_THREAD {
            return Err(io::Error::from_raw_os_error(ret)).context("pthread_barrier_wait");
        }
        Ok(())
    }
}

impl Drop for LaunchBarrier {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_barrier_destroy(self.barrier);
            libc::munmap(
                self.barrier as *mut libc::c_void,
                std::mem::size_of::<libc::pthread_barrier_t>(),
            );
        }
    }
}

/// Fork the traced child. The child arranges to die with the
/// controller, parks on the barrier, then replaces its image with the
/// target program. Returns the child's pid to the controller, which
/// must later release the barrier.
pub fn spawn_traced(program: &str, args: &[String], barrier: &LaunchBarrier) -> Result<Pid> {
    // Argv is built before fork; the child only execs.
    let prog = CString::new(program).context("program path contains NUL")?;
    let mut argv = vec![prog.clone()];
    for arg in args {
        argv.push(CString::new(arg.as_str()).context("argument contains NUL")?);
    }

    match unsafe { fork() }.context("fork traced child")? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            unsafe {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
            }
            let _ = barrier.wait();
            let _ = execvp(&prog, &argv);
            // exec failed; nothing sane left to do in this address space
            unsafe { libc::_exit(127) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn wait_returns_only_after_both_parties_arrive() {
        let barrier = LaunchBarrier::new().unwrap();
        let armed = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                barrier.wait().unwrap();
                // The controller side arms before its own wait, so by
                // the time our wait returns arming must be visible.
                assert!(armed.load(Ordering::SeqCst));
            });

            std::thread::sleep(Duration::from_millis(50));
            armed.store(true, Ordering::SeqCst);
            barrier.wait().unwrap();
        });
    }

    #[test]
    fn spawned_child_blocks_until_release_then_execs() {
        let barrier = LaunchBarrier::new().unwrap();
        let pid = spawn_traced("/bin/true", &[], &barrier).unwrap();

        barrier.wait().unwrap();
        match waitpid(pid, None).unwrap() {
            WaitStatus::Exited(_, code) => assert_eq!(code, 0),
            other => panic!("unexpected wait status {:?}", other),
        }
    }
}
