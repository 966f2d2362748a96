//! Parent-lifetime guard.
//!
//! The worker must not outlive the driver that spawned it. A detached
//! thread polls the parent PID once a second; once the process has been
//! re-parented to init the driver is gone and the worker exits non-zero.

use std::thread;
use std::time::Duration;

use log::error;
use nix::unistd::getppid;

const INIT_PID: i32 = 1;
const PARENT_QUERY_PERIOD: Duration = Duration::from_secs(1);

pub fn bind_to_parent() {
    thread::spawn(|| {
        loop {
            if getppid().as_raw() == INIT_PID {
                error!("Parent process exited, shutting down");
                std::process::exit(1);
            }
            thread::sleep(PARENT_QUERY_PERIOD);
        }
    });
}
