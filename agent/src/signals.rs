// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signal handling shared by the supervisor and the services.
//!
//! Signal handlers only ever set atomic flags inside one owned
//! [`ShutdownFlags`] value; the supervisor and keeper loops check the
//! flags between phases.  SIGTERM asks for a smart stop (finish the
//! current tick), SIGINT for a fast stop (interrupt the current action at
//! the next check point), SIGQUIT for an immediate stop, SIGHUP for a
//! configuration reload.

use slog::{info, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

/// How insistently we were asked to stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownMode {
    Running,
    /// SIGTERM: complete the current tick or transition, then exit.
    Smart,
    /// SIGINT: interrupt the current action at the next check point.
    Fast,
    /// SIGQUIT: abort outright; child tools get killed.
    Immediate,
}

#[derive(Debug, Default)]
struct Flags {
    stop: AtomicBool,
    stop_fast: AtomicBool,
    stop_immediate: AtomicBool,
    reload: AtomicBool,
}

/// Shared view of the signals received by this process.
#[derive(Clone, Debug)]
pub struct ShutdownFlags {
    flags: Arc<Flags>,
}

impl ShutdownFlags {
    /// Installs the handlers and returns the flags they feed.
    pub fn install(log: &Logger) -> std::io::Result<ShutdownFlags> {
        let flags = ShutdownFlags { flags: Arc::new(Flags::default()) };

        for (kind, name) in [
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::interrupt(), "SIGINT"),
            (SignalKind::quit(), "SIGQUIT"),
            (SignalKind::hangup(), "SIGHUP"),
        ] {
            let mut stream = signal(kind)?;
            let flags = flags.clone();
            let log = log.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    info!(log, "received {}", name);
                    match name {
                        "SIGTERM" => {
                            flags.flags.stop.store(true, Ordering::SeqCst)
                        }
                        "SIGINT" => flags
                            .flags
                            .stop_fast
                            .store(true, Ordering::SeqCst),
                        "SIGQUIT" => flags
                            .flags
                            .stop_immediate
                            .store(true, Ordering::SeqCst),
                        "SIGHUP" => {
                            flags.flags.reload.store(true, Ordering::SeqCst)
                        }
                        _ => unreachable!(),
                    }
                }
            });
        }

        Ok(flags)
    }

    /// A detached set of flags, for tests and for driving shutdown
    /// programmatically.
    pub fn detached() -> ShutdownFlags {
        ShutdownFlags { flags: Arc::new(Flags::default()) }
    }

    pub fn mode(&self) -> ShutdownMode {
        if self.flags.stop_immediate.load(Ordering::SeqCst) {
            ShutdownMode::Immediate
        } else if self.flags.stop_fast.load(Ordering::SeqCst) {
            ShutdownMode::Fast
        } else if self.flags.stop.load(Ordering::SeqCst) {
            ShutdownMode::Smart
        } else {
            ShutdownMode::Running
        }
    }

    pub fn should_stop(&self) -> bool {
        self.mode() > ShutdownMode::Running
    }

    /// True when the current action should be interrupted rather than
    /// completed.
    pub fn should_stop_fast(&self) -> bool {
        self.mode() > ShutdownMode::Smart
    }

    /// Consumes a pending reload request.
    pub fn take_reload(&self) -> bool {
        self.flags.reload.swap(false, Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.flags.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn modes_escalate() {
        let flags = ShutdownFlags::detached();
        assert_eq!(flags.mode(), ShutdownMode::Running);
        assert!(!flags.should_stop());

        flags.flags.stop.store(true, Ordering::SeqCst);
        assert_eq!(flags.mode(), ShutdownMode::Smart);
        assert!(flags.should_stop());
        assert!(!flags.should_stop_fast());

        flags.flags.stop_fast.store(true, Ordering::SeqCst);
        assert_eq!(flags.mode(), ShutdownMode::Fast);
        assert!(flags.should_stop_fast());

        flags.flags.stop_immediate.store(true, Ordering::SeqCst);
        assert_eq!(flags.mode(), ShutdownMode::Immediate);
    }

    #[test]
    fn reload_is_consumed() {
        let flags = ShutdownFlags::detached();
        assert!(!flags.take_reload());
        flags.flags.reload.store(true, Ordering::SeqCst);
        assert!(flags.take_reload());
        assert!(!flags.take_reload());
    }
}
