// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities used by the command-line tools.
//!
//! Every failure in the binaries bubbles up to a single [`CmdError`] whose
//! kind determines the process exit code, instead of exiting from deep
//! inside the call stack.

use std::env::current_exe;
use std::process::exit;
use thiserror::Error;

/// Represents a fatal error in a command-line program.
#[derive(Debug, Error)]
pub enum CmdError {
    /// incorrect command-line arguments
    #[error("{0}")]
    Usage(String),
    /// configuration missing or malformed; operator action required
    #[error("{0}")]
    BadConfig(String),
    /// the on-disk keeper state is unusable
    #[error("{0}")]
    BadState(String),
    /// a `pg_ctl`-level operation failed
    #[error("{0}")]
    PgCtl(String),
    /// a query against the local Postgres instance failed
    #[error("{0}")]
    PgSql(String),
    /// the monitor could not be reached or rejected the call
    #[error("{0}")]
    Monitor(String),
    /// all other errors
    #[error("{0}")]
    Internal(String),
}

impl CmdError {
    /// The stable exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            CmdError::Usage(_) => 11,
            CmdError::BadConfig(_) => 12,
            CmdError::BadState(_) => 13,
            CmdError::PgCtl(_) => 14,
            CmdError::PgSql(_) => 15,
            CmdError::Monitor(_) => 16,
            CmdError::Internal(_) => 17,
        }
    }
}

/// Exits the current process on a fatal error.
pub fn fatal(cmd_error: CmdError) -> ! {
    let arg0_result = current_exe().ok();
    let arg0 = arg0_result
        .as_deref()
        .and_then(|pathbuf| pathbuf.file_name())
        .and_then(|file_name| file_name.to_str())
        .unwrap_or("command");
    eprintln!("{}: {}", arg0, cmd_error);
    exit(cmd_error.exit_code());
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(CmdError::Usage(String::new()).exit_code(), 11);
        assert_eq!(CmdError::BadConfig(String::new()).exit_code(), 12);
        assert_eq!(CmdError::BadState(String::new()).exit_code(), 13);
        assert_eq!(CmdError::PgCtl(String::new()).exit_code(), 14);
        assert_eq!(CmdError::PgSql(String::new()).exit_code(), 15);
        assert_eq!(CmdError::Monitor(String::new()).exit_code(), 16);
        assert_eq!(CmdError::Internal(String::new()).exit_code(), 17);
    }
}
