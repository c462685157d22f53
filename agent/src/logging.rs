// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logger construction for the pgwarden binaries.

use slog::{o, Drain, Level, Logger};

/// Output format of the root logger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable terminal output.
    Terminal,
    /// Line-oriented JSON (bunyan), for log collectors and `--json` runs.
    Json,
}

/// Builds the root logger for a pgwarden process.
///
/// Each child service builds its own root logger: processes do not share
/// drains, so a crashing service can never take the supervisor's logging
/// with it.
pub fn root_logger(level: Level, format: LogFormat) -> Logger {
    match format {
        LogFormat::Terminal => {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::FullFormat::new(decorator)
                .build()
                .filter_level(level)
                .fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, o!("name" => "pgwarden"))
        }
        LogFormat::Json => {
            let drain = slog_bunyan::with_name("pgwarden", std::io::stderr())
                .build()
                .filter_level(level)
                .fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, o!())
        }
    }
}

/// Maps a `-v` count to a level: default INFO, `-v` DEBUG, `-vv` TRACE.
pub fn level_from_verbosity(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::Info,
        1 => Level::Debug,
        _ => Level::Trace,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verbosity_mapping() {
        assert_eq!(level_from_verbosity(0), Level::Info);
        assert_eq!(level_from_verbosity(1), Level::Debug);
        assert_eq!(level_from_verbosity(2), Level::Trace);
        assert_eq!(level_from_verbosity(200), Level::Trace);
    }
}
