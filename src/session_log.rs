// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Write-only record of a session, one dispatched message per line, for
//! replaying a performance later.

use crate::protocol::Message;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::warn;

pub struct SessionLog {
    path: PathBuf,
    file: File,
    epoch: Instant,
}

impl SessionLog {
    /// Opens `<root>/logs/server-log-DDMMYY_HHMMSS.txt`, creating the logs
    /// directory if needed.
    pub fn create(root: &Path) -> Result<Self> {
        let log_dir = root.join("logs");
        fs::create_dir_all(&log_dir).context("Failed to create logs directory")?;

        let format = time::format_description::parse(
            "server-log-[day][month][year repr:last_two]_[hour][minute][second].txt",
        )
        .expect("Could not create time format description");
        let offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
        let filename = time::OffsetDateTime::now_utc()
            .to_offset(offset)
            .format(&format)
            .context("Failed to format log file name")?;

        let path = log_dir.join(filename);
        let file = File::create(&path).context("Failed to create session log file")?;
        Ok(Self {
            path,
            file,
            epoch: Instant::now(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line: seconds since the log was opened (4 fractional
    /// digits), a space, and the message. A failing disk must not take the
    /// session down, so write errors are only logged.
    pub fn record(&mut self, message: &Message) {
        let elapsed = self.epoch.elapsed().as_secs_f64();
        if let Err(error) = writeln!(self.file, "{elapsed:.4} {message:?}") {
            warn!("Failed to write to session log: {error}");
        }
    }
}
