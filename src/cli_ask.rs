// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{bail, Result};
use std::io::Write;

pub fn ask_password() -> Result<String> {
    print!("Password (leave blank for an open session): ");
    std::io::stdout().flush()?;
    let mut lines = std::io::stdin().lines();
    if let Some(Ok(line)) = lines.next() {
        Ok(line.trim_end().to_string())
    } else {
        bail!("Failed to read password");
    }
}
