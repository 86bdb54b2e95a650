// Copyright (C) 2022 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use anyhow::bail;
use once_cell::sync::OnceCell;
use regex::Regex;

mod config;

pub use config::{AutoOffsetReset, ProcessingGuarantee, WeirConfig};

/// Validates an identifier destined to become a Kafka group id or a component
/// of a derived topic name.
pub fn validate_identifier(label: &str, value: &str) -> anyhow::Result<()> {
    static IDENTIFIER_REGEX: OnceCell<Regex> = OnceCell::new();

    if IDENTIFIER_REGEX
        .get_or_init(|| {
            Regex::new(r"^[a-zA-Z][a-zA-Z0-9-_\.]{2,254}$")
                .expect("The identifier regex should compile.")
        })
        .is_match(value)
    {
        return Ok(());
    }
    bail!("{} `{}` is invalid.", label, value);
}
