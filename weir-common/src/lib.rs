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

pub mod rand;
pub mod retry;

use once_cell::sync::Lazy;

/// Generates a readable random id of the form `{label}-{adjective}-{animal}-{suffix}`.
///
/// Used for throwaway identities (recovery consumer group ids, test run ids)
/// where uniqueness matters but log greppability matters more.
pub fn new_coolid(label: &str) -> String {
    static ADJECTIVES: [&str; 8] = [
        "aged", "ancient", "autumn", "billowing", "bitter", "black", "blue", "bold",
    ];
    static ANIMALS: [&str; 8] = [
        "albatross", "badger", "cormorant", "heron", "lobster", "marmot", "otter", "pelican",
    ];
    use ::rand::seq::SliceRandom;
    let mut rng = ::rand::thread_rng();
    format!(
        "{}-{}-{}-{}",
        label,
        ADJECTIVES.choose(&mut rng).unwrap(),
        ANIMALS.choose(&mut rng).unwrap(),
        crate::rand::random_suffix(4),
    )
}

static LOGGING_INITIALIZED: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().format_timestamp(None).try_init();
});

pub fn setup_logging_for_tests() {
    Lazy::force(&LOGGING_INITIALIZED);
}
