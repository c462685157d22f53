// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types and utilities shared across the pgwarden crates.

pub mod backoff;
pub mod cmd;
pub mod lsn;
pub mod node;
pub mod poll;
pub mod roles;
