// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Coordination primitives: the [`Event`] synchronizer, the
//! [`when_all`] join combinator, and the [`sync_wait`] blocking bridge.
//!
//! [`Event`]: event::Event
//! [`when_all`]: when_all::when_all
//! [`sync_wait`]: sync_wait::sync_wait

pub mod event;
pub mod sync_wait;
pub mod when_all;
