// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Static world content: rooms, templates, and rules tables. Everything here
//! is immutable data loaded at startup; runtime state lives in the engine.

pub mod room;
pub mod source;
pub mod templates;
