// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Interchangeable bus backends. Producers see [`core_protocol::bus::EventSink`]
//! regardless of whether events cross a thread, a broker, or a TCP stream.

pub mod pubsub;
pub mod rpc;
