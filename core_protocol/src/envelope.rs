// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::UnixTime;
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Authenticated wire format for the pub/sub bus. Receivers drop anything
/// they cannot verify; a forged or replayed envelope must never reach a
/// subscriber.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    /// Stable event discriminator, e.g. "LineReceived".
    pub type_tag: String,
    /// Engine or gateway id of the publisher.
    pub source: String,
    pub timestamp: UnixTime,
    pub payload: Vec<u8>,
    pub mac: Vec<u8>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EnvelopeError {
    /// Fail closed on versions we don't understand.
    UnknownVersion(u16),
    BadMac,
    /// Older than the configured skew window.
    Stale { age_ms: u64 },
}

impl Envelope {
    pub const VERSION: u16 = 1;

    pub fn seal(
        type_tag: &str,
        source: &str,
        timestamp: UnixTime,
        payload: Vec<u8>,
        secret: &[u8],
    ) -> Self {
        let mac = Self::compute_mac(Self::VERSION, type_tag, source, timestamp, &payload, secret);
        Self {
            version: Self::VERSION,
            type_tag: type_tag.to_owned(),
            source: source.to_owned(),
            timestamp,
            payload,
            mac,
        }
    }

    /// Verifies version, MAC, and freshness, in that order. Returns the
    /// payload on success.
    pub fn open(&self, secret: &[u8], now: UnixTime, max_skew_ms: u64) -> Result<&[u8], EnvelopeError> {
        if self.version != Self::VERSION {
            return Err(EnvelopeError::UnknownVersion(self.version));
        }
        let expected = Self::compute_mac(
            self.version,
            &self.type_tag,
            &self.source,
            self.timestamp,
            &self.payload,
            secret,
        );
        if !constant_time_eq(&expected, &self.mac) {
            return Err(EnvelopeError::BadMac);
        }
        let age_ms = now.saturating_sub(self.timestamp);
        if age_ms > max_skew_ms {
            return Err(EnvelopeError::Stale { age_ms });
        }
        Ok(&self.payload)
    }

    /// HMAC-SHA256 over version || type_tag || source || timestamp || payload.
    /// Variable-length fields are length-prefixed so field boundaries cannot
    /// be shifted without invalidating the MAC.
    fn compute_mac(
        version: u16,
        type_tag: &str,
        source: &str,
        timestamp: UnixTime,
        payload: &[u8],
        secret: &[u8],
    ) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(&version.to_le_bytes());
        mac.update(&(type_tag.len() as u32).to_le_bytes());
        mac.update(type_tag.as_bytes());
        mac.update(&(source.len() as u32).to_le_bytes());
        mac.update(source.as_bytes());
        mac.update(&timestamp.to_le_bytes());
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use crate::envelope::{Envelope, EnvelopeError};

    const SECRET: &[u8] = b"shared-secret";

    #[test]
    fn round_trip() {
        let envelope = Envelope::seal("LineReceived", "gateway-1", 5_000, vec![1, 2, 3], SECRET);
        assert_eq!(envelope.open(SECRET, 5_100, 10_000).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn tampered_payload_rejected() {
        let mut envelope = Envelope::seal("LineReceived", "gateway-1", 5_000, vec![1, 2, 3], SECRET);
        envelope.payload[0] ^= 0xff;
        assert_eq!(
            envelope.open(SECRET, 5_100, 10_000),
            Err(EnvelopeError::BadMac)
        );
    }

    #[test]
    fn tampered_header_rejected() {
        let mut envelope = Envelope::seal("LineReceived", "gateway-1", 5_000, vec![1, 2, 3], SECRET);
        envelope.source = "gateway-2".to_owned();
        assert_eq!(
            envelope.open(SECRET, 5_100, 10_000),
            Err(EnvelopeError::BadMac)
        );
    }

    #[test]
    fn wrong_secret_rejected() {
        let envelope = Envelope::seal("LineReceived", "gateway-1", 5_000, vec![1, 2, 3], SECRET);
        assert_eq!(
            envelope.open(b"other", 5_100, 10_000),
            Err(EnvelopeError::BadMac)
        );
    }

    #[test]
    fn unknown_version_fails_closed() {
        let mut envelope = Envelope::seal("LineReceived", "gateway-1", 5_000, vec![], SECRET);
        envelope.version = 2;
        assert_eq!(
            envelope.open(SECRET, 5_100, 10_000),
            Err(EnvelopeError::UnknownVersion(2))
        );
    }

    #[test]
    fn stale_rejected() {
        let envelope = Envelope::seal("LineReceived", "gateway-1", 5_000, vec![], SECRET);
        assert_eq!(
            envelope.open(SECRET, 20_001, 15_000),
            Err(EnvelopeError::Stale { age_ms: 15_001 })
        );
    }
}
