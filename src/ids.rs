//! # Opaque identifiers
//!
//! All cross-component identifiers are opaque tokens with a fixed prefix:
//! `wkr_<hex>` (worker), `lse_<hex>` (lease, hex length >= 8), `run_<16 hex>`
//! (run, zero-padded), `evt_<hex>` (stream event). Callers must treat them as
//! opaque — construction and the regex `matches()` check are the only
//! supported operations on the string form.

use rand::RngCore;
use std::fmt;

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

macro_rules! opaque_id {
    ($name:ident, $prefix:expr, $hex_bytes:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh, globally-unique (within process lifetime) ID.
            pub fn new() -> Self {
                Self(format!("{}{}", $prefix, random_hex($hex_bytes)))
            }

            /// Wrap a pre-existing token (e.g. received over the wire) without
            /// validating its shape. Prefer [`Self::parse`] at trust boundaries.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Validate that `s` matches this ID's expected prefix/shape.
            pub fn parse(s: impl Into<String>) -> Option<Self> {
                let s = s.into();
                if s.starts_with($prefix) && s.len() > $prefix.len() {
                    Some(Self(s))
                } else {
                    None
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

opaque_id!(WorkerId, "wkr_", 8);
opaque_id!(LeaseId, "lse_", 8);
opaque_id!(EventId, "evt_", 8);

/// `run_<16 hex>` — a run ID is always 16 zero-padded hex digits, matching
/// the wire format observed in the control-plane's HTTP contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct RunId(String);

impl RunId {
    pub fn new() -> Self {
        let mut buf = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut buf);
        let n = u64::from_be_bytes(buf);
        Self(format!("run_{n:016x}"))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stage identifiers are caller-defined small strings (e.g. "ramp", "steady");
/// the core treats them as opaque equality keys.
pub type StageId = String;
