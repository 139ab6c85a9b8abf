pub mod account;
pub mod baker;
pub mod blockchain;
pub mod contracts;
pub mod delegation;
pub mod parameters;

use std::{fmt, str::FromStr};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Account index assigned by the chain on account creation. Doubles as the
/// row id of the account projection.
pub type AccountId = i64;

/// Baker id. Always equal to the id of the owning account.
pub type BakerId = i64;

pub type BlockHeight = u64;

pub type TransactionIndex = u64;

/// An amount of micro-CCD.
pub type Amount = u64;

/// A signed micro-CCD adjustment.
pub type AmountDelta = i64;

pub const ADDRESS_BYTES: usize = 32;

/// Number of trailing address bytes that carry alias information. Two
/// addresses are aliases of the same account iff they agree on the leading
/// `ADDRESS_BYTES - ALIAS_BYTES` bytes.
pub const ALIAS_BYTES: usize = 3;

#[derive(Error, Debug, PartialEq)]
#[error("invalid {0} literal: {1}")]
pub struct ParseBytesError(&'static str, String);

macro_rules! hex_newtype {
    ($name:ident, $size:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $size]);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(0x{})", stringify!($name), hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = ParseBytesError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(raw)
                    .map_err(|_| ParseBytesError(stringify!($name), s.to_string()))?;
                let arr: [u8; $size] = bytes
                    .try_into()
                    .map_err(|_| ParseBytesError(stringify!($name), s.to_string()))?;
                Ok(Self(arr))
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

hex_newtype!(AccountAddress, ADDRESS_BYTES);
hex_newtype!(CanonicalAccountAddress, ADDRESS_BYTES);
hex_newtype!(BlockHash, 32);
hex_newtype!(TxHash, 32);

impl AccountAddress {
    /// Maps any alias of an account to its canonical base address by zeroing
    /// the trailing alias bytes. Pure, no I/O.
    pub fn canonical(&self) -> CanonicalAccountAddress {
        let mut bytes = self.0;
        for b in bytes[ADDRESS_BYTES - ALIAS_BYTES..].iter_mut() {
            *b = 0;
        }
        CanonicalAccountAddress(bytes)
    }

    pub fn is_alias_of(&self, other: &AccountAddress) -> bool {
        self.canonical() == other.canonical()
    }
}

impl From<CanonicalAccountAddress> for AccountAddress {
    fn from(value: CanonicalAccountAddress) -> Self {
        AccountAddress(value.0)
    }
}

/// A chain fraction in parts per hundred thousand. Exact equality and
/// ordering, unlike a float representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Commission(pub u32);

impl Commission {
    pub const HUNDRED_PERCENT: Commission = Commission(100_000);
}

impl fmt::Display for Commission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}%", self.0 as f64 / 1_000.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub numerator: u64,
    pub denominator: u64,
}

/// The singleton import checkpoint. One row, mutated once per imported
/// block, read by nearly every pipeline component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportState {
    pub genesis_block_hash: BlockHash,
    pub max_imported_block_height: BlockHeight,
    pub last_block_slot_time: NaiveDateTime,
    /// Highest block height whose finalization time has been applied. `None`
    /// until the first finalization proof is processed; backfill then covers
    /// everything from genesis.
    pub max_height_with_finalization_time: Option<BlockHeight>,
    pub latest_chain_parameters_version: Option<i64>,
    pub total_baker_count: u64,
    pub epoch_duration_millis: i64,
    /// Slot time at or after which the next payday boundary falls. `None` on
    /// protocol versions without paydays.
    pub next_payday_time: Option<NaiveDateTime>,
}
