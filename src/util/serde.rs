//! Serde helpers for durations expressed as fractional seconds.
//!
//! Configuration files and pool snapshots carry timeouts as plain numbers
//! (`"hard_timeout": 10` or `2.5`) rather than serde's default
//! `{ secs, nanos }` representation.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

fn from_secs<E: serde::de::Error>(secs: f64) -> Result<Duration, E> {
    Duration::try_from_secs_f64(secs).map_err(|e| E::custom(format!("invalid duration {secs}: {e}")))
}

/// `Duration` as seconds.
pub mod secs {
    use super::{from_secs, Deserialize, Deserializer, Duration, Serializer};

    /// Serialize a duration as fractional seconds.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    /// Deserialize fractional seconds into a duration.
    ///
    /// # Errors
    ///
    /// Fails on negative, non-finite or non-numeric input.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        from_secs(f64::deserialize(deserializer)?)
    }
}

/// `Option<Duration>` as optional seconds.
pub mod opt_secs {
    use super::{from_secs, Deserialize, Deserializer, Duration, Serializer};

    /// Serialize an optional duration as fractional seconds or `null`.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize optional fractional seconds.
    ///
    /// # Errors
    ///
    /// Fails on negative, non-finite or non-numeric input.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(from_secs)
            .transpose()
    }
}
