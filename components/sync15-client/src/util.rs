/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::fmt;
use std::num::ParseFloatError;
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer, Visitor};
use serde::ser::{Serialize, Serializer};

/// Typesafe way to manage server timestamps without accidentally mixing them
/// up with local ones. Stored as seconds since the unix epoch, the unit the
/// storage servers speak.
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd, Default)]
pub struct ServerTimestamp(pub f64);

pub const SERVER_EPOCH: ServerTimestamp = ServerTimestamp(0.0);

impl ServerTimestamp {
    /// Round up to whole seconds, the granularity records remember their
    /// server modification time with.
    pub fn ceil_secs(self) -> ServerTimestamp {
        ServerTimestamp(self.0.ceil())
    }
}

impl From<f64> for ServerTimestamp {
    #[inline]
    fn from(ts: f64) -> Self {
        ServerTimestamp(ts)
    }
}

// This lets us use ServerTimestamp in hyper header! blocks.
impl FromStr for ServerTimestamp {
    type Err = ParseFloatError;
    fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
        let val = f64::from_str(s)?;
        Ok(ServerTimestamp(val))
    }
}

impl fmt::Display for ServerTimestamp {
    /// Two decimal places, the format the `X-If-*-Since` headers and the
    /// `newer` query parameter expect.
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl Serialize for ServerTimestamp {
    fn serialize<S>(&self, serializer: S) -> ::std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(self.0)
    }
}

impl<'de> Deserialize<'de> for ServerTimestamp {
    fn deserialize<D>(deserializer: D) -> ::std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TimestampVisitor;

        impl<'de> Visitor<'de> for TimestampVisitor {
            type Value = ServerTimestamp;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a 64 bit float number value")
            }

            fn visit_f64<E>(self, value: f64) -> ::std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(ServerTimestamp(value))
            }

            fn visit_u64<E>(self, value: u64) -> ::std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(ServerTimestamp(value as f64))
            }

            fn visit_i64<E>(self, value: i64) -> ::std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(ServerTimestamp(value as f64))
            }
        }

        deserializer.deserialize_f64(TimestampVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_two_decimals() {
        assert_eq!(format!("{}", ServerTimestamp(123.456)), "123.46");
        assert_eq!(format!("{}", SERVER_EPOCH), "0.00");
        assert_eq!(format!("{}", ServerTimestamp(1234.5)), "1234.50");
    }

    #[test]
    fn test_from_str() {
        assert_eq!(
            "1234.56".parse::<ServerTimestamp>().unwrap(),
            ServerTimestamp(1234.56)
        );
        assert!("twelve".parse::<ServerTimestamp>().is_err());
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ServerTimestamp(12.01).ceil_secs(), ServerTimestamp(13.0));
        assert_eq!(ServerTimestamp(12.0).ceil_secs(), ServerTimestamp(12.0));
    }

    #[test]
    fn test_serde() {
        let ts = ServerTimestamp(123.456);
        let ser = ::serde_json::to_string(&ts).unwrap();
        assert_eq!(ser, "123.456");
        let got: ServerTimestamp = ::serde_json::from_str(&ser).unwrap();
        assert_eq!(got, ts);
    }
}
