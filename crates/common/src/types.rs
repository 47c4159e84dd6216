//! Identifier newtypes and version counters shared across the pipeline.

use std::{
    fmt,
    str::FromStr,
};

use serde::{
    Deserialize,
    Serialize,
};

macro_rules! id_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(
            Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_type!(
    /// Identifies one client (one tab's sync instance).
    ClientId
);
id_type!(
    /// Identifies the set of clients sharing one CVR, typically one browser
    /// profile on one origin.
    ClientGroupId
);
id_type!(
    /// Stable fingerprint of a query as the client described it, before
    /// transformation.
    QueryHash
);
id_type!(
    /// Stable fingerprint of a query after transformation and permission
    /// rewrite. Pipelines are keyed by this, never by [`QueryHash`].
    TransformationHash
);
id_type!(
    /// Identifies one WebSocket connection within a client's lifetime.
    WsId
);
id_type!(
    /// The authenticated user on whose behalf a connection acts.
    UserId
);

/// Monotonic version of the replicated data, read from the replication
/// state table.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ReplicaVersion(pub u64);

impl ReplicaVersion {
    pub const MIN: ReplicaVersion = ReplicaVersion(0);
}

impl fmt::Display for ReplicaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CVR version: the major component tracks the replica version the CVR was
/// last advanced to; the minor component counts metadata-only changes
/// (desired-query patches) in between. Totally ordered, strictly monotonic
/// per client group; its string form is the poke cookie.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CvrVersion {
    pub major: u64,
    pub minor: u64,
}

impl CvrVersion {
    pub fn initial() -> Self {
        Self { major: 0, minor: 0 }
    }

    /// Bump to a new replica version; resets the minor counter.
    pub fn advance_major(self, major: u64) -> Self {
        Self { major, minor: 0 }
    }

    /// Metadata-only bump within the same replica version.
    pub fn advance_minor(self) -> Self {
        Self {
            major: self.major,
            minor: self.minor + 1,
        }
    }

    pub fn cookie(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CvrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.major, self.minor)
    }
}

impl FromStr for CvrVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major_s, minor_s) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("Invalid CVR version {s}"))?;
        Ok(Self {
            major: u64::from_str_radix(major_s, 16)?,
            minor: u64::from_str_radix(minor_s, 16)?,
        })
    }
}

impl Serialize for CvrVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CvrVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A mutation's identity: the client that issued it plus its client-local
/// sequence number.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationId {
    pub client_id: ClientId,
    pub id: u64,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{
        ClientId,
        CvrVersion,
    };

    #[test]
    fn test_cvr_version_ordering() {
        let v0 = CvrVersion { major: 1, minor: 5 };
        let v1 = CvrVersion { major: 2, minor: 0 };
        assert!(v0 < v1);
        assert!(v0.advance_minor() < v1);
        assert_eq!(v1, v0.advance_major(2));
    }

    #[test]
    fn test_cookie_roundtrip() {
        let v = CvrVersion {
            major: 0x2af,
            minor: 3,
        };
        assert_eq!(v.cookie(), "2af:3");
        let parsed: CvrVersion = v.cookie().parse().unwrap();
        assert_eq!(parsed, v);
    }

    #[test]
    fn test_cookie_ordering_is_version_ordering() {
        // Cookies are opaque to clients; only the server orders them.
        let low = CvrVersion { major: 9, minor: 0 };
        let high = CvrVersion {
            major: 16,
            minor: 0,
        };
        assert!(low < high);
        let lp: CvrVersion = low.cookie().parse().unwrap();
        let hp: CvrVersion = high.cookie().parse().unwrap();
        assert!(lp < hp);
    }

    #[test]
    fn test_id_display() {
        let c = ClientId::from("c1");
        assert_eq!(c.to_string(), "c1");
        assert_eq!(c.as_str(), "c1");
    }
}
