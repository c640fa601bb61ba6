//! Common types used throughout the Courier system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type for message headers, expiration and scheduled delivery.
pub type Timestamp = DateTime<Utc>;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $repr:ty) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub $repr);

        impl $name {
            /// Create a new identifier from its raw value.
            #[must_use]
            pub const fn new(value: $repr) -> Self {
                Self(value)
            }

            /// Get the raw identifier value.
            #[must_use]
            pub const fn value(self) -> $repr {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$repr> for $name {
            fn from(value: $repr) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a broker node within a cluster.
    ServerId,
    u32
);
numeric_id!(
    /// Server-assigned identifier of a connection endpoint.
    ConnectionId,
    u64
);
numeric_id!(
    /// Server-assigned identifier of a session endpoint.
    SessionId,
    u64
);
numeric_id!(
    /// Server-assigned identifier of a consumer endpoint. Changes across failover.
    ConsumerId,
    u64
);
numeric_id!(
    /// Server-assigned identifier of a producer endpoint.
    ProducerId,
    u64
);
numeric_id!(
    /// Server-assigned identifier of a browser endpoint.
    BrowserId,
    u64
);
numeric_id!(
    /// Runtime identifier of a channel (a queue or one topic subscription).
    ChannelId,
    u64
);

/// Acknowledgement mode of a non-transacted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AckMode {
    /// Every successful receive is acknowledged immediately.
    #[default]
    AutoAcknowledge,
    /// Acknowledged per message; duplicates are tolerated by the application.
    DupsOkAcknowledge,
    /// Acknowledgements are buffered until the application acknowledges the session.
    ClientAcknowledge,
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AckMode::AutoAcknowledge => "AUTO_ACKNOWLEDGE",
            AckMode::DupsOkAcknowledge => "DUPS_OK_ACKNOWLEDGE",
            AckMode::ClientAcknowledge => "CLIENT_ACKNOWLEDGE",
        };
        f.write_str(name)
    }
}

/// Global transaction branch identifier used by two-phase commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    /// Format identifier chosen by the transaction manager.
    pub format_id: i32,
    /// Global transaction id.
    pub global_transaction_id: Vec<u8>,
    /// Branch qualifier.
    pub branch_qualifier: Vec<u8>,
}

impl Xid {
    /// Create an xid from its three components.
    #[must_use]
    pub fn new(format_id: i32, global_transaction_id: Vec<u8>, branch_qualifier: Vec<u8>) -> Self {
        Self { format_id, global_transaction_id, branch_qualifier }
    }

    /// Generate a fresh xid with a random global transaction id and an empty branch.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(0, uuid::Uuid::new_v4().as_bytes().to_vec(), Vec::new())
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        for byte in &self.global_transaction_id {
            write!(f, "{byte:02x}")?;
        }
        f.write_str(":")?;
        for byte in &self.branch_qualifier {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_id_roundtrip() {
        let id = ConsumerId::new(42);
        assert_eq!(id.value(), 42);
        assert_eq!(ConsumerId::from(42), id);
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn test_xid_display_and_equality() {
        let xid = Xid::new(7, vec![0xab, 0x01], vec![0x02]);
        assert_eq!(xid.to_string(), "7:ab01:02");
        assert_eq!(xid, Xid::new(7, vec![0xab, 0x01], vec![0x02]));
        assert_ne!(xid, Xid::new(7, vec![0xab, 0x01], vec![0x03]));
    }

    #[test]
    fn test_generated_xids_are_unique() {
        assert_ne!(Xid::generate(), Xid::generate());
    }

    #[test]
    fn test_ack_mode_default() {
        assert_eq!(AckMode::default(), AckMode::AutoAcknowledge);
        assert_eq!(AckMode::ClientAcknowledge.to_string(), "CLIENT_ACKNOWLEDGE");
    }
}
