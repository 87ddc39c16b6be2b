use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(StreamId);
id_newtype!(MessageId);
id_newtype!(ParticipantId);

impl MessageId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Public,
    PasswordProtected,
    Native,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Public => "public",
            ChannelKind::PasswordProtected => "password_protected",
            ChannelKind::Native => "native",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "public" => Some(ChannelKind::Public),
            "password_protected" => Some(ChannelKind::PasswordProtected),
            "native" => Some(ChannelKind::Native),
            _ => None,
        }
    }
}

/// Integer sender-authenticity classification carried on verified messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrustLevel(pub u8);

impl TrustLevel {
    pub const UNKNOWN: TrustLevel = TrustLevel(0);
    pub const SIGNED: TrustLevel = TrustLevel(1);
    pub const NAME_VERIFIED: TrustLevel = TrustLevel(2);
    pub const CONTACT: TrustLevel = TrustLevel(3);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}
