use std::{fmt, str::FromStr};

use uuid::Uuid;

use crate::Error;

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

/// Reference to an image held by the blob store
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(transparent)]
pub struct BlobId(pub Uuid);

/// Handles allowed to use the `0000` discriminator
const PROTECTED_HANDLES: &[&str] = &["system", "deleted"];

const HANDLE_MIN_LEN: usize = 2;
const HANDLE_MAX_LEN: usize = 32;

/// A `handle#dddd` user name
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Username {
    handle: String,
    discriminator: u16,
}

impl Username {
    pub fn new(handle: &str, discriminator: u16) -> Result<Username, Error> {
        let res = Username {
            handle: String::from(handle),
            discriminator,
        };
        if !res.is_valid() {
            return Err(Error::InvalidName(res.to_string()));
        }
        Ok(res)
    }

    /// Handle shown in place of accounts that no longer exist
    pub fn deleted() -> Username {
        Username {
            handle: String::from("deleted"),
            discriminator: 0,
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn discriminator(&self) -> u16 {
        self.discriminator
    }

    fn is_valid(&self) -> bool {
        let len = self.handle.chars().count();
        let handle_ok = (HANDLE_MIN_LEN..=HANDLE_MAX_LEN).contains(&len)
            && !self.handle.starts_with(' ')
            && !self.handle.ends_with(' ')
            && self
                .handle
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-' | '.'));
        let discriminator_ok = match self.discriminator {
            0 => PROTECTED_HANDLES.contains(&self.handle.as_str()),
            d => d <= 9999,
        };
        handle_ok && discriminator_ok
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:04}", self.handle, self.discriminator)
    }
}

impl FromStr for Username {
    type Err = Error;

    fn from_str(s: &str) -> Result<Username, Error> {
        let invalid = || Error::InvalidName(String::from(s));
        let (handle, discriminator) = s.rsplit_once('#').ok_or_else(invalid)?;
        if discriminator.len() != 4 || !discriminator.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let discriminator = discriminator.parse().map_err(|_| invalid())?;
        Username::new(handle, discriminator).map_err(|_| invalid())
    }
}

impl serde::Serialize for Username {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Username {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Username, D::Error> {
        let s = String::deserialize(deserializer)?;
        Username::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A user, as known by the user directory
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct User {
    pub id: UserId,
    pub display_name: Option<String>,
    pub pronouns: Option<String>,
    pub username: Username,
    pub avatar: Option<BlobId>,
}

/// Summary of a user, embedded in every comment they posted
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentUser {
    pub id: UserId,
    #[serde(rename = "name", default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pronouns: String,
    pub username: Username,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<BlobId>,
}

impl CommentUser {
    pub const DELETED_NAME: &'static str = "Deleted";

    /// Summary shown for accounts that are gone and for deleted comments
    pub fn ghost(id: UserId) -> CommentUser {
        CommentUser {
            id,
            display_name: String::from(Self::DELETED_NAME),
            pronouns: String::new(),
            username: Username::deleted(),
            avatar: None,
        }
    }

    /// Builds the summary from the live user record, `None` meaning the account
    /// no longer exists
    pub fn resolve(id: UserId, user: Option<&User>) -> CommentUser {
        let user = match user {
            None => return CommentUser::ghost(id),
            Some(u) => u,
        };
        let display_name = match &user.display_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => String::from(user.username.handle()),
        };
        CommentUser {
            id,
            display_name,
            pronouns: user.pronouns.clone().unwrap_or_default(),
            username: user.username.clone(),
            avatar: user.avatar,
        }
    }
}
