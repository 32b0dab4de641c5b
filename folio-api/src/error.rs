use std::{fmt, str::FromStr};

use anyhow::{anyhow, Context};
use serde_json::json;
use uuid::Uuid;

/// Structural rule a comment write would have broken
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Invariant {
    /// Both a rating and a parent were set
    RatingAndParent,

    /// Neither a rating nor a parent was set
    NeitherRatingNorParent,

    /// The poster already has a live review of this book
    DuplicateReview,

    RatingOutOfRange,

    /// The parent comment belongs to another book
    ParentOnOtherBook,
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Invariant::RatingAndParent => "a comment cannot have both a rating and a parent",
            Invariant::NeitherRatingNorParent => "a comment needs either a rating or a parent",
            Invariant::DuplicateReview => "only one review per user and book",
            Invariant::RatingOutOfRange => "rating out of range",
            Invariant::ParentOnOtherBook => "parent comment is about another book",
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImmutableField {
    Book,
    Poster,
    Parent,
    Date,
}

impl fmt::Display for ImmutableField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImmutableField::Book => "bookID",
            ImmutableField::Poster => "poster",
            ImmutableField::Parent => "parent",
            ImmutableField::Date => "date",
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Not found {0}")]
    NotFound(Uuid),

    #[error("Comment {0} is invalid: {1}")]
    InvalidInvariant(Uuid, Invariant),

    #[error("Comment {0} cannot have its {1} changed")]
    ImmutableFieldViolation(Uuid, ImmutableField),

    #[error("Conflict while committing changes to {0}")]
    ConflictDuringCommit(Uuid),

    #[error("Comment {0} is deleted")]
    Deleted(Uuid),

    #[error("Uuid already used {0}")]
    UuidAlreadyUsed(Uuid),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),

    #[error("Invalid username {0:?}")]
    InvalidName(String),
}

impl Error {
    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "message": msg,
                "type": "unknown",
            }),
            Error::NotFound(u) => json!({
                "message": "not found",
                "type": "not-found",
                "uuid": u,
            }),
            Error::InvalidInvariant(u, inv) => json!({
                "message": inv.to_string(),
                "type": "invalid-invariant",
                "uuid": u,
                "invariant": inv,
            }),
            Error::ImmutableFieldViolation(u, field) => json!({
                "message": "attempted to change an immutable field",
                "type": "immutable-field",
                "uuid": u,
                "field": field,
            }),
            Error::ConflictDuringCommit(u) => json!({
                "message": "concurrent modification, try again",
                "type": "conflict-commit",
                "uuid": u,
            }),
            Error::Deleted(u) => json!({
                "message": "comment is deleted",
                "type": "deleted",
                "uuid": u,
            }),
            Error::UuidAlreadyUsed(u) => json!({
                "message": "uuid conflict",
                "type": "conflict-uuid",
                "uuid": u,
            }),
            Error::NullByteInString(s) => json!({
                "message": "there was a null byte in argument string",
                "type": "null-byte",
                "string": s,
            }),
            Error::InvalidName(n) => json!({
                "message": "there was an invalid character in a user name",
                "type": "invalid-name",
                "name": n,
            }),
        })
        .expect("serializing error contents")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let uuid = || -> anyhow::Result<Uuid> {
            data.get("uuid")
                .and_then(|uuid| uuid.as_str())
                .and_then(|uuid| Uuid::from_str(uuid).ok())
                .ok_or_else(|| anyhow!("error has no proper uuid"))
        };
        let string = |field: &str| -> anyhow::Result<String> {
            data.get(field)
                .and_then(|s| s.as_str())
                .map(String::from)
                .ok_or_else(|| anyhow!("error has no {field} string"))
        };
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(String::from(
                    data.get("message")
                        .and_then(|msg| msg.as_str())
                        .unwrap_or(""),
                )),
                "not-found" => Error::NotFound(uuid()?),
                "invalid-invariant" => Error::InvalidInvariant(
                    uuid()?,
                    serde_json::from_value(data.get("invariant").cloned().unwrap_or_default())
                        .context("parsing violated invariant")?,
                ),
                "immutable-field" => Error::ImmutableFieldViolation(
                    uuid()?,
                    serde_json::from_value(data.get("field").cloned().unwrap_or_default())
                        .context("parsing immutable field")?,
                ),
                "conflict-commit" => Error::ConflictDuringCommit(uuid()?),
                "deleted" => Error::Deleted(uuid()?),
                "conflict-uuid" => Error::UuidAlreadyUsed(uuid()?),
                "null-byte" => Error::NullByteInString(string("string")?),
                "invalid-name" => Error::InvalidName(string("name")?),
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}

/// Error returned by store operations: either something the caller did wrong,
/// or a failure of the backing store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Backend(#[from] anyhow::Error),

    #[error(transparent)]
    Api(#[from] Error),
}

impl StoreError {
    pub fn not_found(uuid: Uuid) -> StoreError {
        StoreError::Api(Error::NotFound(uuid))
    }

    pub fn invalid(uuid: Uuid, invariant: Invariant) -> StoreError {
        StoreError::Api(Error::InvalidInvariant(uuid, invariant))
    }

    pub fn conflict(uuid: Uuid) -> StoreError {
        StoreError::Api(Error::ConflictDuringCommit(uuid))
    }

    pub fn deleted(uuid: Uuid) -> StoreError {
        StoreError::Api(Error::Deleted(uuid))
    }

    pub fn uuid_already_used(uuid: Uuid) -> StoreError {
        StoreError::Api(Error::UuidAlreadyUsed(uuid))
    }

    /// Collapse into the caller-facing error, logging backend failures
    pub fn into_api(self) -> Error {
        match self {
            StoreError::Backend(err) => {
                tracing::error!(?err, "backing store failure");
                #[cfg(not(test))]
                let err = Error::Unknown(String::from("Internal error, see logs for details"));
                #[cfg(test)]
                let err = Error::Unknown(format!("Internal error: {err:?}"));
                err
            }
            StoreError::Api(err) => {
                tracing::info!("returning error to caller: {err}");
                err
            }
        }
    }
}
