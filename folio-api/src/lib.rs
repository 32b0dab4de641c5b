use chrono::Utc;

mod book;
pub use book::BookId;

mod comment;
pub use comment::{edited_at, Comment, CommentId, NewComment, Rating, Thread, GRACE_PERIOD_SECS};

mod db;
pub use db::{BookCatalog, Clock, CommentManager, SystemClock, UserDirectory, VoteManager};

mod error;
pub use error::{Error, ImmutableField, Invariant, StoreError};

mod user;
pub use user::{BlobId, CommentUser, User, UserId, Username};

mod vote;
pub use vote::Vote;

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

/// Postgres refuses null bytes in TEXT columns, so every user-provided string
/// goes through here before reaching a store.
pub fn validate_string(s: &str) -> Result<(), Error> {
    if s.contains('\0') {
        return Err(Error::NullByteInString(String::from(s)));
    }
    Ok(())
}
