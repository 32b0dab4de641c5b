use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};

use crate::{BookId, Comment, CommentId, NewComment, StoreError, Time, User, UserId};

/// Source of the current time for stores
pub trait Clock: Send + Sync {
    fn now(&self) -> Time;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    /// Truncated to the microsecond, the precision of postgres timestamps
    fn now(&self) -> Time {
        Utc::now().trunc_subsecs(6)
    }
}

/// The live user directory, owned by the account system
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Returns `None` if the user does not exist (anymore)
    async fn get_user(&self, id: UserId) -> anyhow::Result<Option<User>>;

    async fn get_users(&self, ids: &[UserId]) -> anyhow::Result<HashMap<UserId, User>> {
        let mut res = HashMap::with_capacity(ids.len());
        for id in ids {
            if res.contains_key(id) {
                continue;
            }
            if let Some(u) = self.get_user(*id).await? {
                res.insert(*id, u);
            }
        }
        Ok(res)
    }
}

#[async_trait]
pub trait BookCatalog: Send + Sync {
    async fn book_exists(&self, id: BookId) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait CommentManager: Send + Sync {
    /// Posts a comment, along with its poster's upvote
    async fn create(&self, c: NewComment) -> Result<Comment, StoreError>;

    async fn get_by_id(&self, id: CommentId) -> Result<Comment, StoreError>;

    /// All the comments of a book, replies and deleted ones included
    async fn book_comments(&self, book: BookId) -> Result<Vec<Comment>, StoreError>;

    /// Stores the new body and rating of `c`, returning the updated comment
    async fn update(&self, c: Comment) -> Result<Comment, StoreError>;

    async fn delete(&self, id: CommentId) -> Result<(), StoreError>;
}

#[async_trait]
pub trait VoteManager: Send + Sync {
    /// Records `user`'s vote on `comment` and returns the new tally. Any
    /// positive value is an upvote, any negative one a downvote, and 0 takes
    /// the vote back.
    async fn vote(&self, user: UserId, comment: CommentId, value: i64) -> Result<i64, StoreError>;

    /// One entry per requested comment, 0 meaning no vote
    async fn voted(
        &self,
        user: UserId,
        comments: &[CommentId],
    ) -> Result<HashMap<CommentId, i8>, StoreError>;

    async fn user_votes(&self, user: UserId) -> Result<HashMap<CommentId, i8>, StoreError>;
}
