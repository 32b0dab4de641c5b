use std::collections::{HashMap, HashSet};

use chrono::Duration;
use uuid::Uuid;

use crate::{BookId, CommentUser, Error, ImmutableField, Invariant, Time, UserId};

/// Changes made within this many seconds after posting are not flagged as edits
pub const GRACE_PERIOD_SECS: i64 = 5 * 60;

/// The modification date to surface, if `modified` is past the grace period
pub fn edited_at(created: Time, modified: Time) -> Option<Time> {
    (modified > created + Duration::seconds(GRACE_PERIOD_SECS)).then_some(modified)
}

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(transparent)]
pub struct CommentId(pub Uuid);

/// Star rating of a review, in half-star steps from 0.5 to 5
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct Rating(pub f32);

impl Rating {
    pub const MIN: f32 = 0.5;
    pub const MAX: f32 = 5.0;

    pub fn is_valid(&self) -> bool {
        self.0.is_finite() && (Self::MIN..=Self::MAX).contains(&self.0)
    }
}

fn check_exclusive(
    id: CommentId,
    rating: Option<Rating>,
    parent_id: Option<CommentId>,
) -> Result<(), Error> {
    match (rating, parent_id) {
        (Some(_), Some(_)) => Err(Error::InvalidInvariant(id.0, Invariant::RatingAndParent)),
        (None, None) => Err(Error::InvalidInvariant(
            id.0,
            Invariant::NeitherRatingNorParent,
        )),
        (Some(r), None) if !r.is_valid() => {
            Err(Error::InvalidInvariant(id.0, Invariant::RatingOutOfRange))
        }
        _ => Ok(()),
    }
}

/// A comment about to be posted, either a review or a reply
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewComment {
    pub id: CommentId,
    pub book_id: BookId,
    pub poster_id: UserId,
    pub body: String,
    pub rating: Option<Rating>,
    pub parent_id: Option<CommentId>,
}

impl NewComment {
    pub fn review(book_id: BookId, poster_id: UserId, body: String, rating: Rating) -> NewComment {
        NewComment {
            id: CommentId(Uuid::new_v4()),
            book_id,
            poster_id,
            body,
            rating: Some(rating),
            parent_id: None,
        }
    }

    pub fn reply(
        book_id: BookId,
        poster_id: UserId,
        body: String,
        parent_id: CommentId,
    ) -> NewComment {
        NewComment {
            id: CommentId(Uuid::new_v4()),
            book_id,
            poster_id,
            body,
            rating: None,
            parent_id: Some(parent_id),
        }
    }

    /// Checks everything that does not require looking at other comments
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.body)?;
        check_exclusive(self.id, self.rating, self.parent_id)
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub body: String,
    #[serde(rename = "bookID")]
    pub book_id: BookId,
    /// Creation date
    pub date: Time,
    pub poster: CommentUser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<Rating>,
    #[serde(rename = "parent", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CommentId>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(rename = "edited", default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<Time>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub votes: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl Comment {
    pub fn is_review(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Checks that `updated` is an acceptable new version of `self`, the
    /// currently stored comment
    pub fn check_update(&self, updated: &Comment) -> Result<(), Error> {
        let immutable = |field| Error::ImmutableFieldViolation(self.id.0, field);
        if updated.book_id != self.book_id {
            return Err(immutable(ImmutableField::Book));
        }
        if updated.poster.id != self.poster.id {
            return Err(immutable(ImmutableField::Poster));
        }
        if updated.parent_id != self.parent_id {
            return Err(immutable(ImmutableField::Parent));
        }
        if updated.date != self.date {
            return Err(immutable(ImmutableField::Date));
        }
        crate::validate_string(&updated.body)?;
        if self.is_review() {
            // replies keep no rating whatever the caller sent
            check_exclusive(self.id, updated.rating, None)?;
        }
        Ok(())
    }
}

/// A comment along with the replies it received
///
/// Building, counting and dropping work at any depth. The derived impls
/// recurse once per level.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Thread {
    pub comment: Comment,
    pub replies: Vec<Thread>,
}

impl Thread {
    /// Groups a flat listing of comments into reply trees, oldest first.
    ///
    /// Replies whose parent is not part of the listing become roots.
    pub fn build(mut comments: Vec<Comment>) -> Vec<Thread> {
        comments.sort_by(|a, b| (a.date, a.id).cmp(&(b.date, b.id)));
        let known = comments.iter().map(|c| c.id).collect::<HashSet<_>>();
        let mut roots = Vec::new();
        let mut children = HashMap::<CommentId, Vec<Comment>>::new();
        for c in comments {
            match c.parent_id {
                Some(p) if known.contains(&p) => children.entry(p).or_default().push(c),
                _ => roots.push(c),
            }
        }
        roots
            .into_iter()
            .map(|c| Thread::attach(c, &mut children))
            .collect()
    }

    fn attach(root: Comment, children: &mut HashMap<CommentId, Vec<Comment>>) -> Thread {
        // explicit stack, reply chains have no depth limit
        let mut ancestors = Vec::new();
        let mut current = PendingThread::open(root, children);
        loop {
            match current.todo.next() {
                Some(reply) => {
                    let reply = PendingThread::open(reply, children);
                    ancestors.push(std::mem::replace(&mut current, reply));
                }
                None => {
                    let done = Thread {
                        comment: current.comment,
                        replies: current.replies,
                    };
                    match ancestors.pop() {
                        Some(parent) => {
                            current = parent;
                            current.replies.push(done);
                        }
                        None => return done,
                    }
                }
            }
        }
    }

    /// Number of comments in this thread, including its root
    pub fn len(&self) -> usize {
        let mut res = 0;
        let mut todo = vec![self];
        while let Some(t) = todo.pop() {
            res += 1;
            todo.extend(&t.replies);
        }
        res
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        let mut todo = std::mem::take(&mut self.replies);
        while let Some(mut t) = todo.pop() {
            todo.append(&mut t.replies);
        }
    }
}

struct PendingThread {
    comment: Comment,
    todo: std::vec::IntoIter<Comment>,
    replies: Vec<Thread>,
}

impl PendingThread {
    fn open(comment: Comment, children: &mut HashMap<CommentId, Vec<Comment>>) -> PendingThread {
        PendingThread {
            todo: children.remove(&comment.id).unwrap_or_default().into_iter(),
            comment,
            replies: Vec::new(),
        }
    }
}
