use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use folio_api::{
    BookCatalog, BookId, Clock, Comment, CommentId, CommentManager, CommentUser, Invariant,
    NewComment, Rating, StoreError, SystemClock, Time, UserDirectory, UserId, Vote, VoteManager,
};
use tokio::sync::RwLock;

mod collaborators;
pub use collaborators::{ManualClock, MockBooks, MockUsers};

/// In-memory comment store and vote ledger.
///
/// All the state lives behind a single lock: reads share it, and each write
/// holds it exclusively while doing all its mutations without awaiting, so
/// that a dropped future never leaves a half-applied write behind.
pub struct MockDb {
    state: RwLock<State>,
    users: Arc<dyn UserDirectory>,
    books: Arc<dyn BookCatalog>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct State {
    comments: BTreeMap<CommentId, DbComment>,
    votes: HashMap<CommentId, HashMap<UserId, Vote>>,
}

#[derive(Clone, Debug)]
struct DbComment {
    id: CommentId,
    book_id: BookId,
    poster_id: UserId,
    body: String,
    rating: Option<Rating>,
    parent_id: Option<CommentId>,
    deleted: bool,
    created_at: Time,
    updated_at: Time,
    votes: i64,
}

impl DbComment {
    fn to_comment(&self, poster: CommentUser) -> Comment {
        Comment {
            id: self.id,
            body: self.body.clone(),
            book_id: self.book_id,
            date: self.created_at,
            poster,
            rating: self.rating,
            parent_id: self.parent_id,
            deleted: self.deleted,
            edited_at: folio_api::edited_at(self.created_at, self.updated_at),
            votes: self.votes,
        }
    }
}

impl MockDb {
    pub fn new(users: Arc<dyn UserDirectory>, books: Arc<dyn BookCatalog>) -> MockDb {
        MockDb::with_clock(users, books, Arc::new(SystemClock))
    }

    pub fn with_clock(
        users: Arc<dyn UserDirectory>,
        books: Arc<dyn BookCatalog>,
        clock: Arc<dyn Clock>,
    ) -> MockDb {
        MockDb {
            state: RwLock::new(State::default()),
            users,
            books,
            clock,
        }
    }

    /// Return the current number of comments, tombstones included
    pub async fn test_num_comments(&self) -> usize {
        self.state.read().await.comments.len()
    }

    /// Checks that every cached tally is the sum of the comment's votes
    pub async fn test_tallies_consistent(&self) -> bool {
        let state = self.state.read().await;
        state.comments.values().all(|c| {
            let sum = state.votes.get(&c.id).map_or(0, |v| {
                v.values().map(|v| i64::from(v.value())).sum::<i64>()
            });
            c.votes == sum
        })
    }

    async fn check_book(&self, book: BookId) -> Result<(), StoreError> {
        let exists = self
            .books
            .book_exists(book)
            .await
            .with_context(|| format!("checking existence of book {book:?}"))?;
        match exists {
            true => Ok(()),
            false => Err(StoreError::not_found(book.0)),
        }
    }

    /// Attaches the live poster summary to each comment
    async fn present(&self, rows: Vec<DbComment>) -> Result<Vec<Comment>, StoreError> {
        let mut posters = rows
            .iter()
            .filter(|c| !c.deleted)
            .map(|c| c.poster_id)
            .collect::<Vec<_>>();
        posters.sort_unstable();
        posters.dedup();
        let users = self
            .users
            .get_users(&posters)
            .await
            .with_context(|| format!("resolving {} comment posters", posters.len()))?;
        Ok(rows
            .into_iter()
            .map(|c| {
                let poster = match c.deleted {
                    true => CommentUser::ghost(c.poster_id),
                    false => CommentUser::resolve(c.poster_id, users.get(&c.poster_id)),
                };
                c.to_comment(poster)
            })
            .collect())
    }

    async fn present_one(&self, row: DbComment) -> Result<Comment, StoreError> {
        let id = row.id;
        self.present(vec![row])
            .await?
            .pop()
            .ok_or_else(|| StoreError::not_found(id.0))
    }

    /// Presents a row whose write already went through, which cannot fail
    /// anymore: a broken user directory only costs the poster summary
    async fn present_written(&self, row: DbComment) -> Comment {
        let poster = match self.users.get_user(row.poster_id).await {
            Ok(user) => CommentUser::resolve(row.poster_id, user.as_ref()),
            Err(err) => {
                tracing::warn!(
                    ?err,
                    comment = ?row.id,
                    "failed resolving poster of written comment"
                );
                CommentUser::ghost(row.poster_id)
            }
        };
        row.to_comment(poster)
    }
}

#[async_trait]
impl CommentManager for MockDb {
    async fn create(&self, c: NewComment) -> Result<Comment, StoreError> {
        c.validate()?;
        self.check_book(c.book_id).await?;
        let now = self.clock.now();

        let row = {
            let mut state = self.state.write().await;
            if state.comments.contains_key(&c.id) {
                return Err(StoreError::uuid_already_used(c.id.0));
            }
            if let Some(parent_id) = c.parent_id {
                let parent = state
                    .comments
                    .get(&parent_id)
                    .ok_or_else(|| StoreError::not_found(parent_id.0))?;
                if parent.book_id != c.book_id {
                    return Err(StoreError::invalid(c.id.0, Invariant::ParentOnOtherBook));
                }
                if parent.deleted {
                    return Err(StoreError::deleted(parent_id.0));
                }
            }
            let has_review = state.comments.values().any(|o| {
                o.poster_id == c.poster_id
                    && o.book_id == c.book_id
                    && o.rating.is_some()
                    && !o.deleted
            });
            if c.rating.is_some() && has_review {
                return Err(StoreError::invalid(c.id.0, Invariant::DuplicateReview));
            }

            let row = DbComment {
                id: c.id,
                book_id: c.book_id,
                poster_id: c.poster_id,
                body: c.body,
                rating: c.rating,
                parent_id: c.parent_id,
                deleted: false,
                created_at: now,
                updated_at: now,
                votes: 1,
            };
            state.comments.insert(c.id, row.clone());
            state
                .votes
                .entry(c.id)
                .or_default()
                .insert(c.poster_id, Vote::Up);
            row
        };

        tracing::debug!(comment = ?row.id, book = ?row.book_id, "created comment");
        Ok(self.present_written(row).await)
    }

    async fn get_by_id(&self, id: CommentId) -> Result<Comment, StoreError> {
        let row = self
            .state
            .read()
            .await
            .comments
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(id.0))?;
        self.present_one(row).await
    }

    async fn book_comments(&self, book: BookId) -> Result<Vec<Comment>, StoreError> {
        let mut rows = self
            .state
            .read()
            .await
            .comments
            .values()
            .filter(|c| c.book_id == book)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        self.present(rows).await
    }

    async fn update(&self, c: Comment) -> Result<Comment, StoreError> {
        let now = self.clock.now();
        let row = {
            let mut state = self.state.write().await;
            let stored = state
                .comments
                .get_mut(&c.id)
                .ok_or_else(|| StoreError::not_found(c.id.0))?;
            if stored.deleted {
                return Err(StoreError::deleted(c.id.0));
            }
            stored
                .to_comment(CommentUser::ghost(stored.poster_id))
                .check_update(&c)?;

            stored.body = c.body;
            if stored.parent_id.is_none() {
                stored.rating = c.rating;
            }
            stored.updated_at = now;
            stored.clone()
        };

        tracing::debug!(comment = ?row.id, "updated comment");
        Ok(self.present_written(row).await)
    }

    async fn delete(&self, id: CommentId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .comments
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(id.0))?;
        if !stored.deleted {
            stored.deleted = true;
            stored.body.clear();
            tracing::debug!(comment = ?id, "deleted comment");
        }
        Ok(())
    }
}

#[async_trait]
impl VoteManager for MockDb {
    async fn vote(&self, user: UserId, comment: CommentId, value: i64) -> Result<i64, StoreError> {
        let mut state = self.state.write().await;
        let State { comments, votes } = &mut *state;
        let stored = comments
            .get_mut(&comment)
            .ok_or_else(|| StoreError::not_found(comment.0))?;
        if stored.deleted {
            return Err(StoreError::deleted(comment.0));
        }

        let ledger = votes.entry(comment).or_default();
        match Vote::from_value(value) {
            None => {
                ledger.remove(&user);
            }
            Some(v) => {
                ledger.insert(user, v);
            }
        }
        stored.votes = ledger.values().map(|v| i64::from(v.value())).sum();

        tracing::debug!(?user, ?comment, tally = stored.votes, "recorded vote");
        Ok(stored.votes)
    }

    async fn voted(
        &self,
        user: UserId,
        comments: &[CommentId],
    ) -> Result<HashMap<CommentId, i8>, StoreError> {
        let state = self.state.read().await;
        Ok(comments
            .iter()
            .map(|c| {
                let vote = state
                    .votes
                    .get(c)
                    .and_then(|ledger| ledger.get(&user))
                    .map_or(0, |v| v.value());
                (*c, vote)
            })
            .collect())
    }

    async fn user_votes(&self, user: UserId) -> Result<HashMap<CommentId, i8>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .votes
            .iter()
            .filter_map(|(c, ledger)| ledger.get(&user).map(|v| (*c, v.value())))
            .collect())
    }
}

#[cfg(test)]
mod tests;
