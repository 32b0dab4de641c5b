use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use folio_api::{
    BookCatalog, BookId, Clock, Comment, CommentId, CommentManager, CommentUser, Invariant,
    NewComment, StoreError, SystemClock, UserDirectory, UserId, Uuid, Vote, VoteManager,
};

mod db;
mod fuzz;

use db::DbComment;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone, Debug)]
pub struct PgConfig {
    pub url: String,
    pub max_connections: u32,
}

impl PgConfig {
    pub fn new(url: String) -> PgConfig {
        PgConfig {
            url,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

pub async fn create_sqlx_pool(config: &PgConfig) -> anyhow::Result<sqlx::PgPool> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
        .with_context(|| format!("Error opening database {:?}", config.url))
}

/// Whether the failure comes from a concurrent transaction winning a race
fn is_race(err: &anyhow::Error) -> bool {
    err.chain().any(|e| match e.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db)) => matches!(
            db.code().as_deref(),
            Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED | UNIQUE_VIOLATION)
        ),
        _ => false,
    })
}

fn conflict_on_race(id: Uuid, err: StoreError) -> StoreError {
    match err {
        StoreError::Backend(err) if is_race(&err) => {
            tracing::info!(?err, %id, "transaction lost a race");
            StoreError::conflict(id)
        }
        err => err,
    }
}

/// PostgreSQL-backed comment store and vote ledger
///
/// Every write runs in its own transaction, which is rolled back if the
/// future is dropped before committing.
pub struct PgDb {
    pool: sqlx::PgPool,
    users: Arc<dyn UserDirectory>,
    books: Arc<dyn BookCatalog>,
    clock: Arc<dyn Clock>,
}

impl PgDb {
    pub fn new(
        pool: sqlx::PgPool,
        users: Arc<dyn UserDirectory>,
        books: Arc<dyn BookCatalog>,
    ) -> PgDb {
        PgDb::with_clock(pool, users, books, Arc::new(SystemClock))
    }

    pub fn with_clock(
        pool: sqlx::PgPool,
        users: Arc<dyn UserDirectory>,
        books: Arc<dyn BookCatalog>,
        clock: Arc<dyn Clock>,
    ) -> PgDb {
        PgDb {
            pool,
            users,
            books,
            clock,
        }
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

    async fn present(&self, rows: Vec<DbComment>) -> Result<Vec<Comment>, StoreError> {
        let mut posters = rows
            .iter()
            .filter(|c| !c.deleted)
            .map(DbComment::poster)
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
                    true => CommentUser::ghost(c.poster()),
                    false => CommentUser::resolve(c.poster(), users.get(&c.poster())),
                };
                c.into_comment(poster)
            })
            .collect())
    }

    async fn present_one(&self, row: DbComment) -> Result<Comment, StoreError> {
        let id = row.id;
        self.present(vec![row])
            .await?
            .pop()
            .ok_or_else(|| StoreError::not_found(id))
    }

    /// Presents a committed row, falling back to the ghost poster if the
    /// user directory fails
    async fn present_written(&self, row: DbComment) -> Comment {
        let poster = match self.users.get_user(row.poster()).await {
            Ok(user) => CommentUser::resolve(row.poster(), user.as_ref()),
            Err(err) => {
                tracing::warn!(
                    ?err,
                    comment = %row.id,
                    "failed resolving poster of written comment"
                );
                CommentUser::ghost(row.poster())
            }
        };
        row.into_comment(poster)
    }

    async fn insert(&self, c: NewComment) -> Result<DbComment, StoreError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.context("starting transaction")?;

        if db::comment_exists(&mut *tx, c.id).await? {
            return Err(StoreError::uuid_already_used(c.id.0));
        }
        if let Some(parent_id) = c.parent_id {
            let (parent_book, parent_deleted) = db::lock_parent(&mut *tx, parent_id)
                .await?
                .ok_or_else(|| StoreError::not_found(parent_id.0))?;
            if parent_book != c.book_id {
                return Err(StoreError::invalid(c.id.0, Invariant::ParentOnOtherBook));
            }
            if parent_deleted {
                return Err(StoreError::deleted(parent_id.0));
            }
        }
        if c.rating.is_some() && db::has_live_review(&mut *tx, c.poster_id, c.book_id).await? {
            return Err(StoreError::invalid(c.id.0, Invariant::DuplicateReview));
        }

        let row = db::insert_comment(&mut *tx, &c, now).await?;
        tx.commit()
            .await
            .with_context(|| format!("committing creation of comment {:?}", c.id))?;
        Ok(row)
    }

    async fn store_update(&self, c: Comment) -> Result<DbComment, StoreError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.context("starting transaction")?;

        let stored = db::lock_comment(&mut *tx, c.id)
            .await?
            .ok_or_else(|| StoreError::not_found(c.id.0))?;
        if stored.deleted {
            return Err(StoreError::deleted(c.id.0));
        }
        let is_review = stored.parent_id.is_none();
        let poster = stored.poster();
        stored
            .into_comment(CommentUser::ghost(poster))
            .check_update(&c)?;

        let rating = if is_review { c.rating } else { None };
        let row = db::update_comment(&mut *tx, c.id, &c.body, rating, now).await?;
        tx.commit()
            .await
            .with_context(|| format!("committing update of comment {:?}", c.id))?;
        Ok(row)
    }

    /// Returns whether the comment was live before
    async fn store_delete(&self, id: CommentId) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.context("starting transaction")?;

        let stored = db::lock_comment(&mut *tx, id)
            .await?
            .ok_or_else(|| StoreError::not_found(id.0))?;
        if stored.deleted {
            return Ok(false);
        }
        db::tombstone(&mut *tx, id).await?;
        tx.commit()
            .await
            .with_context(|| format!("committing deletion of comment {id:?}"))?;
        Ok(true)
    }

    async fn record_vote(
        &self,
        user: UserId,
        comment: CommentId,
        vote: Option<Vote>,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.context("starting transaction")?;

        let stored = db::lock_comment(&mut *tx, comment)
            .await?
            .ok_or_else(|| StoreError::not_found(comment.0))?;
        if stored.deleted {
            return Err(StoreError::deleted(comment.0));
        }
        db::set_vote(&mut *tx, user, comment, vote).await?;
        let tally = db::refresh_tally(&mut *tx, comment).await?;
        tx.commit()
            .await
            .with_context(|| format!("committing vote of {user:?} on {comment:?}"))?;
        Ok(tally)
    }
}

#[async_trait]
impl CommentManager for PgDb {
    async fn create(&self, c: NewComment) -> Result<Comment, StoreError> {
        c.validate()?;
        self.check_book(c.book_id).await?;
        let id = c.id.0;
        let row = self.insert(c).await.map_err(|e| conflict_on_race(id, e))?;
        tracing::debug!(comment = %row.id, book = %row.book_id, "created comment");
        Ok(self.present_written(row).await)
    }

    async fn get_by_id(&self, id: CommentId) -> Result<Comment, StoreError> {
        let mut conn = self.pool.acquire().await.context("acquiring db connection")?;
        let row = db::fetch_comment(&mut *conn, id)
            .await?
            .ok_or_else(|| StoreError::not_found(id.0))?;
        std::mem::drop(conn);
        self.present_one(row).await
    }

    async fn book_comments(&self, book: BookId) -> Result<Vec<Comment>, StoreError> {
        let mut conn = self.pool.acquire().await.context("acquiring db connection")?;
        let rows = db::book_comments(&mut *conn, book).await?;
        std::mem::drop(conn);
        self.present(rows).await
    }

    async fn update(&self, c: Comment) -> Result<Comment, StoreError> {
        let id = c.id.0;
        let row = self
            .store_update(c)
            .await
            .map_err(|e| conflict_on_race(id, e))?;
        tracing::debug!(comment = %row.id, "updated comment");
        Ok(self.present_written(row).await)
    }

    async fn delete(&self, id: CommentId) -> Result<(), StoreError> {
        let newly_deleted = self
            .store_delete(id)
            .await
            .map_err(|e| conflict_on_race(id.0, e))?;
        if newly_deleted {
            tracing::debug!(comment = ?id, "deleted comment");
        }
        Ok(())
    }
}

#[async_trait]
impl VoteManager for PgDb {
    async fn vote(&self, user: UserId, comment: CommentId, value: i64) -> Result<i64, StoreError> {
        let tally = self
            .record_vote(user, comment, Vote::from_value(value))
            .await
            .map_err(|e| conflict_on_race(comment.0, e))?;
        tracing::debug!(?user, ?comment, tally, "recorded vote");
        Ok(tally)
    }

    async fn voted(
        &self,
        user: UserId,
        comments: &[CommentId],
    ) -> Result<HashMap<CommentId, i8>, StoreError> {
        let mut conn = self.pool.acquire().await.context("acquiring db connection")?;
        let votes = db::fetch_votes(&mut *conn, user, comments).await?;
        Ok(comments
            .iter()
            .map(|c| (*c, votes.get(c).copied().unwrap_or(0)))
            .collect())
    }

    async fn user_votes(&self, user: UserId) -> Result<HashMap<CommentId, i8>, StoreError> {
        let mut conn = self.pool.acquire().await.context("acquiring db connection")?;
        Ok(db::fetch_user_votes(&mut *conn, user).await?)
    }
}
