use std::collections::HashMap;

use anyhow::Context;
use folio_api::{
    edited_at, BookId, Comment, CommentId, CommentUser, NewComment, Rating, Time, UserId, Uuid,
    Vote,
};
use futures::TryStreamExt;

macro_rules! select_comments {
    ($rest:expr) => {
        concat!(
            "
                SELECT
                    id, book_id, poster_id, body, rating, parent_id,
                    deleted, created_at, updated_at, votes
                FROM comments
            ",
            $rest
        )
    };
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct DbComment {
    pub id: Uuid,
    pub book_id: Uuid,
    pub poster_id: Uuid,
    pub body: String,
    pub rating: Option<f32>,
    pub parent_id: Option<Uuid>,
    pub deleted: bool,
    pub created_at: Time,
    pub updated_at: Time,
    pub votes: i64,
}

impl DbComment {
    pub fn poster(&self) -> UserId {
        UserId(self.poster_id)
    }

    pub fn into_comment(self, poster: CommentUser) -> Comment {
        Comment {
            id: CommentId(self.id),
            body: self.body,
            book_id: BookId(self.book_id),
            date: self.created_at,
            poster,
            rating: self.rating.map(Rating),
            parent_id: self.parent_id.map(CommentId),
            deleted: self.deleted,
            edited_at: edited_at(self.created_at, self.updated_at),
            votes: self.votes,
        }
    }
}

pub async fn comment_exists(
    conn: &mut sqlx::PgConnection,
    id: CommentId,
) -> anyhow::Result<bool> {
    sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM comments WHERE id = $1)")
        .bind(id.0)
        .fetch_one(conn)
        .await
        .with_context(|| format!("checking whether comment {id:?} exists"))
}

pub async fn fetch_comment(
    conn: &mut sqlx::PgConnection,
    id: CommentId,
) -> anyhow::Result<Option<DbComment>> {
    sqlx::query_as::<_, DbComment>(select_comments!("WHERE id = $1"))
        .bind(id.0)
        .fetch_optional(conn)
        .await
        .with_context(|| format!("fetching comment {id:?}"))
}

/// Same as `fetch_comment`, but also locks the row until the end of the
/// transaction
pub async fn lock_comment(
    conn: &mut sqlx::PgConnection,
    id: CommentId,
) -> anyhow::Result<Option<DbComment>> {
    sqlx::query_as::<_, DbComment>(select_comments!("WHERE id = $1 FOR UPDATE"))
        .bind(id.0)
        .fetch_optional(conn)
        .await
        .with_context(|| format!("locking comment {id:?}"))
}

/// Returns the book and deletion status of the would-be parent, keeping it
/// from being deleted until the end of the transaction
pub async fn lock_parent(
    conn: &mut sqlx::PgConnection,
    id: CommentId,
) -> anyhow::Result<Option<(BookId, bool)>> {
    Ok(
        sqlx::query_as::<_, (Uuid, bool)>(
            "SELECT book_id, deleted FROM comments WHERE id = $1 FOR SHARE",
        )
        .bind(id.0)
        .fetch_optional(conn)
        .await
        .with_context(|| format!("locking parent comment {id:?}"))?
        .map(|(book, deleted)| (BookId(book), deleted)),
    )
}

pub async fn has_live_review(
    conn: &mut sqlx::PgConnection,
    poster: UserId,
    book: BookId,
) -> anyhow::Result<bool> {
    sqlx::query_scalar::<_, bool>(
        "
            SELECT EXISTS (
                SELECT 1 FROM comments
                WHERE poster_id = $1
                AND book_id = $2
                AND rating IS NOT NULL
                AND NOT deleted
            )
        ",
    )
    .bind(poster.0)
    .bind(book.0)
    .fetch_one(conn)
    .await
    .with_context(|| format!("looking for a review of {book:?} by {poster:?}"))
}

pub async fn book_comments(
    conn: &mut sqlx::PgConnection,
    book: BookId,
) -> anyhow::Result<Vec<DbComment>> {
    sqlx::query_as::<_, DbComment>(select_comments!(
        "WHERE book_id = $1 ORDER BY created_at, id"
    ))
    .bind(book.0)
    .fetch_all(conn)
    .await
    .with_context(|| format!("listing comments of book {book:?}"))
}

/// Inserts the comment along with its poster's upvote
pub async fn insert_comment(
    conn: &mut sqlx::PgConnection,
    c: &NewComment,
    now: Time,
) -> anyhow::Result<DbComment> {
    let row: DbComment = sqlx::query_as(
        "
            INSERT INTO comments
                (id, book_id, poster_id, body, rating, parent_id,
                 deleted, created_at, updated_at, votes)
            VALUES ($1, $2, $3, $4, $5, $6, false, $7, $7, 1)
            RETURNING
                id, book_id, poster_id, body, rating, parent_id,
                deleted, created_at, updated_at, votes
        ",
    )
    .bind(c.id.0)
    .bind(c.book_id.0)
    .bind(c.poster_id.0)
    .bind(&c.body)
    .bind(c.rating.map(|r| r.0))
    .bind(c.parent_id.map(|p| p.0))
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("inserting comment {:?}", c.id))?;

    set_vote(&mut *conn, c.poster_id, c.id, Some(Vote::Up)).await?;
    Ok(row)
}

pub async fn update_comment(
    conn: &mut sqlx::PgConnection,
    id: CommentId,
    body: &str,
    rating: Option<Rating>,
    now: Time,
) -> anyhow::Result<DbComment> {
    sqlx::query_as::<_, DbComment>(
        "
            UPDATE comments
            SET body = $2, rating = $3, updated_at = $4
            WHERE id = $1
            RETURNING
                id, book_id, poster_id, body, rating, parent_id,
                deleted, created_at, updated_at, votes
        ",
    )
    .bind(id.0)
    .bind(body)
    .bind(rating.map(|r| r.0))
    .bind(now)
    .fetch_one(conn)
    .await
    .with_context(|| format!("updating comment {id:?}"))
}

/// Marks the comment as deleted and forgets its contents
pub async fn tombstone(conn: &mut sqlx::PgConnection, id: CommentId) -> anyhow::Result<()> {
    let res = sqlx::query("UPDATE comments SET deleted = true, body = '' WHERE id = $1")
        .bind(id.0)
        .execute(conn)
        .await
        .with_context(|| format!("tombstoning comment {id:?}"))?;
    anyhow::ensure!(
        res.rows_affected() == 1,
        "tombstoning of comment {:?} affected {} rows",
        id,
        res.rows_affected()
    );
    Ok(())
}

pub async fn set_vote(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    comment: CommentId,
    vote: Option<Vote>,
) -> anyhow::Result<()> {
    match vote {
        None => {
            sqlx::query("DELETE FROM votes WHERE comment_id = $1 AND user_id = $2")
                .bind(comment.0)
                .bind(user.0)
                .execute(conn)
                .await
                .with_context(|| format!("removing vote of {user:?} on {comment:?}"))?;
        }
        Some(v) => {
            sqlx::query(
                "
                    INSERT INTO votes (comment_id, user_id, vote)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (comment_id, user_id)
                    DO UPDATE SET vote = EXCLUDED.vote
                ",
            )
            .bind(comment.0)
            .bind(user.0)
            .bind(i16::from(v.value()))
            .execute(conn)
            .await
            .with_context(|| format!("recording vote of {user:?} on {comment:?}"))?;
        }
    }
    Ok(())
}

/// Recomputes the cached tally of the comment from its votes and returns it
pub async fn refresh_tally(
    conn: &mut sqlx::PgConnection,
    comment: CommentId,
) -> anyhow::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "
            UPDATE comments
            SET votes = (SELECT COALESCE(SUM(vote), 0) FROM votes WHERE comment_id = $1)
            WHERE id = $1
            RETURNING votes
        ",
    )
    .bind(comment.0)
    .fetch_one(conn)
    .await
    .with_context(|| format!("refreshing tally of {comment:?}"))
}

/// Votes of `user` among `comments`, comments without a vote being absent
pub async fn fetch_votes(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    comments: &[CommentId],
) -> anyhow::Result<HashMap<CommentId, i8>> {
    let ids = comments.iter().map(|c| c.0).collect::<Vec<_>>();
    let rows = sqlx::query_as::<_, (Uuid, i16)>(
        "SELECT comment_id, vote FROM votes WHERE user_id = $1 AND comment_id = ANY($2)",
    )
    .bind(user.0)
    .bind(ids)
    .fetch(conn)
    .map_ok(|(c, v)| (CommentId(c), v))
    .try_collect::<Vec<_>>()
    .await
    .with_context(|| format!("fetching votes of {user:?} on {} comments", comments.len()))?;
    to_vote_map(rows)
}

pub async fn fetch_user_votes(
    conn: &mut sqlx::PgConnection,
    user: UserId,
) -> anyhow::Result<HashMap<CommentId, i8>> {
    let rows = sqlx::query_as::<_, (Uuid, i16)>(
        "SELECT comment_id, vote FROM votes WHERE user_id = $1",
    )
    .bind(user.0)
    .fetch(conn)
    .map_ok(|(c, v)| (CommentId(c), v))
    .try_collect::<Vec<_>>()
    .await
    .with_context(|| format!("fetching all votes of {user:?}"))?;
    to_vote_map(rows)
}

fn to_vote_map(rows: Vec<(CommentId, i16)>) -> anyhow::Result<HashMap<CommentId, i8>> {
    rows.into_iter()
        .map(|(c, v)| match Vote::from_value(i64::from(v)) {
            Some(vote) if i16::from(vote.value()) == v => Ok((c, vote.value())),
            _ => Err(anyhow::anyhow!("vote of {c:?} has invalid value {v}")),
        })
        .collect()
}
