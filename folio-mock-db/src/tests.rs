use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use bolero::generator::TypeGenerator;
use chrono::Duration;
use folio_api::{
    BookId, CommentId, CommentManager, CommentUser, Error, ImmutableField, Invariant, NewComment,
    Rating, StoreError, User, UserId, Username, Uuid, VoteManager,
};

use crate::{ManualClock, MockBooks, MockDb, MockUsers};

struct Env {
    db: Arc<MockDb>,
    users: Arc<MockUsers>,
    books: Arc<MockBooks>,
    clock: Arc<ManualClock>,
    book: BookId,
    u1: UserId,
    u2: UserId,
}

fn user(handle: &str, discriminator: u16) -> User {
    User {
        id: UserId(Uuid::new_v4()),
        display_name: None,
        pronouns: None,
        username: Username::new(handle, discriminator).unwrap(),
        avatar: None,
    }
}

async fn env() -> Env {
    let users = Arc::new(MockUsers::new());
    let books = Arc::new(MockBooks::new());
    let clock = Arc::new(ManualClock::starting_now());
    let db = Arc::new(MockDb::with_clock(
        users.clone(),
        books.clone(),
        clock.clone(),
    ));
    let book = BookId(Uuid::new_v4());
    books.insert(book).await;
    let u1 = user("alice", 1);
    let u2 = user("bob", 2);
    let (u1_id, u2_id) = (u1.id, u2.id);
    users.insert(u1).await;
    users.insert(u2).await;
    Env {
        db,
        users,
        books,
        clock,
        book,
        u1: u1_id,
        u2: u2_id,
    }
}

fn api_err<T: std::fmt::Debug>(res: Result<T, StoreError>) -> Error {
    match res {
        Err(StoreError::Api(err)) => err,
        res => panic!("expected an api error, got {res:?}"),
    }
}

fn review(env: &Env, poster: UserId, rating: f32) -> NewComment {
    NewComment::review(env.book, poster, String::from("a fine book"), Rating(rating))
}

#[tokio::test]
async fn review_thread_scenario() {
    let env = env().await;

    let c1 = env.db.create(review(&env, env.u1, 4.5)).await.unwrap();
    assert_eq!(c1.votes, 1);
    assert_eq!(c1.rating, Some(Rating(4.5)));
    assert_eq!(env.db.get_by_id(c1.id).await.unwrap().votes, 1);

    let c2 = env
        .db
        .create(NewComment::reply(
            env.book,
            env.u2,
            String::from("disagree"),
            c1.id,
        ))
        .await
        .unwrap();
    assert_eq!(c2.parent_id, Some(c1.id));
    assert_eq!(c2.rating, None);

    let mut both = review(&env, env.u1, 3.0);
    both.parent_id = Some(c1.id);
    assert_eq!(
        api_err(env.db.create(both.clone()).await),
        Error::InvalidInvariant(both.id.0, Invariant::RatingAndParent)
    );

    assert_eq!(env.db.vote(env.u2, c1.id, -1).await.unwrap(), 0);
    assert_eq!(env.db.vote(env.u2, c1.id, 0).await.unwrap(), 1);

    let mut moved = env.db.get_by_id(c1.id).await.unwrap();
    moved.book_id = BookId(Uuid::new_v4());
    assert_eq!(
        api_err(env.db.update(moved).await),
        Error::ImmutableFieldViolation(c1.id.0, ImmutableField::Book)
    );
    assert_eq!(env.db.get_by_id(c1.id).await.unwrap().book_id, env.book);

    env.db.delete(c1.id).await.unwrap();
    let listing = env.db.book_comments(env.book).await.unwrap();
    assert_eq!(listing.len(), 2);
    let parent = listing.iter().find(|c| c.id == c1.id).unwrap();
    assert!(parent.deleted);
    assert_eq!(parent.body, "");
    assert_eq!(parent.poster, CommentUser::ghost(env.u1));
    let reply = listing.iter().find(|c| c.id == c2.id).unwrap();
    assert_eq!(reply.parent_id, Some(c1.id));
    assert!(!reply.deleted);
}

#[tokio::test]
async fn exclusivity_on_create() {
    let env = env().await;
    let mut neither = review(&env, env.u1, 4.0);
    neither.rating = None;
    assert_eq!(
        api_err(env.db.create(neither.clone()).await),
        Error::InvalidInvariant(neither.id.0, Invariant::NeitherRatingNorParent)
    );
    let too_high = review(&env, env.u1, 7.0);
    assert_eq!(
        api_err(env.db.create(too_high.clone()).await),
        Error::InvalidInvariant(too_high.id.0, Invariant::RatingOutOfRange)
    );
    assert_eq!(env.db.test_num_comments().await, 0);

    let c = env.db.create(review(&env, env.u1, 4.0)).await.unwrap();
    for c in env.db.book_comments(env.book).await.unwrap() {
        assert!(c.rating.is_some() != c.parent_id.is_some());
    }
    assert!(c.is_review());
}

#[tokio::test]
async fn single_review_per_book() {
    let env = env().await;
    let first = env.db.create(review(&env, env.u1, 4.0)).await.unwrap();

    let second = review(&env, env.u1, 2.0);
    assert_eq!(
        api_err(env.db.create(second.clone()).await),
        Error::InvalidInvariant(second.id.0, Invariant::DuplicateReview)
    );

    // replies and reviews of other books or by other users are fine
    env.db
        .create(NewComment::reply(
            env.book,
            env.u1,
            String::from("also"),
            first.id,
        ))
        .await
        .unwrap();
    env.db.create(review(&env, env.u2, 2.0)).await.unwrap();
    let other_book = BookId(Uuid::new_v4());
    env.books.insert(other_book).await;
    env.db
        .create(NewComment::review(
            other_book,
            env.u1,
            String::new(),
            Rating(1.0),
        ))
        .await
        .unwrap();

    // deleting the review frees the slot
    env.db.delete(first.id).await.unwrap();
    env.db.create(review(&env, env.u1, 2.0)).await.unwrap();
}

#[tokio::test]
async fn create_checks_references() {
    let env = env().await;

    let unknown_book = BookId(Uuid::new_v4());
    assert_eq!(
        api_err(
            env.db
                .create(NewComment::review(
                    unknown_book,
                    env.u1,
                    String::new(),
                    Rating(3.0)
                ))
                .await
        ),
        Error::NotFound(unknown_book.0)
    );

    let unknown_parent = CommentId(Uuid::new_v4());
    assert_eq!(
        api_err(
            env.db
                .create(NewComment::reply(
                    env.book,
                    env.u1,
                    String::new(),
                    unknown_parent
                ))
                .await
        ),
        Error::NotFound(unknown_parent.0)
    );

    let parent = env.db.create(review(&env, env.u1, 3.0)).await.unwrap();
    let other_book = BookId(Uuid::new_v4());
    env.books.insert(other_book).await;
    let misplaced = NewComment::reply(other_book, env.u2, String::new(), parent.id);
    assert_eq!(
        api_err(env.db.create(misplaced.clone()).await),
        Error::InvalidInvariant(misplaced.id.0, Invariant::ParentOnOtherBook)
    );

    let mut reused = review(&env, env.u2, 3.0);
    reused.id = parent.id;
    assert_eq!(
        api_err(env.db.create(reused).await),
        Error::UuidAlreadyUsed(parent.id.0)
    );

    let null = NewComment::reply(env.book, env.u2, String::from("\0"), parent.id);
    assert!(matches!(
        api_err(env.db.create(null).await),
        Error::NullByteInString(_)
    ));

    env.db.delete(parent.id).await.unwrap();
    assert_eq!(
        api_err(
            env.db
                .create(NewComment::reply(
                    env.book,
                    env.u2,
                    String::new(),
                    parent.id
                ))
                .await
        ),
        Error::Deleted(parent.id.0)
    );
    assert_eq!(env.db.test_num_comments().await, 1);
}

#[tokio::test]
async fn immutable_fields() {
    let env = env().await;
    let parent = env.db.create(review(&env, env.u1, 3.0)).await.unwrap();
    let stored = env
        .db
        .create(NewComment::reply(
            env.book,
            env.u2,
            String::from("hm"),
            parent.id,
        ))
        .await
        .unwrap();
    let id = stored.id.0;

    let mut c = stored.clone();
    c.poster.id = env.u1;
    assert_eq!(
        api_err(env.db.update(c).await),
        Error::ImmutableFieldViolation(id, ImmutableField::Poster)
    );
    let mut c = stored.clone();
    c.parent_id = None;
    assert_eq!(
        api_err(env.db.update(c).await),
        Error::ImmutableFieldViolation(id, ImmutableField::Parent)
    );
    let mut c = stored.clone();
    c.date = c.date - Duration::seconds(1);
    assert_eq!(
        api_err(env.db.update(c).await),
        Error::ImmutableFieldViolation(id, ImmutableField::Date)
    );

    let mut c = stored.clone();
    c.body = String::from("on second thought");
    c.rating = Some(Rating(5.0));
    let updated = env.db.update(c).await.unwrap();
    assert_eq!(updated.body, "on second thought");
    assert_eq!(updated.rating, None);
    assert_eq!(updated.book_id, stored.book_id);
    assert_eq!(updated.poster.id, stored.poster.id);
    assert_eq!(updated.parent_id, stored.parent_id);
    assert_eq!(updated.date, stored.date);

    let mut c = parent.clone();
    c.rating = Some(Rating(1.5));
    assert_eq!(env.db.update(c).await.unwrap().rating, Some(Rating(1.5)));

    let missing = CommentId(Uuid::new_v4());
    let mut c = parent.clone();
    c.id = missing;
    assert_eq!(api_err(env.db.update(c).await), Error::NotFound(missing.0));
}

#[tokio::test]
async fn edit_grace_window() {
    let env = env().await;
    let c = env.db.create(review(&env, env.u1, 3.0)).await.unwrap();
    assert_eq!(c.edited_at, None);

    env.clock.advance(Duration::minutes(2));
    let mut quick_fix = c.clone();
    quick_fix.body = String::from("typo fixed");
    let quick_fix = env.db.update(quick_fix).await.unwrap();
    assert_eq!(quick_fix.edited_at, None);
    assert_eq!(env.db.get_by_id(c.id).await.unwrap().edited_at, None);

    env.clock.advance(Duration::minutes(8));
    let mut rewrite = quick_fix.clone();
    rewrite.body = String::from("changed my mind");
    let rewrite = env.db.update(rewrite).await.unwrap();
    assert_eq!(rewrite.edited_at, Some(c.date + Duration::minutes(10)));
    assert_eq!(
        env.db.get_by_id(c.id).await.unwrap().edited_at,
        rewrite.edited_at
    );
}

#[tokio::test]
async fn tombstones() {
    let env = env().await;
    let c = env.db.create(review(&env, env.u1, 3.0)).await.unwrap();
    env.db.vote(env.u2, c.id, 1).await.unwrap();

    env.db.delete(c.id).await.unwrap();
    env.db.delete(c.id).await.unwrap();
    let tomb = env.db.get_by_id(c.id).await.unwrap();
    assert!(tomb.deleted);
    assert_eq!(tomb.body, "");
    assert_eq!(tomb.poster.display_name, CommentUser::DELETED_NAME);
    assert_eq!(tomb.poster.username, Username::deleted());
    assert_eq!(tomb.votes, 2);

    assert_eq!(api_err(env.db.update(tomb).await), Error::Deleted(c.id.0));
    assert_eq!(
        api_err(env.db.vote(env.u2, c.id, -1).await),
        Error::Deleted(c.id.0)
    );

    let missing = CommentId(Uuid::new_v4());
    assert_eq!(api_err(env.db.delete(missing).await), Error::NotFound(missing.0));
    assert_eq!(
        api_err(env.db.get_by_id(missing).await),
        Error::NotFound(missing.0)
    );
}

#[tokio::test]
async fn posters_are_resolved_on_read() {
    let env = env().await;
    let c = env.db.create(review(&env, env.u1, 3.0)).await.unwrap();
    assert_eq!(c.poster.display_name, "alice");
    assert_eq!(c.poster.username.to_string(), "alice#0001");

    let mut renamed = user("alice", 1);
    renamed.id = env.u1;
    renamed.display_name = Some(String::from("Alice L."));
    renamed.pronouns = Some(String::from("she/her"));
    env.users.insert(renamed).await;
    let c = env.db.get_by_id(c.id).await.unwrap();
    assert_eq!(c.poster.display_name, "Alice L.");
    assert_eq!(c.poster.pronouns, "she/her");

    env.users.remove(env.u1).await;
    let listing = env.db.book_comments(env.book).await.unwrap();
    assert_eq!(listing[0].poster, CommentUser::ghost(env.u1));
    assert_eq!(listing[0].body, "a fine book");
}

#[tokio::test]
async fn book_comments_lists_everything_in_order() {
    let env = env().await;
    let r1 = env.db.create(review(&env, env.u1, 3.0)).await.unwrap();
    env.clock.advance(Duration::seconds(1));
    let r2 = env.db.create(review(&env, env.u2, 4.0)).await.unwrap();
    env.clock.advance(Duration::seconds(1));
    let reply = env
        .db
        .create(NewComment::reply(
            env.book,
            env.u2,
            String::new(),
            r1.id,
        ))
        .await
        .unwrap();

    let other_book = BookId(Uuid::new_v4());
    env.books.insert(other_book).await;
    env.db
        .create(NewComment::review(
            other_book,
            env.u1,
            String::new(),
            Rating(2.0),
        ))
        .await
        .unwrap();

    let ids = env
        .db
        .book_comments(env.book)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![r1.id, r2.id, reply.id]);

    let threads = folio_api::Thread::build(env.db.book_comments(env.book).await.unwrap());
    assert_eq!(threads.len(), 2);
    assert_eq!(threads[0].replies[0].comment.id, reply.id);

    assert!(env.db.book_comments(other_book).await.unwrap().len() == 1);
    // books leaving the catalog keep their comments listable
    env.books.remove(other_book).await;
    assert_eq!(env.db.book_comments(other_book).await.unwrap().len(), 1);
    assert!(env
        .db
        .book_comments(BookId(Uuid::new_v4()))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn committed_writes_survive_user_directory_outage() {
    let env = env().await;
    env.users.set_down(true);

    let c = env.db.create(review(&env, env.u1, 4.0)).await.unwrap();
    assert_eq!(c.poster, CommentUser::ghost(env.u1));
    assert_eq!(c.votes, 1);
    assert_eq!(env.db.test_num_comments().await, 1);

    let mut edit = c.clone();
    edit.body = String::from("on second thought");
    let edited = env.db.update(edit).await.unwrap();
    assert_eq!(edited.body, "on second thought");
    assert_eq!(edited.poster, CommentUser::ghost(env.u1));

    // reads have nothing committed to protect, so they report the outage
    assert!(matches!(
        env.db.get_by_id(c.id).await,
        Err(StoreError::Backend(_))
    ));

    env.users.set_down(false);
    let stored = env.db.get_by_id(c.id).await.unwrap();
    assert_eq!(stored.poster.id, env.u1);
    assert_eq!(stored.poster.display_name, "alice");
    assert_eq!(stored.body, "on second thought");
    let again = review(&env, env.u1, 2.0);
    assert_eq!(
        api_err(env.db.create(again.clone()).await),
        Error::InvalidInvariant(again.id.0, Invariant::DuplicateReview)
    );
}

#[tokio::test]
async fn votes() {
    let env = env().await;
    let c = env.db.create(review(&env, env.u1, 3.0)).await.unwrap();
    let other = env.db.create(review(&env, env.u2, 3.0)).await.unwrap();

    // idempotence
    assert_eq!(env.db.vote(env.u2, c.id, 1).await.unwrap(), 2);
    assert_eq!(env.db.vote(env.u2, c.id, 1).await.unwrap(), 2);
    // normalization
    assert_eq!(env.db.vote(env.u2, c.id, 42).await.unwrap(), 2);
    assert_eq!(env.db.vote(env.u2, c.id, -7).await.unwrap(), 0);
    // the author can take back their own upvote
    assert_eq!(env.db.vote(env.u1, c.id, 0).await.unwrap(), -1);
    assert_eq!(env.db.get_by_id(c.id).await.unwrap().votes, -1);

    // removal
    assert_eq!(env.db.vote(env.u2, c.id, 0).await.unwrap(), 0);
    assert_eq!(env.db.vote(env.u2, c.id, 0).await.unwrap(), 0);
    let unknown = CommentId(Uuid::new_v4());
    let voted = env
        .db
        .voted(env.u2, &[c.id, other.id, unknown])
        .await
        .unwrap();
    assert_eq!(voted.len(), 3);
    assert_eq!(voted[&c.id], 0);
    assert_eq!(voted[&other.id], 1);
    assert_eq!(voted[&unknown], 0);

    env.db.vote(env.u1, other.id, -1).await.unwrap();
    let mut expected = HashMap::new();
    expected.insert(other.id, -1);
    assert_eq!(env.db.user_votes(env.u1).await.unwrap(), expected);
    assert!(env.db.voted(env.u1, &[]).await.unwrap().is_empty());

    assert_eq!(
        api_err(env.db.vote(env.u1, unknown, 1).await),
        Error::NotFound(unknown.0)
    );
    assert!(env.db.test_tallies_consistent().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_votes_are_not_lost() {
    let env = env().await;
    let c = env.db.create(review(&env, env.u1, 3.0)).await.unwrap();
    let voters = (0..64).map(|_| UserId(Uuid::new_v4())).collect::<Vec<_>>();

    let handles = voters
        .iter()
        .enumerate()
        .map(|(i, u)| {
            let db = env.db.clone();
            let (u, id) = (*u, c.id);
            tokio::spawn(async move {
                let value = if i % 4 == 0 { -1 } else { 1 };
                db.vote(u, id, value).await.unwrap();
            })
        })
        .collect::<Vec<_>>();
    for h in handles {
        h.await.unwrap();
    }

    // 48 upvotes, 16 downvotes, and the author's own
    assert_eq!(env.db.get_by_id(c.id).await.unwrap().votes, 1 + 48 - 16);
    assert!(env.db.test_tallies_consistent().await);
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum LedgerOp {
    Vote { user: u8, comment: u8, value: i8 },
    Delete { comment: u8 },
}

const FUZZ_USERS: usize = 4;
const FUZZ_COMMENTS: usize = 3;

#[test]
fn fuzz_tally_matches_ledger() {
    let runtime = AssertUnwindSafe(
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed initializing tokio runtime"),
    );
    bolero::check!()
        .with_type::<Vec<LedgerOp>>()
        .cloned()
        .for_each(move |ops| {
            runtime.block_on(async move {
                let env = env().await;
                let mut users = vec![env.u1, env.u2];
                while users.len() < FUZZ_USERS {
                    users.push(UserId(Uuid::new_v4()));
                }
                let mut comments = Vec::new();
                let mut model = HashMap::new();
                for i in 0..FUZZ_COMMENTS {
                    let poster = users[i % 2];
                    let c = match comments.first() {
                        None => env.db.create(review(&env, poster, 4.0)).await.unwrap(),
                        Some(&parent) => env
                            .db
                            .create(NewComment::reply(env.book, poster, String::new(), parent))
                            .await
                            .unwrap(),
                    };
                    model.insert((c.id, poster), 1i64);
                    comments.push(c.id);
                }

                let mut deleted = Vec::new();
                for op in ops {
                    match op {
                        LedgerOp::Vote {
                            user,
                            comment,
                            value,
                        } => {
                            let user = users[user as usize % FUZZ_USERS];
                            let comment = comments[comment as usize % FUZZ_COMMENTS];
                            let res = env.db.vote(user, comment, i64::from(value)).await;
                            if deleted.contains(&comment) {
                                assert_eq!(api_err(res), Error::Deleted(comment.0));
                                continue;
                            }
                            match value.signum() {
                                0 => model.remove(&(comment, user)),
                                s => model.insert((comment, user), i64::from(s)),
                            };
                            let expected = model
                                .iter()
                                .filter(|((c, _), _)| *c == comment)
                                .map(|(_, v)| v)
                                .sum::<i64>();
                            assert_eq!(res.unwrap(), expected);
                        }
                        LedgerOp::Delete { comment } => {
                            let comment = comments[comment as usize % FUZZ_COMMENTS];
                            env.db.delete(comment).await.unwrap();
                            deleted.push(comment);
                        }
                    }
                    assert!(env.db.test_tallies_consistent().await);
                }

                for u in users {
                    let votes = env.db.user_votes(u).await.unwrap();
                    for c in &comments {
                        let expected = model.get(&(*c, u)).copied().unwrap_or(0);
                        assert_eq!(votes.get(c).copied().map_or(0, i64::from), expected);
                    }
                }
            })
        })
}
