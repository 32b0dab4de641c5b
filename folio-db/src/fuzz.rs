#![cfg(test)]

use std::{cmp, fmt::Debug, ops::RangeTo, panic::AssertUnwindSafe, path::Path, sync::Arc};

use bolero::generator::TypeGenerator;
use chrono::Duration;
use folio_api::{
    BookId, CommentId, Error as ApiError, NewComment, Rating, StoreError, User, Username,
};
use folio_mock_db::{ManualClock, MockBooks, MockDb, MockUsers};

use crate::*;

fn build_pg_cluster(data: &Path) -> Option<postgresfixture::cluster::Cluster> {
    let mut runtime = None;
    let mut best_version = None;
    for r in postgresfixture::runtime::Runtime::find_on_path() {
        if let Ok(v) = r.version() {
            match (&mut runtime, &mut best_version) {
                (None, None) => {
                    runtime = Some(r);
                    best_version = Some(v);
                }
                (Some(runtime), Some(best_version)) => {
                    if *best_version < v {
                        *runtime = r;
                        *best_version = v;
                    }
                }
                _ => unreachable!(),
            }
        }
    }
    Some(postgresfixture::cluster::Cluster::new(data, runtime?))
}

macro_rules! do_sqlx_test {
    ( $name:ident, $gen:expr, $fn:expr ) => {
        #[test]
        fn $name() {
            if std::env::var("RUST_LOG").is_ok() {
                let _ = tracing_subscriber::fmt::try_init();
            }
            let lockfile = tempfile::tempfile().expect("creating tempfile");
            let datadir = tempfile::tempdir().expect("creating tempdir");
            let datadir_path: &Path = datadir.as_ref();
            let cluster = match build_pg_cluster(datadir_path) {
                Some(cluster) => cluster,
                None => {
                    println!(
                        "postgresql seems to not be installed in path, skipping {}",
                        stringify!($name)
                    );
                    return;
                }
            };
            let datadir_path: &str = datadir_path.to_str().expect("tempdir is not valid utf8");
            postgresfixture::coordinate::run_and_destroy(&cluster, lockfile.into(), || {
                cluster.createdb("test_db").expect("creating test_db database");
                let runtime = AssertUnwindSafe(
                    tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed initializing tokio runtime"),
                );
                // create test db
                let pool = AssertUnwindSafe(runtime.block_on(async move {
                    let config = PgConfig::new(format!(
                        "postgresql://?host={}&dbname=test_db",
                        datadir_path
                    ));
                    let pool = create_sqlx_pool(&config).await.expect("creating sqlx pool");
                    MIGRATOR
                        .run(&mut *pool.acquire().await.expect("getting migrator connection"))
                        .await
                        .expect("failed applying migrations");
                    pool
                }));
                bolero::check!()
                    .with_generator($gen)
                    .cloned()
                    .for_each(move |v| {
                        let pool = pool.clone();
                        // run the test
                        let idle_before = pool.num_idle();
                        let v_str = format!("{v:?}");
                        let idle_after_res: Result<usize, _> = {
                            let pool = pool.clone();
                            std::panic::catch_unwind(AssertUnwindSafe(|| {
                                runtime.block_on(async move {
                                    let () = $fn(pool.clone(), v).await;
                                    let mut idle_after = pool.num_idle();
                                    let wait_release_since = std::time::Instant::now();
                                    while idle_after < idle_before
                                        && wait_release_since.elapsed()
                                            <= std::time::Duration::from_secs(1)
                                    {
                                        tokio::task::yield_now().await;
                                        idle_after = pool.num_idle();
                                    }
                                    idle_after
                                })
                            }))
                        };
                        runtime.block_on(async move {
                            // cleanup
                            let mut conn =
                                pool.acquire().await.expect("getting db cleanup connection");
                            sqlx::query(include_str!("../reset-test-db.sql"))
                                .execute(&mut *conn)
                                .await
                                .expect("failed cleaning up database");
                        });
                        // resume the panics
                        match idle_after_res {
                            Err(e) => std::panic::resume_unwind(e),
                            Ok(idle_after) => assert!(
                                idle_after >= idle_before,
                                "test {} held onto pool after exiting test: before there were {idle_before} connections, and after there were {idle_after} with value {v_str}",
                                stringify!($name)
                            ),
                        }
                    });
            })
            .expect("coordinating spinup and shutdown of the pg cluster");
        }
    };
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzOp {
    AddBook,
    RemoveBook {
        book: usize,
    },
    AddUser {
        #[generator(bolero::generator::gen_with::<String>().len(0..20usize))]
        display_name: String,
    },
    RemoveUser {
        user: usize,
    },
    Tick {
        minutes: u8,
    },
    CreateReview {
        book: usize,
        poster: usize,
        #[generator(bolero::generator::gen_with::<String>().len(0..100usize))]
        body: String,
        half_stars: u8,
    },
    CreateReply {
        poster: usize,
        parent: usize,
        #[generator(bolero::generator::gen_with::<String>().len(0..100usize))]
        body: String,
    },
    ReuseId {
        comment: usize,
        poster: usize,
    },
    Update {
        comment: usize,
        #[generator(bolero::generator::gen_with::<String>().len(0..100usize))]
        body: String,
        half_stars: u8,
        tamper: u8,
    },
    Delete {
        comment: usize,
    },
    Vote {
        user: usize,
        comment: usize,
        value: i64,
    },
    GetById {
        comment: usize,
    },
    BookComments {
        book: usize,
    },
    Voted {
        user: usize,
        #[generator(bolero::generator::gen_with::<Vec<usize>>().len(0..10usize))]
        comments: Vec<usize>,
    },
    UserVotes {
        user: usize,
    },
}

fn compare<T>(name: &str, app_res: Result<T, StoreError>, mock_res: Result<T, StoreError>)
where
    T: Debug + PartialEq,
{
    assert_eq!(
        app_res.map_err(StoreError::into_api),
        mock_res.map_err(StoreError::into_api),
        "postgres and mock did not return the same result for {name}"
    );
}

fn resize_int(fuzz_id: usize, RangeTo { end }: RangeTo<usize>) -> Option<usize> {
    if end == 0 {
        return None;
    }
    let bucket_size = cmp::max(1, usize::MAX / end); // in case we rounded to 0
    let id = fuzz_id / bucket_size;
    Some(cmp::min(id, end - 1)) // in case id was actually over end - 1 due to rounding
}

/// Picks one of the known items, or a fresh id nothing knows about
fn pick<T: Copy>(items: &[T], fuzz_id: usize, unknown: impl FnOnce(Uuid) -> T) -> T {
    match resize_int(fuzz_id, ..items.len()) {
        Some(i) => items[i],
        None => unknown(Uuid::new_v4()),
    }
}

fn rating(half_stars: u8) -> Rating {
    Rating(f32::from(half_stars) / 2.0)
}

struct ComparativeFuzzer {
    app: PgDb,
    mock: MockDb,
    users: Arc<MockUsers>,
    books: Arc<MockBooks>,
    clock: Arc<ManualClock>,
    known_users: Vec<UserId>,
    known_books: Vec<BookId>,
    known_comments: Vec<CommentId>,
}

impl ComparativeFuzzer {
    fn new(pool: sqlx::PgPool) -> ComparativeFuzzer {
        let users = Arc::new(MockUsers::new());
        let books = Arc::new(MockBooks::new());
        let clock = Arc::new(ManualClock::starting_now());
        ComparativeFuzzer {
            app: PgDb::with_clock(pool, users.clone(), books.clone(), clock.clone()),
            mock: MockDb::with_clock(users.clone(), books.clone(), clock.clone()),
            users,
            books,
            clock,
            known_users: Vec::new(),
            known_books: Vec::new(),
            known_comments: Vec::new(),
        }
    }

    fn user(&self, fuzz_id: usize) -> UserId {
        pick(&self.known_users, fuzz_id, UserId)
    }

    fn book(&self, fuzz_id: usize) -> BookId {
        pick(&self.known_books, fuzz_id, BookId)
    }

    fn comment(&self, fuzz_id: usize) -> CommentId {
        pick(&self.known_comments, fuzz_id, CommentId)
    }

    async fn create(&mut self, name: &str, c: NewComment) {
        let app = self.app.create(c.clone()).await;
        let mock = self.mock.create(c.clone()).await;
        if mock.is_ok() {
            self.known_comments.push(c.id);
        }
        compare(name, app, mock);
    }

    async fn execute_fuzz_op(&mut self, op: FuzzOp) {
        match op {
            FuzzOp::AddBook => {
                let book = BookId(Uuid::new_v4());
                self.books.insert(book).await;
                self.known_books.push(book);
            }
            FuzzOp::RemoveBook { book } => {
                self.books.remove(self.book(book)).await;
            }
            FuzzOp::AddUser { display_name } => {
                let discriminator = (self.known_users.len() % 9999) as u16 + 1;
                let user = User {
                    id: UserId(Uuid::new_v4()),
                    display_name: Some(display_name),
                    pronouns: None,
                    username: Username::new("reader", discriminator)
                        .expect("building fuzz username"),
                    avatar: None,
                };
                self.known_users.push(user.id);
                self.users.insert(user).await;
            }
            FuzzOp::RemoveUser { user } => {
                self.users.remove(self.user(user)).await;
            }
            FuzzOp::Tick { minutes } => {
                self.clock.advance(Duration::minutes(i64::from(minutes)));
            }
            FuzzOp::CreateReview {
                book,
                poster,
                body,
                half_stars,
            } => {
                let c = NewComment::review(
                    self.book(book),
                    self.user(poster),
                    body,
                    rating(half_stars),
                );
                self.create("CreateReview", c).await;
            }
            FuzzOp::CreateReply {
                poster,
                parent,
                body,
            } => {
                let parent = self.comment(parent);
                // replies to unknown comments still need a book that exists
                let book = match self.mock.get_by_id(parent).await {
                    Ok(p) => p.book_id,
                    Err(_) => self.book(0),
                };
                let c = NewComment::reply(book, self.user(poster), body, parent);
                self.create("CreateReply", c).await;
            }
            FuzzOp::ReuseId { comment, poster } => {
                let mut c = NewComment::review(
                    self.book(0),
                    self.user(poster),
                    String::new(),
                    Rating(Rating::MAX),
                );
                c.id = self.comment(comment);
                self.create("ReuseId", c).await;
            }
            FuzzOp::Update {
                comment,
                body,
                half_stars,
                tamper,
            } => {
                let id = self.comment(comment);
                let mut c = match self.mock.get_by_id(id).await {
                    Ok(c) => c,
                    Err(_) => {
                        compare(
                            "Update (get)",
                            self.app.get_by_id(id).await,
                            self.mock.get_by_id(id).await,
                        );
                        return;
                    }
                };
                c.body = body;
                c.rating = Some(rating(half_stars));
                match tamper % 5 {
                    1 => c.book_id = BookId(Uuid::new_v4()),
                    2 => c.poster.id = UserId(Uuid::new_v4()),
                    3 => c.parent_id = Some(CommentId(Uuid::new_v4())),
                    4 => c.date = c.date + Duration::seconds(1),
                    _ => (),
                }
                compare(
                    "Update",
                    self.app.update(c.clone()).await,
                    self.mock.update(c).await,
                );
            }
            FuzzOp::Delete { comment } => {
                let id = self.comment(comment);
                compare(
                    "Delete",
                    self.app.delete(id).await,
                    self.mock.delete(id).await,
                );
            }
            FuzzOp::Vote {
                user,
                comment,
                value,
            } => {
                let (user, comment) = (self.user(user), self.comment(comment));
                compare(
                    "Vote",
                    self.app.vote(user, comment, value).await,
                    self.mock.vote(user, comment, value).await,
                );
            }
            FuzzOp::GetById { comment } => {
                let id = self.comment(comment);
                compare(
                    "GetById",
                    self.app.get_by_id(id).await,
                    self.mock.get_by_id(id).await,
                );
            }
            FuzzOp::BookComments { book } => {
                let book = self.book(book);
                compare(
                    "BookComments",
                    self.app.book_comments(book).await,
                    self.mock.book_comments(book).await,
                );
            }
            FuzzOp::Voted { user, comments } => {
                let user = self.user(user);
                let comments = comments
                    .into_iter()
                    .map(|c| self.comment(c))
                    .collect::<Vec<_>>();
                compare(
                    "Voted",
                    self.app.voted(user, &comments).await,
                    self.mock.voted(user, &comments).await,
                );
            }
            FuzzOp::UserVotes { user } => {
                let user = self.user(user);
                compare(
                    "UserVotes",
                    self.app.user_votes(user).await,
                    self.mock.user_votes(user).await,
                );
            }
        }
    }

    async fn check_final_state(&self) {
        for book in &self.known_books {
            compare(
                "final BookComments",
                self.app.book_comments(*book).await,
                self.mock.book_comments(*book).await,
            );
        }
        for user in &self.known_users {
            compare(
                "final UserVotes",
                self.app.user_votes(*user).await,
                self.mock.user_votes(*user).await,
            );
        }
        assert!(self.mock.test_tallies_consistent().await);
    }
}

do_sqlx_test!(
    compare_with_mock,
    bolero::generator::gen_with::<Vec<FuzzOp>>().len(1..100usize),
    |pool, test: Vec<FuzzOp>| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool);
        for op in test {
            fuzzer.execute_fuzz_op(op).await;
        }
        fuzzer.check_final_state().await;
    }
);

do_sqlx_test!(
    concurrent_votes_keep_tally,
    bolero::generator::gen_with::<Vec<i8>>().len(1..20usize),
    |pool, votes: Vec<i8>| async move {
        let users = Arc::new(MockUsers::new());
        let books = Arc::new(MockBooks::new());
        let book = BookId(Uuid::new_v4());
        books.insert(book).await;
        let app = PgDb::new(pool, users, books);

        let poster = UserId(Uuid::new_v4());
        let id = app
            .create(NewComment::review(
                book,
                poster,
                String::from("contested"),
                Rating(3.0),
            ))
            .await
            .expect("creating contested comment")
            .id;

        let results = futures::future::join_all(votes.iter().map(|v| {
            let app = &app;
            async move {
                app.vote(UserId(Uuid::new_v4()), id, i64::from(*v))
                    .await
                    .map_err(StoreError::into_api)
            }
        }))
        .await;

        let mut expected = 1;
        for (v, res) in votes.iter().zip(results) {
            match res {
                Ok(_) => expected += i64::from(v.signum()),
                Err(ApiError::ConflictDuringCommit(_)) => (),
                Err(e) => panic!("unexpected error while voting: {e}"),
            }
        }
        let stored = app.get_by_id(id).await.expect("fetching contested comment");
        assert_eq!(stored.votes, expected);
    }
);

do_sqlx_test!(
    committed_writes_survive_user_directory_outage,
    bolero::generator::gen_with::<String>().len(0..50usize),
    |pool, body: String| async move {
        let users = Arc::new(MockUsers::new());
        let books = Arc::new(MockBooks::new());
        let book = BookId(Uuid::new_v4());
        books.insert(book).await;
        let app = PgDb::new(pool, users.clone(), books.clone());
        let poster = UserId(Uuid::new_v4());
        let body = body.replace('\0', "");

        users.set_down(true);
        let review = NewComment::review(book, poster, body.clone(), Rating(4.0));
        let c = app
            .create(review)
            .await
            .expect("creating comment while the user directory is down");
        assert_eq!(c.poster, CommentUser::ghost(poster));
        assert_eq!(c.votes, 1);
        let mut edit = c.clone();
        edit.body.push('!');
        let edited = app
            .update(edit)
            .await
            .expect("updating comment while the user directory is down");
        assert_eq!(edited.poster, CommentUser::ghost(poster));
        users.set_down(false);

        let stored = app.get_by_id(c.id).await.expect("fetching comment");
        assert_eq!(stored.body, format!("{body}!"));
        assert_eq!(app.book_comments(book).await.expect("listing comments").len(), 1);
        books.remove(book).await;
        assert_eq!(app.book_comments(book).await.expect("listing comments").len(), 1);
    }
);
