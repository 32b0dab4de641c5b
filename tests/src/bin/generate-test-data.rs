use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rand::{seq::SliceRandom, Rng};
use uuid::Uuid;

const NUM_USERS: usize = 30;
const NUM_BOOKS: usize = 20;

const MAX_REVIEWS_PER_BOOK: usize = 12;
const NUM_REPLIES: usize = 400;
const NUM_VOTES: usize = 2000;

const BODY_MAX_WORDS: usize = 80;
const DELETED_PERCENT: f64 = 0.05;
const EDITED_PERCENT: f64 = 0.2;

struct Comment {
    id: Uuid,
    book: Uuid,
    poster: Uuid,
    body: String,
    rating: Option<f32>,
    parent: Option<Uuid>,
    deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn gen_n_items(table: &str, n: usize, mut f: impl FnMut(usize) -> String) {
    println!("INSERT INTO {} VALUES", table);
    for i in 0..n {
        if i != 0 {
            println!(",");
        }
        print!("    {}", f(i));
    }
    println!();
    println!("ON CONFLICT DO NOTHING;");
}

fn gen_body(rng: &mut impl Rng) -> String {
    lipsum::lipsum_words(rng.gen_range(1..=BODY_MAX_WORDS)).replace('\'', "''")
}

fn gen_comment(
    rng: &mut impl Rng,
    book: Uuid,
    poster: Uuid,
    rating: Option<f32>,
    parent: Option<Uuid>,
    created_at: DateTime<Utc>,
) -> Comment {
    let deleted = rng.gen_bool(DELETED_PERCENT);
    let updated_at = match rng.gen_bool(EDITED_PERCENT) {
        true => created_at + Duration::minutes(rng.gen_range(1..=3 * 24 * 60)),
        false => created_at,
    };
    Comment {
        id: Uuid::new_v4(),
        book,
        poster,
        body: match deleted {
            true => String::new(),
            false => gen_body(rng),
        },
        rating,
        parent,
        deleted,
        created_at,
        updated_at,
    }
}

fn sql_opt<T: std::fmt::Display>(v: &Option<T>, quote: bool) -> String {
    match (v, quote) {
        (None, _) => String::from("NULL"),
        (Some(v), true) => format!("'{}'", v),
        (Some(v), false) => format!("{}", v),
    }
}

fn main() {
    let mut rng = rand::thread_rng();
    let users = (0..NUM_USERS).map(|_| Uuid::new_v4()).collect::<Vec<_>>();
    let books = (0..NUM_BOOKS).map(|_| Uuid::new_v4()).collect::<Vec<_>>();
    let start = Utc::now() - Duration::days(60);

    // Books and users live in other services, list them for seeding those
    for b in &books {
        println!("-- book {}", b);
    }
    for u in &users {
        println!("-- user {}", u);
    }

    // Reviews, at most one per user and book
    let mut comments = Vec::new();
    for book in &books {
        let n = rng.gen_range(1..=MAX_REVIEWS_PER_BOOK);
        for poster in users.choose_multiple(&mut rng, n) {
            let rating = f32::from(rng.gen_range(1..=10u8)) / 2.0;
            let date = start + Duration::minutes(rng.gen_range(0..30 * 24 * 60));
            let c = gen_comment(&mut rng, *book, *poster, Some(rating), None, date);
            comments.push(c);
        }
    }

    // Replies, always posted after their parent and on its book
    for _ in 0..NUM_REPLIES {
        let parent = &comments[rng.gen_range(0..comments.len())];
        if parent.deleted {
            continue;
        }
        let (book, parent_id, parent_date) = (parent.book, parent.id, parent.created_at);
        let poster = users[rng.gen_range(0..users.len())];
        let date = parent_date + Duration::minutes(rng.gen_range(1..7 * 24 * 60));
        let c = gen_comment(&mut rng, book, poster, None, Some(parent_id), date);
        comments.push(c);
    }

    // Votes, starting with every poster's own upvote
    let mut votes = HashMap::new();
    for c in &comments {
        votes.insert((c.id, c.poster), 1i16);
    }
    for _ in 0..NUM_VOTES {
        let c = &comments[rng.gen_range(0..comments.len())];
        if c.deleted {
            continue;
        }
        let user = users[rng.gen_range(0..users.len())];
        let vote = match rng.gen_bool(0.75) {
            true => 1,
            false => -1,
        };
        votes.insert((c.id, user), vote);
    }
    let mut tallies = HashMap::<Uuid, i64>::new();
    for ((c, _), v) in &votes {
        *tallies.entry(*c).or_default() += i64::from(*v);
    }

    gen_n_items("comments", comments.len(), |i| {
        let c = &comments[i];
        format!(
            "('{}', '{}', '{}', '{}', {}, {}, {}, '{}', '{}', {})",
            c.id,
            c.book,
            c.poster,
            c.body,
            sql_opt(&c.rating, false),
            sql_opt(&c.parent, true),
            c.deleted,
            c.created_at.to_rfc3339(),
            c.updated_at.to_rfc3339(),
            tallies.get(&c.id).copied().unwrap_or(0),
        )
    });

    let votes = votes.into_iter().collect::<Vec<_>>();
    gen_n_items("votes", votes.len(), |i| {
        let ((comment, user), vote) = votes[i];
        format!("('{}', '{}', {})", comment, user, vote)
    });
}
