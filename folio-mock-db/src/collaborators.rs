use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use chrono::Duration;
use folio_api::{BookCatalog, BookId, Clock, SystemClock, Time, User, UserId};
use tokio::sync::RwLock;

/// In-memory user directory
#[derive(Debug, Default)]
pub struct MockUsers {
    users: RwLock<HashMap<UserId, User>>,
    down: AtomicBool,
}

impl MockUsers {
    pub fn new() -> MockUsers {
        MockUsers::default()
    }

    /// Adds the user, or replaces its profile if it already exists
    pub async fn insert(&self, u: User) {
        self.users.write().await.insert(u.id, u);
    }

    pub async fn remove(&self, id: UserId) -> Option<User> {
        self.users.write().await.remove(&id)
    }

    /// While down, every lookup fails
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check_up(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.down.load(Ordering::SeqCst),
            "user directory is unavailable"
        );
        Ok(())
    }
}

#[async_trait]
impl folio_api::UserDirectory for MockUsers {
    async fn get_user(&self, id: UserId) -> anyhow::Result<Option<User>> {
        self.check_up()?;
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn get_users(&self, ids: &[UserId]) -> anyhow::Result<HashMap<UserId, User>> {
        self.check_up()?;
        let users = self.users.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| users.get(id).map(|u| (*id, u.clone())))
            .collect())
    }
}

/// In-memory book catalog, that only knows which books exist
#[derive(Debug, Default)]
pub struct MockBooks(RwLock<HashSet<BookId>>);

impl MockBooks {
    pub fn new() -> MockBooks {
        MockBooks::default()
    }

    pub async fn insert(&self, id: BookId) {
        self.0.write().await.insert(id);
    }

    pub async fn remove(&self, id: BookId) -> bool {
        self.0.write().await.remove(&id)
    }
}

#[async_trait]
impl BookCatalog for MockBooks {
    async fn book_exists(&self, id: BookId) -> anyhow::Result<bool> {
        Ok(self.0.read().await.contains(&id))
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock(parking_lot::Mutex<Time>);

impl ManualClock {
    pub fn new(start: Time) -> ManualClock {
        ManualClock(parking_lot::Mutex::new(start))
    }

    pub fn starting_now() -> ManualClock {
        ManualClock::new(SystemClock.now())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.0.lock();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        *self.0.lock()
    }
}
