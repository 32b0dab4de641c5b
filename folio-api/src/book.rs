use uuid::Uuid;

use crate::STUB_UUID;

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(transparent)]
pub struct BookId(pub Uuid);

impl BookId {
    pub fn stub() -> BookId {
        BookId(STUB_UUID)
    }
}
