use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum Vote {
    Up,
    Down,
}

impl Vote {
    /// `None` means the vote is taken back
    pub fn from_value(value: i64) -> Option<Vote> {
        match value.cmp(&0) {
            Ordering::Greater => Some(Vote::Up),
            Ordering::Less => Some(Vote::Down),
            Ordering::Equal => None,
        }
    }

    pub fn value(self) -> i8 {
        match self {
            Vote::Up => 1,
            Vote::Down => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization() {
        assert_eq!(Vote::from_value(1), Some(Vote::Up));
        assert_eq!(Vote::from_value(42), Some(Vote::Up));
        assert_eq!(Vote::from_value(i64::MAX), Some(Vote::Up));
        assert_eq!(Vote::from_value(-1), Some(Vote::Down));
        assert_eq!(Vote::from_value(i64::MIN), Some(Vote::Down));
        assert_eq!(Vote::from_value(0), None);
        assert_eq!(Vote::Up.value() + Vote::Down.value(), 0);
    }
}
