use std::{fmt, panic::Location};

/// A source position at which a lock was acquired, released or waited on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Site {
    pub file: &'static str,
    pub line: u32,
}

impl Site {
    /// The position recorded for witnesses created from the seed order list.
    pub const ORDER_LIST: Site = Site::new("order list", 0);

    pub const fn new(file: &'static str, line: u32) -> Self {
        Site { file, line }
    }

    /// The position of the caller, propagated through `#[track_caller]`.
    #[track_caller]
    pub fn caller() -> Self {
        Site::from(Location::caller())
    }
}

impl From<&'static Location<'static>> for Site {
    fn from(location: &'static Location<'static>) -> Self {
        Site::new(location.file(), location.line())
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}
