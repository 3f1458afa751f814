#[derive(Debug, Clone, Copy)]
pub enum Error {
    /// The host refused to hand over the backing memory for an arena of
    /// the requested size.
    ArenaReserve(usize),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::ArenaReserve(size) => {
                write!(f, "failed to reserve {size} bytes of backing memory")
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
