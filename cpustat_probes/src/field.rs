use std::io;

/// A value that has been read from the hardware or the kernel, or the reason why it could not be.
///
/// Every field of a snapshot fails independently: one unreadable file never prevents the
/// other fields from being sampled.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<T> {
    Present(T),
    Absent(FieldError),
}

/// Why a single field is absent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("short read ({0}/8 bytes)")]
    ShortRead(usize),
    #[error("failed to parse '{0}'")]
    Parse(String),
    #[error("not available on this system")]
    Unmapped,
    #[error("{0}")]
    Io(String),
}

impl From<io::Error> for FieldError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => FieldError::NotFound,
            io::ErrorKind::PermissionDenied => FieldError::PermissionDenied,
            io::ErrorKind::UnexpectedEof => FieldError::ShortRead(0),
            _ => FieldError::Io(e.to_string()),
        }
    }
}

impl<T> Field<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Field::Present(v) => Some(v),
            Field::Absent(_) => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Field::Present(_))
    }

    pub fn error(&self) -> Option<&FieldError> {
        match self {
            Field::Present(_) => None,
            Field::Absent(e) => Some(e),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Field<U> {
        match self {
            Field::Present(v) => Field::Present(f(v)),
            Field::Absent(e) => Field::Absent(e),
        }
    }
}

impl<T: Copy> Field<T> {
    pub fn get(&self) -> Option<T> {
        self.value().copied()
    }
}

impl<T> From<Result<T, FieldError>> for Field<T> {
    fn from(r: Result<T, FieldError>) -> Self {
        match r {
            Ok(v) => Field::Present(v),
            Err(e) => Field::Absent(e),
        }
    }
}
