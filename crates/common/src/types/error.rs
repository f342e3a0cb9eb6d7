// SDB - Stored Program Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result type returned by every database-facing debug operation.
pub type DbResult<T> = Result<T, DbError>;

/// A cloneable database error
///
/// Protocol adapters wrap whatever their driver reports into this type so the
/// session engine can store, log and forward failures without caring about the
/// driver's error type. The vendor code (e.g. `ORA-01031` becomes `1031`) is
/// kept when the driver exposes one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbError {
    code: Option<i32>,
    message: String,
}

impl DbError {
    /// Create a new error with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self { code: None, message: message.into() }
    }

    /// Create a new error carrying a vendor error code
    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self { code: Some(code), message: message.into() }
    }

    /// Create from any error type
    pub fn from_error<E: std::error::Error>(err: E) -> Self {
        Self::new(err.to_string())
    }

    /// Vendor error code, if the driver reported one
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    /// Error text as reported by the database
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "database error {code}: {}", self.message),
            None => write!(f, "database error: {}", self.message),
        }
    }
}

impl std::error::Error for DbError {}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::from_error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_and_without_code() {
        let plain = DbError::new("connection reset");
        assert_eq!(plain.to_string(), "database error: connection reset");
        assert_eq!(plain.code(), None);

        let coded = DbError::with_code(1031, "insufficient privileges");
        assert_eq!(coded.to_string(), "database error 1031: insufficient privileges");
        assert_eq!(coded.code(), Some(1031));
        assert_eq!(coded.message(), "insufficient privileges");
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: DbError = io.into();
        assert_eq!(err.message(), "pipe closed");
    }

    #[test]
    fn test_serde_keeps_code() {
        let err = DbError::with_code(20001, "user raised");
        let json = serde_json::to_string(&err).unwrap();
        let back: DbError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
