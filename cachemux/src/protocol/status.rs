//! Response status codes.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Status {
    NoError = 0x0000,
    KeyNotFound = 0x0001,
    KeyExists = 0x0002,
    ValueTooLarge = 0x0003,
    InvalidArguments = 0x0004,
    ItemNotStored = 0x0005,
    IncrDecrOnNonNumeric = 0x0006,
    VbucketBelongsToAnotherServer = 0x0007,
    AuthenticationError = 0x0008,
    AuthenticationContinue = 0x0009,
    AuthenticationRequired = 0x0020,
    FurtherAuthRequired = 0x0021,
    UnknownCommand = 0x0081,
    OutOfMemory = 0x0082,
    NotSupported = 0x0083,
    InternalError = 0x0084,
    Busy = 0x0085,
    TemporaryFailure = 0x0086,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::NoError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_zero() {
        assert!(Status::NoError.is_success());
        let byte: u16 = Status::NoError.into();
        assert_eq!(byte, 0);
    }

    #[test]
    fn non_success_roundtrips() {
        assert_eq!(Status::try_from(0x0001u16).unwrap(), Status::KeyNotFound);
        assert!(!Status::KeyNotFound.is_success());
    }
}
