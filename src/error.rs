//! Definition of the fixed error-code surface every public operation returns.

use std::fmt;

/// Status returned by every fallible operation on a [`Domain`](crate::domain::Domain),
/// [`List`](crate::list::List) or [`ListIter`](crate::iter::ListIter).
///
/// Numeric values are canonized here (the two legacy header conventions this
/// crate descends from disagreed on `NoThread`/`Invalid`): `Success=0`,
/// `NoMem=-1`, `NotFound=-2`, `NoThread=-3`, `Invalid=-4`, `Full=-5`.
#[repr(i8)]
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Status {
    /// The operation completed successfully.
    Success = 0,
    /// Allocation failed; no visible state was changed.
    NoMem = -1,
    /// The element was not found (logical remove) or no visible element
    /// remained (remove_first).
    NotFound = -2,
    /// The calling thread is not registered with the required domain.
    NoThread = -3,
    /// A required argument was null or otherwise malformed.
    Invalid = -4,
    /// Reserved, currently unused by any operation.
    Full = -5,
}

impl Status {
    /// True for [`Status::Success`].
    #[inline]
    pub fn is_ok(self) -> bool {
        self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod test {
    use super::Status;

    #[test]
    fn display_matches_debug_name() {
        assert_eq!(format!("{}", Status::Success), "Success");
        assert_eq!(format!("{}", Status::NotFound), "NotFound");
    }

    #[test]
    fn is_ok_only_for_success() {
        assert!(Status::Success.is_ok());
        assert!(!Status::NoMem.is_ok());
        assert!(!Status::NotFound.is_ok());
        assert!(!Status::NoThread.is_ok());
        assert!(!Status::Invalid.is_ok());
    }

    #[test]
    fn numeric_values_are_canonized() {
        assert_eq!(Status::Success as i8, 0);
        assert_eq!(Status::NoMem as i8, -1);
        assert_eq!(Status::NotFound as i8, -2);
        assert_eq!(Status::NoThread as i8, -3);
        assert_eq!(Status::Invalid as i8, -4);
        assert_eq!(Status::Full as i8, -5);
    }

    #[test]
    fn implements_std_error() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<Status>();
    }
}
