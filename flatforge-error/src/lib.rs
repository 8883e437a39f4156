//! Error handling for the flatforge crates.
//!
//! All fallible operations in the workspace return [`ForgeResult`]. Errors are
//! constructed with the [`forge_err`] and [`forge_bail`] macros so call sites
//! stay terse while messages keep their context.

use std::borrow::Cow;
use std::fmt::Display;

/// Cheap error message storage: static text costs nothing, formatted text
/// allocates once.
pub type ErrString = Cow<'static, str>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ForgeError {
    /// An operation was called against the wrong builder state: wrong open
    /// container, out-of-range field id, duplicate field, truncation past
    /// empty, and similar caller mistakes.
    #[error("invalid usage: {0}")]
    InvalidUsage(ErrString),
    /// Offset arithmetic left the representable range: the buffer grew past
    /// half the unsigned offset range, a vector byte size overflowed, or a
    /// relative offset no longer fits its wire field.
    #[error("representation overflow: {0}")]
    Overflow(ErrString),
    /// The emitter refused a write. The byte stream is incomplete and the
    /// builder must be reset before reuse.
    #[error("emitter rejected write: {0}")]
    EmitterRejected(ErrString),
    /// A previous operation failed and the builder only accepts `reset` or
    /// `clear` until then.
    #[error("builder poisoned by an earlier failure")]
    Poisoned,
}

pub type ForgeResult<T> = Result<T, ForgeError>;

/// Construct a [`ForgeError`] with `format!`-style arguments.
///
/// The leading `Variant:` selects the error variant and defaults to
/// `InvalidUsage` when omitted.
#[macro_export]
macro_rules! forge_err {
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::ForgeError::$variant($crate::err_string(format_args!($fmt $(, $arg)*)))
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::forge_err!(InvalidUsage: $fmt $(, $arg)*)
    };
}

/// Return early with a [`ForgeError`], `forge_err!` style.
#[macro_export]
macro_rules! forge_bail {
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        return Err($crate::forge_err!($variant: $fmt $(, $arg)*))
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        return Err($crate::forge_err!($fmt $(, $arg)*))
    };
}

#[doc(hidden)]
pub fn err_string(args: std::fmt::Arguments<'_>) -> ErrString {
    match args.as_str() {
        Some(s) => Cow::Borrowed(s),
        None => Cow::Owned(args.to_string()),
    }
}

/// Unwrap with context for conditions the caller has already established.
///
/// Prefer this over `unwrap`/`expect` in non-test code so that the rare
/// violation reports what was assumed rather than where it exploded.
pub trait ForgeExpect {
    type Output;

    fn forge_expect(self, msg: &str) -> Self::Output;
}

impl<T> ForgeExpect for Option<T> {
    type Output = T;

    #[allow(clippy::panic)]
    fn forge_expect(self, msg: &str) -> T {
        match self {
            Some(v) => v,
            None => panic!("expectation violated: {msg}"),
        }
    }
}

impl<T, E: Display> ForgeExpect for Result<T, E> {
    type Output = T;

    #[allow(clippy::panic)]
    fn forge_expect(self, msg: &str) -> T {
        match self {
            Ok(v) => v,
            Err(e) => panic!("expectation violated: {msg}: {e}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn static_messages_borrow() {
        let e = forge_err!("wrong frame");
        assert!(matches!(
            e,
            ForgeError::InvalidUsage(Cow::Borrowed("wrong frame"))
        ));
    }

    #[test]
    fn formatted_messages_own() {
        let id = 7;
        let e = forge_err!(Overflow: "field {} too large", id);
        assert_eq!(e.to_string(), "representation overflow: field 7 too large");
    }

    #[test]
    fn bail_returns_error() {
        fn f() -> ForgeResult<()> {
            forge_bail!(EmitterRejected: "short write");
        }
        assert!(matches!(f(), Err(ForgeError::EmitterRejected(_))));
    }

    #[test]
    fn forge_expect_passes_through() {
        assert_eq!(Some(3).forge_expect("three"), 3);
    }
}
