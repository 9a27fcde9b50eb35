use std::io;

/// Catch-all error type shared across the workspace.
///
/// Per-crate error enums (`BrowserError`, `QueueError`, `SwitchError`, `PipelineError`, ...)
/// carry their own variants and convert into this one with `#[from]` at crate boundaries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn message(msg: impl Into<String>) -> Self {
        Error::Message(msg.into())
    }

    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Other(Box::new(err))
    }
}

/// Conversion from a plain string, used by the `Context` trait generated by [`impl_context`].
pub trait FromMessage {
    fn from_message(msg: String) -> Self;
}

impl FromMessage for Error {
    fn from_message(msg: String) -> Self {
        Error::Message(msg)
    }
}

/// Generates a local `Context` trait implemented for `Result<T, E: Display>` and `Option<T>`,
/// producing `$err_ty` on failure. Each downstream crate invokes this once with its own error
/// type so `.context("...")` reads naturally against that crate's error enum.
#[macro_export]
macro_rules! impl_context {
    ($err_ty:ty) => {
        pub trait Context<T> {
            fn context(self, msg: impl Into<String>) -> ::std::result::Result<T, $err_ty>;
            fn with_context<F, S>(self, f: F) -> ::std::result::Result<T, $err_ty>
            where
                F: FnOnce() -> S,
                S: Into<String>;
        }

        impl<T, E: ::std::fmt::Display> Context<T> for ::std::result::Result<T, E> {
            fn context(self, msg: impl Into<String>) -> ::std::result::Result<T, $err_ty> {
                self.map_err(|e| {
                    $crate::FromMessage::from_message(format!("{}: {e}", msg.into()))
                })
            }

            fn with_context<F, S>(self, f: F) -> ::std::result::Result<T, $err_ty>
            where
                F: FnOnce() -> S,
                S: Into<String>,
            {
                self.map_err(|e| {
                    $crate::FromMessage::from_message(format!("{}: {e}", f().into()))
                })
            }
        }

        impl<T> Context<T> for ::std::option::Option<T> {
            fn context(self, msg: impl Into<String>) -> ::std::result::Result<T, $err_ty> {
                self.ok_or_else(|| $crate::FromMessage::from_message(msg.into()))
            }

            fn with_context<F, S>(self, f: F) -> ::std::result::Result<T, $err_ty>
            where
                F: FnOnce() -> S,
                S: Into<String>,
            {
                self.ok_or_else(|| $crate::FromMessage::from_message(f().into()))
            }
        }
    };
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    impl_context!(Error);

    #[test]
    fn context_wraps_result_err() {
        let r: std::result::Result<(), &str> = Err("boom");
        let err = r.context("loading identity").unwrap_err();
        assert_eq!(err.to_string(), "loading identity: boom");
    }

    #[test]
    fn context_leaves_ok_untouched() {
        let r: std::result::Result<u32, &str> = Ok(7);
        assert_eq!(r.context("whatever").unwrap(), 7);
    }

    #[test]
    fn option_context_produces_message_error() {
        let none: Option<u32> = None;
        let err = none.context("missing auth index").unwrap_err();
        assert!(matches!(err, Error::Message(ref m) if m == "missing auth index"));
    }
}
