use std::any::Any;
use std::fmt;

use static_assertions::assert_impl_all;
use thiserror::Error;

pub(crate) type PanicPayload = Box<dyn Any + Send + 'static>;

pub(crate) fn panic_message(payload: &PanicPayload) -> Option<&str> {
    let payload = payload.as_ref();
    if let Some(s) = payload.downcast_ref::<&str>() {
        Some(s)
    } else {
        payload.downcast_ref::<String>().map(|s| s.as_str())
    }
}

/// Panic caught at a fiber boundary.
///
/// Fibers never propagate panics to whoever resumed them. [crate::fiber::JoinHandle::join] hands
/// the caught payload over as this error instead.
#[derive(Error)]
#[error("fiber panicked: {}", panic_message(.payload).unwrap_or(".."))]
pub struct JoinError {
    payload: PanicPayload,
}

assert_impl_all!(JoinError: Send);

impl JoinError {
    pub(crate) fn new(payload: PanicPayload) -> Self {
        JoinError { payload }
    }

    /// Returns panic message if the payload is a string.
    pub fn message(&self) -> Option<&str> {
        panic_message(&self.payload)
    }

    /// Converts this error to panicked object, say, to [std::panic::resume_unwind] it.
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        self.payload
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            None => write!(f, "JoinError::Panic({:?})", self.payload.as_ref().type_id()),
            Some(s) => write!(f, "JoinError::Panic({:?})", s),
        }
    }
}

/// Error for push to a closed [crate::channel::Rendezvous]. It carries the rejected value.
#[derive(Error, Copy, Clone, PartialEq, Eq)]
pub enum PushError<T> {
    #[error("push to closed channel")]
    Closed(T),
}

impl<T> PushError<T> {
    /// Takes back the rejected value.
    pub fn into_inner(self) -> T {
        let PushError::Closed(value) = self;
        value
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PushError::Closed(..)")
    }
}

#[cfg(test)]
mod tests {
    use std::panic;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn join_error_message() {
        let err = JoinError::new(panic::catch_unwind(|| panic!("oooooops {}", 5)).unwrap_err());
        assert_eq!(err.message(), Some("oooooops 5"));
        assert_eq!(err.to_string(), "fiber panicked: oooooops 5");
        assert_eq!(format!("{:?}", err), r#"JoinError::Panic("oooooops 5")"#);
    }

    #[test]
    fn join_error_opaque_payload() {
        let err = JoinError::new(panic::catch_unwind(|| panic::panic_any(5usize)).unwrap_err());
        assert_eq!(err.message(), None);
        assert_eq!(err.to_string(), "fiber panicked: ..");
        assert_eq!(*err.into_panic().downcast::<usize>().unwrap(), 5);
    }

    #[test]
    fn push_error() {
        let err = PushError::Closed(vec![1, 2]);
        assert_eq!(err.to_string(), "push to closed channel");
        assert_eq!(err.into_inner(), vec![1, 2]);
    }
}
