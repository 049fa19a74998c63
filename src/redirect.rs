//! Redirect handling.
//!
//! The client follows `301`, `302`, `303` and `307` responses up to the
//! policy's bound, rewriting the method the way browsers historically do:
//! `POST` becomes `GET` on 301/302, everything becomes `GET` on 303, and
//! 307 preserves the method (and body).

use std::fmt;

use http::{Method, StatusCode};

/// A type that controls the policy on how to handle the following of
/// redirects.
///
/// The default policy follows up to 10 redirects.
#[derive(Debug)]
pub struct Policy {
    inner: PolicyKind,
}

impl Policy {
    /// Create a `Policy` with a maximum number of redirects to follow.
    ///
    /// A redirect past the limit is returned to the caller as-is.
    pub fn limited(max: usize) -> Policy {
        Policy {
            inner: PolicyKind::Limit(max),
        }
    }

    /// Create a `Policy` that does not follow any redirect.
    pub fn none() -> Policy {
        Policy {
            inner: PolicyKind::None,
        }
    }

    pub(crate) fn check(&self, status: StatusCode, followed: usize) -> Action {
        if !is_redirect(status) {
            return Action::Stop;
        }
        match self.inner {
            PolicyKind::Limit(max) => {
                if followed < max {
                    Action::Follow
                } else {
                    Action::Stop
                }
            }
            PolicyKind::None => Action::Stop,
        }
    }
}

impl Default for Policy {
    fn default() -> Policy {
        Policy::limited(10)
    }
}

enum PolicyKind {
    Limit(usize),
    None,
}

impl fmt::Debug for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PolicyKind::Limit(max) => f.debug_tuple("Limit").field(&max).finish(),
            PolicyKind::None => f.pad("None"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Action {
    Follow,
    Stop,
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307)
}

/// The method used for the follow-up request.
pub(crate) fn redirect_method(status: StatusCode, method: Method) -> Method {
    match status.as_u16() {
        303 => Method::GET,
        301 | 302 if method == Method::POST => Method::GET,
        _ => method,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_allows_then_stops() {
        let policy = Policy::limited(2);
        let found = StatusCode::FOUND;
        assert_eq!(policy.check(found, 0), Action::Follow);
        assert_eq!(policy.check(found, 1), Action::Follow);
        assert_eq!(policy.check(found, 2), Action::Stop);
    }

    #[test]
    fn none_never_follows() {
        let policy = Policy::none();
        assert_eq!(policy.check(StatusCode::FOUND, 0), Action::Stop);
    }

    #[test]
    fn non_redirect_statuses_stop() {
        let policy = Policy::default();
        assert_eq!(policy.check(StatusCode::OK, 0), Action::Stop);
        assert_eq!(policy.check(StatusCode::PERMANENT_REDIRECT, 0), Action::Stop);
    }

    #[test]
    fn method_rewrite_rules() {
        assert_eq!(
            redirect_method(StatusCode::MOVED_PERMANENTLY, Method::POST),
            Method::GET
        );
        assert_eq!(redirect_method(StatusCode::FOUND, Method::POST), Method::GET);
        assert_eq!(
            redirect_method(StatusCode::FOUND, Method::DELETE),
            Method::DELETE
        );
        assert_eq!(
            redirect_method(StatusCode::SEE_OTHER, Method::PUT),
            Method::GET
        );
        assert_eq!(
            redirect_method(StatusCode::SEE_OTHER, Method::HEAD),
            Method::GET
        );
        assert_eq!(
            redirect_method(StatusCode::TEMPORARY_REDIRECT, Method::POST),
            Method::POST
        );
    }
}
