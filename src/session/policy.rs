//! Session admission policy.
//!
//! The scheduler picks a `RequestBehavior` for each new session; `admit`
//! turns it into what the manager must do: whether to start a refresh and
//! what the session waits for before becoming Ready.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestBehavior {
    /// Ready immediately on existing content; request only when head is empty
    NoRequestWithContent,
    /// Wait for an outstanding request, bounded by the session timeout
    NoRequestWithTimeout,
    /// Issue (or join) a request and wait for it
    RequestWithWait,
    /// Issue (or join) a request but become Ready on existing content
    RequestWithContent,
    /// Issue (or join) a request, bounded by the session timeout
    RequestWithTimeout,
    /// Wait for an outstanding request without a bound
    NoRequestWithWait,
}

/// Decides how a new session is populated.
pub trait SchedulerApi: Send + Sync {
    fn should_make_request(&self, session_has_content: bool) -> RequestBehavior;
}

/// Scheduler returning one configurable behaviour
#[derive(Debug)]
pub struct FixedScheduler {
    behavior: Mutex<RequestBehavior>,
}

impl FixedScheduler {
    pub fn new(behavior: RequestBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
        }
    }

    pub fn set_behavior(&self, behavior: RequestBehavior) {
        *self.behavior.lock().unwrap_or_else(PoisonError::into_inner) = behavior;
    }
}

impl SchedulerApi for FixedScheduler {
    fn should_make_request(&self, _session_has_content: bool) -> RequestBehavior {
        *self.behavior.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What an Initializing session waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    /// Ready right away
    Nothing,
    /// Ready when the outstanding refresh completes
    Request,
    /// Ready when the outstanding refresh completes or the timeout fires
    RequestOrTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Admission {
    /// Start a refresh (false when one is already outstanding)
    pub issue_request: bool,
    pub wait: Wait,
}

pub(crate) fn admit(
    behavior: RequestBehavior,
    has_content: bool,
    request_outstanding: bool,
) -> Admission {
    use RequestBehavior::*;

    let (wants_request, wait) = match behavior {
        NoRequestWithContent if has_content => (false, Wait::Nothing),
        NoRequestWithContent => (true, Wait::Request),
        NoRequestWithTimeout if request_outstanding || !has_content => {
            (false, Wait::RequestOrTimeout)
        }
        NoRequestWithTimeout => (false, Wait::Nothing),
        RequestWithWait => (true, Wait::Request),
        RequestWithContent if has_content => (true, Wait::Nothing),
        RequestWithContent => (true, Wait::Request),
        RequestWithTimeout => (true, Wait::RequestOrTimeout),
        NoRequestWithWait if request_outstanding => (false, Wait::Request),
        NoRequestWithWait if has_content => (false, Wait::Nothing),
        NoRequestWithWait => (true, Wait::Request),
    };

    Admission {
        issue_request: wants_request && !request_outstanding,
        wait,
    }
}
