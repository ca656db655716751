//! Request manager answering from a script.
//!
//! Used by the replay tool and the test suite. Refresh responses are consumed
//! in order; page responses are looked up by token and may be served any
//! number of times.

use super::{RequestError, RequestManager, RequestReason};
use crate::model::ContinuationToken;
use crate::protocol::Response;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

type Scripted = Result<Response, RequestError>;

#[derive(Default)]
pub struct ScriptedRequestManager {
    refreshes: Mutex<VecDeque<Scripted>>,
    pages: Mutex<HashMap<ContinuationToken, Scripted>>,
    delay: Mutex<Duration>,
    refresh_calls: AtomicUsize,
    load_more_calls: AtomicUsize,
}

impl ScriptedRequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latency applied to every call
    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn push_refresh(&self, response: Response) {
        self.lock_refreshes().push_back(Ok(response));
    }

    pub fn push_refresh_error(&self, error: RequestError) {
        self.lock_refreshes().push_back(Err(error));
    }

    pub fn set_page(&self, token: ContinuationToken, response: Response) {
        self.lock_pages().insert(token, Ok(response));
    }

    pub fn set_page_error(&self, token: ContinuationToken, error: RequestError) {
        self.lock_pages().insert(token, Err(error));
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn load_more_calls(&self) -> usize {
        self.load_more_calls.load(Ordering::SeqCst)
    }

    fn lock_refreshes(&self) -> std::sync::MutexGuard<'_, VecDeque<Scripted>> {
        self.refreshes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pages(&self) -> std::sync::MutexGuard<'_, HashMap<ContinuationToken, Scripted>> {
        self.pages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn wait(&self) {
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RequestManager for ScriptedRequestManager {
    async fn refresh(&self, reason: RequestReason) -> Result<Response, RequestError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        // An exhausted script answers with an empty response
        let next = self.lock_refreshes().pop_front();
        debug!(%reason, scripted = next.is_some(), "Scripted refresh");
        next.unwrap_or_else(|| Ok(Response::default()))
    }

    async fn load_more(&self, token: &ContinuationToken) -> Result<Response, RequestError> {
        self.load_more_calls.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        self.lock_pages()
            .get(token)
            .cloned()
            .unwrap_or_else(|| {
                Err(RequestError::Status {
                    code: 404,
                    message: format!("no page scripted for token {}", token),
                })
            })
    }
}
