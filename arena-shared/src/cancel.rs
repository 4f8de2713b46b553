//! Cooperative shutdown. A [`Token`] is cloned into every long-running
//! task; dropping the matching [`Guard`] flips the flag and wakes them all.

use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::watch;

/// A one-way shutdown flag backed by a watch channel. The channel carries a
/// single bool that only ever moves from `false` to `true`, so waiters can
/// subscribe at any point and never miss the transition.
#[derive(Clone)]
pub struct Token {
    flag: Arc<watch::Sender<bool>>,
}

impl Token {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    /// Resolves once the token is cancelled; immediately if it already is.
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            // The sender lives inside `self`, so `changed` cannot fail
            // while we are borrowed here.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn guard(&self) -> Guard {
        Guard {
            token: self.clone(),
        }
    }
}

impl Default for Token {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Self { flag: Arc::new(tx) }
    }
}

/// Cancels its token when dropped.
pub struct Guard {
    token: Token,
}

impl Deref for Guard {
    type Target = Token;

    fn deref(&self) -> &Token {
        &self.token
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
