// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wake pipe for interrupting a blocked read.

use tokio::sync::watch;
use tracing::debug;

/// Reason a blocked read was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSignal {
    /// Tear everything down. Terminal.
    Close,
    /// Drop the current client only; a server keeps listening.
    Disconnect,
}

impl WakeSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            WakeSignal::Close => "close",
            WakeSignal::Disconnect => "disconnect",
        }
    }
}

/// Holds at most one pending [`WakeSignal`].
///
/// A tag signalled while nobody is waiting stays pending until it is drained,
/// so a read that starts late still sees it.
#[derive(Debug)]
pub struct WakePipe {
    tx: watch::Sender<Option<WakeSignal>>,
}

impl Default for WakePipe {
    fn default() -> Self {
        Self::new()
    }
}

impl WakePipe {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Post `signal`. A pending `Close` is never downgraded to `Disconnect`.
    pub fn signal(&self, signal: WakeSignal) {
        self.tx.send_modify(|pending| {
            if *pending != Some(WakeSignal::Close) {
                *pending = Some(signal);
            }
        });
        debug!("Wake pipe signalled: {}", signal.as_str());
    }

    /// The tag currently pending, if any.
    pub fn pending(&self) -> Option<WakeSignal> {
        *self.tx.borrow()
    }

    /// Resolve once a tag is pending. Does not consume it.
    pub async fn wait(&self) -> WakeSignal {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(signal) = *rx.borrow_and_update() {
                return signal;
            }
            // The sender lives in `self`, so the channel cannot close here.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Consume the pending tag.
    pub fn drain(&self) -> Option<WakeSignal> {
        self.tx.send_replace(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_close_supersedes_disconnect() {
        let pipe = WakePipe::new();
        pipe.signal(WakeSignal::Close);
        pipe.signal(WakeSignal::Disconnect);
        assert_eq!(pipe.pending(), Some(WakeSignal::Close));

        let pipe = WakePipe::new();
        pipe.signal(WakeSignal::Disconnect);
        pipe.signal(WakeSignal::Close);
        assert_eq!(pipe.pending(), Some(WakeSignal::Close));
    }

    #[test]
    fn test_drain_consumes_tag() {
        let pipe = WakePipe::new();
        assert_eq!(pipe.drain(), None);
        pipe.signal(WakeSignal::Disconnect);
        assert_eq!(pipe.drain(), Some(WakeSignal::Disconnect));
        assert_eq!(pipe.pending(), None);
    }

    #[tokio::test]
    async fn test_pending_tag_wakes_late_waiter() {
        let pipe = WakePipe::new();
        pipe.signal(WakeSignal::Disconnect);
        let signal = tokio::time::timeout(Duration::from_secs(1), pipe.wait())
            .await
            .unwrap();
        assert_eq!(signal, WakeSignal::Disconnect);
    }

    #[tokio::test]
    async fn test_signal_wakes_blocked_waiter() {
        let pipe = Arc::new(WakePipe::new());
        let waiter = {
            let pipe = pipe.clone();
            tokio::spawn(async move { pipe.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pipe.signal(WakeSignal::Close);
        let signal = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal, WakeSignal::Close);
    }
}
