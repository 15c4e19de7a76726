// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Mutex;
use tokio::sync::mpsc;

/// Sender half of an entity's unbounded FIFO mailbox.
///
/// After `shutdown`, offers fail and the receiver drains what is already
/// buffered before observing the end of the stream.
pub struct Mailbox<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
}

/// Receiver half, owned by the single entity behavior task.
pub struct MailboxReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Mailbox<T> {
    pub fn unbounded() -> (Mailbox<T>, MailboxReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Mailbox {
                tx: Mutex::new(Some(tx)),
            },
            MailboxReceiver { rx },
        )
    }

    /// Enqueues an item, handing it back when the mailbox is already shut
    /// down or its receiver is gone.
    pub fn offer(&self, item: T) -> Result<(), T> {
        let guard = self.tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.send(item).map_err(|err| err.0),
            None => Err(item),
        }
    }

    /// Stops accepting new items and wakes a receiver blocked on an empty
    /// mailbox once the buffered items are drained.
    pub fn shutdown(&self) {
        self.tx.lock().unwrap().take();
    }

    pub fn is_shut_down(&self) -> bool {
        self.tx.lock().unwrap().is_none()
    }
}

impl<T> MailboxReceiver<T> {
    /// Takes the next item in FIFO order, or `None` once the mailbox has
    /// been shut down and drained.
    pub async fn take(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}
