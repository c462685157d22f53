// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Long-lived LISTEN subscriptions against the monitor.
//!
//! `tokio_postgres` surfaces asynchronous notifications through the
//! connection object, not the client, so the subscription owns both: a
//! background task drives the connection and forwards notifications into
//! a channel the caller drains.

use crate::MonitorError;
use futures::stream::StreamExt;
use slog::{debug, o, Logger};
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, NoTls, Notification};

/// An open LISTEN subscription.  Dropping it closes the connection.
pub struct NotificationSubscription {
    // Keeps the session (and its LISTEN registrations) alive.
    _client: tokio_postgres::Client,
    rx: mpsc::UnboundedReceiver<Notification>,
    log: Logger,
}

impl NotificationSubscription {
    /// Connects and subscribes to the given channels.
    pub async fn subscribe(
        log: &Logger,
        config: &tokio_postgres::Config,
        channels: &[&str],
    ) -> Result<NotificationSubscription, MonitorError> {
        let log = log.new(o!("component" => "NotificationSubscription"));
        let (client, mut connection) =
            config.connect(NoTls).await.map_err(MonitorError::Connect)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let conn_log = log.clone();
        tokio::spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| {
                connection.poll_message(cx)
            });
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        if tx.send(n).is_err() {
                            break;
                        }
                    }
                    Ok(_) => (),
                    Err(error) => {
                        debug!(conn_log, "monitor connection closed";
                            "error" => %error);
                        break;
                    }
                }
            }
            // tx drops here; recv() on the other side returns None and
            // the caller knows to resubscribe.
        });

        for channel in channels {
            let statement = format!("LISTEN {}", channel);
            client.batch_execute(&statement).await.map_err(|source| {
                MonitorError::Call { call: "listen", source }
            })?;
        }

        Ok(NotificationSubscription { _client: client, rx, log })
    }

    /// Waits for the next notification.  Returns `None` once the
    /// underlying connection is gone, at which point the subscription is
    /// dead and must be re-established.
    pub async fn next(&mut self) -> Option<Notification> {
        let notification = self.rx.recv().await;
        if let Some(n) = &notification {
            debug!(self.log, "notification";
                "channel" => n.channel(), "payload" => n.payload());
        }
        notification
    }
}
