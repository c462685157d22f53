// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The monitor node's LISTEN service.
//!
//! Keeps the local monitor Postgres running, subscribes to its `state`
//! and `log` channels, and prints every event.  Notifications are
//! operator convenience only: losing some is fine, the monitor's SQL
//! state remains the truth.

use crate::config::Config;
use crate::postgres::PostgresController;
use crate::signals::ShutdownFlags;
use slog::{info, o, warn, Logger};
use std::time::Duration;
use warden_common::backoff::{retry_policy_monitor, Backoff};
use warden_monitor_client::listen::NotificationSubscription;
use warden_monitor_client::notifications::{Channel, StateNotification};

/// How often to give the shutdown flags a look while idle.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub async fn run(
    log: &Logger,
    config: &Config,
    flags: &ShutdownFlags,
) -> anyhow::Result<()> {
    let log = log.new(o!("component" => "Listener"));
    let postgres = PostgresController::new(
        &log,
        config.postgresql.pgdata.clone(),
        config.postgresql.pgport,
        config.postgresql.dbname.clone(),
        config.postgresql.listen_addresses.clone(),
        config.postgresql.bindir.clone(),
        config.replication.maximum_backup_rate.clone(),
    );

    let mut pg_config = tokio_postgres::Config::new();
    pg_config
        .host("127.0.0.1")
        .port(config.postgresql.pgport)
        .dbname(&config.postgresql.dbname)
        .application_name("pgwarden-listener")
        .connect_timeout(Duration::from_secs(2));
    if let Ok(user) = std::env::var("PGUSER") {
        pg_config.user(&user);
    } else if let Ok(user) = std::env::var("USER") {
        pg_config.user(&user);
    }

    let mut backoff = retry_policy_monitor();

    info!(log, "listener service is starting");
    while !flags.should_stop() {
        // The monitor cannot notify anybody if its own Postgres is down.
        if let Err(error) = postgres.ensure_running().await {
            warn!(log, "failed to ensure the monitor Postgres is running";
                "error" => %error);
            interruptible_sleep(flags, IDLE_CHECK_INTERVAL).await;
            continue;
        }

        let mut subscription = match NotificationSubscription::subscribe(
            &log,
            &pg_config,
            &[Channel::State.as_str(), Channel::Log.as_str()],
        )
        .await
        {
            Ok(subscription) => {
                backoff.reset();
                info!(log, "listening for monitor events");
                subscription
            }
            Err(error) => {
                let delay = backoff
                    .next_backoff()
                    .unwrap_or(IDLE_CHECK_INTERVAL);
                warn!(log, "failed to subscribe, retrying";
                    "error" => %error,
                    "delay_ms" => delay.as_millis() as u64);
                interruptible_sleep(flags, delay).await;
                continue;
            }
        };

        // Drain until the connection dies or we are asked to stop.
        loop {
            if flags.should_stop() {
                return Ok(());
            }
            tokio::select! {
                notification = subscription.next() => {
                    match notification {
                        Some(n) => log_notification(
                            &log, n.channel(), n.payload()),
                        None => {
                            warn!(log,
                                "lost the monitor connection, \
                                 re-establishing; some notifications \
                                 may be missed");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(IDLE_CHECK_INTERVAL) => {}
            }
        }
    }
    info!(log, "listener service is stopping");
    Ok(())
}

fn log_notification(log: &Logger, channel: &str, payload: &str) {
    match Channel::from_name(channel) {
        Some(Channel::State) => match StateNotification::parse(payload) {
            Ok(event) => info!(log, "{}", event),
            Err(error) => warn!(log, "unparsable state notification";
                "payload" => payload, "error" => %error),
        },
        Some(Channel::Log) => info!(log, "{}", payload),
        None => info!(log, "{}", payload; "channel" => channel),
    }
}

async fn interruptible_sleep(flags: &ShutdownFlags, total: Duration) {
    let mut remaining = total;
    while !flags.should_stop() && remaining > Duration::ZERO {
        let step = remaining.min(Duration::from_millis(100));
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
}
