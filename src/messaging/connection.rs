//! Connection lifecycle: establish the broker connection and track its health.
//!
//! Reconnects are performed by the [`BrokerConnection`] implementation. This
//! component only observes the state transitions, mirrors them into the
//! `mq_broker_up` gauge and logs them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::metrics::Metrics;
use crate::broker::{BrokerConnection, ConnectionState};
use crate::error::{BrokerError, Result};

pub struct ConnectionLifecycle {
    connection: Arc<dyn BrokerConnection>,
    metrics: Metrics,
    monitoring: AtomicBool,
}

impl ConnectionLifecycle {
    pub fn new(connection: Arc<dyn BrokerConnection>, metrics: Metrics) -> Self {
        Self {
            connection,
            metrics,
            monitoring: AtomicBool::new(false),
        }
    }

    /// Start the connection manager and the health monitor without waiting.
    ///
    /// Safe to call any number of times.
    pub fn start(&self) {
        if !self.monitoring.swap(true, Ordering::SeqCst) {
            self.spawn_monitor();
        }
        self.connection.open();
    }

    /// Start connecting and wait for the first successful connection.
    ///
    /// Does not resolve while the broker stays unreachable; the connection
    /// manager keeps retrying. Callers that need a bound wrap this in a timeout.
    pub async fn connect(&self) -> Result<()> {
        self.start();

        let mut state = self.connection.state();
        let reached = *state
            .wait_for(|s| s.is_connected() || *s == ConnectionState::Closed)
            .await
            .map_err(|_| BrokerError::NotConnected)?;

        match reached {
            ConnectionState::Connected(_) => Ok(()),
            _ => Err(BrokerError::NotConnected.into()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.connection.state().borrow()
    }

    /// Close the connection and stop reconnecting.
    pub async fn close(&self) -> Result<()> {
        self.connection.close().await?;
        self.metrics.set_broker_up(false);
        Ok(())
    }

    fn spawn_monitor(&self) {
        let mut state = self.connection.state();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let mut previous = None;
            loop {
                let current = *state.borrow_and_update();
                if previous != Some(current) {
                    observe(&metrics, current);
                    previous = Some(current);
                }
                if current == ConnectionState::Closed {
                    break;
                }
                if state.changed().await.is_err() {
                    metrics.set_broker_up(false);
                    break;
                }
            }
            debug!("Connection monitor stopped");
        });
    }
}

fn observe(metrics: &Metrics, state: ConnectionState) {
    match state {
        ConnectionState::Connected(1) => {
            metrics.set_broker_up(true);
            info!("Connected to broker");
        }
        ConnectionState::Connected(epoch) => {
            metrics.set_broker_up(true);
            info!(epoch, "Reconnected to broker");
        }
        ConnectionState::Connecting => {
            metrics.set_broker_up(false);
            debug!("Connecting to broker");
        }
        ConnectionState::Disconnected => {
            metrics.set_broker_up(false);
            warn!("Broker connection lost, reconnecting");
        }
        ConnectionState::Closed => {
            metrics.set_broker_up(false);
            info!("Broker connection closed");
        }
    }
}
