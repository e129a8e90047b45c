//! Gateway assembly and shared handler state.
//!
//! `Gateway` owns one instance of every long-lived component: the
//! dispatcher with its breakers, dead-letter store and template cache, the
//! inbound rate limiter, and the cancellation token that stops background
//! sweepers and in-flight retries on shutdown. Detached dispatches are
//! tracked so shutdown can drain them before the final dead-letter snapshot.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

use anyhow::{Context, Result};
use herald_core::{
    events::emit_detached, AlertBatch, CircuitState, Clock, DispatchEvent, EventHandler, NoOpEventHandler, RealClock,
};
use herald_delivery::{
    CircuitBreakerRegistry, DeadLetterStore, DestinationConfig, DispatchSummary, Dispatcher, EngineCache,
    HttpSender, Sender, StateChangeListener,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{config::Config, rate_limit::RateLimiter};

/// State shared by every handler.
pub type AppState = Arc<Gateway>;

/// The assembled gateway.
#[derive(Debug)]
pub struct Gateway {
    config: Config,
    clock: Arc<dyn Clock>,
    dispatcher: Dispatcher,
    cache: Arc<EngineCache>,
    rate_limiter: Arc<RateLimiter>,
    events: Arc<dyn EventHandler>,
    shutdown: CancellationToken,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
    dispatches: Mutex<Vec<JoinHandle<Option<DispatchSummary>>>>,
    started_at: Instant,
}

impl Gateway {
    /// Builds a gateway sending through `sender`.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid.
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        sender: Arc<dyn Sender>,
        events: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(
            EngineCache::new(config.to_template_cache_config(), clock.clone())
                .context("failed to create template cache")?
                .with_events(events.clone()),
        );

        let listener_events = events.clone();
        let listener: StateChangeListener = Arc::new(move |name: &str, from: CircuitState, to: CircuitState| {
            emit_detached(
                &listener_events,
                DispatchEvent::CircuitStateChanged { destination: name.to_string(), from, to },
            );
        });
        let breakers = Arc::new(CircuitBreakerRegistry::new(clock.clone()).with_listener(listener));

        let dead_letters = Arc::new(DeadLetterStore::new(config.to_dead_letter_config(), clock.clone()));
        let dispatcher = Dispatcher::new(clock.clone(), sender, cache.clone(), breakers, dead_letters)
            .with_events(events.clone());
        let rate_limiter = Arc::new(RateLimiter::new(config.to_rate_limit_config(), clock.clone()));

        Ok(Self {
            config,
            clock,
            dispatcher,
            cache,
            rate_limiter,
            events,
            shutdown: CancellationToken::new(),
            sweepers: Mutex::new(Vec::new()),
            dispatches: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        })
    }

    /// Builds a production gateway: real clock, reqwest sender, no event
    /// subscribers.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the HTTP client cannot be
    /// built.
    pub fn from_config(config: Config) -> Result<Self> {
        let sender = HttpSender::new(config.to_client_config()).context("failed to build HTTP client")?;
        Self::new(config, Arc::new(RealClock::new()), Arc::new(sender), Arc::new(NoOpEventHandler::new()))
    }

    /// Loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Clock in use.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Dispatcher in use.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Breaker registry.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        self.dispatcher.breakers()
    }

    /// Dead-letter store.
    pub fn dead_letters(&self) -> &Arc<DeadLetterStore> {
        self.dispatcher.dead_letters()
    }

    /// Template cache.
    pub fn cache(&self) -> &Arc<EngineCache> {
        &self.cache
    }

    /// Inbound rate limiter.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Event subscriber.
    pub fn events(&self) -> &Arc<dyn EventHandler> {
        &self.events
    }

    /// Time since the gateway was built.
    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Loads the dead-letter snapshot, if persistence is configured.
    /// Returns how many records were restored.
    ///
    /// # Errors
    ///
    /// Fails if the snapshot exists but cannot be read.
    pub async fn restore_dead_letters(&self) -> Result<usize> {
        match &self.config.dead_letter.persist_path {
            Some(path) => self.dead_letters().restore(path).await.context("failed to restore dead letters"),
            None => Ok(0),
        }
    }

    /// Starts the rate limiter, template cache and dead-letter sweepers.
    pub fn start_background_tasks(&self) {
        let handles = vec![
            self.rate_limiter.start_sweeper(self.shutdown.child_token()),
            self.cache.start_sweeper(self.shutdown.child_token()),
            self.dead_letters().start_sweeper(self.shutdown.child_token()),
        ];
        self.sweepers.lock().unwrap_or_else(PoisonError::into_inner).extend(handles);
        info!("background sweepers started");
    }

    /// Starts one detached dispatch per destination and returns how many
    /// were started. Shutdown waits for them.
    pub fn dispatch(&self, destinations: Vec<DestinationConfig>, batch: Arc<AlertBatch>) -> usize {
        let handles: Vec<_> = destinations
            .into_iter()
            .map(|destination| {
                self.dispatcher.spawn_dispatch(destination, batch.clone(), self.shutdown.child_token())
            })
            .collect();
        let started = handles.len();

        let mut dispatches = self.dispatches.lock().unwrap_or_else(PoisonError::into_inner);
        dispatches.retain(|handle| !handle.is_finished());
        dispatches.extend(handles);
        started
    }

    /// Stops the gateway: cancels sweepers and in-flight retries, waits for
    /// sweepers and dispatches to finish, then writes the final dead-letter
    /// snapshot when persistence is configured.
    pub async fn shutdown(&self) {
        info!("shutting down gateway");
        self.shutdown.cancel();

        let sweepers = std::mem::take(&mut *self.sweepers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in sweepers {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        let dispatches = std::mem::take(&mut *self.dispatches.lock().unwrap_or_else(PoisonError::into_inner));
        let pending = dispatches.len();
        for handle in dispatches {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch task ended abnormally");
            }
        }
        debug!(pending, "dispatches drained");

        if let Err(e) = self.dead_letters().persist_now().await {
            warn!(error = %e, "final dead-letter snapshot failed");
        }
        info!("gateway stopped");
    }
}
