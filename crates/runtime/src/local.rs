//! Single-process dispatch runtime.
//!
//! Agents are invoked directly on the caller's task. `call_parallel` spawns one
//! task per target; each task sends its outcome over a channel to a single
//! collector, so the result maps are only ever written by one owner.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use troupe_config::RuntimeConfig;
use troupe_core::{Agent, CallContext, Error, Message, Result, RuntimeError};

use crate::mailbox::Mailbox;
use crate::result::ParallelResults;
use crate::Runtime;

struct Registration {
    agent: Arc<dyn Agent>,
    sender: mpsc::Sender<Message>,
    mailbox: Mailbox,
}

struct Inner {
    config: RuntimeConfig,
    registry: RwLock<HashMap<String, Registration>>,
    /// Runtime-scoped token while started. Always locked before `registry`.
    lifecycle: Mutex<Option<CancellationToken>>,
    started: AtomicBool,
    /// Global limit on concurrent calls, if configured.
    call_limiter: Option<Arc<Semaphore>>,
}

/// In-process [`Runtime`]. Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct LocalRuntime {
    inner: Arc<Inner>,
}

impl LocalRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        let call_limiter = config
            .max_concurrency
            .filter(|limit| *limit > 0)
            .map(|limit| Arc::new(Semaphore::new(limit)));

        Self {
            inner: Arc::new(Inner {
                config,
                registry: RwLock::new(HashMap::new()),
                lifecycle: Mutex::new(None),
                started: AtomicBool::new(false),
                call_limiter,
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Register several agents, stopping at the first failure.
    pub async fn register_all<I>(&self, agents: I) -> Result<()>
    where
        I: IntoIterator<Item = Arc<dyn Agent>>,
    {
        for agent in agents {
            self.register(agent).await?;
        }
        Ok(())
    }

    async fn lookup(&self, name: &str) -> Result<Arc<dyn Agent>> {
        let registry = self.inner.registry.read().await;
        registry
            .get(name)
            .map(|reg| Arc::clone(&reg.agent))
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()).into())
    }
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl std::fmt::Debug for LocalRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRuntime")
            .field("config", &self.inner.config)
            .field("started", &self.is_started())
            .finish()
    }
}

/// Wait for a slot, giving up as soon as the context is done.
async fn acquire(ctx: &CallContext, semaphore: &Arc<Semaphore>) -> Result<OwnedSemaphorePermit> {
    ctx.check()?;
    tokio::select! {
        biased;
        err = ctx.done() => Err(err),
        permit = Arc::clone(semaphore).acquire_owned() => {
            permit.map_err(|_| Error::Internal("concurrency limiter closed".into()))
        }
    }
}

fn spawn_start(agent: Arc<dyn Agent>, token: CancellationToken) {
    tokio::spawn(async move {
        let ctx = CallContext::from_token(token);
        if let Err(e) = agent.start(ctx).await {
            warn!(agent = %agent.name(), error = %e, "Agent start failed");
        }
    });
}

#[async_trait]
impl Runtime for LocalRuntime {
    async fn register(&self, agent: Arc<dyn Agent>) -> Result<()> {
        let name = agent.name().to_string();
        let role = agent.role().to_string();
        let lifecycle = self.inner.lifecycle.lock().await;

        {
            let mut registry = self.inner.registry.write().await;
            if registry.contains_key(&name) {
                return Err(RuntimeError::AlreadyRegistered(name).into());
            }
            let (sender, receiver) = mpsc::channel(self.inner.config.channel_capacity.max(1));
            let mailbox = Mailbox::new(name.clone(), receiver);
            registry.insert(
                name.clone(),
                Registration {
                    agent: Arc::clone(&agent),
                    sender,
                    mailbox,
                },
            );
        }

        if let Some(token) = lifecycle.as_ref() {
            spawn_start(agent, token.child_token());
        }

        info!(agent = %name, role = %role, "Registered agent");
        Ok(())
    }

    async fn unregister(&self, name: &str) -> Result<()> {
        let removed = self.inner.registry.write().await.remove(name);
        match removed {
            Some(registration) => {
                registration.mailbox.close();
                info!(agent = %name, "Unregistered agent");
                Ok(())
            }
            None => Err(RuntimeError::NotFound(name.to_string()).into()),
        }
    }

    async fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.lookup(name).await.ok()
    }

    async fn list(&self) -> Vec<String> {
        let registry = self.inner.registry.read().await;
        let mut names: Vec<String> = registry.keys().cloned().collect();
        names.sort();
        names
    }

    async fn send(&self, target: &str, msg: Message) -> Result<()> {
        let (sender, mailbox) = {
            let registry = self.inner.registry.read().await;
            registry
                .get(target)
                .map(|reg| (reg.sender.clone(), reg.mailbox.clone()))
                .ok_or_else(|| RuntimeError::NotFound(target.to_string()))?
        };

        let max = sender.max_capacity();
        let occupancy = (max - sender.capacity()) as f64 / max as f64;
        if occupancy > self.inner.config.backpressure_ratio {
            warn!(
                agent = %target,
                occupancy_pct = (occupancy * 100.0).round() as u64,
                "Agent channel nearing capacity"
            );
        }

        let timeout = self.inner.config.send_timeout();
        let delivery = async {
            tokio::select! {
                _ = mailbox.closed() => Err(()),
                sent = sender.send(msg) => sent.map_err(|_| ()),
            }
        };
        match tokio::time::timeout(timeout, delivery).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(())) => Err(RuntimeError::ChannelClosed(target.to_string()).into()),
            Err(_) => Err(RuntimeError::Timeout(format!(
                "send to '{target}' did not complete within {}ms",
                timeout.as_millis()
            ))
            .into()),
        }
    }

    async fn recv(&self, source: &str) -> Result<Mailbox> {
        let registry = self.inner.registry.read().await;
        registry
            .get(source)
            .map(|reg| reg.mailbox.clone())
            .ok_or_else(|| RuntimeError::NotFound(source.to_string()).into())
    }

    async fn call(&self, ctx: &CallContext, target: &str, input: Message) -> Result<Message> {
        let _slot = match &self.inner.call_limiter {
            Some(limiter) => Some(acquire(ctx, limiter).await?),
            None => None,
        };

        if !self.is_started() {
            return Err(RuntimeError::NotStarted.into());
        }
        let agent = self.lookup(target).await?;
        if !agent.is_ready() {
            return Err(RuntimeError::NotReady(target.to_string()).into());
        }

        let started = Instant::now();
        let outcome = agent.execute(ctx, input).await;
        debug!(
            agent = %target,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "Call finished"
        );
        outcome
    }

    async fn call_parallel(
        &self,
        ctx: &CallContext,
        targets: &[String],
        input: Message,
    ) -> ParallelResults {
        let mut seen = HashSet::new();
        let targets: Vec<String> = targets
            .iter()
            .filter(|t| seen.insert(t.as_str()))
            .cloned()
            .collect();

        // Each batch gets its own pool, so a target that fans out again never
        // waits on permits held by its caller.
        let pool = Arc::new(Semaphore::new(self.inner.config.fan_out_width().max(1)));
        let (tx, mut rx) = mpsc::channel(targets.len().max(1));
        for target in &targets {
            let runtime = self.clone();
            let pool = Arc::clone(&pool);
            let ctx = ctx.clone();
            let input = input.clone();
            let target = target.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let outcome = match acquire(&ctx, &pool).await {
                    Ok(_permit) => runtime.call(&ctx, &target, input).await,
                    Err(e) => Err(e),
                };
                let _ = tx.send((target, outcome, started.elapsed())).await;
            });
        }
        drop(tx);

        let mut results = ParallelResults::new();
        while let Some((target, outcome, elapsed)) = rx.recv().await {
            results.record(target, outcome, elapsed);
        }

        // A task that panicked never reported back.
        let missing: Vec<String> = targets
            .into_iter()
            .filter(|t| !results.contains(t))
            .collect();
        for target in missing {
            results.record(
                target.clone(),
                Err(Error::Internal(format!("call task for '{target}' aborted"))),
                Duration::ZERO,
            );
        }

        if !results.errors.is_empty() {
            warn!(
                failed = results.errors.len(),
                total = results.len(),
                "Parallel call finished with failures"
            );
        }
        results
    }

    async fn broadcast(&self, msg: Message) -> Result<()> {
        let mut first_err = None;
        for name in self.list().await {
            if let Err(e) = self.send(&name, msg.clone()).await {
                warn!(agent = %name, error = %e, "Broadcast delivery failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(RuntimeError::AlreadyStarted.into());
        }

        let token = CancellationToken::new();
        let count = {
            let registry = self.inner.registry.read().await;
            for registration in registry.values() {
                spawn_start(Arc::clone(&registration.agent), token.child_token());
            }
            registry.len()
        };

        *lifecycle = Some(token);
        self.inner.started.store(true, Ordering::SeqCst);
        info!(agents = count, "Runtime started");
        Ok(())
    }

    async fn stop(&self, ctx: &CallContext) -> Result<()> {
        let token = self.inner.lifecycle.lock().await.take();
        let Some(token) = token else {
            debug!("Runtime was not started; nothing to stop");
            return Ok(());
        };
        token.cancel();
        self.inner.started.store(false, Ordering::SeqCst);

        let agents: Vec<Arc<dyn Agent>> = {
            let registry = self.inner.registry.read().await;
            registry.values().map(|reg| Arc::clone(&reg.agent)).collect()
        };

        let stops = join_all(agents.iter().map(|agent| async move {
            (agent.name().to_string(), agent.stop(ctx).await)
        }));
        let outcomes = ctx.run(async { Ok(stops.await) }).await?;

        let mut first_err = None;
        for (name, outcome) in outcomes {
            if let Err(e) = outcome {
                warn!(agent = %name, error = %e, "Failed to stop agent");
                first_err.get_or_insert(e);
            }
        }

        info!(agents = agents.len(), "Runtime stopped");
        first_err.map_or(Ok(()), Err)
    }
}
