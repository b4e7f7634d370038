//! Browser tab pool
//!
//! A bounded pool of browser contexts shared by the capture pipeline.
//! Waiters are served strictly FIFO; every lease bumps the tab's use count
//! and a tab reaching the recycle limit has its underlying context torn
//! down and replaced on release. Close failures during drain or recycle are
//! logged and swallowed.

use crate::VizzlyError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

/// Capture parameters passed through to the page.
#[derive(Debug, Clone, Default)]
pub struct CaptureParams {
    pub full_page: bool,
    pub omit_background: bool,
}

/// One renderable page owned by a pooled context.
#[async_trait]
pub trait TabPage: Send + Sync {
    async fn set_viewport(&self, width: u32, height: u32) -> Result<(), VizzlyError>;
    async fn navigate(&self, url: &str) -> Result<(), VizzlyError>;
    async fn run_script(&self, script: &str) -> Result<(), VizzlyError>;
    async fn capture(&self, params: &CaptureParams) -> Result<Vec<u8>, VizzlyError>;
}

/// An isolated browser context owning exactly one page.
#[async_trait]
pub trait TabContext: Send + Sync {
    fn page(&self) -> Arc<dyn TabPage>;
    async fn close(&mut self) -> Result<(), VizzlyError>;
}

/// Opaque browser handle able to mint fresh contexts.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn new_context(&self) -> Result<Box<dyn TabContext>, VizzlyError>;
}

#[derive(Debug, Clone)]
pub struct TabPoolConfig {
    /// Maximum number of live contexts
    pub size: usize,
    /// Leases before a context is torn down and replaced
    pub recycle_after: usize,
}

impl Default for TabPoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            recycle_after: 25,
        }
    }
}

/// A leased tab. Hand it back with [`TabPool::release`].
pub struct PooledTab {
    context: Box<dyn TabContext>,
    use_count: usize,
}

impl PooledTab {
    pub fn page(&self) -> Arc<dyn TabPage> {
        self.context.page()
    }

    pub fn use_count(&self) -> usize {
        self.use_count
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabPoolStats {
    pub available: usize,
    pub waiting: usize,
    pub total: usize,
    pub size: usize,
    pub recycled: usize,
}

struct PoolState {
    idle: VecDeque<PooledTab>,
    waiters: VecDeque<oneshot::Sender<PooledTab>>,
    total: usize,
    recycled: usize,
    draining: bool,
}

pub struct TabPool {
    driver: Arc<dyn BrowserDriver>,
    config: TabPoolConfig,
    state: Mutex<PoolState>,
}

impl TabPool {
    pub fn new(driver: Arc<dyn BrowserDriver>, config: TabPoolConfig) -> Self {
        Self {
            driver,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                total: 0,
                recycled: 0,
                draining: false,
            }),
        }
    }

    /// Leases a tab: an idle one if available, a fresh context while the
    /// pool is below capacity, otherwise the caller queues FIFO.
    pub async fn acquire(&self) -> Result<PooledTab, VizzlyError> {
        let receiver = {
            let mut state = self.state.lock().await;
            if state.draining {
                return Err(VizzlyError::PoolDrained);
            }
            if let Some(mut tab) = state.idle.pop_front() {
                tab.use_count += 1;
                return Ok(tab);
            }
            if state.total < self.config.size {
                state.total += 1;
                drop(state);
                return match self.driver.new_context().await {
                    Ok(context) => Ok(PooledTab {
                        context,
                        use_count: 1,
                    }),
                    Err(e) => {
                        self.state.lock().await.total -= 1;
                        Err(e)
                    }
                };
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        receiver.await.map_err(|_| VizzlyError::PoolDrained)
    }

    /// Returns a tab to the pool, recycling its context if the lease count
    /// hit the limit, then hands it to the head of the waiter queue or
    /// parks it idle.
    pub async fn release(&self, mut tab: PooledTab) {
        {
            let state = self.state.lock().await;
            if state.draining {
                drop(state);
                self.close_quietly(&mut tab).await;
                self.state.lock().await.total -= 1;
                return;
            }
        }

        if tab.use_count >= self.config.recycle_after {
            self.close_quietly(&mut tab).await;
            match self.driver.new_context().await {
                Ok(context) => {
                    tab = PooledTab {
                        context,
                        use_count: 0,
                    };
                    self.state.lock().await.recycled += 1;
                    info!("Recycled pooled tab after {} uses", self.config.recycle_after);
                }
                Err(e) => {
                    // Replacement failed; shrink rather than leak the slot.
                    warn!("Tab recycle failed, shrinking pool: {}", e);
                    self.state.lock().await.total -= 1;
                    return;
                }
            }
        }

        let mut state = self.state.lock().await;
        // Drain may have begun while the recycle ran.
        if state.draining {
            drop(state);
            self.close_quietly(&mut tab).await;
            self.state.lock().await.total -= 1;
            return;
        }
        loop {
            match state.waiters.pop_front() {
                Some(waiter) => {
                    tab.use_count += 1;
                    match waiter.send(tab) {
                        Ok(()) => return,
                        // Waiter gave up (cancelled); try the next one.
                        Err(returned) => {
                            tab = returned;
                            tab.use_count -= 1;
                        }
                    }
                }
                None => {
                    state.idle.push_back(tab);
                    return;
                }
            }
        }
    }

    /// Closes all idle contexts and fails outstanding waiters fast.
    pub async fn drain(&self) {
        let (idle, waiters) = {
            let mut state = self.state.lock().await;
            state.draining = true;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };
        debug!(
            "Draining tab pool: {} idle, {} waiters",
            idle.len(),
            waiters.len()
        );
        // Dropping the sender resolves each waiter's receive with an error.
        drop(waiters);
        let closed = idle.len();
        for mut tab in idle {
            self.close_quietly(&mut tab).await;
        }
        self.state.lock().await.total -= closed;
    }

    pub async fn stats(&self) -> TabPoolStats {
        let state = self.state.lock().await;
        TabPoolStats {
            available: state.idle.len(),
            waiting: state.waiters.len(),
            total: state.total,
            size: self.config.size,
            recycled: state.recycled,
        }
    }

    async fn close_quietly(&self, tab: &mut PooledTab) {
        if let Err(e) = tab.context.close().await {
            warn!("Ignoring tab close failure: {}", e);
        }
    }
}
