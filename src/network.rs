//! Connectivity tracking for the request queue.
//!
//! The monitor is the single source of truth for whether network I/O should be
//! attempted. It never drains anything itself: on an offline → online
//! transition it calls the registered resume hooks (the request queue registers
//! one) and publishes [`LayerEvent::NetworkOnline`].

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::event::{EventBus, LayerEvent};

/// Coarse link quality, used to decide whether speculative traffic is cheap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkQuality {
  #[default]
  Unknown,
  Slow,
  Good,
}

/// Something that wants to know when connectivity returns.
pub trait ResumeHook: Send + Sync {
  fn on_online(&self);
}

/// Snapshot of the monitor's state as seen by watch subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
  pub online: bool,
  pub quality: LinkQuality,
}

pub struct NetworkMonitor {
  state: watch::Sender<NetworkState>,
  hooks: Mutex<Vec<Weak<dyn ResumeHook>>>,
  events: EventBus,
  config: NetworkConfig,
}

impl NetworkMonitor {
  /// Create a monitor that starts out online.
  ///
  /// Until a probe or the host platform says otherwise the layer assumes it can
  /// reach the network.
  pub fn new(config: NetworkConfig, events: EventBus) -> Self {
    let (state, _) = watch::channel(NetworkState {
      online: true,
      quality: LinkQuality::Unknown,
    });
    Self {
      state,
      hooks: Mutex::new(Vec::new()),
      events,
      config,
    }
  }

  pub fn is_online(&self) -> bool {
    self.state.borrow().online
  }

  pub fn link_quality(&self) -> LinkQuality {
    self.state.borrow().quality
  }

  /// Subscribe to state changes instead of polling.
  pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
    self.state.subscribe()
  }

  /// Register a hook called on every offline → online transition.
  ///
  /// Hooks are held weakly so the monitor never keeps its consumers alive.
  pub fn register_resume_hook(&self, hook: Weak<dyn ResumeHook>) {
    self.hooks.lock().push(hook);
  }

  /// Record the current connectivity. Only real transitions emit events.
  pub fn set_online(&self, online: bool) {
    let changed = self.state.send_if_modified(|state| {
      if state.online == online {
        return false;
      }
      state.online = online;
      true
    });

    if !changed {
      return;
    }

    if online {
      info!("network: back online");
      self.events.publish(LayerEvent::NetworkOnline);
      self.resume();
    } else {
      info!("network: offline, pausing request queue");
      self.events.publish(LayerEvent::NetworkOffline);
    }
  }

  pub fn set_link_quality(&self, quality: LinkQuality) {
    self.state.send_if_modified(|state| {
      if state.quality == quality {
        return false;
      }
      state.quality = quality;
      true
    });
  }

  fn resume(&self) {
    // Collect live hooks first so no lock is held while they run.
    let hooks: Vec<Arc<dyn ResumeHook>> = {
      let mut hooks = self.hooks.lock();
      hooks.retain(|h| h.strong_count() > 0);
      hooks.iter().filter_map(Weak::upgrade).collect()
    };

    for hook in hooks {
      hook.on_online();
    }
  }

  /// Probe the configured URL once and record the result.
  ///
  /// A connect or timeout error means offline. Anything else that prevents a
  /// verdict (no probe URL, a malformed request) leaves the state as online.
  pub async fn probe(&self, client: &reqwest::Client) -> bool {
    let Some(url) = self.config.probe_url.as_deref() else {
      self.set_online(true);
      return true;
    };

    let started = Instant::now();
    let result = client
      .head(url)
      .timeout(Duration::from_millis(self.config.probe_timeout_ms))
      .send()
      .await;

    match result {
      Ok(_) => {
        let latency = started.elapsed();
        let quality = if latency > Duration::from_millis(self.config.slow_threshold_ms) {
          LinkQuality::Slow
        } else {
          LinkQuality::Good
        };
        debug!(?latency, ?quality, "network: probe succeeded");
        self.set_link_quality(quality);
        self.set_online(true);
        true
      }
      Err(e) if e.is_connect() || e.is_timeout() => {
        debug!("network: probe failed: {}", e);
        self.set_link_quality(LinkQuality::Unknown);
        self.set_online(false);
        false
      }
      Err(e) => {
        debug!("network: probe inconclusive, assuming online: {}", e);
        self.set_online(true);
        true
      }
    }
  }

  /// Probe periodically until the returned task is aborted.
  pub fn spawn_probe_loop(self: &Arc<Self>, client: reqwest::Client) -> JoinHandle<()> {
    let monitor = Arc::clone(self);
    let interval = Duration::from_secs(self.config.probe_interval_secs.max(1));

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        monitor.probe(&client).await;
      }
    })
  }
}

impl std::fmt::Debug for NetworkMonitor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("NetworkMonitor")
      .field("state", &*self.state.borrow())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  struct CountingHook(AtomicU32);

  impl ResumeHook for CountingHook {
    fn on_online(&self) {
      self.0.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn monitor() -> NetworkMonitor {
    NetworkMonitor::new(NetworkConfig::default(), EventBus::default())
  }

  #[test]
  fn test_starts_online() {
    let monitor = monitor();
    assert!(monitor.is_online());
    assert_eq!(monitor.link_quality(), LinkQuality::Unknown);
  }

  #[test]
  fn test_resume_hook_fires_only_on_transition_to_online() {
    let monitor = monitor();
    let hook = Arc::new(CountingHook(AtomicU32::new(0)));
    let weak: Weak<dyn ResumeHook> = Arc::downgrade(&hook) as Weak<dyn ResumeHook>;
    monitor.register_resume_hook(weak);

    // Already online: not a transition
    monitor.set_online(true);
    assert_eq!(hook.0.load(Ordering::SeqCst), 0);

    monitor.set_online(false);
    monitor.set_online(false);
    assert_eq!(hook.0.load(Ordering::SeqCst), 0);

    monitor.set_online(true);
    assert_eq!(hook.0.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_dropped_hooks_are_pruned() {
    let monitor = monitor();
    {
      let hook = Arc::new(CountingHook(AtomicU32::new(0)));
      monitor.register_resume_hook(Arc::downgrade(&hook) as Weak<dyn ResumeHook>);
    }
    monitor.set_online(false);
    monitor.set_online(true);
    assert!(monitor.hooks.lock().is_empty());
  }

  #[tokio::test]
  async fn test_transitions_publish_events() {
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let monitor = NetworkMonitor::new(NetworkConfig::default(), events);

    monitor.set_online(false);
    monitor.set_online(true);

    assert_eq!(rx.recv().await.ok(), Some(LayerEvent::NetworkOffline));
    assert_eq!(rx.recv().await.ok(), Some(LayerEvent::NetworkOnline));
  }

  #[tokio::test]
  async fn test_watch_subscribers_see_changes() {
    let monitor = monitor();
    let mut rx = monitor.subscribe();

    monitor.set_online(false);
    rx.changed().await.ok();
    assert!(!rx.borrow().online);
  }

  #[tokio::test]
  async fn test_probe_without_url_assumes_online() {
    let monitor = monitor();
    monitor.set_online(false);
    assert!(monitor.probe(&reqwest::Client::new()).await);
    assert!(monitor.is_online());
  }
}
