use tokio::sync::watch;

use crate::membership::types::SiteId;
use crate::topology::types::TopologyEpoch;

/// Execution-side consumer of topology changes.
pub trait TopologyListener: Send + Sync {
    fn on_topology_changed(&self, epoch: &TopologyEpoch);
}

/// Logs the partitions this site masters after every change.
pub struct LoggingListener {
    local: SiteId,
}

impl LoggingListener {
    pub fn new(local: SiteId) -> Self {
        Self { local }
    }
}

impl TopologyListener for LoggingListener {
    fn on_topology_changed(&self, epoch: &TopologyEpoch) {
        let mastered = epoch.mastered_by(self.local);
        tracing::info!(
            "Topology epoch {}: {} member(s), site {} masters {:?}",
            epoch.epoch,
            epoch.members.len(),
            self.local,
            mastered
        );
        if !epoch.unavailable.is_empty() {
            tracing::error!("Unavailable partitions: {:?}", epoch.unavailable);
        }
    }
}

/// Publishes the newest epoch on a watch channel.
pub struct WatchListener {
    tx: watch::Sender<Option<TopologyEpoch>>,
}

impl WatchListener {
    pub fn new() -> (Self, watch::Receiver<Option<TopologyEpoch>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TopologyEpoch>> {
        self.tx.subscribe()
    }
}

impl TopologyListener for WatchListener {
    fn on_topology_changed(&self, epoch: &TopologyEpoch) {
        self.tx.send_replace(Some(epoch.clone()));
    }
}
