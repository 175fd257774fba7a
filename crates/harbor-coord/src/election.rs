//! Leader election over an ephemeral node.
//!
//! The leader is whoever holds the ephemeral election node. Contenders
//! that lose the create race watch for the node's deletion and retry
//! after a random 0–3 s backoff, so a herd of contenders does not stampede
//! when a leader's session expires.

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::client::{Client, WatchEvent, WatchRx};
use crate::{CoordError, CoordResult};

/// A contender for leadership at one election path.
pub struct LeaderElection {
    client: Client,
    path: String,
    data: Vec<u8>,
}

impl LeaderElection {
    pub fn new(client: Client, path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            client,
            path: path.into(),
            data,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Contend until leadership is acquired or shutdown is signalled.
    ///
    /// Returns `true` once this contender holds the election node, `false`
    /// if shutdown won the race.
    pub async fn campaign(&self, shutdown: &mut watch::Receiver<bool>) -> CoordResult<bool> {
        if let Some(parent) = self.path.rfind('/').map(|i| &self.path[..i]) {
            if !parent.is_empty() {
                self.client.ensure_path(parent)?;
            }
        }
        loop {
            match self.client.create_ephemeral(&self.path, &self.data) {
                Ok(()) => {
                    info!(path = %self.path, "leadership acquired");
                    return Ok(true);
                }
                Err(CoordError::AlreadyExists(_)) => {
                    debug!(path = %self.path, "leadership held elsewhere, waiting");
                    let (exists, rx) = self.client.exists_w(&self.path)?;
                    if exists {
                        tokio::select! {
                            _ = rx => {}
                            _ = shutdown.changed() => return Ok(false),
                        }
                    }
                    // Randomized backoff so contenders don't stampede.
                    let pause = Duration::from_millis(rand::thread_rng().gen_range(0..3000));
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = shutdown.changed() => return Ok(false),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Watch the held election node; the receiver fires when leadership is
    /// lost (deletion or session expiry).
    pub fn watch_leadership(&self) -> CoordResult<WatchRx> {
        let (_, _, rx) = self.client.get_w(&self.path)?;
        Ok(rx)
    }

    /// Give up leadership explicitly.
    pub fn resign(&self) {
        if let Err(err) = self.client.delete(&self.path, crate::ANY_VERSION) {
            debug!(path = %self.path, error = %err, "resign: election node already gone");
        }
    }
}

/// Whether an event means leadership was lost.
pub fn is_leadership_lost(event: &WatchEvent) -> bool {
    matches!(event, WatchEvent::Deleted(_) | WatchEvent::Expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Coordinator;

    #[tokio::test]
    async fn first_contender_wins() {
        let coord = Coordinator::new();
        let election = LeaderElection::new(coord.connect(), "/scheduler/leader/p1", b"m1".to_vec());
        let (_tx, mut shutdown) = watch::channel(false);

        assert!(election.campaign(&mut shutdown).await.unwrap());
        assert!(coord.connect().exists("/scheduler/leader/p1").unwrap());
    }

    #[tokio::test]
    async fn loser_takes_over_after_expiry() {
        let coord = Coordinator::new();
        let holder_client = coord.connect();
        let holder =
            LeaderElection::new(holder_client.clone(), "/scheduler/leader/p1", b"m1".to_vec());
        let (_tx, mut shutdown) = watch::channel(false);
        assert!(holder.campaign(&mut shutdown).await.unwrap());

        let contender =
            LeaderElection::new(coord.connect(), "/scheduler/leader/p1", b"m2".to_vec());
        let (_tx2, mut shutdown2) = watch::channel(false);
        let race = tokio::spawn(async move { contender.campaign(&mut shutdown2).await });

        // Let the contender arm its watch, then kill the holder's session.
        tokio::time::sleep(Duration::from_millis(50)).await;
        holder_client.expire_session();

        let won = tokio::time::timeout(Duration::from_secs(5), race)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(won);
    }

    #[tokio::test]
    async fn shutdown_stops_the_campaign() {
        let coord = Coordinator::new();
        let holder = LeaderElection::new(coord.connect(), "/scheduler/leader/p1", b"m1".to_vec());
        let (_tx, mut shutdown) = watch::channel(false);
        assert!(holder.campaign(&mut shutdown).await.unwrap());

        let contender = LeaderElection::new(coord.connect(), "/scheduler/leader/p1", b"m2".to_vec());
        let (tx2, mut shutdown2) = watch::channel(false);
        let race = tokio::spawn(async move { contender.campaign(&mut shutdown2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx2.send(true).unwrap();

        let won = tokio::time::timeout(Duration::from_secs(5), race)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!won);
    }

    #[tokio::test]
    async fn watch_fires_on_resign() {
        let coord = Coordinator::new();
        let election = LeaderElection::new(coord.connect(), "/scheduler/leader/p1", b"m1".to_vec());
        let (_tx, mut shutdown) = watch::channel(false);
        assert!(election.campaign(&mut shutdown).await.unwrap());

        let rx = election.watch_leadership().unwrap();
        election.resign();
        assert!(is_leadership_lost(&rx.await.unwrap()));
    }
}
