//! Background retry of failed publications.
//!
//! A catalog write that could not be mirrored into the coordination
//! namespace is queued here instead of being rolled back; the reconciler
//! retries each operation with bounded backoff until it lands or the
//! daemon shuts down.

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use harbor_coord::{Backoff, Connections};
use harbor_model::Service;

use crate::publish::{publish_service, unpublish_service};

/// One deferred publication.
#[derive(Debug, Clone)]
pub enum PublishOp {
    Update(Box<Service>),
    Remove { pool_id: String, service_id: String },
}

/// The retry loop. Owns the receiving side of the facade's publish queue.
pub struct PublishReconciler {
    conns: Connections,
    rx: mpsc::UnboundedReceiver<PublishOp>,
}

impl PublishReconciler {
    /// Build the reconciler plus the sender handed to the facade.
    pub fn new(conns: Connections) -> (mpsc::UnboundedSender<PublishOp>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { conns, rx })
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let op = tokio::select! {
                op = self.rx.recv() => match op {
                    Some(op) => op,
                    None => return,
                },
                _ = shutdown.changed() => return,
            };

            let mut backoff = Backoff::new();
            loop {
                let result = match &op {
                    PublishOp::Update(svc) => publish_service(&self.conns, svc),
                    PublishOp::Remove {
                        pool_id,
                        service_id,
                    } => unpublish_service(&self.conns, pool_id, service_id),
                };
                match result {
                    Ok(()) => {
                        info!(?op, "deferred publication completed");
                        break;
                    }
                    Err(err) => {
                        warn!(?op, error = %err, "publication retry failed");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff.next()) => {}
                            _ = shutdown.changed() => return,
                        }
                    }
                }
            }
        }
    }
}
