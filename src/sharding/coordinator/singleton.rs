//! Keeps exactly one coordinator per entry type alive in the cluster.
//!
//! Each role-carrying node runs a [`SingletonManager`]; the one on the
//! oldest node runs the [`CoordinatorSupervisor`], which (re)spawns the
//! coordinator and restarts it with backoff when it stops on a persistence
//! failure. Losing oldest status stops the supervisor gracefully and the
//! new oldest node takes over from the journal.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use super::allocation::AllocationStrategy;
use super::{CoordinatorOptions, ShardCoordinator};
use crate::actor::TaskSet;
use crate::cluster::{Cluster, Member};
use crate::internal::tokio::spawn_named;
use crate::persistence::Journal;
use crate::sharding::settings::ShardingSettings;

pub(crate) struct SingletonOptions {
    pub type_name: String,
    /// The singleton's logical path, registered while a coordinator runs.
    pub path: String,
    pub persistence_id: String,
    pub settings: Arc<ShardingSettings>,
    pub cluster: Cluster,
    pub member: Member,
    pub role: Option<String>,
    pub strategy: Arc<dyn AllocationStrategy>,
    pub journal: Arc<dyn Journal>,
    pub tasks: Arc<TaskSet>,
}

pub(crate) fn spawn_singleton_manager(options: SingletonOptions) {
    let tasks = Arc::clone(&options.tasks);
    let manager = SingletonManager {
        options,
        running: None,
    };

    tasks.track(spawn_named("singleton_manager::run", async move {
        manager.run().await;
    }));
}

struct SingletonManager {
    options: SingletonOptions,
    /// Stop signal of the currently running supervisor, if any.
    running: Option<watch::Sender<bool>>,
}

impl SingletonManager {
    async fn run(mut self) {
        let mut events = self.options.cluster.subscribe();
        self.evaluate();

        loop {
            match events.recv().await {
                Ok(_) => self.evaluate(),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("[Singleton] Membership stream lagged, skipped {} events", skipped);
                    self.evaluate();
                },
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }

        self.stop_supervisor();
    }

    fn oldest(&self) -> Option<Member> {
        self.options
            .cluster
            .members()
            .into_iter()
            .find(|member| {
                self.options.role.as_ref().map_or(true, |role| member.has_role(role))
            })
    }

    fn evaluate(&mut self) {
        let is_oldest = self.oldest().is_some_and(|oldest| oldest == self.options.member);

        match (is_oldest, self.running.is_some()) {
            (true, false) => self.start_supervisor(),
            (false, true) => self.stop_supervisor(),
            _ => {},
        }
    }

    fn start_supervisor(&mut self) {
        info!(
            "[Singleton {}] Oldest member, starting the coordinator here",
            self.options.path
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let supervisor = CoordinatorSupervisor {
            type_name: self.options.type_name.clone(),
            path: self.options.path.clone(),
            persistence_id: self.options.persistence_id.clone(),
            settings: Arc::clone(&self.options.settings),
            cluster: self.options.cluster.clone(),
            strategy: Arc::clone(&self.options.strategy),
            journal: Arc::clone(&self.options.journal),
            tasks: Arc::clone(&self.options.tasks),
            stop: stop_rx,
        };

        self.options.tasks.track(spawn_named("coordinator_supervisor::run", async move {
            supervisor.run().await;
        }));
        self.running = Some(stop_tx);
    }

    fn stop_supervisor(&mut self) {
        if let Some(stop) = self.running.take() {
            info!("[Singleton {}] No longer oldest, stopping the coordinator", self.options.path);
            drop(stop.send(true));
        }
    }
}

/// Runs the coordinator and restarts it after `coordinator_failure_backoff`
/// when it stops on a persistence failure.
///
/// There is no resume: when a write fails it is unknown whether the event
/// reached the log, so the only safe path is to stop, back off and recover
/// from the log.
struct CoordinatorSupervisor {
    type_name: String,
    path: String,
    persistence_id: String,
    settings: Arc<ShardingSettings>,
    cluster: Cluster,
    strategy: Arc<dyn AllocationStrategy>,
    journal: Arc<dyn Journal>,
    tasks: Arc<TaskSet>,
    stop: watch::Receiver<bool>,
}

impl CoordinatorSupervisor {
    async fn run(mut self) {
        loop {
            if *self.stop.borrow() {
                break;
            }

            let (coordinator_ref, coordinator) = ShardCoordinator::new(CoordinatorOptions {
                type_name: self.type_name.clone(),
                path: self.path.clone(),
                persistence_id: self.persistence_id.clone(),
                settings: Arc::clone(&self.settings),
                cluster: self.cluster.clone(),
                strategy: Arc::clone(&self.strategy),
                journal: Arc::clone(&self.journal),
                tasks: Arc::clone(&self.tasks),
                stop: self.stop.clone(),
            });

            self.cluster.registry().register(self.path.clone(), coordinator_ref);
            let result = coordinator.run().await;
            self.cluster.registry().deregister(&self.path);

            match result {
                Ok(()) => break,
                Err(why) => {
                    warn!(
                        "[Singleton {}] Coordinator failed: {}; restarting in {:?}",
                        self.path, why, self.settings.coordinator_failure_backoff
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.coordinator_failure_backoff) => {},
                        _ = self.stop.changed() => {},
                    }
                },
            }
        }
    }
}
