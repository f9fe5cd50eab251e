// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use arc_swap::ArcSwap;
use consus_config::{ClusterConfig, CommId, Parameters};

use crate::metrics::Metrics;

/// Context shared by all components of one node: its identity, operational
/// parameters, metrics, and the coordinator-published cluster snapshot.
///
/// The snapshot is read lock-free; the coordinator link publishes a whole new
/// configuration with a single pointer swap.
pub(crate) struct Context {
    pub own_id: CommId,
    pub parameters: Parameters,
    pub metrics: Arc<Metrics>,
    config: ArcSwap<ClusterConfig>,
}

impl Context {
    pub(crate) fn new(
        own_id: CommId,
        config: Arc<ClusterConfig>,
        parameters: Parameters,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            own_id,
            parameters,
            metrics,
            config: ArcSwap::new(config),
        }
    }

    pub(crate) fn config(&self) -> Arc<ClusterConfig> {
        self.config.load_full()
    }

    pub(crate) fn publish_config(&self, config: Arc<ClusterConfig>) {
        self.config.store(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::test_metrics;
    use consus_config::{local_cluster, VersionId};

    #[test]
    fn published_config_replaces_the_snapshot() {
        let cluster = local_cluster(1, 3, 1);
        let own_id = cluster.txman_ids[0][0];
        let context = Context::new(
            own_id,
            Arc::new(cluster.config),
            Parameters::default(),
            test_metrics(),
        );
        assert_eq!(context.config().version, VersionId::new(1));

        let mut next = (*context.config()).clone();
        next.version = VersionId::new(2);
        context.publish_config(Arc::new(next));
        assert_eq!(context.config().version, VersionId::new(2));
    }
}
