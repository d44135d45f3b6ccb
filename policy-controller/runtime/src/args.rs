use crate::{
    actions::{Controller, ControllerMetrics, Queue},
    admission::Admission,
    index::{
        IndexMetrics, QuotaIndex, RbacSyncer, ResourceQuotaUnpacker, Syncer, TreeIndex,
    },
    index_list::IndexList,
    k8s::{self, labels},
    lease,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use tokio::time::Duration;
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "hierarchy", about = "A hierarchical policy controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "hierarchy=info,warn",
        env = "HIERARCHY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Permits policy trees with more than one root node.
    #[clap(long)]
    allow_multiple_roots: bool,

    #[clap(long, default_value = "hierarchy-controller")]
    controller_deployment_name: String,

    #[clap(long, default_value = "hierarchy-system")]
    controller_namespace: String,

    /// How often every syncer reconciles the full declared state.
    #[clap(long, default_value = "300")]
    resync_period_secs: u64,

    #[clap(long, default_value = "5000")]
    action_timeout_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            allow_multiple_roots,
            controller_deployment_name,
            controller_namespace,
            resync_period_secs,
            action_timeout_ms,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };
        let resync_period = Duration::from_secs(resync_period_secs);

        // All syncers share a single queue of actions against the cluster.
        let queue = Queue::default();
        let tree_index = TreeIndex::shared();
        let rbac_syncer = RbacSyncer::shared(queue.clone());
        let quota_syncer = Syncer::shared(ResourceQuotaUnpacker, queue.clone());
        let quota_index = QuotaIndex::shared(queue.clone());

        let mut prom = <Registry>::default();
        let controller_metrics =
            ControllerMetrics::register(prom.sub_registry_with_prefix("actions"));
        let tree_metrics = IndexMetrics::register(
            tree_index.clone(),
            prom.sub_registry_with_prefix("tree_index"),
        )
        .shared();
        let rbac_metrics = IndexMetrics::register(
            rbac_syncer.clone(),
            prom.sub_registry_with_prefix("rbac_syncer"),
        )
        .shared();
        let quota_syncer_metrics = IndexMetrics::register(
            quota_syncer.clone(),
            prom.sub_registry_with_prefix("resource_quota_syncer"),
        )
        .shared();
        let quota_metrics = IndexMetrics::register(
            quota_index.clone(),
            prom.sub_registry_with_prefix("quota_index"),
        )
        .shared();
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").context("failed to fetch `HOSTNAME` environment variable")?;

        let claims = lease::init(
            &runtime,
            &controller_namespace,
            &controller_deployment_name,
            &hostname,
        )
        .await?;

        // Spawn resource watches.

        let nodes = runtime.watch_all::<k8s::PolicyNode>(watcher::Config::default());
        let nodes_indexes = IndexList::new(tree_metrics)
            .push(rbac_metrics.clone())
            .push(quota_syncer_metrics.clone())
            .push(quota_metrics.clone())
            .shared();
        tokio::spawn(
            kubert::index::cluster(nodes_indexes, nodes).instrument(info_span!("policynodes")),
        );

        let roles = runtime
            .watch_all::<k8s::Role>(watcher::Config::default().labels(labels::MANAGED_SELECTOR));
        tokio::spawn(
            kubert::index::namespaced(rbac_metrics.clone(), roles).instrument(info_span!("roles")),
        );

        let role_bindings = runtime.watch_all::<k8s::RoleBinding>(
            watcher::Config::default().labels(labels::MANAGED_SELECTOR),
        );
        tokio::spawn(
            kubert::index::namespaced(rbac_metrics, role_bindings)
                .instrument(info_span!("rolebindings")),
        );

        let quotas = runtime.watch_all::<k8s::ResourceQuota>(
            watcher::Config::default().labels(labels::MANAGED_SELECTOR),
        );
        let quotas_indexes = IndexList::new(quota_syncer_metrics)
            .push(quota_metrics)
            .shared();
        tokio::spawn(
            kubert::index::namespaced(quotas_indexes, quotas)
                .instrument(info_span!("resourcequotas")),
        );

        // Spawn the periodic resyncs.
        tokio::spawn(
            RbacSyncer::run(rbac_syncer, resync_period).instrument(info_span!("rbac_syncer")),
        );
        tokio::spawn(
            Syncer::run(quota_syncer, resync_period)
                .instrument(info_span!("resource_quota_syncer")),
        );

        // Spawn the action controller. Once shutdown is signaled the queue
        // stops accepting actions and the controller drains what remains.
        let controller = Controller::new(
            hostname,
            claims,
            queue.clone(),
            runtime.client(),
            Duration::from_millis(action_timeout_ms),
            controller_metrics,
        );
        let controller = tokio::spawn(controller.run().instrument(info_span!("actions")));
        let shutdown = runtime.shutdown_handle();
        tokio::spawn(async move {
            let release = shutdown.signaled().await;
            queue.shut_down();
            if let Err(error) = release.release_after(controller).await {
                tracing::error!(%error, "Action controller failed");
            }
        });

        let runtime = runtime
            .spawn_server(move || Admission::new(tree_index, quota_index, allow_multiple_roots));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
