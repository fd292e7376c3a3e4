//! Regent operator - rolling upgrades for leader-elected member groups

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use regent::config::ControllerConfig;
use regent::controller::{error_policy, reconcile, Context};
use regent::crd::MemberGroup;
use regent::telemetry::{init_telemetry, TelemetryConfig};
use regent::{LABEL_MANAGED_BY, MANAGED_BY};

/// Regent - Kubernetes operator for leader-elected consensus member groups
#[derive(Parser, Debug)]
#[command(name = "regent", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    controller: ControllerArgs,
}

#[derive(clap::Args, Debug)]
struct ControllerArgs {
    #[command(flatten)]
    config: ControllerConfig,

    /// Do not install or update the MemberGroup CRD on startup
    #[arg(long, env = "REGENT_SKIP_CRD_INSTALL")]
    skip_crd_install: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // aws-lc-rs backs every TLS connection: kube API and member control planes.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install the aws-lc-rs crypto provider: {:?}",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&MemberGroup::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    run_controller(cli.controller).await
}

/// Install or update the MemberGroup CRD with server-side apply
///
/// Keeps the CRD schema in lockstep with the running operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(regent::FIELD_MANAGER).force();

    tracing::info!("Installing MemberGroup CRD...");
    crds.patch(
        "membergroups.regent.dev",
        &params,
        &Patch::Apply(&MemberGroup::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install MemberGroup CRD: {}", e))?;
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let config = args.config;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid controller configuration: {}", e))?;

    tracing::info!("Regent controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if !args.skip_crd_install {
        ensure_crd_installed(&client).await?;
    }

    let (groups, pods): (Api<MemberGroup>, Api<Pod>) = match &config.watch_namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    let ctx = Arc::new(
        Context::builder(client, config)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build controller context: {}", e))?,
    );

    let pod_watch = WatcherConfig::default().labels(&format!("{LABEL_MANAGED_BY}={MANAGED_BY}"));
    let members = ctx.members.clone();

    tracing::info!("Starting MemberGroup controller");
    Controller::new(groups, WatcherConfig::default())
        .owns(pods, pod_watch)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            let members = members.clone();
            async move {
                match result {
                    Ok((obj, action)) => {
                        tracing::debug!(group = %obj.name, ?action, "MemberGroup reconciliation completed");
                    }
                    Err(controller::Error::ObjectNotFound(obj)) => {
                        // Group deleted; its member control client is no longer needed.
                        let namespace = obj.namespace.clone().unwrap_or_else(|| "default".to_string());
                        members.forget(&namespace, &obj.name);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "MemberGroup reconciliation error");
                    }
                }
            }
        })
        .await;

    tracing::info!("Regent controller shutting down");
    Ok(())
}
