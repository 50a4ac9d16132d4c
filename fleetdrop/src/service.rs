//! Caller-facing payload service.
//!
//! [`PayloadService`] turns an action request (deploy, undeploy, status,
//! info, custom) against a list of endpoints into dispatch jobs and
//! notifications. Deploy scripts are produced by a [`ScriptComposer`], so
//! the service itself knows nothing about what runs on the endpoint.
//!
//! # Example
//!
//! ```ignore
//! let service = PayloadService::new(catalog, handle, transport, notifier, serve_config)
//!     .with_composer(Arc::new(PowerShellComposer));
//!
//! let request = ActionRequest::new(ActionKind::Deploy)
//!     .with_targets(["node/site/abc"])
//!     .with_origin("https://mesh.example.com");
//! service.submit(request).await?;
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::acquisition::{ArtifactCatalog, ArtifactMetadata};
use crate::dispatch::{
    ActionKind, DispatchError, DispatchHandle, DispatchResult, EndpointId, EndpointTransport, Job,
    JobNotifier, JobUpdate, Severity,
};
use crate::serve::ServeConfig;

/// Default directory deploy scripts install into.
pub const DEFAULT_DEPLOY_DIR: &str = r"C:\ProgramData\fleetdrop";

// =============================================================================
// Script Composition
// =============================================================================

/// Per-request options passed to the script composer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployOptions {
    /// Directory on the endpoint the artifact is installed into.
    pub deploy_dir: String,
    /// Overwrite an existing install.
    pub force: bool,
    /// Run as the logged-in user instead of the agent account.
    pub run_as_user: bool,
    /// Remove the deploy directory itself on undeploy.
    pub cleanup_on_undeploy: bool,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            deploy_dir: DEFAULT_DEPLOY_DIR.to_string(),
            force: false,
            run_as_user: false,
            cleanup_on_undeploy: false,
        }
    }
}

/// Everything a deploy script may need.
#[derive(Debug, Clone, Copy)]
pub struct DeployContext<'a> {
    pub download_url: &'a str,
    pub asset: &'a ArtifactMetadata,
    pub options: &'a DeployOptions,
}

/// Produces the scripts endpoints run for deploy and undeploy.
pub trait ScriptComposer: Send + Sync {
    fn deploy_script(&self, ctx: &DeployContext<'_>) -> String;

    fn undeploy_script(&self, options: &DeployOptions) -> String;
}

/// Windows PowerShell scripts: download, verify, extract; undeploy removes
/// the install directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct PowerShellComposer;

fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

impl ScriptComposer for PowerShellComposer {
    fn deploy_script(&self, ctx: &DeployContext<'_>) -> String {
        let mut lines = vec![
            "$ErrorActionPreference = 'Stop'".to_string(),
            "$ProgressPreference = 'SilentlyContinue'".to_string(),
            format!("$packageUrl = {}", ps_quote(ctx.download_url)),
            format!("$targetDir = {}", ps_quote(&ctx.options.deploy_dir)),
            "$tempFile = Join-Path -Path $env:TEMP -ChildPath ('fleetdrop-' + [System.Guid]::NewGuid().ToString() + '.zip')".to_string(),
            "if (-not (Test-Path -LiteralPath $targetDir)) { New-Item -ItemType Directory -Path $targetDir -Force | Out-Null }".to_string(),
        ];
        if !ctx.options.force {
            lines.push(
                "if ((Get-ChildItem -LiteralPath $targetDir -Force | Measure-Object).Count -gt 0) { Write-Host ('Existing deployment detected at ' + $targetDir + '. Use force to overwrite.'); exit 0 }".to_string(),
            );
        }
        lines.push("Invoke-WebRequest -Uri $packageUrl -OutFile $tempFile -UseBasicParsing".to_string());
        if let Some(sha256) = &ctx.asset.sha256 {
            lines.push(format!("$expectedHash = {}", ps_quote(sha256)));
            lines.push("$fileHash = (Get-FileHash -Path $tempFile -Algorithm SHA256).Hash".to_string());
            lines.push("if ($fileHash -ne $expectedHash) { Remove-Item -LiteralPath $tempFile -Force; throw ('SHA256 mismatch. Expected ' + $expectedHash + ' but received ' + $fileHash) }".to_string());
        }
        lines.push("Expand-Archive -Path $tempFile -DestinationPath $targetDir -Force".to_string());
        lines.push("Remove-Item -LiteralPath $tempFile -Force".to_string());
        lines.push("Write-Host ('Deployed to ' + $targetDir)".to_string());
        lines.join("\r\n")
    }

    fn undeploy_script(&self, options: &DeployOptions) -> String {
        let mut lines = vec![
            "$ErrorActionPreference = 'Stop'".to_string(),
            format!("$targetDir = {}", ps_quote(&options.deploy_dir)),
            "if (Test-Path -LiteralPath $targetDir) {".to_string(),
        ];
        if options.cleanup_on_undeploy {
            lines.push("  Remove-Item -LiteralPath $targetDir -Recurse -Force".to_string());
        } else {
            lines.push("  Get-ChildItem -LiteralPath $targetDir -Force | Remove-Item -Recurse -Force".to_string());
        }
        lines.push("  Write-Host ('Removed deployment from ' + $targetDir)".to_string());
        lines.push("} else {".to_string());
        lines.push("  Write-Host 'No deployment found to remove.'".to_string());
        lines.push("}".to_string());
        lines.join("\r\n")
    }
}

// =============================================================================
// Requests
// =============================================================================

/// One caller action against a set of endpoints.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub action: ActionKind,
    pub targets: Vec<String>,
    pub requester: Option<String>,
    /// Origin the caller reached the server on; used for download links.
    pub origin: Option<String>,
    pub options: Option<DeployOptions>,
    /// Script for [`ActionKind::Custom`].
    pub script: Option<String>,
}

impl ActionRequest {
    pub fn new(action: ActionKind) -> Self {
        Self {
            action,
            targets: Vec::new(),
            requester: None,
            origin: None,
            options: None,
            script: None,
        }
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_options(mut self, options: DeployOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }
}

/// What a submitted request did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitReport {
    /// Artifact metadata, for `info`.
    pub info: Option<ArtifactMetadata>,
    /// Endpoints a job was queued for.
    pub enqueued: Vec<EndpointId>,
    /// Connectivity, for `status`.
    pub connectivity: Vec<(EndpointId, bool)>,
    /// Target strings that failed validation.
    pub rejected: Vec<String>,
}

// =============================================================================
// Payload Service
// =============================================================================

/// Wires the artifact catalog to the dispatch queue for one payload.
pub struct PayloadService {
    catalog: Arc<ArtifactCatalog>,
    dispatch: DispatchHandle,
    transport: Arc<dyn EndpointTransport>,
    notifier: Arc<dyn JobNotifier>,
    composer: Arc<dyn ScriptComposer>,
    serve: ServeConfig,
    defaults: DeployOptions,
}

impl PayloadService {
    pub fn new(
        catalog: Arc<ArtifactCatalog>,
        dispatch: DispatchHandle,
        transport: Arc<dyn EndpointTransport>,
        notifier: Arc<dyn JobNotifier>,
        serve: ServeConfig,
    ) -> Self {
        Self {
            catalog,
            dispatch,
            transport,
            notifier,
            composer: Arc::new(PowerShellComposer),
            serve,
            defaults: DeployOptions::default(),
        }
    }

    pub fn with_composer(mut self, composer: Arc<dyn ScriptComposer>) -> Self {
        self.composer = composer;
        self
    }

    /// Options used when a request carries none.
    pub fn with_default_options(mut self, options: DeployOptions) -> Self {
        self.defaults = options;
        self
    }

    pub fn catalog(&self) -> &Arc<ArtifactCatalog> {
        &self.catalog
    }

    /// Current artifact metadata.
    pub async fn asset_info(&self) -> ArtifactMetadata {
        self.catalog.metadata(false).await
    }

    /// Carry out a caller request.
    ///
    /// Request-level problems (no targets, no artifact for a deploy, no
    /// script for a custom action) are notified and returned as errors.
    /// Per-target problems are notified and the target is skipped.
    pub async fn submit(&self, request: ActionRequest) -> DispatchResult<SubmitReport> {
        let action = request.action;
        let requester = request.requester.clone();
        debug!(action = %action, targets = request.targets.len(), "Action requested");

        if action == ActionKind::Info {
            return Ok(SubmitReport {
                info: Some(self.asset_info().await),
                ..Default::default()
            });
        }

        if request.targets.is_empty() {
            return Err(self.reject(DispatchError::NoTargets, action, &requester));
        }

        let options = request.options.clone().unwrap_or_else(|| self.defaults.clone());
        let asset = if action == ActionKind::Deploy {
            let meta = self.catalog.metadata(false).await;
            if !meta.available {
                return Err(self.reject(DispatchError::AssetUnavailable, action, &requester));
            }
            Some(meta)
        } else {
            None
        };
        let custom_script = match (action, request.script.as_deref()) {
            (ActionKind::Custom, Some(script)) if !script.trim().is_empty() => Some(script),
            (ActionKind::Custom, _) => {
                return Err(self.reject(DispatchError::MissingScript, action, &requester));
            }
            _ => None,
        };

        let mut report = SubmitReport::default();
        for raw in &request.targets {
            let endpoint = match EndpointId::parse(raw) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    self.notifier.notify(
                        JobUpdate::message(Severity::Error, e.to_string())
                            .with_action(action)
                            .with_requester(requester.clone()),
                    );
                    report.rejected.push(raw.clone());
                    continue;
                }
            };

            let script = match action {
                ActionKind::Deploy => {
                    let Some(asset) = asset.as_ref() else { continue };
                    let name = asset.name.as_deref().unwrap_or_default();
                    let Some(download_url) =
                        self.serve
                            .download_url(request.origin.as_deref(), endpoint.domain(), name)
                    else {
                        self.notify_endpoint(
                            &endpoint,
                            action,
                            &requester,
                            Severity::Error,
                            DispatchError::DownloadUrlUnavailable.to_string(),
                        );
                        continue;
                    };
                    self.composer.deploy_script(&DeployContext {
                        download_url: &download_url,
                        asset,
                        options: &options,
                    })
                }
                ActionKind::Undeploy => self.composer.undeploy_script(&options),
                ActionKind::Custom => custom_script.unwrap_or_default().to_string(),
                ActionKind::Status => {
                    let connected = self.transport.is_connected(&endpoint);
                    let (level, text) = if connected {
                        (Severity::Info, "Agent connected")
                    } else {
                        (Severity::Error, "Agent offline")
                    };
                    self.notify_endpoint(&endpoint, action, &requester, level, text);
                    report.connectivity.push((endpoint, connected));
                    continue;
                }
                ActionKind::Info => continue,
            };

            info!(action = %action, endpoint = %endpoint, "Queueing command");
            let mut job = Job::new(endpoint.clone(), action, script)
                .with_privileged(!options.run_as_user);
            if let Some(requester) = &requester {
                job = job.with_requester(requester.clone());
            }
            self.dispatch.enqueue(job)?;
            report.enqueued.push(endpoint);
        }

        Ok(report)
    }

    fn reject(
        &self,
        error: DispatchError,
        action: ActionKind,
        requester: &Option<String>,
    ) -> DispatchError {
        self.notifier.notify(
            JobUpdate::message(Severity::Error, error.to_string())
                .with_action(action)
                .with_requester(requester.clone()),
        );
        error
    }

    fn notify_endpoint(
        &self,
        endpoint: &EndpointId,
        action: ActionKind,
        requester: &Option<String>,
        level: Severity,
        text: impl Into<String>,
    ) {
        self.notifier.notify(
            JobUpdate::message(level, text)
                .with_endpoint(endpoint.clone())
                .with_node_name(self.transport.display_name(endpoint))
                .with_action(action)
                .with_requester(requester.clone()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::PayloadSettings;
    use crate::dispatch::{
        AgentRegistry, ChannelNotifier, DispatchConfig, DispatchDaemon, JobStatus,
    };
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        _temp: TempDir,
        service: PayloadService,
        registry: Arc<AgentRegistry>,
        updates: mpsc::UnboundedReceiver<JobUpdate>,
        shutdown: CancellationToken,
    }

    fn fixture(with_asset: bool) -> Fixture {
        let temp = TempDir::new().unwrap();
        if with_asset {
            std::fs::write(temp.path().join("bundle.zip"), b"PK\x03\x04bundle").unwrap();
        }
        let settings = PayloadSettings::new("stfdeploy", temp.path());
        let catalog = Arc::new(ArtifactCatalog::new(&settings));
        let registry = Arc::new(AgentRegistry::new());
        let (notifier, updates) = ChannelNotifier::new();
        let notifier: Arc<dyn JobNotifier> = Arc::new(notifier);

        let (daemon, handle) =
            DispatchDaemon::new(DispatchConfig::default(), registry.clone(), notifier.clone());
        let shutdown = CancellationToken::new();
        tokio::spawn(daemon.run(shutdown.clone()));

        let serve = ServeConfig::new("127.0.0.1:8088".parse().unwrap(), "/plugins/stfdeploy/assets");
        let service = PayloadService::new(catalog, handle, registry.clone(), notifier, serve);
        Fixture {
            _temp: temp,
            service,
            registry,
            updates,
            shutdown,
        }
    }

    fn node(id: &str) -> EndpointId {
        EndpointId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_deploy_sends_script_with_download_url() {
        let mut f = fixture(true);
        let mut agent = f.registry.connect(node("node/site/pc1"), Some("PC 1".to_string()));

        let report = f
            .service
            .submit(
                ActionRequest::new(ActionKind::Deploy)
                    .with_targets(["node/site/pc1"])
                    .with_requester("admin")
                    .with_origin("https://mesh.example.com"),
            )
            .await
            .unwrap();
        assert_eq!(report.enqueued, vec![node("node/site/pc1")]);

        let sent = agent.recv().await.unwrap();
        let message: serde_json::Value = serde_json::from_str(&sent).unwrap();
        let script = message["cmds"].as_str().unwrap();
        assert!(script.contains(
            "'https://mesh.example.com/site/plugins/stfdeploy/assets/bundle.zip'"
        ));
        assert!(script.contains("$expectedHash"));
        assert_eq!(message["runAsUser"], 0);

        let update = f.updates.recv().await.unwrap();
        assert_eq!(update.status, Some(JobStatus::InFlight));
        assert_eq!(update.node_name.as_deref(), Some("PC 1"));
        assert_eq!(update.requester.as_deref(), Some("admin"));
        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_deploy_without_artifact_is_rejected() {
        let mut f = fixture(false);
        let err = f
            .service
            .submit(ActionRequest::new(ActionKind::Deploy).with_targets(["node//pc1"]))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::AssetUnavailable);
        let update = f.updates.recv().await.unwrap();
        assert_eq!(update.text, "Deployment asset not found on server.");
        assert_eq!(update.level, Severity::Error);
        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_empty_targets_rejected_but_info_allowed() {
        let mut f = fixture(true);
        let err = f
            .service
            .submit(ActionRequest::new(ActionKind::Undeploy))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::NoTargets);
        assert_eq!(
            f.updates.recv().await.unwrap().text,
            "No target devices provided."
        );

        let report = f.service.submit(ActionRequest::new(ActionKind::Info)).await.unwrap();
        let info = report.info.unwrap();
        assert!(info.available);
        assert_eq!(info.name.as_deref(), Some("bundle.zip"));
        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_invalid_targets_are_skipped() {
        let mut f = fixture(true);
        let _agent = f.registry.connect(node("node//pc1"), None);
        let report = f
            .service
            .submit(
                ActionRequest::new(ActionKind::Undeploy)
                    .with_targets(["device-42", "node//pc1"]),
            )
            .await
            .unwrap();
        assert_eq!(report.rejected, vec!["device-42".to_string()]);
        assert_eq!(report.enqueued, vec![node("node//pc1")]);
        assert_eq!(
            f.updates.recv().await.unwrap().text,
            "Invalid node identifier: device-42"
        );
        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_status_checks_connectivity_without_dispatch() {
        let mut f = fixture(false);
        let mut agent = f.registry.connect(node("node//up"), None);
        let report = f
            .service
            .submit(ActionRequest::new(ActionKind::Status).with_targets(["node//up", "node//down"]))
            .await
            .unwrap();
        assert_eq!(
            report.connectivity,
            vec![(node("node//up"), true), (node("node//down"), false)]
        );
        assert!(report.enqueued.is_empty());
        assert!(agent.try_recv().is_err());

        let first = f.updates.recv().await.unwrap();
        assert_eq!((first.text.as_str(), first.level), ("Agent connected", Severity::Info));
        let second = f.updates.recv().await.unwrap();
        assert_eq!((second.text.as_str(), second.level), ("Agent offline", Severity::Error));
        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_custom_requires_script_and_respects_run_as_user() {
        let f = fixture(false);
        let mut agent = f.registry.connect(node("node//pc1"), None);

        let err = f
            .service
            .submit(ActionRequest::new(ActionKind::Custom).with_targets(["node//pc1"]))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::MissingScript);

        let options = DeployOptions {
            run_as_user: true,
            ..Default::default()
        };
        f.service
            .submit(
                ActionRequest::new(ActionKind::Custom)
                    .with_targets(["node//pc1"])
                    .with_script("hostname")
                    .with_options(options),
            )
            .await
            .unwrap();
        let message: serde_json::Value =
            serde_json::from_str(&agent.recv().await.unwrap()).unwrap();
        assert_eq!(message["cmds"], "hostname");
        assert_eq!(message["runAsUser"], 1);
        f.shutdown.cancel();
    }

    #[test]
    fn test_powershell_quoting_and_force() {
        let asset = ArtifactMetadata::unavailable();
        let options = DeployOptions {
            deploy_dir: r"C:\O'Brien".to_string(),
            force: true,
            ..Default::default()
        };
        let script = PowerShellComposer.deploy_script(&DeployContext {
            download_url: "http://h/a.zip",
            asset: &asset,
            options: &options,
        });
        assert!(script.contains(r"$targetDir = 'C:\O''Brien'"));
        assert!(!script.contains("Existing deployment detected"));
        assert!(!script.contains("$expectedHash"));

        let undeploy = PowerShellComposer.undeploy_script(&DeployOptions {
            cleanup_on_undeploy: true,
            ..Default::default()
        });
        assert!(undeploy.contains("Remove-Item -LiteralPath $targetDir -Recurse -Force"));
    }

    #[test]
    fn test_deploy_options_deserialize_with_defaults() {
        let options: DeployOptions =
            serde_json::from_str(r#"{"force": true, "runAsUser": true}"#).unwrap();
        assert!(options.force);
        assert!(options.run_as_user);
        assert_eq!(options.deploy_dir, DEFAULT_DEPLOY_DIR);
    }
}
