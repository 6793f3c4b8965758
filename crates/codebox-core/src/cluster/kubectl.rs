//! Kubernetes backend driven through the `kubectl` CLI.
//!
//! Each sandbox is one pod running `codebox-executor serve`. Requests are
//! delivered with `kubectl exec -i <pod> -- codebox-executor exec`, one JSON
//! request on stdin and one JSON response on stdout.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{ClusterError, SandboxCluster, SandboxName};
use crate::executor::protocol::{ExecutorRequest, ExecutorResponse};

/// Label every sandbox pod carries, for `kubectl get pods -l`.
pub const APP_LABEL: &str = "codebox-executor";

const CONTAINER_NAME: &str = "executor";

const WORKSPACE_VOLUME: &str = "workspace";

const RUN_INSTALL_ALLOWANCE: Duration = Duration::from_secs(300);

/// Kubernetes backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KubernetesConfig {
    /// kubectl binary.
    pub kubectl: String,
    pub namespace: Option<String>,
    /// kubeconfig context; current context when unset.
    pub context: Option<String>,
    /// Container image that ships `codebox-executor` and the interpreter.
    pub executor_image: String,
    /// Path of the executor binary inside the image.
    pub executor_binary: String,
    /// Workspace directory inside the container.
    pub workspace_dir: String,
    /// `resources` block for the executor container.
    pub container_resources: Value,
    /// Container `securityContext`. User code runs under this identity.
    pub security_context: Value,
    /// Pod-level `securityContext`; `fsGroup` makes the workspace volume writable.
    pub pod_security_context: Value,
    /// Extra fields merged into the pod `spec` (node selectors, tolerations, ...).
    pub pod_spec_extra: Value,
    /// Pod that owns every sandbox pod. Kubernetes garbage-collects the
    /// sandboxes when it is deleted.
    pub owner_pod: Option<String>,
    /// Use `$HOSTNAME` (the orchestrator's own pod) when `owner_pod` is unset.
    pub owner_from_hostname: bool,
    /// Upper bound on any single non-exec kubectl call.
    pub command_timeout_secs: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            namespace: None,
            context: None,
            executor_image: "codebox-executor:latest".to_string(),
            executor_binary: "codebox-executor".to_string(),
            workspace_dir: "/workspace".to_string(),
            container_resources: json!({
                "requests": {"cpu": "250m", "memory": "256Mi"},
                "limits": {"cpu": "1", "memory": "1Gi"}
            }),
            security_context: json!({
                "runAsNonRoot": true,
                "runAsUser": 1000,
                "runAsGroup": 1000,
                "allowPrivilegeEscalation": false,
                "capabilities": {"drop": ["ALL"]}
            }),
            pod_security_context: json!({"fsGroup": 1000}),
            pod_spec_extra: json!({}),
            owner_pod: None,
            owner_from_hostname: false,
            command_timeout_secs: 60,
        }
    }
}

pub struct KubectlCluster {
    config: KubernetesConfig,
    /// Resolved on first create; `None` when no owner is configured or it can't be found.
    owner: OnceCell<Option<Value>>,
}

impl KubectlCluster {
    pub fn new(config: KubernetesConfig) -> Self {
        Self {
            config,
            owner: OnceCell::new(),
        }
    }

    /// Pod manifest for a sandbox, optionally owned by `owner` (an `ownerReferences` entry).
    pub fn pod_manifest(&self, name: &SandboxName, owner: Option<&Value>) -> Value {
        let cfg = &self.config;
        let mut spec = json!({
            "restartPolicy": "Never",
            "automountServiceAccountToken": false,
            "securityContext": cfg.pod_security_context,
            "volumes": [{"name": WORKSPACE_VOLUME, "emptyDir": {}}],
            "containers": [{
                "name": CONTAINER_NAME,
                "image": cfg.executor_image,
                "command": [cfg.executor_binary, "serve", "--root", cfg.workspace_dir],
                "workingDir": cfg.workspace_dir,
                "resources": cfg.container_resources,
                "securityContext": cfg.security_context,
                "volumeMounts": [{"name": WORKSPACE_VOLUME, "mountPath": cfg.workspace_dir}],
                "readinessProbe": {
                    "exec": {"command": [cfg.executor_binary, "probe", "--root", cfg.workspace_dir]},
                    "periodSeconds": 1,
                    "failureThreshold": 1
                }
            }]
        });
        if let (Some(spec), Some(extra)) = (spec.as_object_mut(), cfg.pod_spec_extra.as_object()) {
            for (key, value) in extra {
                spec.insert(key.clone(), value.clone());
            }
        }

        let mut metadata = json!({
            "name": name.as_str(),
            "labels": {"app": APP_LABEL}
        });
        if let Some(owner) = owner {
            metadata["ownerReferences"] = json!([owner]);
        }

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": metadata,
            "spec": spec
        })
    }

    fn owner_pod_name(&self) -> Option<String> {
        self.config.owner_pod.clone().or_else(|| {
            self.config
                .owner_from_hostname
                .then(|| std::env::var("HOSTNAME").ok())
                .flatten()
                .filter(|h| !h.is_empty())
        })
    }

    /// `ownerReferences` entry for the configured owner pod, looked up once.
    pub async fn owner_reference(&self) -> Option<Value> {
        self.owner
            .get_or_init(|| async {
                let name = self.owner_pod_name()?;
                let pod = format!("pod/{name}");
                let uid = match self
                    .kubectl(
                        &["get", &pod, "-o", "jsonpath={.metadata.uid}"],
                        None,
                        self.command_timeout(),
                    )
                    .await
                {
                    Ok(stdout) => String::from_utf8_lossy(&stdout).trim().to_string(),
                    Err(e) => {
                        warn!(owner = %name, error = %e, "owner pod lookup failed, sandboxes will not be garbage-collected");
                        return None;
                    }
                };
                if uid.is_empty() {
                    warn!(owner = %name, "owner pod has no uid");
                    return None;
                }
                info!(owner = %name, %uid, "sandbox pods will be owned by this pod");
                Some(json!({
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "name": name,
                    "uid": uid
                }))
            })
            .await
            .clone()
    }

    /// Global flags followed by `args`.
    fn args(&self, args: &[&str]) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(ns) = &self.config.namespace {
            out.push(format!("--namespace={ns}"));
        }
        if let Some(ctx) = &self.config.context {
            out.push(format!("--context={ctx}"));
        }
        out.extend(args.iter().map(|a| a.to_string()));
        out
    }

    async fn kubectl(
        &self,
        args: &[&str],
        stdin: Option<Vec<u8>>,
        limit: Duration,
    ) -> Result<Vec<u8>, ClusterError> {
        let args = self.args(args);
        debug!(cmd = %self.config.kubectl, ?args, "kubectl");

        let mut child = Command::new(&self.config.kubectl)
            .args(&args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClusterError::Fatal(format!("spawning {}: {e}", self.config.kubectl)))?;

        if let (Some(payload), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&payload)
                .await
                .map_err(|e| ClusterError::Transient(format!("writing kubectl stdin: {e}")))?;
            // Closing stdin is what tells the remote side the request is complete.
            drop(pipe);
        }

        let output = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| ClusterError::Transient(format!("kubectl timed out after {}s", limit.as_secs())))?
            .map_err(|e| ClusterError::Transient(format!("waiting for kubectl: {e}")))?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(classify(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }
}

/// Map kubectl stderr to an error class.
pub fn classify(stderr: &str) -> ClusterError {
    const TRANSIENT: &[&str] = &[
        "connection refused",
        "connection reset",
        "i/o timeout",
        "TLS handshake timeout",
        "ServiceUnavailable",
        "the server is currently unable",
        "etcdserver",
        "unable to upgrade connection",
        "container not found",
        "is not running",
        "ContainerCreating",
        "PodInitializing",
        "Too Many Requests",
    ];

    let message = stderr.trim().to_string();
    if TRANSIENT.iter().any(|needle| stderr.contains(needle)) {
        ClusterError::Transient(message)
    } else if stderr.contains("AlreadyExists") || stderr.contains("already exists") {
        ClusterError::AlreadyExists(message)
    } else if stderr.contains("NotFound") || stderr.contains("not found") {
        ClusterError::NotFound(message)
    } else {
        ClusterError::Fatal(message)
    }
}

#[async_trait]
impl SandboxCluster for KubectlCluster {
    fn backend(&self) -> &'static str {
        "kubectl"
    }

    async fn create(&self, name: &SandboxName) -> Result<(), ClusterError> {
        let owner = self.owner_reference().await;
        let manifest = serde_json::to_vec(&self.pod_manifest(name, owner.as_ref()))
            .map_err(|e| ClusterError::Fatal(format!("encoding pod manifest: {e}")))?;
        self.kubectl(&["create", "-f", "-"], Some(manifest), self.command_timeout())
            .await?;
        Ok(())
    }

    async fn await_ready(&self, name: &SandboxName, timeout: Duration) -> Result<(), ClusterError> {
        let pod = format!("pod/{name}");
        let wait_flag = format!("--timeout={}s", timeout.as_secs().max(1));
        // kubectl enforces the wait itself; the outer limit only guards a hung client.
        let limit = timeout + Duration::from_secs(10);
        match self
            .kubectl(&["wait", &pod, "--for=condition=Ready", &wait_flag], None, limit)
            .await
        {
            Ok(_) => Ok(()),
            Err(ClusterError::Fatal(msg)) if msg.contains("timed out") => {
                Err(ClusterError::ReadyTimeout(timeout))
            }
            Err(e) => Err(e),
        }
    }

    async fn terminate(&self, name: &SandboxName) -> Result<(), ClusterError> {
        let pod = format!("pod/{name}");
        self.kubectl(
            &["delete", &pod, "--now", "--ignore-not-found"],
            None,
            self.command_timeout(),
        )
        .await?;
        Ok(())
    }

    async fn exec(
        &self,
        name: &SandboxName,
        request: ExecutorRequest,
    ) -> Result<ExecutorResponse, ClusterError> {
        let op = request.op();
        let limit = match &request {
            // Dependency installation runs before the script's own clock starts.
            ExecutorRequest::Run { timeout_secs, .. } => {
                Duration::from_secs(timeout_secs.unwrap_or(0))
                    + RUN_INSTALL_ALLOWANCE
                    + self.command_timeout()
            }
            _ => self.command_timeout(),
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| ClusterError::Fatal(format!("encoding request: {e}")))?;
        let binary = self.config.executor_binary.as_str();
        let root = self.config.workspace_dir.as_str();

        let stdout = self
            .kubectl(
                &[
                    "exec", "-i", name.as_str(), "-c", CONTAINER_NAME, "--", binary, "exec",
                    "--root", root,
                ],
                Some(payload),
                limit,
            )
            .await?;

        serde_json::from_slice(&stdout).map_err(|e| {
            warn!(sandbox = %name, op = op, error = %e, "unparseable executor response");
            ClusterError::Fatal(format!("malformed executor response to {op}: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_errors() {
        assert!(matches!(
            classify("error: unable to upgrade connection: container not found (\"executor\")"),
            ClusterError::Transient(_)
        ));
        assert!(matches!(
            classify("Error from server (AlreadyExists): pods \"codebox-1\" already exists"),
            ClusterError::AlreadyExists(_)
        ));
        assert!(matches!(
            classify("Error from server (NotFound): pods \"codebox-1\" not found"),
            ClusterError::NotFound(_)
        ));
        assert!(matches!(
            classify("Error from server (Forbidden): pods is forbidden"),
            ClusterError::Fatal(_)
        ));
    }

    #[test]
    fn manifest_carries_name_label_and_extra_spec() {
        let cluster = KubectlCluster::new(KubernetesConfig {
            pod_spec_extra: json!({"nodeSelector": {"pool": "sandbox"}}),
            ..KubernetesConfig::default()
        });
        let name = SandboxName::for_executor("alice");
        let manifest = cluster.pod_manifest(&name, None);

        assert_eq!(manifest["metadata"]["name"], name.as_str());
        assert_eq!(manifest["metadata"]["labels"]["app"], APP_LABEL);
        assert!(manifest["metadata"].get("ownerReferences").is_none());
        assert_eq!(manifest["spec"]["nodeSelector"]["pool"], "sandbox");
        assert_eq!(manifest["spec"]["restartPolicy"], "Never");
        let container = &manifest["spec"]["containers"][0];
        let command = &container["command"];
        assert_eq!(command[1], "serve");
        assert_eq!(command[3], "/workspace");

        let security = &container["securityContext"];
        assert_eq!(security["runAsNonRoot"], true);
        assert_ne!(security["runAsUser"], 0);
        assert!(security["runAsUser"].as_u64().is_some());
        assert_eq!(security["allowPrivilegeEscalation"], false);
        assert_eq!(security["capabilities"]["drop"], json!(["ALL"]));
        assert_eq!(manifest["spec"]["securityContext"]["fsGroup"], 1000);
        assert_eq!(container["volumeMounts"][0]["mountPath"], "/workspace");
        assert_eq!(manifest["spec"]["volumes"][0]["name"], container["volumeMounts"][0]["name"]);
    }

    #[test]
    fn security_context_is_configurable() {
        let cluster = KubectlCluster::new(KubernetesConfig {
            security_context: json!({"runAsUser": 2000, "runAsNonRoot": true}),
            ..KubernetesConfig::default()
        });
        let manifest = cluster.pod_manifest(&SandboxName::for_executor("bob"), None);
        assert_eq!(manifest["spec"]["containers"][0]["securityContext"]["runAsUser"], 2000);
    }

    #[test]
    fn manifest_carries_owner_reference() {
        let cluster = KubectlCluster::new(KubernetesConfig::default());
        let owner = json!({"apiVersion": "v1", "kind": "Pod", "name": "codebox-api-0", "uid": "1f2e"});
        let manifest = cluster.pod_manifest(&SandboxName::for_executor("alice"), Some(&owner));
        assert_eq!(manifest["metadata"]["ownerReferences"], json!([owner]));
    }

    #[test]
    fn owner_pod_name_prefers_explicit_config() {
        let explicit = KubectlCluster::new(KubernetesConfig {
            owner_pod: Some("codebox-api-0".into()),
            owner_from_hostname: true,
            ..KubernetesConfig::default()
        });
        assert_eq!(explicit.owner_pod_name().as_deref(), Some("codebox-api-0"));

        let unowned = KubectlCluster::new(KubernetesConfig::default());
        assert_eq!(unowned.owner_pod_name(), None);
    }

    #[cfg(unix)]
    fn fake_kubectl(dir: &std::path::Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("kubectl");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn owner_reference_is_resolved_once() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls");
        let kubectl = fake_kubectl(
            dir.path(),
            &format!("echo \"$@\" >> {}\nprintf 'abc-123'", calls.display()),
        );
        let cluster = KubectlCluster::new(KubernetesConfig {
            kubectl,
            owner_pod: Some("codebox-api-0".into()),
            ..KubernetesConfig::default()
        });

        let owner = cluster.owner_reference().await.unwrap();
        assert_eq!(owner["name"], "codebox-api-0");
        assert_eq!(owner["uid"], "abc-123");
        assert_eq!(owner["kind"], "Pod");
        assert_eq!(cluster.owner_reference().await, Some(owner));

        let calls = std::fs::read_to_string(&calls).unwrap();
        assert_eq!(calls.lines().count(), 1);
        assert!(calls.contains("get pod/codebox-api-0"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_owner_pod_leaves_sandboxes_unowned() {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = fake_kubectl(
            dir.path(),
            "echo 'Error from server (NotFound): pods \"gone\" not found' >&2\nexit 1",
        );
        let cluster = KubectlCluster::new(KubernetesConfig {
            kubectl,
            owner_pod: Some("gone".into()),
            ..KubernetesConfig::default()
        });
        assert_eq!(cluster.owner_reference().await, None);
    }

    #[test]
    fn global_flags_precede_subcommand() {
        let cluster = KubectlCluster::new(KubernetesConfig {
            namespace: Some("sandboxes".into()),
            context: Some("prod".into()),
            ..KubernetesConfig::default()
        });
        let args = cluster.args(&["get", "pods"]);
        assert_eq!(
            args,
            vec!["--namespace=sandboxes", "--context=prod", "get", "pods"]
        );
    }

    #[tokio::test]
    async fn missing_kubectl_binary_is_fatal() {
        let cluster = KubectlCluster::new(KubernetesConfig {
            kubectl: "/nonexistent/kubectl".into(),
            ..KubernetesConfig::default()
        });
        let err = cluster
            .terminate(&SandboxName::for_executor("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Fatal(_)));
    }
}
