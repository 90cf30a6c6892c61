use std::path::PathBuf;

/// Environment variable naming the `kubectl` binary to run.
pub const KUBECTL_ENV: &str = "PODCOPY_KUBECTL";

/// How to reach the cluster.
///
/// This is built once when the client is set up and handed to the executor; nothing about the
/// cluster connection lives in process-wide state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// The `kubectl` binary used to open exec streams.
    pub kubectl: PathBuf,
    /// Passed as `--kubeconfig`; when unset kubectl falls back to `$KUBECONFIG` and `~/.kube/config`.
    pub kubeconfig: Option<PathBuf>,
    /// Passed as `--context`.
    pub context: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            kubectl: PathBuf::from("kubectl"),
            kubeconfig: None,
            context: None,
        }
    }
}

impl ClientConfig {
    /// The default configuration, with the kubectl binary overridden from `$PODCOPY_KUBECTL`.
    pub fn from_env() -> Self {
        let mut config = ClientConfig::default();
        if let Some(kubectl) = std::env::var_os(KUBECTL_ENV) {
            config.kubectl = kubectl.into();
        }
        config
    }

    /// Global kubectl arguments that select the cluster.
    pub(crate) fn global_args(&self) -> Vec<String> {
        let mut args = vec![];
        if let Some(kubeconfig) = &self.kubeconfig {
            args.push(format!("--kubeconfig={}", kubeconfig.display()));
        }
        if let Some(context) = &self.context {
            args.push(format!("--context={context}"));
        }
        args
    }
}
