use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::debug;

use podcopy::{
    client::{Client, File},
    config::ClientConfig,
    path::{FileSpec, LocalPath, RemoteFile, RemotePath},
};

/// podcp
#[derive(Debug, Parser)]
#[clap(name = "podcp", version)]
pub struct App {
    /// Namespace of pods named without one
    #[clap(
        long,
        short = 'n',
        global = true,
        default_value = "default",
        env = "PODCOPY_NAMESPACE"
    )]
    namespace: String,
    /// Container to run in, instead of the pod's default one
    #[clap(long, short = 'c', global = true)]
    container: Option<String>,
    /// kubeconfig file for kubectl
    #[clap(long, global = true)]
    kubeconfig: Option<PathBuf>,
    /// kubeconfig context for kubectl
    #[clap(long, global = true)]
    context: Option<String>,
    /// The kubectl binary
    #[clap(long, global = true, default_value = "kubectl", env = "PODCOPY_KUBECTL")]
    kubectl: PathBuf,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Copies one file between the local host and a pod
    ///
    /// One side is [NAMESPACE/]POD:PATH, the other a local path, or - for stdin/stdout.
    Cp {
        src: String,
        dest: String,
        /// How often to resume a broken download; negative retries forever
        #[clap(
            long,
            default_value_t = 0,
            allow_negative_numbers = true,
            env = "PODCOPY_RETRIES"
        )]
        retries: i32,
        /// Don't restore ownership and permissions in the pod
        #[clap(long)]
        no_preserve: bool,
    },
    /// Runs a command in a pod
    Exec {
        pod: String,
        /// Pass stdin to the command
        #[clap(long, short = 'i')]
        stdin: bool,
        /// Allocate a terminal
        #[clap(long, short = 't')]
        tty: bool,
        #[clap(last = true, required = true)]
        command: Vec<String>,
    },
    /// Opens an interactive shell in a pod
    Shell {
        pod: String,
        /// Defaults to sh
        command: Option<String>,
        args: Vec<String>,
    },
}

/// Splits `[namespace/]pod`.
fn pod_ref(app: &App, pod: &str) -> (String, String) {
    match pod.split_once('/') {
        Some((namespace, pod)) => (namespace.to_string(), pod.to_string()),
        None => (app.namespace.clone(), pod.to_string()),
    }
}

fn remote_file(client: &Client, app: &App, remote: &RemoteFile) -> File {
    let file = client.file(&remote.namespace, &remote.pod, remote.path.as_str());
    match &app.container {
        Some(container) => file.container(container),
        None => file,
    }
}

fn download(file: &File, local: &LocalPath) -> Result<()> {
    if local.is_stdio() {
        let stats = file
            .read_to_writer(io::BufWriter::new(io::stdout()))
            .with_context(|| format!("Copying {} to stdout", file.path()))?;
        debug!("{stats:?}");
        return Ok(());
    }

    // like cp, copying into a directory keeps the file name
    let mut target = local.as_path().to_path_buf();
    if target.is_dir() {
        target.push(RemotePath::new(file.path()).base().as_str());
    }

    let output =
        fs::File::create(&target).with_context(|| format!("Creating {}", target.display()))?;
    let result = file
        .read_to_writer(io::BufWriter::new(output))
        .with_context(|| format!("Copying {} to {}", file.path(), target.display()));
    if result.is_err() {
        let _ = fs::remove_file(&target);
    }
    let stats = result?;
    debug!("{stats:?}");
    Ok(())
}

fn upload(file: &File, local: &LocalPath) -> Result<()> {
    if local.is_stdio() {
        return file
            .write_from_reader(io::stdin(), None)
            .with_context(|| format!("Copying stdin to {}", file.path()));
    }

    let input = fs::File::open(local.as_path()).with_context(|| format!("Opening {local}"))?;
    let metadata = input.metadata()?;
    if metadata.is_dir() {
        bail!("{local} is a directory, only single files can be copied");
    }
    file.write_from_reader(input, Some(metadata.len()))
        .with_context(|| format!("Copying {local} to {}", file.path()))
}

fn copy(
    client: &Client,
    app: &App,
    src: &str,
    dest: &str,
    retries: i32,
    no_preserve: bool,
) -> Result<()> {
    let src = FileSpec::parse(src, &app.namespace)?;
    let dest = FileSpec::parse(dest, &app.namespace)?;

    match (src, dest) {
        (FileSpec::Remote(remote), FileSpec::Local(local)) => {
            let file = remote_file(client, app, &remote).max_retries(retries);
            download(&file, &local)
        }
        (FileSpec::Local(local), FileSpec::Remote(mut remote)) => {
            // `pod:/tmp/` means "into /tmp", under the local name
            if remote.path.as_str().ends_with('/') {
                let Some(name) = local.base() else {
                    bail!("{} needs a file name", remote.path);
                };
                remote.path = remote.path.join(name);
            }
            let file = remote_file(client, app, &remote).no_preserve(no_preserve);
            upload(&file, &local)
        }
        (FileSpec::Remote(..), FileSpec::Remote(..)) => {
            bail!("Copying between two pods is not supported")
        }
        (FileSpec::Local(..), FileSpec::Local(..)) => {
            bail!("One of source and destination must be [NAMESPACE/]POD:PATH")
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();
    let config = ClientConfig {
        kubectl: args.kubectl.clone(),
        kubeconfig: args.kubeconfig.clone(),
        context: args.context.clone(),
    };
    let client = Client::kubectl(config);

    match &args.cmd {
        Command::Cp {
            src,
            dest,
            retries,
            no_preserve,
        } => copy(&client, &args, src, dest, *retries, *no_preserve)?,
        Command::Exec {
            pod,
            stdin,
            tty,
            command,
        } => {
            let (namespace, pod) = pod_ref(&args, pod);
            let (program, rest) = command.split_first().context("Missing command")?;
            let mut shell = client
                .shell(namespace, pod, program, rest)
                .interactive(*stdin)
                .tty(*tty);
            if let Some(container) = &args.container {
                shell = shell.container(container);
            }
            match shell.run() {
                // pass the command's own exit status through
                Err(podcopy::Error::Remote {
                    status: Some(code), ..
                }) => {
                    io::stdout().flush()?;
                    std::process::exit(code);
                }
                result => result?,
            }
        }
        Command::Shell {
            pod,
            command,
            args: shell_args,
        } => {
            let (namespace, pod) = pod_ref(&args, pod);
            let mut shell = client.shell(
                namespace,
                pod,
                command.as_deref().unwrap_or("sh"),
                shell_args,
            );
            if let Some(container) = &args.container {
                shell = shell.container(container);
            }
            shell.run()?;
        }
    }
    Ok(())
}
