//! In-process SSH agent scoped to one test.
//!
//! [`SshAgent::start`] binds a Unix socket in a private temporary directory
//! and serves the agent protocol from a dedicated worker thread running a
//! single-threaded Tokio runtime. Point `SSH_AUTH_SOCK` at
//! [`SshAgent::socket_path`] (or pass [`SshAgent::endpoint`] to the
//! provisioning options) so child processes authenticate with the test's
//! key pair without touching the developer's own agent.

mod protocol;

use std::io;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::key_pair::KeyPair;

pub use protocol::{
    MAX_MESSAGE_LEN, SSH_AGENT_FAILURE, SSH_AGENT_IDENTITIES_ANSWER, SSH_AGENT_SIGN_RESPONSE,
    SSH_AGENTC_REQUEST_IDENTITIES, SSH_AGENTC_SIGN_REQUEST,
};
use protocol::{Keyring, frame};

/// Environment variable SSH clients read to locate an agent.
pub const SSH_AUTH_SOCK_ENV: &str = "SSH_AUTH_SOCK";

const SOCKET_FILE_NAME: &str = "agent.sock";
const SOCKET_DIR_PREFIX: &str = "terrastage-agent-";
const WORKER_THREAD_NAME: &str = "terrastage-ssh-agent";
/// Pause after a failed `accept` so persistent errors such as descriptor
/// exhaustion do not spin the worker.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Errors raised while starting an agent.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AgentError {
    /// A supplied private key could not be decoded.
    #[error("agent key is invalid: {message}")]
    InvalidKey {
        /// Decoder error message.
        message: String,
    },
    /// The private socket directory could not be created.
    #[error("failed to create agent socket directory: {message}")]
    SocketDir {
        /// Operating system error message.
        message: String,
    },
    /// The socket could not be bound.
    #[error("failed to bind agent socket {path}: {message}")]
    Bind {
        /// Socket path.
        path: Utf8PathBuf,
        /// Operating system error message.
        message: String,
    },
    /// The async runtime could not be built.
    #[error("failed to build agent runtime: {message}")]
    Runtime {
        /// Runtime builder error message.
        message: String,
    },
    /// The worker thread could not be spawned.
    #[error("failed to spawn agent worker: {message}")]
    Spawn {
        /// Operating system error message.
        message: String,
    },
}

/// Where child processes should look for the agent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AgentEndpoint {
    /// Environment variable name.
    pub var: String,
    /// Socket path.
    pub socket: Utf8PathBuf,
}

impl AgentEndpoint {
    /// Builds an endpoint exported through `SSH_AUTH_SOCK`.
    #[must_use]
    pub fn new(socket: impl Into<Utf8PathBuf>) -> Self {
        Self {
            var: String::from(SSH_AUTH_SOCK_ENV),
            socket: socket.into(),
        }
    }
}

/// Handle to a running agent. Dropping the handle stops the agent.
#[derive(Debug)]
pub struct SshAgent {
    socket_path: Utf8PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
    socket_dir: Option<TempDir>,
}

impl SshAgent {
    /// Starts an agent serving a single key pair.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] when the key cannot be decoded or the socket,
    /// runtime or worker thread cannot be set up. Nothing is left running on
    /// failure.
    pub fn start(key_pair: &KeyPair) -> Result<Self, AgentError> {
        Self::start_with_key_pairs(std::slice::from_ref(key_pair))
    }

    /// Starts an agent serving every key pair in `key_pairs`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] when a key cannot be decoded or the socket,
    /// runtime or worker thread cannot be set up. Nothing is left running on
    /// failure.
    pub fn start_with_key_pairs(key_pairs: &[KeyPair]) -> Result<Self, AgentError> {
        let keyring = Keyring::from_key_pairs(key_pairs).map_err(|err| AgentError::InvalidKey {
            message: err.to_string(),
        })?;

        let socket_dir = tempfile::Builder::new()
            .prefix(SOCKET_DIR_PREFIX)
            .tempdir()
            .map_err(|err| AgentError::SocketDir {
                message: err.to_string(),
            })?;
        let socket_path = Utf8PathBuf::from_path_buf(socket_dir.path().join(SOCKET_FILE_NAME))
            .map_err(|path| AgentError::SocketDir {
                message: format!("socket path is not valid UTF-8: {}", path.display()),
            })?;

        let bind_error = |err: io::Error| AgentError::Bind {
            path: socket_path.clone(),
            message: err.to_string(),
        };
        let listener = StdUnixListener::bind(&socket_path).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| AgentError::Runtime {
                message: err.to_string(),
            })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let keyring = Arc::new(keyring);
        let identity_count = keyring.len();
        let worker = thread::Builder::new()
            .name(String::from(WORKER_THREAD_NAME))
            .spawn(move || {
                runtime.block_on(async move {
                    match UnixListener::from_std(listener) {
                        Ok(listener) => serve(listener, keyring, shutdown_rx).await,
                        Err(err) => warn!(error = %err, "ssh agent could not register its socket"),
                    }
                });
            })
            .map_err(|err| AgentError::Spawn {
                message: err.to_string(),
            })?;

        info!(socket = %socket_path, identities = identity_count, "ssh agent started");
        Ok(Self {
            socket_path,
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
            socket_dir: Some(socket_dir),
        })
    }

    /// Returns the socket clients connect to.
    #[must_use]
    pub fn socket_path(&self) -> &Utf8Path {
        &self.socket_path
    }

    /// Returns the endpoint to hand to child processes.
    #[must_use]
    pub fn endpoint(&self) -> AgentEndpoint {
        AgentEndpoint::new(self.socket_path.clone())
    }

    /// Returns the `(variable, value)` pair child processes need.
    #[must_use]
    pub fn endpoint_for_env(&self) -> (&'static str, String) {
        (SSH_AUTH_SOCK_ENV, self.socket_path.to_string())
    }

    /// Returns `true` until [`SshAgent::stop`] has run.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Stops serving, waits for the worker and removes the socket
    /// directory. Calling it again is a no-op.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // The worker may already have exited; nothing to signal then.
            shutdown.send(()).ok();
        }
        let was_running = self.worker.is_some();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!(socket = %self.socket_path, "ssh agent worker panicked");
        }
        if let Some(socket_dir) = self.socket_dir.take()
            && let Err(err) = socket_dir.close()
        {
            warn!(socket = %self.socket_path, error = %err, "failed to remove agent socket directory");
        }
        if was_running {
            info!(socket = %self.socket_path, "ssh agent stopped");
        }
    }
}

impl Drop for SshAgent {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(
    listener: UnixListener,
    keyring: Arc<Keyring>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let keyring = Arc::clone(&keyring);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, &keyring).await {
                            debug!(error = %err, "ssh agent connection closed with error");
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "ssh agent failed to accept a connection");
                    if back_off(&mut shutdown).await {
                        break;
                    }
                }
            },
        }
    }
}

/// Sleeps for [`ACCEPT_BACKOFF`]; returns `true` when shutdown arrives first.
async fn back_off(shutdown: &mut oneshot::Receiver<()>) -> bool {
    tokio::select! {
        _ = shutdown => true,
        () = tokio::time::sleep(ACCEPT_BACKOFF) => false,
    }
}

async fn handle_connection(mut stream: UnixStream, keyring: &Keyring) -> io::Result<()> {
    loop {
        let len = match stream.read_u32().await {
            Ok(len) => usize::try_from(len).unwrap_or(usize::MAX),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        };
        if len > MAX_MESSAGE_LEN {
            debug!(len, "ssh agent request exceeds size limit; closing connection");
            return Ok(());
        }

        let mut request = vec![0_u8; len];
        stream.read_exact(&mut request).await?;
        let reply = keyring.handle(&request);
        stream.write_all(&frame(&reply)).await?;
    }
}
