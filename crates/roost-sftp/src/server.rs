//! SSH listener and session acceptance.
//!
//! The server owns the host key, the shared quota cache, and the oracle
//! client. russh drives the TCP accept loop and the SSH handshake; each
//! accepted connection gets its own [`SessionHandler`], which authenticates
//! against the oracle, negotiates the `sftp` subsystem, and then pumps
//! channel data through the session's packet loop until the peer goes away.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Server as SshAcceptor, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use russh_keys::key::{Name as KeyName, RSA_SHA2_256, RSA_SHA2_512, SSH_RSA};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::handler::{FsHandler, SessionPrincipal};
use crate::host_key;
use crate::oracle::CredentialOracle;
use crate::permissions::PermissionSet;
use crate::quota::QuotaCache;
use crate::session::SftpSession;

/// Password attempts allowed before the connection is refused outright.
const MAX_AUTH_ATTEMPTS: u32 = 6;

/// The single host-key family offered: the persisted RSA key, with its
/// SHA-2 signature variants for modern clients.
const HOST_KEY_ALGORITHMS: &[KeyName] = &[RSA_SHA2_512, RSA_SHA2_256, SSH_RSA];

struct SharedState {
    settings: Settings,
    oracle: CredentialOracle,
    quota: Arc<QuotaCache>,
}

/// The SFTP gateway server.
pub struct Server {
    shared: Arc<SharedState>,
    ssh_config: russh::server::Config,
}

impl Server {
    /// Build the server: load or generate the host key and set up the SSH
    /// configuration. Password authentication only.
    pub async fn new(settings: Settings, oracle: CredentialOracle) -> Result<Self> {
        let key_pair = host_key::load_or_generate(&settings.base_path).await?;

        let mut ssh_config = russh::server::Config {
            auth_rejection_time: std::time::Duration::from_secs(3),
            auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
            methods: MethodSet::PASSWORD,
            keys: vec![key_pair],
            ..Default::default()
        };
        ssh_config.preferred = russh::Preferred {
            key: HOST_KEY_ALGORITHMS,
            ..Default::default()
        };

        let quota = Arc::new(QuotaCache::new(settings.disable_disk_check));

        Ok(Self {
            shared: Arc::new(SharedState {
                settings,
                oracle,
                quota,
            }),
            ssh_config,
        })
    }

    /// Bind and serve until the process is terminated.
    pub async fn run(self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.shared.settings.bind_address, self.shared.settings.bind_port
        );
        info!(
            event = "listening",
            address = %addr,
            read_only = self.shared.settings.read_only,
            "sftp subsystem listening for connections"
        );

        self.shared.quota.spawn_sweeper();

        let mut acceptor = Acceptor {
            shared: self.shared.clone(),
        };

        acceptor
            .run_on_address(Arc::new(self.ssh_config), addr)
            .await
            .map_err(|e| Error::Connection(format!("listener error: {e}")))
    }
}

struct Acceptor {
    shared: Arc<SharedState>,
}

#[async_trait]
impl SshAcceptor for Acceptor {
    type Handler = SessionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        debug!(event = "connection_accepted", peer = ?peer_addr, "accepted inbound connection");

        SessionHandler {
            shared: self.shared.clone(),
            peer_addr,
            principal: None,
            auth_attempts: 0,
            sftp: None,
        }
    }
}

/// Per-connection SSH handler.
pub struct SessionHandler {
    shared: Arc<SharedState>,
    peer_addr: Option<SocketAddr>,
    principal: Option<SessionPrincipal>,
    auth_attempts: u32,
    sftp: Option<SftpSession>,
}

impl SessionHandler {
    fn reject(&self) -> Auth {
        if self.auth_attempts >= MAX_AUTH_ATTEMPTS {
            Auth::Reject {
                proceed_with_methods: None,
            }
        } else {
            Auth::Reject {
                proceed_with_methods: Some(MethodSet::PASSWORD),
            }
        }
    }
}

#[async_trait]
impl Handler for SessionHandler {
    type Error = Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        self.auth_attempts += 1;

        match self.shared.oracle.authenticate(user, password).await {
            Ok(grant) => {
                info!(
                    event = "auth_succeeded",
                    user,
                    tenant = %grant.server,
                    peer = ?self.peer_addr,
                    "authenticated sftp session"
                );
                self.principal = Some(SessionPrincipal {
                    tenant_id: grant.server,
                    username: user.to_string(),
                    permissions: PermissionSet::new(grant.permissions),
                });
                Ok(Auth::Accept)
            }
            Err(e) => {
                // Every failure shape collapses into the same refusal so a
                // peer cannot probe for valid usernames.
                match &e {
                    Error::InvalidCredentials => {
                        debug!(event = "auth_rejected", user, peer = ?self.peer_addr, "invalid credentials")
                    }
                    _ => {
                        warn!(event = "auth_error", user, peer = ?self.peer_addr, error = %e, "could not validate credentials")
                    }
                }
                Ok(self.reject())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        // Only `session` channels reach this handler; russh rejects other
        // channel types with an unknown-channel-type reply.
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        if name != "sftp" {
            warn!(event = "subsystem_rejected", subsystem = %name, "unsupported subsystem");
            session.channel_failure(channel_id);
            return Ok(());
        }

        let Some(principal) = self.principal.clone() else {
            error!(event = "subsystem_without_auth", "sftp requested before authentication");
            session.channel_failure(channel_id);
            return Ok(());
        };

        if principal.tenant_id.is_empty() {
            error!(
                event = "missing_tenant_id",
                user = %principal.username,
                "authenticated session carries no tenant id"
            );
            session.channel_failure(channel_id);
            return Ok(());
        }

        let settings = &self.shared.settings;
        let root = settings.data_root.join(&principal.tenant_id);
        let server_config = settings
            .server_data_folder
            .join(&principal.tenant_id)
            .join("server.json");

        debug!(
            event = "sftp_subsystem_started",
            tenant = %principal.tenant_id,
            user = %principal.username,
            permissions = %principal.permissions.joined(),
            root = ?root,
            "starting sftp subsystem"
        );

        let handler = FsHandler::new(
            principal,
            root,
            server_config,
            settings.read_only,
            settings.owner,
            self.shared.quota.clone(),
        );
        self.sftp = Some(SftpSession::new(handler));

        session.channel_success(channel_id);
        Ok(())
    }

    async fn shell_request(&mut self, channel_id: ChannelId, session: &mut Session) -> Result<()> {
        session.channel_failure(channel_id);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        session.channel_failure(channel_id);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<()> {
        session.channel_failure(channel_id);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        let Some(sftp) = self.sftp.as_mut() else {
            debug!("channel data before subsystem negotiation");
            return Ok(());
        };

        match sftp.handle_data(data).await {
            Ok(response) => {
                if !response.is_empty() {
                    session.data(channel, CryptoVec::from_slice(&response));
                }
                Ok(())
            }
            Err(e) => {
                // Errors that reach this point poisoned the packet stream;
                // request-level failures were already answered with status
                // responses inside the session.
                error!(error = %e, "sftp session error");
                Err(e)
            }
        }
    }
}
