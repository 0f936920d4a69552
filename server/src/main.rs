mod accounts;
mod dispatch;
mod errors;
mod relay_spool;
mod rendezvous;
#[cfg(test)]
mod tests;
mod tls;

use accounts::Accounts;
use common::config::Settings;
use dispatch::Dispatch;
use errors::ServerError;
use log::{error, info, warn};
use protocol::handshake;
use protocol::identity::{FullIdentity, IdentitySnapshot};
use protocol::kx::Variant;
use protocol::session::EphemeralKemPool;
use protocol::wire::{AccountPolicy, PreSessionCommand, PreSessionReply};
use relay_spool::RelaySpool;
use rendezvous::Rendezvous;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

fn load_identity(path: &str) -> std::io::Result<FullIdentity> {
    let content = std::fs::read_to_string(path)?;
    let snapshot: IdentitySnapshot = toml::from_str(&content).map_err(std::io::Error::other)?;
    FullIdentity::unmarshal(snapshot).map_err(std::io::Error::other)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = common::config::init("./settings.toml");
    common::logging::init(settings);

    let identity = load_identity(&settings.identity_path).unwrap_or_else(|e| {
        panic!(
            "failed to load server identity from {}: {} (run the config tool to create one)",
            settings.identity_path, e
        )
    });
    info!("loaded identity {}", identity.public().fingerprint_hex());

    let accounts = Arc::new(Accounts::new());
    let rendezvous = Arc::new(Rendezvous::new());
    let spool = Arc::new(RelaySpool::new(settings.spool_dir.clone()));
    let dispatch = Arc::new(Dispatch::new(accounts.clone(), rendezvous, spool, settings.tag_depth, settings.motd.clone()));
    let identity = Arc::new(identity);
    let ephemeral_pool = Arc::new(EphemeralKemPool::new());
    EphemeralKemPool::spawn_rotation_task(ephemeral_pool.clone());

    let acceptor = match (&settings.tls_cert_path, &settings.tls_key_path) {
        (Some(cert), Some(key)) => {
            info!("TLS enabled, certificate {}", cert);
            Some(tls::load_acceptor(cert, key)?)
        }
        _ => {
            warn!("no TLS certificate configured, listening in plain TCP");
            None
        }
    };

    let addr = format!("{}:{}", settings.server_ip, settings.server_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let accounts = accounts.clone();
        let dispatch = dispatch.clone();
        let identity = identity.clone();
        let ephemeral_pool = ephemeral_pool.clone();
        match acceptor.clone() {
            Some(acceptor) => {
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            if let Err(e) =
                                handle_connection(tls_stream, accounts, dispatch, identity, ephemeral_pool, settings).await
                            {
                                warn!("connection from {} ended: {}", peer_addr, e);
                            }
                        }
                        Err(e) => warn!("TLS handshake with {} failed: {}", peer_addr, e),
                    }
                });
            }
            None => {
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, accounts, dispatch, identity, ephemeral_pool, settings).await {
                        warn!("connection from {} ended: {}", peer_addr, e);
                    }
                });
            }
        }
    }
}

async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    accounts: Arc<Accounts>,
    dispatch: Arc<Dispatch>,
    identity: Arc<FullIdentity>,
    ephemeral_pool: Arc<EphemeralKemPool>,
    settings: &'static Settings,
) -> Result<(), ServerError> {
    loop {
        let command = protocol::presession::recv_command(&mut stream).await?;
        match command {
            PreSessionCommand::Identify => {
                let reply = PreSessionReply::Identify { identity: identity.public().clone() };
                protocol::presession::send_reply(&mut stream, &reply).await?;
            }
            PreSessionCommand::CreateAccount { token, identity: candidate } => {
                let error = match authorize_creation(settings.account_policy, token.as_deref()) {
                    Ok(()) => match accounts.register(candidate) {
                        Ok(()) => None,
                        Err(e) => Some(sanitize(&e)),
                    },
                    Err(reason) => Some(reason.to_string()),
                };
                protocol::presession::send_reply(&mut stream, &PreSessionReply::CreateAccount { error }).await?;
            }
            PreSessionCommand::Session { fingerprint } => {
                protocol::presession::send_reply(&mut stream, &PreSessionReply::ProceedToHandshake).await?;
                return run_session(stream, &fingerprint, accounts, dispatch, identity, ephemeral_pool, settings).await;
            }
        }
    }
}

async fn run_session<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    fingerprint: &str,
    accounts: Arc<Accounts>,
    dispatch: Arc<Dispatch>,
    identity: Arc<FullIdentity>,
    ephemeral_pool: Arc<EphemeralKemPool>,
    settings: &'static Settings,
) -> Result<(), ServerError> {
    let claimed = accounts.lookup(fingerprint)?;
    if accounts.is_disabled(fingerprint) {
        return Err(ServerError::AccountDisabled);
    }
    let mut session = match settings.kx_variant {
        Variant::Sigma => {
            let (session, revealed_pub) = handshake::respond_sigma(&mut stream, identity.sigma_identity()).await?;
            if claimed.sigma_pub != revealed_pub.to_vec() {
                return Err(ServerError::InvalidRequest);
            }
            session
        }
        Variant::PostQuantum => {
            let peer_pub = fips203::ml_kem_768::EncapsKey::try_from_bytes(
                claimed.kem_key.as_slice().try_into().map_err(|_| ServerError::InvalidRequest)?,
            )
            .map_err(|_| ServerError::InvalidRequest)?;
            handshake::respond_pq(&mut stream, &identity, &peer_pub, &ephemeral_pool).await?
        }
    };
    dispatch.run(fingerprint, &mut session, &mut stream).await
}

fn authorize_creation(policy: AccountPolicy, token: Option<&str>) -> Result<(), &'static str> {
    match policy {
        AccountPolicy::Open => Ok(()),
        AccountPolicy::Closed => Err("account creation is closed on this server"),
        AccountPolicy::Token => match token {
            Some(t) if !t.is_empty() => Ok(()),
            _ => Err("a creation token is required"),
        },
    }
}

fn sanitize(error: &ServerError) -> String {
    match error {
        ServerError::AccountAlreadyExists => "account already exists".to_string(),
        ServerError::AccountNotFound => "account not found".to_string(),
        ServerError::AccountDisabled => "account disabled".to_string(),
        ServerError::InvalidRequest => "invalid request".to_string(),
        _ => {
            error!("internal error during account creation: {}", error);
            "internal error".to_string()
        }
    }
}
