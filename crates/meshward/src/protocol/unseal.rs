//! Remote Unseal Protocol: admin-only stream handler for
//! `/…/relay-unseal/1.0.0`.

use crate::allowlist::{AllowlistStore, Role};
use crate::errors::UnsealProtocolError;
use crate::lockout::{LockoutCheck, LockoutTracker};
use crate::peer::PeerId;
use crate::vault::Vault;
use secrecy::SecretString;
use std::sync::Mutex;
use std::time::Duration as StdDuration;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

const VERSION: u8 = 1;
const MAX_PASSPHRASE_LEN: usize = 1024;
const MAX_TOTP_LEN: usize = 16;
const STATUS_OK: u8 = 0x01;
const STATUS_ERR: u8 = 0x00;

struct Request {
    passphrase: SecretString,
    totp: Option<String>,
}

async fn read_request<R: AsyncRead + Unpin>(stream: &mut R) -> eyre::Result<Request> {
    let version = stream.read_u8().await?;
    if version != VERSION {
        eyre::bail!("unsupported unseal protocol version {version}");
    }

    let passphrase_len = usize::from(stream.read_u16().await?);
    if passphrase_len > MAX_PASSPHRASE_LEN {
        eyre::bail!("passphrase exceeds {MAX_PASSPHRASE_LEN} bytes");
    }
    let mut passphrase_bytes = vec![0_u8; passphrase_len];
    stream.read_exact(&mut passphrase_bytes).await?;
    let passphrase = SecretString::new(String::from_utf8_lossy(&passphrase_bytes).into_owned().into());

    let totp_len = usize::from(stream.read_u8().await?);
    if totp_len > MAX_TOTP_LEN {
        eyre::bail!("totp code exceeds {MAX_TOTP_LEN} bytes");
    }
    let mut totp_bytes = vec![0_u8; totp_len];
    stream.read_exact(&mut totp_bytes).await?;
    let totp = if totp_bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&totp_bytes).into_owned())
    };

    Ok(Request { passphrase, totp })
}

async fn write_response<W: AsyncWrite + Unpin>(stream: &mut W, status: u8, msg: &str) -> eyre::Result<()> {
    let msg_bytes = &msg.as_bytes()[..msg.len().min(255)];
    stream.write_all(&[status]).await?;
    #[allow(clippy::cast_possible_truncation)]
    stream.write_all(&[msg_bytes.len() as u8]).await?;
    stream.write_all(msg_bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Handles one remote-unseal attempt. `caller` is the already-authenticated
/// peer identity the transport attributes to this stream. `read_deadline`
/// bounds how long the request read may take (`config.unseal_read_deadline_secs`).
pub async fn handle<S>(
    stream: &mut S,
    vault: &Mutex<Vault>,
    allowlist: &AllowlistStore,
    lockout: &LockoutTracker,
    caller: &PeerId,
    read_deadline: StdDuration,
) -> eyre::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let role = allowlist.get_role(caller).unwrap_or_default();
    if role != Role::Admin {
        return write_response(stream, STATUS_ERR, &UnsealProtocolError::PermissionDenied.to_string()).await;
    }

    match lockout.check(caller) {
        LockoutCheck::PermanentlyBlocked => {
            return write_response(stream, STATUS_ERR, &UnsealProtocolError::PermanentlyBlocked.to_string()).await;
        }
        LockoutCheck::LockedOut { remaining_secs } => {
            return write_response(
                stream,
                STATUS_ERR,
                &UnsealProtocolError::LockedOut { remaining_secs }.to_string(),
            )
            .await;
        }
        LockoutCheck::Clear => {}
    }

    let request = match tokio::time::timeout(read_deadline, read_request(stream)).await {
        Ok(Ok(req)) => req,
        Ok(Err(_)) | Err(_) => return write_response(stream, STATUS_ERR, "unseal failed").await,
    };

    let result = {
        let mut guard = vault.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.unseal(&request.passphrase, request.totp.as_deref())
    };

    match result {
        Ok(()) => {
            lockout.record_success(caller);
            write_response(stream, STATUS_OK, "unsealed").await
        }
        Err(_) => {
            lockout.record_failure(caller);
            write_response(stream, STATUS_ERR, "unseal failed").await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request_bytes(passphrase: &str, totp: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(VERSION);
        #[allow(clippy::cast_possible_truncation)]
        buf.extend_from_slice(&(passphrase.len() as u16).to_be_bytes());
        buf.extend_from_slice(passphrase.as_bytes());
        #[allow(clippy::cast_possible_truncation)]
        buf.push(totp.len() as u8);
        buf.extend_from_slice(totp.as_bytes());
        buf
    }

    fn secret(s: &str) -> SecretString {
        SecretString::new(s.to_owned().into())
    }

    #[tokio::test]
    async fn non_admin_is_rejected_before_touching_vault() {
        let dir = tempdir().unwrap();
        let allowlist = AllowlistStore::new(dir.path().join("allowlist.txt"));
        let peer = PeerId::parse("12D3KooWmember").unwrap();
        allowlist.add(&peer, None).unwrap();

        let (vault, _seed, _totp) =
            Vault::create(dir.path().join("vault.json"), &secret("hunter22"), false, 30).unwrap();
        let vault = Mutex::new(vault);
        let lockout = LockoutTracker::new();

        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&request_bytes("hunter22", "")).await.unwrap();
        handle(
            &mut server,
            &vault,
            &allowlist,
            &lockout,
            &peer,
            StdDuration::from_secs(30),
        )
        .await
        .unwrap();

        drop(server);
        let mut response = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut response).await.unwrap();
        assert_eq!(response[0], STATUS_ERR);
    }

    #[tokio::test]
    async fn admin_with_correct_passphrase_unseals() {
        let dir = tempdir().unwrap();
        let allowlist = AllowlistStore::new(dir.path().join("allowlist.txt"));
        let peer = PeerId::parse("12D3KooWadmin").unwrap();
        allowlist.add(&peer, None).unwrap();
        allowlist.set_role(&peer, Role::Admin).unwrap();

        let (mut vault, _seed, _totp) =
            Vault::create(dir.path().join("vault.json"), &secret("correct horse"), false, 30).unwrap();
        vault.seal();
        let vault = Mutex::new(vault);
        let lockout = LockoutTracker::new();

        let (mut client, mut server) = tokio::io::duplex(4096);
        client
            .write_all(&request_bytes("correct horse", ""))
            .await
            .unwrap();
        handle(
            &mut server,
            &vault,
            &allowlist,
            &lockout,
            &peer,
            StdDuration::from_secs(30),
        )
        .await
        .unwrap();

        drop(server);
        let mut response = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut response).await.unwrap();
        assert_eq!(response[0], STATUS_OK);
        assert_eq!(lockout.check(&peer), LockoutCheck::Clear);
    }

    #[tokio::test]
    async fn wrong_passphrase_records_failure() {
        let dir = tempdir().unwrap();
        let allowlist = AllowlistStore::new(dir.path().join("allowlist.txt"));
        let peer = PeerId::parse("12D3KooWadmin").unwrap();
        allowlist.add(&peer, None).unwrap();
        allowlist.set_role(&peer, Role::Admin).unwrap();

        let (mut vault, _seed, _totp) =
            Vault::create(dir.path().join("vault.json"), &secret("correct horse"), false, 30).unwrap();
        vault.seal();
        let vault = Mutex::new(vault);
        let lockout = LockoutTracker::new();

        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&request_bytes("wrong guess", "")).await.unwrap();
        handle(
            &mut server,
            &vault,
            &allowlist,
            &lockout,
            &peer,
            StdDuration::from_secs(30),
        )
        .await
        .unwrap();

        drop(server);
        let mut response = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut response).await.unwrap();
        assert_eq!(response[0], STATUS_ERR);
        assert!(matches!(lockout.check(&peer), LockoutCheck::Clear));
    }
}
