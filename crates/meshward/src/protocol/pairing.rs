//! Pairing Protocol Handler: the relay-side stream handler for
//! `/…/relay-pair/1.0.0`.

use crate::allowlist::AllowlistStore;
use crate::gater::ConnectionGater;
use crate::pairing_store::PairingTokenStore;
use crate::peer::PeerId;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

const MAX_NAME_LEN: usize = 64;
const STATUS_OK: u8 = 0x01;
const STATUS_ERR: u8 = 0x00;

async fn read_request<R: AsyncRead + Unpin>(stream: &mut R) -> eyre::Result<([u8; 16], String)> {
    let mut token = [0_u8; 16];
    stream.read_exact(&mut token).await?;

    let name_len = stream.read_u8().await? as usize;
    if name_len > MAX_NAME_LEN {
        eyre::bail!("name exceeds {MAX_NAME_LEN} bytes");
    }
    let mut name_bytes = vec![0_u8; name_len];
    stream.read_exact(&mut name_bytes).await?;
    let name = String::from_utf8_lossy(&name_bytes).into_owned();

    Ok((token, name))
}

async fn write_err<W: AsyncWrite + Unpin>(stream: &mut W, msg: &str) -> eyre::Result<()> {
    let msg_bytes = &msg.as_bytes()[..msg.len().min(255)];
    stream.write_all(&[STATUS_ERR]).await?;
    #[allow(clippy::cast_possible_truncation)]
    stream.write_all(&[msg_bytes.len() as u8]).await?;
    stream.write_all(msg_bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Handles one pairing attempt over an already-accepted stream. Returns
/// `Ok(())` whether the attempt was accepted or rejected — only genuine I/O
/// failure on the stream itself is an `Err`.
pub async fn handle<S>(
    stream: &mut S,
    store: &PairingTokenStore,
    allowlist: &AllowlistStore,
    gater: &ConnectionGater,
    connecting_peer: &PeerId,
) -> eyre::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (token, name) = match read_request(stream).await {
        Ok(v) => v,
        Err(_) => return write_err(stream, "pairing failed").await,
    };

    let name = if name.trim().is_empty() {
        format!("paired-{}", Utc::now().format("%Y-%m-%d"))
    } else {
        name
    };

    let (group_id, slot_index, _proof) =
        match store.validate_and_use_by_token(&token, connecting_peer.as_str(), Some(name.clone())) {
            Ok(v) => v,
            Err(_) => return write_err(stream, "pairing failed").await,
        };

    if let Err(e) = allowlist.add(connecting_peer, Some(&name)) {
        tracing::warn!(peer = %connecting_peer, error = %e, "allowlist add failed during pairing");
    }
    if let Err(e) = allowlist.set_attr(connecting_peer, "group", &group_id) {
        tracing::warn!(peer = %connecting_peer, error = %e, "allowlist group attr failed during pairing");
    }

    gater.promote_peer(connecting_peer);

    let group = store.get(&group_id);
    if let Some(group) = &group {
        if let Some(peer_ttl) = group.peer_ttl {
            if peer_ttl > chrono::Duration::zero() {
                gater.set_peer_expiry(connecting_peer, Utc::now() + peer_ttl);
            }
        }
    }

    let Some(group) = group else {
        return write_err(stream, "pairing failed").await;
    };

    let peer_entries: Vec<(String, String)> = group
        .slots
        .iter()
        .enumerate()
        .filter(|(i, slot)| *i != slot_index && slot.used_at.is_some())
        .filter_map(|(_, slot)| Some((slot.peer_id.clone()?, slot.name.clone().unwrap_or_default())))
        .collect();

    stream.write_all(&[STATUS_OK]).await?;
    let group_id_bytes = group.group_id.as_bytes();
    #[allow(clippy::cast_possible_truncation)]
    stream.write_all(&[group_id_bytes.len() as u8]).await?;
    stream.write_all(group_id_bytes).await?;
    #[allow(clippy::cast_possible_truncation)]
    stream.write_all(&[group.slots.len() as u8]).await?;
    #[allow(clippy::cast_possible_truncation)]
    stream.write_all(&[peer_entries.len() as u8]).await?;

    for (pid, pname) in &peer_entries {
        let pid_bytes = pid.as_bytes();
        let name_bytes = &pname.as_bytes()[..pname.len().min(255)];
        #[allow(clippy::cast_possible_truncation)]
        stream.write_all(&[pid_bytes.len().min(255) as u8]).await?;
        stream.write_all(&pid_bytes[..pid_bytes.len().min(255)]).await?;
        #[allow(clippy::cast_possible_truncation)]
        stream.write_all(&[name_bytes.len() as u8]).await?;
        stream.write_all(name_bytes).await?;
    }

    stream.flush().await?;
    Ok(())
}
