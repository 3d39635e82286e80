//! Token authority (C5): issues tokens bound to (volume, range, op),
//! records ACKs, expires/revokes. Grounded on the issue/ack/cleanup cycle
//! implied by `sds/token_verifier.py`'s consumer side and generalized to
//! the issuing side spec.md §4.5 describes.

use std::sync::Arc;

use chrono::Utc;

use crate::error::{AppError, AppResult};
use crate::model::*;
use crate::store::MdmStore;
use crate::token::{compute_token_expiry, generate_token_id, sign_token, TokenPayload};

pub struct TokenAuthority {
    store: Arc<MdmStore>,
    cluster_secret: String,
}

impl TokenAuthority {
    pub fn new(store: Arc<MdmStore>, cluster_secret: String) -> Self {
        Self {
            store,
            cluster_secret,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn issue_token(
        &self,
        volume_id: VolumeId,
        sdc_id: SdcId,
        op: IoOp,
        offset_bytes: u64,
        length_bytes: u64,
        io_plan: serde_json::Value,
        ttl_secs: i64,
    ) -> AppResult<TokenPayload> {
        if !self.store.volumes.read().await.contains_key(&volume_id) {
            return Err(AppError::NotFound(format!("volume {volume_id} not found")));
        }
        if !self.store.sdc_clients.read().await.contains_key(&sdc_id) {
            return Err(AppError::NotFound(format!("sdc {sdc_id} not found")));
        }

        let token_id = generate_token_id();
        let signature = sign_token(
            &token_id,
            volume_id,
            op,
            offset_bytes,
            length_bytes,
            &self.cluster_secret,
        );
        let issued_at = Utc::now();
        let expires_at = compute_token_expiry(ttl_secs);

        let payload = TokenPayload {
            token_id: token_id.clone(),
            volume_id,
            sdc_id,
            operation: op,
            offset_bytes,
            length_bytes,
            signature: signature.clone(),
            expires_at,
            io_plan: io_plan.clone(),
        };

        let row = IoToken {
            token_id: token_id.clone(),
            volume_id,
            sdc_id,
            operation: op,
            offset_bytes,
            length_bytes,
            io_plan,
            signature,
            issued_at,
            expires_at,
            status: TokenStatus::Issued,
            consumed_at: None,
        };

        // Token issuance is serialized only by the store's uniqueness on
        // token_id (spec.md §5) — a fresh UUID never collides in practice,
        // so a plain insert is sufficient here.
        self.store.tokens.write().await.insert(token_id, row);

        Ok(payload)
    }

    /// Records one ack row and, on a successful write, bumps the target
    /// chunk's `generation`/`checksum`/`last_write_*` bookkeeping (spec.md
    /// §2's data-flow paragraph: "SDS ... acks back to the MDM, which
    /// updates chunk generation/checksum"). `chunk_id`/`checksum` are only
    /// meaningful for write acks; reads pass `None` for both.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_ack(
        &self,
        token_id: &str,
        sds_id: SdsId,
        success: bool,
        bytes_processed: u64,
        duration_ms: u64,
        chunk_id: Option<ChunkId>,
        checksum: Option<String>,
    ) -> AppResult<()> {
        let ack = IoTransactionAck {
            token_id: token_id.to_string(),
            sds_id,
            success,
            bytes_processed,
            duration_ms,
            received_at: Utc::now(),
        };
        self.store.acks.write().await.push(ack);

        if success {
            let mut tokens = self.store.tokens.write().await;
            let token_offsets = tokens.get(token_id).map(|t| (t.offset_bytes, t.length_bytes));
            if let Some(token) = tokens.get_mut(token_id) {
                if token.status != TokenStatus::Consumed {
                    token.status = TokenStatus::Consumed;
                    token.consumed_at = Some(Utc::now());
                }
            }
            drop(tokens);

            if let Some(chunk_id) = chunk_id {
                let mut chunks = self.store.chunks.write().await;
                if let Some(chunk) = chunks.get_mut(&chunk_id) {
                    chunk.generation += 1;
                    if checksum.is_some() {
                        chunk.checksum = checksum;
                    }
                    if let Some((offset, length)) = token_offsets {
                        chunk.last_write_offset = Some(offset);
                        chunk.last_write_length = Some(length);
                    }
                    chunk.last_write_time = Some(Utc::now());
                }
            }
        }
        Ok(())
    }

    /// Scans ISSUED tokens past `expires_at` in bounded batches and marks
    /// them EXPIRED. Returns the number transitioned.
    pub async fn cleanup_expired(&self, batch_size: usize) -> usize {
        let now = Utc::now();
        let mut tokens = self.store.tokens.write().await;
        let mut transitioned = 0usize;
        for token in tokens.values_mut() {
            if transitioned >= batch_size {
                break;
            }
            if token.status == TokenStatus::Issued && now >= token.expires_at {
                token.status = TokenStatus::Expired;
                transitioned += 1;
            }
        }
        transitioned
    }

    pub async fn revoke(&self, token_id: &str) -> AppResult<()> {
        let mut tokens = self.store.tokens.write().await;
        let token = tokens
            .get_mut(token_id)
            .ok_or_else(|| AppError::NotFound(format!("token {token_id} not found")))?;
        token.status = TokenStatus::Revoked;
        Ok(())
    }

    pub fn cluster_secret(&self) -> &str {
        &self.cluster_secret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (Arc<MdmStore>, TokenAuthority, VolumeId, SdcId) {
        let store = Arc::new(MdmStore::new());
        let authority = TokenAuthority::new(store.clone(), "test-secret".to_string());

        let volume_id = store.next_volume_id();
        store.volumes.write().await.insert(
            volume_id,
            Volume {
                id: volume_id,
                pool_id: PoolId(1),
                name: "v1".into(),
                size_bytes: 1024,
                provisioning: Provisioning::Thin,
                state: VolumeState::Available,
                mapping_count: 0,
                used_capacity_bytes: 0,
            },
        );
        let sdc_id = store.next_sdc_id();
        store.sdc_clients.write().await.insert(
            sdc_id,
            SdcClient {
                id: sdc_id,
                name: "sdc-1".into(),
                cluster_node_id: "sdc-1".into(),
            },
        );

        (store, authority, volume_id, sdc_id)
    }

    #[tokio::test]
    async fn issue_token_rejects_unknown_volume() {
        let (_store, authority, _volume_id, sdc_id) = setup().await;
        let err = authority
            .issue_token(VolumeId(999), sdc_id, IoOp::Read, 0, 1024, serde_json::json!({}), 300)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn issue_token_rejects_unknown_sdc() {
        let (_store, authority, volume_id, _sdc_id) = setup().await;
        let err = authority
            .issue_token(volume_id, SdcId(999), IoOp::Read, 0, 1024, serde_json::json!({}), 300)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn issued_token_signature_validates() {
        let (store, authority, volume_id, sdc_id) = setup().await;
        let token = authority
            .issue_token(volume_id, sdc_id, IoOp::Write, 0, 1024, serde_json::json!({}), 300)
            .await
            .unwrap();
        assert!(crate::token::validate_token_for_io(
            &token,
            authority.cluster_secret(),
            volume_id,
            IoOp::Write,
            0,
            1024,
        )
        .is_ok());
        assert_eq!(store.tokens.read().await.len(), 1);
    }

    #[tokio::test]
    async fn record_ack_marks_token_consumed_and_bumps_chunk_generation() {
        let (store, authority, volume_id, sdc_id) = setup().await;
        let token = authority
            .issue_token(volume_id, sdc_id, IoOp::Write, 0, 1024, serde_json::json!({}), 300)
            .await
            .unwrap();

        let chunk_id = store.next_chunk_id();
        store.chunks.write().await.insert(
            chunk_id,
            Chunk {
                id: chunk_id,
                volume_id,
                chunk_index: 0,
                is_degraded: false,
                generation: 0,
                checksum: None,
                last_write_offset: None,
                last_write_length: None,
                last_write_time: None,
            },
        );

        authority
            .record_ack(
                &token.token_id,
                SdsId(1),
                true,
                1024,
                5,
                Some(chunk_id),
                Some("deadbeef".to_string()),
            )
            .await
            .unwrap();

        let tokens = store.tokens.read().await;
        assert_eq!(tokens.get(&token.token_id).unwrap().status, TokenStatus::Consumed);
        let chunks = store.chunks.read().await;
        let chunk = chunks.get(&chunk_id).unwrap();
        assert_eq!(chunk.generation, 1);
        assert_eq!(chunk.checksum.as_deref(), Some("deadbeef"));
    }

    #[tokio::test]
    async fn record_ack_without_chunk_is_bookkeeping_only() {
        let (store, authority, volume_id, sdc_id) = setup().await;
        let token = authority
            .issue_token(volume_id, sdc_id, IoOp::Read, 0, 1024, serde_json::json!({}), 300)
            .await
            .unwrap();

        authority
            .record_ack(&token.token_id, SdsId(1), true, 1024, 5, None, None)
            .await
            .unwrap();

        assert_eq!(store.acks.read().await.len(), 1);
        let tokens = store.tokens.read().await;
        assert_eq!(tokens.get(&token.token_id).unwrap().status, TokenStatus::Consumed);
    }

    #[tokio::test]
    async fn cleanup_expired_transitions_only_past_expiry() {
        let (store, authority, volume_id, sdc_id) = setup().await;
        let token = authority
            .issue_token(volume_id, sdc_id, IoOp::Read, 0, 1024, serde_json::json!({}), -1)
            .await
            .unwrap();

        let expired = authority.cleanup_expired(256).await;
        assert_eq!(expired, 1);
        let tokens = store.tokens.read().await;
        assert_eq!(tokens.get(&token.token_id).unwrap().status, TokenStatus::Expired);
    }

    #[tokio::test]
    async fn revoke_unknown_token_is_not_found() {
        let (_store, authority, _volume_id, _sdc_id) = setup().await;
        let err = authority.revoke("no-such-token").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
