//! Off-chain entity seam
//!
//! The relational store that owns bookings, certificates, loyalty balances
//! and reviews lives outside this crate. Reconciliation talks to it through
//! [`EntityStore`]; [`MemoryEntityStore`] is the in-process reference used in
//! development and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::LedgerResult;
use crate::types::EntityType;

/// Address of one off-chain entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

/// Confirmed ledger effect to apply to an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "patch", rename_all = "snake_case")]
pub enum EntityPatch {
    CertificateMinted {
        token_id: Option<u64>,
        tourist: String,
        destination: String,
        tx_hash: String,
    },
    PointsCredited {
        points: u64,
        description: String,
        tx_hash: String,
    },
    PointsDebited {
        points: u64,
        description: String,
        tx_hash: String,
    },
    BookingVerified {
        /// Ledger-assigned booking hash, when an event carried one
        booking_hash: Option<String>,
        tx_hash: String,
    },
    ReviewVerified {
        tx_hash: String,
    },
}

impl EntityPatch {
    pub fn tx_hash(&self) -> &str {
        match self {
            EntityPatch::CertificateMinted { tx_hash, .. }
            | EntityPatch::PointsCredited { tx_hash, .. }
            | EntityPatch::PointsDebited { tx_hash, .. }
            | EntityPatch::BookingVerified { tx_hash, .. }
            | EntityPatch::ReviewVerified { tx_hash } => tx_hash,
        }
    }
}

/// Ledger-facing view of an off-chain entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_ref: EntityRef,
    /// Certificate NFT token id
    pub nft_token_id: Option<u64>,
    pub wallet_address: Option<String>,
    pub destination: Option<String>,
    pub points_balance: u64,
    pub total_earned: u64,
    pub total_redeemed: u64,
    /// Booking or review recorded on chain
    pub verified: bool,
    pub booking_hash: Option<String>,
    /// Every transaction applied to this entity, oldest first
    pub tx_hashes: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(entity_ref: EntityRef) -> Self {
        Self {
            entity_ref,
            nft_token_id: None,
            wallet_address: None,
            destination: None,
            points_balance: 0,
            total_earned: 0,
            total_redeemed: 0,
            verified: false,
            booking_hash: None,
            tx_hashes: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn apply(&mut self, patch: &EntityPatch) {
        match patch {
            EntityPatch::CertificateMinted {
                token_id,
                tourist,
                destination,
                ..
            } => {
                if token_id.is_some() {
                    self.nft_token_id = *token_id;
                }
                self.wallet_address = Some(tourist.clone());
                self.destination = Some(destination.clone());
            }
            EntityPatch::PointsCredited { points, .. } => {
                self.points_balance = self.points_balance.saturating_add(*points);
                self.total_earned = self.total_earned.saturating_add(*points);
            }
            EntityPatch::PointsDebited { points, .. } => {
                if *points > self.points_balance {
                    warn!(
                        "Debit of {} exceeds known balance {} for {}",
                        points, self.points_balance, self.entity_ref
                    );
                }
                self.points_balance = self.points_balance.saturating_sub(*points);
                self.total_redeemed = self.total_redeemed.saturating_add(*points);
            }
            EntityPatch::BookingVerified { booking_hash, .. } => {
                self.verified = true;
                if booking_hash.is_some() {
                    self.booking_hash = booking_hash.clone();
                }
            }
            EntityPatch::ReviewVerified { .. } => {
                self.verified = true;
            }
        }
        self.tx_hashes.push(patch.tx_hash().to_string());
        self.updated_at = Utc::now();
    }
}

/// Off-chain entity store
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_entity(&self, entity: &EntityRef) -> LedgerResult<Option<Entity>>;

    /// Apply `patch`, creating the entity if the store has none
    async fn update_entity(&self, entity: &EntityRef, patch: &EntityPatch) -> LedgerResult<Entity>;
}

/// In-memory entity store
#[derive(Default)]
pub struct MemoryEntityStore {
    entities: RwLock<HashMap<EntityRef, Entity>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entity
    pub async fn insert(&self, entity: Entity) {
        self.entities
            .write()
            .await
            .insert(entity.entity_ref.clone(), entity);
    }

    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn get_entity(&self, entity: &EntityRef) -> LedgerResult<Option<Entity>> {
        Ok(self.entities.read().await.get(entity).cloned())
    }

    async fn update_entity(&self, entity: &EntityRef, patch: &EntityPatch) -> LedgerResult<Entity> {
        let mut entities = self.entities.write().await;
        let current = entities
            .entry(entity.clone())
            .or_insert_with(|| Entity::new(entity.clone()));
        current.apply(patch);
        Ok(current.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loyalty() -> EntityRef {
        EntityRef::new(EntityType::Loyalty, "0x00000000000000000000000000000000000000aa")
    }

    #[tokio::test]
    async fn test_update_creates_entity() {
        let store = MemoryEntityStore::new();
        let patch = EntityPatch::PointsCredited {
            points: 50,
            description: "booking B9".to_string(),
            tx_hash: "0x01".to_string(),
        };
        let entity = store.update_entity(&loyalty(), &patch).await.unwrap();
        assert_eq!(entity.points_balance, 50);
        assert_eq!(entity.total_earned, 50);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_debit_saturates() {
        let store = MemoryEntityStore::new();
        let mut seeded = Entity::new(loyalty());
        seeded.points_balance = 100;
        store.insert(seeded).await;

        let patch = EntityPatch::PointsDebited {
            points: 150,
            description: "voucher".to_string(),
            tx_hash: "0x02".to_string(),
        };
        let entity = store.update_entity(&loyalty(), &patch).await.unwrap();
        assert_eq!(entity.points_balance, 0);
        assert_eq!(entity.total_redeemed, 150);
    }

    #[test]
    fn test_booking_patch_keeps_ledger_hash() {
        let mut booking = Entity::new(EntityRef::new(EntityType::Booking, "B1"));
        booking.apply(&EntityPatch::BookingVerified {
            booking_hash: Some("0xaa".to_string()),
            tx_hash: "0x03".to_string(),
        });
        booking.apply(&EntityPatch::BookingVerified {
            booking_hash: None,
            tx_hash: "0x04".to_string(),
        });
        assert!(booking.verified);
        assert_eq!(booking.booking_hash.as_deref(), Some("0xaa"));
        assert_eq!(booking.tx_hashes, vec!["0x03".to_string(), "0x04".to_string()]);
    }
}
