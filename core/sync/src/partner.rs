//! Partner webhook surface: token-authenticated access to a restricted
//! subset of outbox events.
//!
//! Tokens are only shown once, at registration. The registry keeps a
//! BLAKE2b digest of each token and compares digests in constant time.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use subtle::ConstantTimeEq;
use tracing::info;
use uuid::Uuid;

use storesync_common::{EntityType, Error, OutboxEntry, OutboxStatus, Result, SecretString};
use storesync_storage::{OutboxQuery, SyncStore};

use crate::outbox::{Outbox, MAX_PAGE_SIZE};

/// Entity types that may ever be exposed to partners.
pub const PARTNER_ALLOW_LIST: &[&str] = &[
    "sale",
    "transfer",
    "inventory",
    "product",
    "customer",
    "purchase_order",
];

const TOKEN_PREFIX: &str = "sp_";
const TOKEN_BYTES: usize = 32;

/// What a partner may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// List events.
    Pull,
    /// Acknowledge events.
    Push,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Pull => f.write_str("pull"),
            Capability::Push => f.write_str("push"),
        }
    }
}

impl std::str::FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pull" => Ok(Capability::Pull),
            "push" => Ok(Capability::Push),
            _ => Err(Error::Validation(format!("Unknown capability: {}", s))),
        }
    }
}

/// Public view of a registered partner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerProfile {
    pub id: Uuid,
    pub name: String,
    pub capabilities: BTreeSet<Capability>,
    pub entity_types: BTreeSet<EntityType>,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

impl PartnerProfile {
    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn may_see(&self, entity_type: &EntityType) -> bool {
        self.entity_types.contains(entity_type)
    }
}

/// Plaintext partner credential. Zeroized on drop.
#[derive(Clone)]
pub struct PartnerToken(SecretString);

impl PartnerToken {
    fn generate() -> Self {
        let bytes: [u8; TOKEN_BYTES] = rand::random();
        Self(SecretString::new(format!(
            "{}{}",
            TOKEN_PREFIX,
            URL_SAFE_NO_PAD.encode(bytes)
        )))
    }

    /// The token value to hand to the partner.
    pub fn expose(&self) -> &str {
        self.0.expose()
    }
}

impl fmt::Debug for PartnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartnerToken([REDACTED])")
    }
}

fn token_digest(token: &str) -> [u8; 32] {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(b"storesync-partner-token");
    hasher.update(token.as_bytes());

    let result = hasher.finalize();
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&result);
    digest
}

#[derive(Debug, Clone)]
struct PartnerRecord {
    profile: PartnerProfile,
    digest: [u8; 32],
}

/// Registered partners and their credential digests.
///
/// Share it behind an `Arc`; reads return copies.
#[derive(Debug, Default)]
pub struct PartnerRegistry {
    partners: RwLock<HashMap<Uuid, PartnerRecord>>,
}

impl PartnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a partner and mint its token.
    ///
    /// # Errors
    /// - `Validation` for an empty name, no capabilities, or an entity type
    ///   outside [`PARTNER_ALLOW_LIST`]
    pub fn register(
        &self,
        name: &str,
        capabilities: &[Capability],
        entity_types: &[&str],
    ) -> Result<(PartnerProfile, PartnerToken)> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("Partner name cannot be empty".to_string()));
        }
        if capabilities.is_empty() {
            return Err(Error::Validation(
                "Partner needs at least one capability".to_string(),
            ));
        }

        let mut allowed = BTreeSet::new();
        for tag in entity_types {
            let entity_type = EntityType::new(tag)?;
            if !PARTNER_ALLOW_LIST.contains(&entity_type.as_str()) {
                return Err(Error::Validation(format!(
                    "Entity type {} cannot be exposed to partners",
                    entity_type
                )));
            }
            allowed.insert(entity_type);
        }

        let token = PartnerToken::generate();
        let profile = PartnerProfile {
            id: Uuid::new_v4(),
            name: name.to_string(),
            capabilities: capabilities.iter().copied().collect(),
            entity_types: allowed,
            created_at: Utc::now(),
            revoked: false,
        };

        let mut partners = self.write()?;
        partners.insert(
            profile.id,
            PartnerRecord {
                profile: profile.clone(),
                digest: token_digest(token.expose()),
            },
        );
        info!("Registered partner {} ({})", profile.name, profile.id);
        Ok((profile, token))
    }

    /// Revoke a partner. Its token stops working immediately.
    pub fn revoke(&self, partner_id: Uuid) -> Result<PartnerProfile> {
        let mut partners = self.write()?;
        let record = partners
            .get_mut(&partner_id)
            .ok_or_else(|| Error::NotFound(format!("Partner not found: {}", partner_id)))?;
        record.profile.revoked = true;
        info!("Revoked partner {} ({})", record.profile.name, partner_id);
        Ok(record.profile.clone())
    }

    /// Resolve a token to its partner.
    ///
    /// # Errors
    /// - `Unauthorized` if the token is missing, unknown or revoked
    pub fn authenticate(&self, token: Option<&str>) -> Result<PartnerProfile> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Unauthorized("Missing partner token".to_string()))?;
        let digest = token_digest(token);

        let partners = self.read()?;
        let mut matched = None;
        for record in partners.values() {
            if bool::from(record.digest[..].ct_eq(&digest[..])) {
                matched = Some(record);
            }
        }

        match matched {
            Some(record) if !record.profile.revoked => Ok(record.profile.clone()),
            _ => Err(Error::Unauthorized("Invalid partner token".to_string())),
        }
    }

    /// Every registered partner.
    pub fn list(&self) -> Result<Vec<PartnerProfile>> {
        let partners = self.read()?;
        let mut profiles: Vec<PartnerProfile> =
            partners.values().map(|r| r.profile.clone()).collect();
        profiles.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(profiles)
    }

    /// Look up one partner.
    pub fn get(&self, partner_id: Uuid) -> Result<PartnerProfile> {
        self.read()?
            .get(&partner_id)
            .map(|r| r.profile.clone())
            .ok_or_else(|| Error::NotFound(format!("Partner not found: {}", partner_id)))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<Uuid, PartnerRecord>>> {
        self.partners
            .read()
            .map_err(|_| Error::Storage("partner registry lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<Uuid, PartnerRecord>>> {
        self.partners
            .write()
            .map_err(|_| Error::Storage("partner registry lock poisoned".to_string()))
    }
}

/// Partner acknowledgement of one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Ack {
    Sent,
    Failed { message: String },
}

/// Entry point for partner requests.
pub struct PartnerGateway<S: SyncStore + ?Sized> {
    outbox: Arc<Outbox<S>>,
    registry: Arc<PartnerRegistry>,
}

impl<S: SyncStore + ?Sized> PartnerGateway<S> {
    pub fn new(outbox: Arc<Outbox<S>>, registry: Arc<PartnerRegistry>) -> Self {
        Self { outbox, registry }
    }

    fn authorize(&self, token: Option<&str>, capability: Capability) -> Result<PartnerProfile> {
        let partner = self.registry.authenticate(token)?;
        if !partner.can(capability) {
            return Err(Error::Forbidden(format!(
                "Partner {} lacks the {} capability",
                partner.name, capability
            )));
        }
        Ok(partner)
    }

    /// Events visible to the partner, oldest first.
    ///
    /// # Errors
    /// - `Unauthorized` for a bad token
    /// - `Forbidden` without Pull, or for an entity type the partner
    ///   was not granted
    pub async fn list_events(
        &self,
        token: Option<&str>,
        entity_type: Option<&EntityType>,
        status: Option<OutboxStatus>,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>> {
        let partner = self.authorize(token, Capability::Pull)?;
        let types: Vec<EntityType> = match entity_type {
            Some(t) if partner.may_see(t) => vec![t.clone()],
            Some(t) => {
                return Err(Error::Forbidden(format!(
                    "Partner {} may not read {} events",
                    partner.name, t
                )))
            }
            None => partner.entity_types.iter().cloned().collect(),
        };

        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let mut events = Vec::new();
        for t in types {
            let page = self
                .outbox
                .list(&OutboxQuery {
                    entity_type: Some(t),
                    status,
                    limit: Some(limit),
                    ..OutboxQuery::default()
                })
                .await?;
            events.extend(page.items);
        }
        events.sort_by_key(|e| e.id);
        events.truncate(limit);
        Ok(events)
    }

    /// Record the partner's delivery outcome for an event.
    ///
    /// # Errors
    /// - `Unauthorized` for a bad token
    /// - `Forbidden` without Push, or for an entry the partner cannot see.
    ///   Unknown ids get the same answer as foreign ones.
    pub async fn acknowledge(
        &self,
        token: Option<&str>,
        entry_id: i64,
        ack: Ack,
    ) -> Result<OutboxEntry> {
        let partner = self.authorize(token, Capability::Push)?;
        match self.outbox.get(entry_id).await {
            Ok(entry) if partner.may_see(&entry.entity_type) => {}
            Ok(_) | Err(Error::NotFound(_)) => {
                return Err(Error::Forbidden(format!(
                    "Partner {} may not acknowledge entry {}",
                    partner.name, entry_id
                )));
            }
            Err(e) => return Err(e),
        }

        info!("Partner {} acknowledged entry {}: {:?}", partner.name, entry_id, ack);
        match ack {
            Ack::Sent => self.outbox.mark_sent(entry_id).await,
            Ack::Failed { message } => self.outbox.mark_failed(entry_id, message).await,
        }
    }
}
