//! Users, access keys, tokens and permissions.

use ed25519_dalek::{Signature, VerifyingKey};

use crate::error::{CResult, Error};
use crate::util::now_micros;

/// Superuser name, always stored in upper case.
pub const SUPER_USER_NAME: &str = "ROOT";

/// Fixed superuser id; bypasses permission checks and cannot be dropped.
pub const SUPER_USER_ID: u32 = 1;

/// Permission types and their bitmask bit numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PermissionType {
    Select = 0,
    SelectSystem = 1,
    Insert = 2,
    Delete = 3,
    Update = 4,
    Show = 5,
    ShowSystem = 6,
    Create = 7,
    Drop = 8,
    Alter = 9,
    Attach = 10,
    Detach = 11,
    Enable = 12,
    Disable = 13,
    Shutdown = 14,
}

impl PermissionType {
    pub fn mask(self) -> u64 {
        1u64 << (self as u8)
    }

    pub fn from_name(name: &str) -> Option<PermissionType> {
        match name {
            "SELECT" => Some(PermissionType::Select),
            "INSERT" => Some(PermissionType::Insert),
            "DELETE" => Some(PermissionType::Delete),
            "UPDATE" => Some(PermissionType::Update),
            "SHOW" => Some(PermissionType::Show),
            "CREATE" => Some(PermissionType::Create),
            "DROP" => Some(PermissionType::Drop),
            "ALTER" => Some(PermissionType::Alter),
            "ATTACH" => Some(PermissionType::Attach),
            "DETACH" => Some(PermissionType::Detach),
            "ENABLE" => Some(PermissionType::Enable),
            "DISABLE" => Some(PermissionType::Disable),
            "SHUTDOWN" => Some(PermissionType::Shutdown),
            _ => None,
        }
    }
}

/// Builds a permission mask from several permission types.
pub fn build_permission_mask(types: &[PermissionType]) -> u64 {
    types.iter().fold(0, |mask, t| mask | t.mask())
}

/// Kind of object a permission applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DatabaseObjectType {
    Instance = 1,
    Database = 2,
    Table = 3,
}

impl TryFrom<u8> for DatabaseObjectType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(DatabaseObjectType::Instance),
            2 => Ok(DatabaseObjectType::Database),
            3 => Ok(DatabaseObjectType::Table),
            other => Err(other),
        }
    }
}

/// Public-key credential of a user. The key text is the hex form of an
/// Ed25519 public key.
#[derive(Debug, Clone)]
pub struct UserAccessKey {
    pub id: u64,
    pub name: String,
    pub text: String,
    pub description: Option<String>,
    pub active: bool,
}

impl UserAccessKey {
    /// Parses the key material. Fails on anything that is not a 32-byte
    /// hex-encoded Ed25519 public key.
    pub fn verifying_key(&self) -> CResult<VerifyingKey> {
        parse_access_key_text(&self.text)
    }
}

pub fn parse_access_key_text(text: &str) -> CResult<VerifyingKey> {
    let bytes = hex::decode(text.trim())
        .map_err(|_| Error::InvalidArgument("access key text is not valid hex".into()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::InvalidArgument("access key must be a 32-byte public key".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| Error::InvalidArgument("access key is not a valid public key".into()))
}

/// Bearer credential of a user. Zero expiration means "never expires".
#[derive(Debug, Clone)]
pub struct UserToken {
    pub id: u64,
    pub name: String,
    pub value: Vec<u8>,
    pub expiration_timestamp: u64,
    pub description: Option<String>,
}

impl UserToken {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration_timestamp != 0 && self.expiration_timestamp <= now
    }
}

/// One granted permission record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPermission {
    pub id: u64,
    /// Zero means "any database".
    pub database_id: u32,
    pub object_type: DatabaseObjectType,
    /// Zero means "any object".
    pub object_id: u64,
    pub permissions: u64,
    pub grant_option: bool,
}

impl UserPermission {
    /// Whether this record covers the requested object and bits, honouring
    /// the zero wildcards.
    pub fn covers(
        &self,
        database_id: u32,
        object_type: DatabaseObjectType,
        object_id: u64,
        mask: u64,
    ) -> bool {
        (self.database_id == 0 || self.database_id == database_id)
            && self.object_type == object_type
            && (self.object_id == 0 || self.object_id == object_id)
            && (self.permissions & mask) == mask
    }
}

/// A database user.
#[derive(Debug, Clone)]
pub struct User {
    pub id: u32,
    pub name: String,
    pub real_name: Option<String>,
    pub description: Option<String>,
    pub active: bool,
    pub access_keys: Vec<UserAccessKey>,
    pub tokens: Vec<UserToken>,
    pub permissions: Vec<UserPermission>,
}

impl User {
    pub fn is_super_user(&self) -> bool {
        self.id == SUPER_USER_ID
    }

    pub fn active_access_key_count(&self) -> usize {
        self.access_keys.iter().filter(|k| k.active).count()
    }

    /// Verifies `signature` over `challenge` against any active access key.
    pub fn authenticate_signature(&self, signature: &[u8], challenge: &[u8]) -> bool {
        let signature = match Signature::from_slice(signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        self.access_keys.iter().filter(|k| k.active).any(|key| {
            key.verifying_key()
                .map(|vk| vk.verify_strict(challenge, &signature).is_ok())
                .unwrap_or(false)
        })
    }

    /// Matches a raw token value against any unexpired token.
    pub fn authenticate_token(&self, value: &[u8]) -> bool {
        let now = now_micros();
        self.tokens.iter().any(|t| !t.is_expired(now) && t.value == value)
    }

    /// Permission check: explicit record or wildcard record with the
    /// required bits. The superuser bypasses the check.
    pub fn has_permission(
        &self,
        database_id: u32,
        object_type: DatabaseObjectType,
        object_id: u64,
        mask: u64,
    ) -> bool {
        if self.is_super_user() {
            return true;
        }
        self.permissions
            .iter()
            .any(|p| p.covers(database_id, object_type, object_id, mask))
    }

    /// Whether the user holds any permission on the given database.
    pub fn has_any_permission_on_database(&self, database_id: u32) -> bool {
        if self.is_super_user() {
            return true;
        }
        self.permissions
            .iter()
            .any(|p| (p.database_id == 0 || p.database_id == database_id) && p.permissions != 0)
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    use super::*;

    fn sample_user() -> (User, SigningKey) {
        let signing_key = SigningKey::generate(&mut OsRng);
        let user = User {
            id: 2,
            name: "ALICE".into(),
            real_name: None,
            description: None,
            active: true,
            access_keys: vec![UserAccessKey {
                id: 1,
                name: "main".into(),
                text: hex::encode(signing_key.verifying_key().to_bytes()),
                description: None,
                active: true,
            }],
            tokens: vec![UserToken {
                id: 1,
                name: "api".into(),
                value: vec![1, 2, 3],
                expiration_timestamp: 0,
                description: None,
            }],
            permissions: vec![UserPermission {
                id: 1,
                database_id: 7,
                object_type: DatabaseObjectType::Table,
                object_id: 0,
                permissions: PermissionType::Select.mask() | PermissionType::Insert.mask(),
                grant_option: false,
            }],
        };
        (user, signing_key)
    }

    #[test]
    fn signature_authentication() {
        let (mut user, key) = sample_user();
        let challenge = b"challenge bytes";
        let signature = key.sign(challenge);
        assert!(user.authenticate_signature(&signature.to_bytes(), challenge));
        assert!(!user.authenticate_signature(&signature.to_bytes(), b"other challenge"));
        assert!(!user.authenticate_signature(b"garbage", challenge));

        // Inactive keys never authenticate.
        user.access_keys[0].active = false;
        assert!(!user.authenticate_signature(&signature.to_bytes(), challenge));
    }

    #[test]
    fn token_authentication_and_expiry() {
        let (mut user, _) = sample_user();
        assert!(user.authenticate_token(&[1, 2, 3]));
        assert!(!user.authenticate_token(&[1, 2, 4]));

        user.tokens[0].expiration_timestamp = 1; // long in the past
        assert!(!user.authenticate_token(&[1, 2, 3]));
    }

    #[test]
    fn permission_wildcards() {
        let (user, _) = sample_user();
        let select = PermissionType::Select.mask();
        // Object wildcard covers any table of database 7.
        assert!(user.has_permission(7, DatabaseObjectType::Table, 300, select));
        assert!(!user.has_permission(8, DatabaseObjectType::Table, 300, select));
        assert!(!user.has_permission(7, DatabaseObjectType::Database, 7, select));
        assert!(!user.has_permission(
            7,
            DatabaseObjectType::Table,
            300,
            PermissionType::Drop.mask()
        ));
        assert!(user.has_any_permission_on_database(7));
        assert!(!user.has_any_permission_on_database(9));
    }

    #[test]
    fn super_user_bypasses_checks() {
        let (mut user, _) = sample_user();
        user.id = SUPER_USER_ID;
        user.permissions.clear();
        assert!(user.has_permission(1, DatabaseObjectType::Instance, 0, u64::MAX));
    }
}
