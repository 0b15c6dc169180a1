//! The instance: lifecycle of databases, users, tokens, permissions and
//! sessions, with all control-plane registries persisted through system
//! tables in the system database.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs4::FileExt;
use rand::RngCore;
use uuid::Uuid;

use crate::crypto::{CipherContext, CipherRegistry};
use crate::error::{CResult, Error};
use crate::row::{ColumnDataType, Variant};
use crate::util::{is_valid_object_name, now_micros};

pub mod auth;
pub mod database;
pub mod user;

pub use auth::{AuthenticationResult, ClientSession};
pub use database::Database;
pub use user::{
    build_permission_mask, DatabaseObjectType, PermissionType, User, UserAccessKey,
    UserPermission, UserToken, SUPER_USER_ID, SUPER_USER_NAME,
};

/// Instance metadata file: a single little-endian u32 metadata version.
pub const INSTANCE_METADATA_FILE: &str = "instance_metadata";
/// Flag file written after a successful bootstrap.
pub const INSTANCE_INITIALIZED_FILE: &str = "initialized";
const INSTANCE_LOCK_FILE: &str = ".instance_lock";

const CURRENT_METADATA_VERSION: u32 = 1;

pub const SYSTEM_DATABASE_NAME: &str = "SYS";
pub const SYSTEM_DATABASE_ID: u32 = 1;
const SYSTEM_DATABASE_DIR: &str = "system";

const SYS_DATABASES: &str = "SYS_DATABASES";
const SYS_USERS: &str = "SYS_USERS";
const SYS_USER_ACCESS_KEYS: &str = "SYS_USER_ACCESS_KEYS";
const SYS_USER_TOKENS: &str = "SYS_USER_TOKENS";
const SYS_USER_PERMISSIONS: &str = "SYS_USER_PERMISSIONS";

const GENERATED_TOKEN_LENGTH: usize = 32;

/// Construction-time configuration of an instance.
#[derive(Debug, Clone)]
pub struct InstanceOptions {
    pub data_dir: PathBuf,
    pub master_cipher_id: String,
    pub master_key: Vec<u8>,
    /// Hex form of the superuser's initial Ed25519 public key.
    pub superuser_initial_access_key: String,
    pub data_area_size: u32,
}

struct InstanceState {
    system_database: Arc<Mutex<Database>>,
    databases: HashMap<u32, Arc<Mutex<Database>>>,
    database_ids_by_name: HashMap<String, u32>,
    users: HashMap<u32, User>,
    user_ids_by_name: HashMap<String, u32>,
}

pub struct Instance {
    data_dir: PathBuf,
    ciphers: Arc<CipherRegistry>,
    master_cipher_id: String,
    master_enc: Arc<dyn CipherContext>,
    master_dec: Arc<dyn CipherContext>,
    data_area_size: u32,
    state: Mutex<InstanceState>,
    pub(crate) sessions: Mutex<HashMap<Uuid, ClientSession>>,
    _lock_file: File,
}

impl Instance {
    /// Opens the instance in `options.data_dir`, bootstrapping it first when
    /// the initialization flag file is absent.
    pub fn open_or_create(options: InstanceOptions, ciphers: Arc<CipherRegistry>) -> CResult<Instance> {
        if options.data_dir.join(INSTANCE_INITIALIZED_FILE).exists() {
            Self::open(options, ciphers)
        } else {
            Self::create(options, ciphers)
        }
    }

    fn create(options: InstanceOptions, ciphers: Arc<CipherRegistry>) -> CResult<Instance> {
        log::info!("creating instance in {}", options.data_dir.display());
        fs::create_dir_all(&options.data_dir)?;
        let lock_file = acquire_instance_lock(&options.data_dir)?;

        // Fail before touching disk if the configured superuser key is bad.
        user::parse_access_key_text(&options.superuser_initial_access_key)?;

        let cipher = ciphers.get_cipher(&options.master_cipher_id)?;
        let master_enc = cipher.create_encryption_context(&options.master_key)?;
        let master_dec = cipher.create_decryption_context(&options.master_key)?;

        fs::write(
            options.data_dir.join(INSTANCE_METADATA_FILE),
            CURRENT_METADATA_VERSION.to_le_bytes(),
        )?;

        let mut system_database = Database::create(
            SYSTEM_DATABASE_ID,
            Uuid::nil(),
            SYSTEM_DATABASE_NAME.into(),
            Some("System database".into()),
            options.master_cipher_id.clone(),
            options.data_dir.join(SYSTEM_DATABASE_DIR),
            options.data_area_size,
            master_enc.clone(),
            master_dec.clone(),
        )?;
        create_control_tables(&mut system_database)?;

        // Record the system database itself; its row TRID is its id.
        let mut wrapped_master_key = options.master_key.clone();
        master_enc.transform(&mut wrapped_master_key)?;
        let txn = system_database.next_transaction_id();
        let db_row = system_database.find_table_mut(SYS_DATABASES)?.insert_row(
            vec![
                Variant::Text(SYSTEM_DATABASE_NAME.into()),
                Variant::Text(Uuid::nil().to_string()),
                Variant::Text(options.master_cipher_id.clone()),
                Variant::Binary(wrapped_master_key),
                Variant::Text("System database".into()),
            ],
            SUPER_USER_ID,
            txn,
        )?;
        debug_assert_eq!(db_row.table_row_id, SYSTEM_DATABASE_ID as u64);

        // Record the superuser with the configured initial access key.
        let user_row = system_database.find_table_mut(SYS_USERS)?.insert_row(
            vec![
                Variant::Text(SUPER_USER_NAME.into()),
                Variant::Null,
                Variant::Text("Super user".into()),
                Variant::Bool(true),
            ],
            SUPER_USER_ID,
            txn,
        )?;
        debug_assert_eq!(user_row.table_row_id, SUPER_USER_ID as u64);
        let key_row = system_database.find_table_mut(SYS_USER_ACCESS_KEYS)?.insert_row(
            vec![
                Variant::UInt64(SUPER_USER_ID as u64),
                Variant::Text("initial".into()),
                Variant::Text(options.superuser_initial_access_key.clone()),
                Variant::Null,
                Variant::Bool(true),
            ],
            SUPER_USER_ID,
            txn,
        )?;

        let root = User {
            id: SUPER_USER_ID,
            name: SUPER_USER_NAME.into(),
            real_name: None,
            description: Some("Super user".into()),
            active: true,
            access_keys: vec![UserAccessKey {
                id: key_row.table_row_id,
                name: "initial".into(),
                text: options.superuser_initial_access_key.clone(),
                description: None,
                active: true,
            }],
            tokens: Vec::new(),
            permissions: Vec::new(),
        };

        // The flag file is written last: a half-bootstrapped directory
        // refuses to load.
        fs::write(options.data_dir.join(INSTANCE_INITIALIZED_FILE), now_micros().to_string())?;
        log::info!("instance initialized in {}", options.data_dir.display());

        let mut users = HashMap::new();
        let mut user_ids_by_name = HashMap::new();
        user_ids_by_name.insert(root.name.clone(), root.id);
        users.insert(root.id, root);

        Ok(Instance {
            data_dir: options.data_dir,
            ciphers,
            master_cipher_id: options.master_cipher_id,
            master_enc,
            master_dec,
            data_area_size: options.data_area_size,
            state: Mutex::new(InstanceState {
                system_database: Arc::new(Mutex::new(system_database)),
                databases: HashMap::new(),
                database_ids_by_name: HashMap::new(),
                users,
                user_ids_by_name,
            }),
            sessions: Mutex::new(HashMap::new()),
            _lock_file: lock_file,
        })
    }

    fn open(options: InstanceOptions, ciphers: Arc<CipherRegistry>) -> CResult<Instance> {
        log::info!("opening instance in {}", options.data_dir.display());
        if !options.data_dir.join(INSTANCE_INITIALIZED_FILE).exists() {
            return Err(Error::NotFound(format!(
                "instance in {} is not initialized",
                options.data_dir.display()
            )));
        }
        let metadata = fs::read(options.data_dir.join(INSTANCE_METADATA_FILE))?;
        let version_bytes: [u8; 4] = metadata
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::Corrupt("instance metadata file is too short".into()))?;
        let version = u32::from_le_bytes(version_bytes);
        if version != CURRENT_METADATA_VERSION {
            return Err(Error::Corrupt(format!(
                "unknown instance metadata version {}",
                version
            )));
        }
        let lock_file = acquire_instance_lock(&options.data_dir)?;

        let cipher = ciphers.get_cipher(&options.master_cipher_id)?;
        let master_enc = cipher.create_encryption_context(&options.master_key)?;
        let master_dec = cipher.create_decryption_context(&options.master_key)?;

        let mut system_database = Database::open(
            SYSTEM_DATABASE_ID,
            Uuid::nil(),
            SYSTEM_DATABASE_NAME.into(),
            Some("System database".into()),
            options.master_cipher_id.clone(),
            options.data_dir.join(SYSTEM_DATABASE_DIR),
            options.data_area_size,
            master_enc.clone(),
            master_dec.clone(),
        )?;

        let mut databases = HashMap::new();
        let mut database_ids_by_name = HashMap::new();
        let db_rows = read_all_rows(&mut system_database, SYS_DATABASES)?;
        for (trid, row) in db_rows {
            let id = trid as u32;
            let name = row_text(&row, 0, SYS_DATABASES)?;
            if id == SYSTEM_DATABASE_ID {
                continue;
            }
            let db_uuid = Uuid::parse_str(&row_text(&row, 1, SYS_DATABASES)?)
                .map_err(|_| Error::Corrupt(format!("database {} has an invalid uuid", name)))?;
            let cipher_id = row_text(&row, 2, SYS_DATABASES)?;
            let mut key = row_binary(&row, 3, SYS_DATABASES)?;
            master_dec.transform(&mut key)?;
            let description = row_opt_text(&row, 4)?;
            let db_cipher = ciphers.get_cipher(&cipher_id)?;
            let enc = db_cipher.create_encryption_context(&key)?;
            let dec = db_cipher.create_decryption_context(&key)?;
            let database = Database::open(
                id,
                db_uuid,
                name.clone(),
                description,
                cipher_id,
                options.data_dir.join(db_uuid.to_string()),
                options.data_area_size,
                enc,
                dec,
            )?;
            database_ids_by_name.insert(name, id);
            databases.insert(id, Arc::new(Mutex::new(database)));
        }

        let mut users: HashMap<u32, User> = HashMap::new();
        let mut user_ids_by_name = HashMap::new();
        for (trid, row) in read_all_rows(&mut system_database, SYS_USERS)? {
            let user = User {
                id: trid as u32,
                name: row_text(&row, 0, SYS_USERS)?,
                real_name: row_opt_text(&row, 1)?,
                description: row_opt_text(&row, 2)?,
                active: row_bool(&row, 3, SYS_USERS)?,
                access_keys: Vec::new(),
                tokens: Vec::new(),
                permissions: Vec::new(),
            };
            user_ids_by_name.insert(user.name.clone(), user.id);
            users.insert(user.id, user);
        }
        for (trid, row) in read_all_rows(&mut system_database, SYS_USER_ACCESS_KEYS)? {
            let user_id = row_u64(&row, 0, SYS_USER_ACCESS_KEYS)? as u32;
            let key = UserAccessKey {
                id: trid,
                name: row_text(&row, 1, SYS_USER_ACCESS_KEYS)?,
                text: row_text(&row, 2, SYS_USER_ACCESS_KEYS)?,
                description: row_opt_text(&row, 3)?,
                active: row_bool(&row, 4, SYS_USER_ACCESS_KEYS)?,
            };
            users
                .get_mut(&user_id)
                .ok_or_else(|| {
                    Error::Corrupt(format!("access key {} references unknown user {}", trid, user_id))
                })?
                .access_keys
                .push(key);
        }
        for (trid, row) in read_all_rows(&mut system_database, SYS_USER_TOKENS)? {
            let user_id = row_u64(&row, 0, SYS_USER_TOKENS)? as u32;
            let token = UserToken {
                id: trid,
                name: row_text(&row, 1, SYS_USER_TOKENS)?,
                value: row_binary(&row, 2, SYS_USER_TOKENS)?,
                expiration_timestamp: row_u64(&row, 3, SYS_USER_TOKENS)?,
                description: row_opt_text(&row, 4)?,
            };
            users
                .get_mut(&user_id)
                .ok_or_else(|| {
                    Error::Corrupt(format!("token {} references unknown user {}", trid, user_id))
                })?
                .tokens
                .push(token);
        }
        for (trid, row) in read_all_rows(&mut system_database, SYS_USER_PERMISSIONS)? {
            let user_id = row_u64(&row, 0, SYS_USER_PERMISSIONS)? as u32;
            let object_type = DatabaseObjectType::try_from(
                row_u64(&row, 2, SYS_USER_PERMISSIONS)? as u8,
            )
            .map_err(|b| Error::Corrupt(format!("permission {} has object type {}", trid, b)))?;
            let permission = UserPermission {
                id: trid,
                database_id: row_u64(&row, 1, SYS_USER_PERMISSIONS)? as u32,
                object_type,
                object_id: row_u64(&row, 3, SYS_USER_PERMISSIONS)?,
                permissions: row_u64(&row, 4, SYS_USER_PERMISSIONS)?,
                grant_option: row_bool(&row, 5, SYS_USER_PERMISSIONS)?,
            };
            users
                .get_mut(&user_id)
                .ok_or_else(|| {
                    Error::Corrupt(format!("permission {} references unknown user {}", trid, user_id))
                })?
                .permissions
                .push(permission);
        }
        if !users.contains_key(&SUPER_USER_ID) {
            return Err(Error::Corrupt("superuser record is missing".into()));
        }

        log::info!(
            "opened instance in {}: {} databases, {} users",
            options.data_dir.display(),
            databases.len(),
            users.len()
        );
        Ok(Instance {
            data_dir: options.data_dir,
            ciphers,
            master_cipher_id: options.master_cipher_id,
            master_enc,
            master_dec,
            data_area_size: options.data_area_size,
            state: Mutex::new(InstanceState {
                system_database: Arc::new(Mutex::new(system_database)),
                databases,
                database_ids_by_name,
                users,
                user_ids_by_name,
            }),
            sessions: Mutex::new(HashMap::new()),
            _lock_file: lock_file,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn data_area_size(&self) -> u32 {
        self.data_area_size
    }

    // --- databases ---

    /// Creates a database with a freshly generated cipher key, stored
    /// wrapped by the instance master cipher.
    pub fn create_database(
        &self,
        current_user_id: u32,
        name: &str,
        cipher_id: &str,
        description: Option<String>,
    ) -> CResult<(u32, Uuid)> {
        let mut state = self.state.lock().unwrap();
        check_permission_locked(
            &state,
            current_user_id,
            0,
            DatabaseObjectType::Instance,
            0,
            PermissionType::Create.mask(),
        )?;
        if !is_valid_object_name(name) {
            return Err(Error::InvalidArgument(format!("invalid database name '{}'", name)));
        }
        if name == SYSTEM_DATABASE_NAME || state.database_ids_by_name.contains_key(name) {
            return Err(Error::AlreadyExists(format!("database {} already exists", name)));
        }
        let cipher = self.ciphers.get_cipher(cipher_id)?;
        let mut key = vec![0u8; cipher.key_size()];
        rand::thread_rng().fill_bytes(&mut key);
        let mut wrapped_key = key.clone();
        self.master_enc.transform(&mut wrapped_key)?;
        let db_uuid = Uuid::new_v4();

        let system_database = state.system_database.clone();
        let mut sysdb = system_database.lock().unwrap();
        let txn = sysdb.next_transaction_id();
        let inserted = sysdb.find_table_mut(SYS_DATABASES)?.insert_row(
            vec![
                Variant::Text(name.to_string()),
                Variant::Text(db_uuid.to_string()),
                Variant::Text(cipher_id.to_string()),
                Variant::Binary(wrapped_key),
                description.clone().map(Variant::Text).unwrap_or(Variant::Null),
            ],
            current_user_id,
            txn,
        )?;
        drop(sysdb);
        let id = inserted.table_row_id as u32;

        let enc = cipher.create_encryption_context(&key)?;
        let dec = cipher.create_decryption_context(&key)?;
        let database = Database::create(
            id,
            db_uuid,
            name.to_string(),
            description,
            cipher_id.to_string(),
            self.data_dir.join(db_uuid.to_string()),
            self.data_area_size,
            enc,
            dec,
        )?;
        state.database_ids_by_name.insert(name.to_string(), id);
        state.databases.insert(id, Arc::new(Mutex::new(database)));
        Ok((id, db_uuid))
    }

    pub fn drop_database(&self, current_user_id: u32, name: &str) -> CResult<()> {
        let mut state = self.state.lock().unwrap();
        if name == SYSTEM_DATABASE_NAME {
            return Err(Error::InvalidArgument("the system database cannot be dropped".into()));
        }
        let id = find_database_id(&state, name)?;
        check_permission_locked(
            &state,
            current_user_id,
            id,
            DatabaseObjectType::Database,
            id as u64,
            PermissionType::Drop.mask(),
        )?;
        let system_database = state.system_database.clone();
        let mut sysdb = system_database.lock().unwrap();
        let txn = sysdb.next_transaction_id();
        sysdb.find_table_mut(SYS_DATABASES)?.delete_row(id as u64, current_user_id, txn)?;
        drop(sysdb);

        let database = state.databases.remove(&id).expect("database maps out of sync");
        state.database_ids_by_name.remove(name);
        let data_dir = database.lock().unwrap().data_dir().to_path_buf();
        drop(database);
        fs::remove_dir_all(&data_dir)?;
        log::info!("dropped database {} ({})", name, id);
        Ok(())
    }

    pub fn rename_database(
        &self,
        current_user_id: u32,
        old_name: &str,
        new_name: &str,
    ) -> CResult<()> {
        let mut state = self.state.lock().unwrap();
        if old_name == SYSTEM_DATABASE_NAME {
            return Err(Error::InvalidArgument("the system database cannot be renamed".into()));
        }
        if !is_valid_object_name(new_name) {
            return Err(Error::InvalidArgument(format!("invalid database name '{}'", new_name)));
        }
        if new_name == SYSTEM_DATABASE_NAME || state.database_ids_by_name.contains_key(new_name) {
            return Err(Error::AlreadyExists(format!("database {} already exists", new_name)));
        }
        let id = find_database_id(&state, old_name)?;
        check_permission_locked(
            &state,
            current_user_id,
            id,
            DatabaseObjectType::Database,
            id as u64,
            PermissionType::Alter.mask(),
        )?;
        let system_database = state.system_database.clone();
        let mut sysdb = system_database.lock().unwrap();
        let txn = sysdb.next_transaction_id();
        let table = sysdb.find_table_mut(SYS_DATABASES)?;
        let name_column = table.column_index("NAME")?;
        table.update_row(
            id as u64,
            vec![(name_column, Variant::Text(new_name.to_string()))],
            current_user_id,
            txn,
        )?;
        drop(sysdb);

        state.database_ids_by_name.remove(old_name);
        state.database_ids_by_name.insert(new_name.to_string(), id);
        state.databases[&id].lock().unwrap().set_name(new_name.to_string());
        Ok(())
    }

    /// Resolves a database for a session. Non-superusers need at least one
    /// permission touching it.
    pub fn use_database(&self, current_user_id: u32, name: &str) -> CResult<u32> {
        let state = self.state.lock().unwrap();
        let user = find_user(&state, current_user_id)?;
        let id = if name == SYSTEM_DATABASE_NAME {
            SYSTEM_DATABASE_ID
        } else {
            find_database_id(&state, name)?
        };
        if !user.has_any_permission_on_database(id) {
            return Err(Error::PermissionDenied(format!(
                "user {} has no access to database {}",
                user.name, name
            )));
        }
        Ok(id)
    }

    pub fn find_database_by_name(&self, name: &str) -> CResult<Arc<Mutex<Database>>> {
        let state = self.state.lock().unwrap();
        if name == SYSTEM_DATABASE_NAME {
            return Ok(state.system_database.clone());
        }
        let id = find_database_id(&state, name)?;
        Ok(state.databases[&id].clone())
    }

    pub fn find_database_by_id(&self, id: u32) -> CResult<Arc<Mutex<Database>>> {
        let state = self.state.lock().unwrap();
        if id == SYSTEM_DATABASE_ID {
            return Ok(state.system_database.clone());
        }
        state
            .databases
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("database {} does not exist", id)))
    }

    /// Databases visible to `user_id`, system database included for the
    /// superuser, sorted by name.
    pub fn list_databases(&self, user_id: u32) -> CResult<Vec<(u32, String)>> {
        let state = self.state.lock().unwrap();
        let user = find_user(&state, user_id)?;
        let mut result = Vec::new();
        if user.is_super_user() {
            result.push((SYSTEM_DATABASE_ID, SYSTEM_DATABASE_NAME.to_string()));
        }
        for (name, id) in &state.database_ids_by_name {
            if user.has_any_permission_on_database(*id) {
                result.push((*id, name.clone()));
            }
        }
        result.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(result)
    }

    // --- users ---

    pub fn create_user(
        &self,
        current_user_id: u32,
        name: &str,
        real_name: Option<String>,
        description: Option<String>,
        active: bool,
    ) -> CResult<u32> {
        let mut state = self.state.lock().unwrap();
        check_permission_locked(
            &state,
            current_user_id,
            0,
            DatabaseObjectType::Instance,
            0,
            PermissionType::Create.mask(),
        )?;
        if !is_valid_object_name(name) {
            return Err(Error::InvalidArgument(format!("invalid user name '{}'", name)));
        }
        if state.user_ids_by_name.contains_key(name) {
            return Err(Error::Conflict(format!("user {} already exists", name)));
        }
        let system_database = state.system_database.clone();
        let mut sysdb = system_database.lock().unwrap();
        let txn = sysdb.next_transaction_id();
        let inserted = sysdb.find_table_mut(SYS_USERS)?.insert_row(
            vec![
                Variant::Text(name.to_string()),
                real_name.clone().map(Variant::Text).unwrap_or(Variant::Null),
                description.clone().map(Variant::Text).unwrap_or(Variant::Null),
                Variant::Bool(active),
            ],
            current_user_id,
            txn,
        )?;
        drop(sysdb);
        let id = inserted.table_row_id as u32;
        let user = User {
            id,
            name: name.to_string(),
            real_name,
            description,
            active,
            access_keys: Vec::new(),
            tokens: Vec::new(),
            permissions: Vec::new(),
        };
        state.user_ids_by_name.insert(user.name.clone(), id);
        state.users.insert(id, user);
        log::info!("created user {} ({})", name, id);
        Ok(id)
    }

    pub fn drop_user(&self, current_user_id: u32, name: &str) -> CResult<()> {
        let mut state = self.state.lock().unwrap();
        check_permission_locked(
            &state,
            current_user_id,
            0,
            DatabaseObjectType::Instance,
            0,
            PermissionType::Drop.mask(),
        )?;
        let id = find_user_id(&state, name)?;
        if id == SUPER_USER_ID {
            return Err(Error::InvalidArgument("the superuser cannot be dropped".into()));
        }
        let user = state.users[&id].clone();
        let system_database = state.system_database.clone();
        let mut sysdb = system_database.lock().unwrap();
        let txn = sysdb.next_transaction_id();
        for key in &user.access_keys {
            sysdb.find_table_mut(SYS_USER_ACCESS_KEYS)?.delete_row(key.id, current_user_id, txn)?;
        }
        for token in &user.tokens {
            sysdb.find_table_mut(SYS_USER_TOKENS)?.delete_row(token.id, current_user_id, txn)?;
        }
        for permission in &user.permissions {
            sysdb
                .find_table_mut(SYS_USER_PERMISSIONS)?
                .delete_row(permission.id, current_user_id, txn)?;
        }
        sysdb.find_table_mut(SYS_USERS)?.delete_row(id as u64, current_user_id, txn)?;
        drop(sysdb);
        state.users.remove(&id);
        state.user_ids_by_name.remove(name);
        log::info!("dropped user {} ({})", name, id);
        Ok(())
    }

    /// Updates user attributes; `None` leaves a field unchanged.
    pub fn set_user_attributes(
        &self,
        current_user_id: u32,
        name: &str,
        real_name: Option<Option<String>>,
        description: Option<Option<String>>,
        active: Option<bool>,
    ) -> CResult<()> {
        let mut state = self.state.lock().unwrap();
        check_permission_locked(
            &state,
            current_user_id,
            0,
            DatabaseObjectType::Instance,
            0,
            PermissionType::Alter.mask(),
        )?;
        let id = find_user_id(&state, name)?;
        if id == SUPER_USER_ID && active == Some(false) {
            return Err(Error::InvalidArgument("the superuser cannot be deactivated".into()));
        }
        let system_database = state.system_database.clone();
        let mut sysdb = system_database.lock().unwrap();
        let txn = sysdb.next_transaction_id();
        let table = sysdb.find_table_mut(SYS_USERS)?;
        let mut updates = Vec::new();
        if let Some(real_name) = &real_name {
            updates.push((
                table.column_index("REAL_NAME")?,
                real_name.clone().map(Variant::Text).unwrap_or(Variant::Null),
            ));
        }
        if let Some(description) = &description {
            updates.push((
                table.column_index("DESCRIPTION")?,
                description.clone().map(Variant::Text).unwrap_or(Variant::Null),
            ));
        }
        if let Some(active) = active {
            updates.push((table.column_index("ACTIVE")?, Variant::Bool(active)));
        }
        if updates.is_empty() {
            return Ok(());
        }
        table.update_row(id as u64, updates, current_user_id, txn)?;
        drop(sysdb);

        let user = state.users.get_mut(&id).unwrap();
        if let Some(real_name) = real_name {
            user.real_name = real_name;
        }
        if let Some(description) = description {
            user.description = description;
        }
        if let Some(active) = active {
            user.active = active;
        }
        Ok(())
    }

    pub fn create_user_access_key(
        &self,
        current_user_id: u32,
        user_name: &str,
        key_name: &str,
        text: &str,
        description: Option<String>,
    ) -> CResult<u64> {
        let mut state = self.state.lock().unwrap();
        check_permission_locked(
            &state,
            current_user_id,
            0,
            DatabaseObjectType::Instance,
            0,
            PermissionType::Alter.mask(),
        )?;
        let id = find_user_id(&state, user_name)?;
        user::parse_access_key_text(text)?;
        if state.users[&id].access_keys.iter().any(|k| k.name == key_name) {
            return Err(Error::Conflict(format!(
                "user {} already has an access key named {}",
                user_name, key_name
            )));
        }
        let system_database = state.system_database.clone();
        let mut sysdb = system_database.lock().unwrap();
        let txn = sysdb.next_transaction_id();
        let inserted = sysdb.find_table_mut(SYS_USER_ACCESS_KEYS)?.insert_row(
            vec![
                Variant::UInt64(id as u64),
                Variant::Text(key_name.to_string()),
                Variant::Text(text.to_string()),
                description.clone().map(Variant::Text).unwrap_or(Variant::Null),
                Variant::Bool(true),
            ],
            current_user_id,
            txn,
        )?;
        drop(sysdb);
        let key_id = inserted.table_row_id;
        state.users.get_mut(&id).unwrap().access_keys.push(UserAccessKey {
            id: key_id,
            name: key_name.to_string(),
            text: text.to_string(),
            description,
            active: true,
        });
        Ok(key_id)
    }

    pub fn drop_user_access_key(
        &self,
        current_user_id: u32,
        user_name: &str,
        key_name: &str,
    ) -> CResult<()> {
        let mut state = self.state.lock().unwrap();
        check_permission_locked(
            &state,
            current_user_id,
            0,
            DatabaseObjectType::Instance,
            0,
            PermissionType::Alter.mask(),
        )?;
        let id = find_user_id(&state, user_name)?;
        let key_id = state.users[&id]
            .access_keys
            .iter()
            .find(|k| k.name == key_name)
            .map(|k| k.id)
            .ok_or_else(|| {
                Error::NotFound(format!("user {} has no access key named {}", user_name, key_name))
            })?;
        let system_database = state.system_database.clone();
        let mut sysdb = system_database.lock().unwrap();
        let txn = sysdb.next_transaction_id();
        sysdb.find_table_mut(SYS_USER_ACCESS_KEYS)?.delete_row(key_id, current_user_id, txn)?;
        drop(sysdb);
        state.users.get_mut(&id).unwrap().access_keys.retain(|k| k.id != key_id);
        Ok(())
    }

    /// Creates a token. When no value is supplied a random one is generated;
    /// the value is returned exactly once and stored as supplied.
    pub fn create_user_token(
        &self,
        current_user_id: u32,
        user_name: &str,
        token_name: &str,
        value: Option<Vec<u8>>,
        expiration_timestamp: Option<u64>,
        description: Option<String>,
    ) -> CResult<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        check_permission_locked(
            &state,
            current_user_id,
            0,
            DatabaseObjectType::Instance,
            0,
            PermissionType::Alter.mask(),
        )?;
        let id = find_user_id(&state, user_name)?;
        if state.users[&id].tokens.iter().any(|t| t.name == token_name) {
            return Err(Error::Conflict(format!(
                "user {} already has a token named {}",
                user_name, token_name
            )));
        }
        let value = value.unwrap_or_else(|| {
            let mut bytes = vec![0u8; GENERATED_TOKEN_LENGTH];
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes
        });
        let expiration_timestamp = expiration_timestamp.unwrap_or(0);
        let system_database = state.system_database.clone();
        let mut sysdb = system_database.lock().unwrap();
        let txn = sysdb.next_transaction_id();
        let inserted = sysdb.find_table_mut(SYS_USER_TOKENS)?.insert_row(
            vec![
                Variant::UInt64(id as u64),
                Variant::Text(token_name.to_string()),
                Variant::Binary(value.clone()),
                Variant::UInt64(expiration_timestamp),
                description.clone().map(Variant::Text).unwrap_or(Variant::Null),
            ],
            current_user_id,
            txn,
        )?;
        drop(sysdb);
        state.users.get_mut(&id).unwrap().tokens.push(UserToken {
            id: inserted.table_row_id,
            name: token_name.to_string(),
            value: value.clone(),
            expiration_timestamp,
            description,
        });
        Ok(value)
    }

    pub fn drop_user_token(
        &self,
        current_user_id: u32,
        user_name: &str,
        token_name: &str,
    ) -> CResult<()> {
        let mut state = self.state.lock().unwrap();
        check_permission_locked(
            &state,
            current_user_id,
            0,
            DatabaseObjectType::Instance,
            0,
            PermissionType::Alter.mask(),
        )?;
        let id = find_user_id(&state, user_name)?;
        let token_id = state.users[&id]
            .tokens
            .iter()
            .find(|t| t.name == token_name)
            .map(|t| t.id)
            .ok_or_else(|| {
                Error::NotFound(format!("user {} has no token named {}", user_name, token_name))
            })?;
        let system_database = state.system_database.clone();
        let mut sysdb = system_database.lock().unwrap();
        let txn = sysdb.next_transaction_id();
        sysdb.find_table_mut(SYS_USER_TOKENS)?.delete_row(token_id, current_user_id, txn)?;
        drop(sysdb);
        state.users.get_mut(&id).unwrap().tokens.retain(|t| t.id != token_id);
        Ok(())
    }

    // --- permissions ---

    #[allow(clippy::too_many_arguments)]
    pub fn grant_permissions(
        &self,
        current_user_id: u32,
        grantee_name: &str,
        database_id: u32,
        object_type: DatabaseObjectType,
        object_id: u64,
        permissions: u64,
        grant_option: bool,
    ) -> CResult<()> {
        let mut state = self.state.lock().unwrap();
        authorize_grant(&state, current_user_id, database_id, object_type, object_id, permissions)?;
        let id = find_user_id(&state, grantee_name)?;
        let existing = state.users[&id]
            .permissions
            .iter()
            .find(|p| {
                p.database_id == database_id
                    && p.object_type == object_type
                    && p.object_id == object_id
            })
            .cloned();

        let system_database = state.system_database.clone();
        let mut sysdb = system_database.lock().unwrap();
        let txn = sysdb.next_transaction_id();
        match existing {
            Some(mut record) => {
                record.permissions |= permissions;
                record.grant_option = record.grant_option || grant_option;
                let table = sysdb.find_table_mut(SYS_USER_PERMISSIONS)?;
                let updates = vec![
                    (table.column_index("PERMISSIONS")?, Variant::UInt64(record.permissions)),
                    (table.column_index("GRANT_OPTION")?, Variant::Bool(record.grant_option)),
                ];
                table.update_row(record.id, updates, current_user_id, txn)?;
                drop(sysdb);
                let user = state.users.get_mut(&id).unwrap();
                let slot =
                    user.permissions.iter_mut().find(|p| p.id == record.id).expect("registry sync");
                *slot = record;
            }
            None => {
                let inserted = sysdb.find_table_mut(SYS_USER_PERMISSIONS)?.insert_row(
                    vec![
                        Variant::UInt64(id as u64),
                        Variant::UInt64(database_id as u64),
                        Variant::UInt64(object_type as u8 as u64),
                        Variant::UInt64(object_id),
                        Variant::UInt64(permissions),
                        Variant::Bool(grant_option),
                    ],
                    current_user_id,
                    txn,
                )?;
                drop(sysdb);
                state.users.get_mut(&id).unwrap().permissions.push(UserPermission {
                    id: inserted.table_row_id,
                    database_id,
                    object_type,
                    object_id,
                    permissions,
                    grant_option,
                });
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn revoke_permissions(
        &self,
        current_user_id: u32,
        grantee_name: &str,
        database_id: u32,
        object_type: DatabaseObjectType,
        object_id: u64,
        permissions: u64,
    ) -> CResult<()> {
        let mut state = self.state.lock().unwrap();
        authorize_grant(&state, current_user_id, database_id, object_type, object_id, permissions)?;
        let id = find_user_id(&state, grantee_name)?;
        let record = state.users[&id]
            .permissions
            .iter()
            .find(|p| {
                p.database_id == database_id
                    && p.object_type == object_type
                    && p.object_id == object_id
            })
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "user {} holds no matching permission record",
                    grantee_name
                ))
            })?;
        let remaining = record.permissions & !permissions;
        let system_database = state.system_database.clone();
        let mut sysdb = system_database.lock().unwrap();
        let txn = sysdb.next_transaction_id();
        if remaining == 0 {
            sysdb.find_table_mut(SYS_USER_PERMISSIONS)?.delete_row(record.id, current_user_id, txn)?;
            drop(sysdb);
            state.users.get_mut(&id).unwrap().permissions.retain(|p| p.id != record.id);
        } else {
            let table = sysdb.find_table_mut(SYS_USER_PERMISSIONS)?;
            let updates =
                vec![(table.column_index("PERMISSIONS")?, Variant::UInt64(remaining))];
            table.update_row(record.id, updates, current_user_id, txn)?;
            drop(sysdb);
            let user = state.users.get_mut(&id).unwrap();
            let slot =
                user.permissions.iter_mut().find(|p| p.id == record.id).expect("registry sync");
            slot.permissions = remaining;
        }
        Ok(())
    }

    /// Checks `mask` for `user_id` against `(database, object)`, honouring
    /// wildcards and the superuser bypass.
    pub fn check_permission(
        &self,
        user_id: u32,
        database_id: u32,
        object_type: DatabaseObjectType,
        object_id: u64,
        mask: u64,
    ) -> CResult<()> {
        let state = self.state.lock().unwrap();
        check_permission_locked(&state, user_id, database_id, object_type, object_id, mask)
    }

    /// Looks up a user by name; `NotFound` when absent.
    pub fn find_user_checked(&self, name: &str) -> CResult<u32> {
        let state = self.state.lock().unwrap();
        find_user_id(&state, name)
    }

    pub fn user_name(&self, user_id: u32) -> CResult<String> {
        let state = self.state.lock().unwrap();
        Ok(find_user(&state, user_id)?.name.clone())
    }

    pub(crate) fn with_user<R>(&self, name: &str, f: impl FnOnce(&User) -> R) -> CResult<R> {
        let state = self.state.lock().unwrap();
        let id = state
            .user_ids_by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("user {} does not exist", name)))?;
        Ok(f(&state.users[&id]))
    }

    pub fn flush(&self) -> CResult<()> {
        let state = self.state.lock().unwrap();
        state.system_database.lock().unwrap().flush()?;
        for database in state.databases.values() {
            database.lock().unwrap().flush()?;
        }
        Ok(())
    }
}

// --- helpers ---

fn acquire_instance_lock(data_dir: &Path) -> CResult<File> {
    let lock_path = data_dir.join(INSTANCE_LOCK_FILE);
    let file = OpenOptions::new().create(true).write(true).open(&lock_path)?;
    file.try_lock_exclusive().map_err(|_| {
        Error::Conflict(format!(
            "instance data directory {} is locked by another process",
            data_dir.display()
        ))
    })?;
    Ok(file)
}

fn create_control_tables(system_database: &mut Database) -> CResult<()> {
    system_database.create_table(
        SYS_DATABASES,
        &[
            ("NAME".into(), ColumnDataType::Text),
            ("UUID".into(), ColumnDataType::Text),
            ("CIPHER_ID".into(), ColumnDataType::Text),
            ("CIPHER_KEY".into(), ColumnDataType::Binary),
            ("DESCRIPTION".into(), ColumnDataType::Text),
        ],
        SUPER_USER_ID,
    )?;
    system_database.create_table(
        SYS_USERS,
        &[
            ("NAME".into(), ColumnDataType::Text),
            ("REAL_NAME".into(), ColumnDataType::Text),
            ("DESCRIPTION".into(), ColumnDataType::Text),
            ("ACTIVE".into(), ColumnDataType::Bool),
        ],
        SUPER_USER_ID,
    )?;
    system_database.create_table(
        SYS_USER_ACCESS_KEYS,
        &[
            ("USER_ID".into(), ColumnDataType::UInt64),
            ("NAME".into(), ColumnDataType::Text),
            ("TEXT".into(), ColumnDataType::Text),
            ("DESCRIPTION".into(), ColumnDataType::Text),
            ("ACTIVE".into(), ColumnDataType::Bool),
        ],
        SUPER_USER_ID,
    )?;
    system_database.create_table(
        SYS_USER_TOKENS,
        &[
            ("USER_ID".into(), ColumnDataType::UInt64),
            ("NAME".into(), ColumnDataType::Text),
            ("VALUE".into(), ColumnDataType::Binary),
            ("EXPIRATION_TS".into(), ColumnDataType::UInt64),
            ("DESCRIPTION".into(), ColumnDataType::Text),
        ],
        SUPER_USER_ID,
    )?;
    system_database.create_table(
        SYS_USER_PERMISSIONS,
        &[
            ("USER_ID".into(), ColumnDataType::UInt64),
            ("DATABASE_ID".into(), ColumnDataType::UInt64),
            ("OBJECT_TYPE".into(), ColumnDataType::UInt64),
            ("OBJECT_ID".into(), ColumnDataType::UInt64),
            ("PERMISSIONS".into(), ColumnDataType::UInt64),
            ("GRANT_OPTION".into(), ColumnDataType::Bool),
        ],
        SUPER_USER_ID,
    )?;
    Ok(())
}

fn read_all_rows(database: &mut Database, table_name: &str) -> CResult<Vec<(u64, Vec<Variant>)>> {
    let table = database.find_table_mut(table_name)?;
    let mut rows = Vec::new();
    for trid in table.visible_trids() {
        let (_, row) = table.read_row(trid)?.ok_or_else(|| {
            Error::Corrupt(format!("row {} of {} vanished during load", trid, table_name))
        })?;
        rows.push((trid, row));
    }
    Ok(rows)
}

fn find_user<'a>(state: &'a InstanceState, user_id: u32) -> CResult<&'a User> {
    state
        .users
        .get(&user_id)
        .ok_or_else(|| Error::NotFound(format!("user {} does not exist", user_id)))
}

fn find_user_id(state: &InstanceState, name: &str) -> CResult<u32> {
    state
        .user_ids_by_name
        .get(name)
        .copied()
        .ok_or_else(|| Error::NotFound(format!("user {} does not exist", name)))
}

fn find_database_id(state: &InstanceState, name: &str) -> CResult<u32> {
    state
        .database_ids_by_name
        .get(name)
        .copied()
        .ok_or_else(|| Error::NotFound(format!("database {} does not exist", name)))
}

fn check_permission_locked(
    state: &InstanceState,
    user_id: u32,
    database_id: u32,
    object_type: DatabaseObjectType,
    object_id: u64,
    mask: u64,
) -> CResult<()> {
    let user = find_user(state, user_id)?;
    if user.has_permission(database_id, object_type, object_id, mask) {
        Ok(())
    } else {
        Err(Error::PermissionDenied(format!(
            "user {} lacks the required permissions on object {:?}/{}",
            user.name, object_type, object_id
        )))
    }
}

/// Granting requires the same bits held with the grant option, or superuser.
fn authorize_grant(
    state: &InstanceState,
    user_id: u32,
    database_id: u32,
    object_type: DatabaseObjectType,
    object_id: u64,
    mask: u64,
) -> CResult<()> {
    let user = find_user(state, user_id)?;
    if user.is_super_user() {
        return Ok(());
    }
    let can_grant = user
        .permissions
        .iter()
        .any(|p| p.grant_option && p.covers(database_id, object_type, object_id, mask));
    if can_grant {
        Ok(())
    } else {
        Err(Error::PermissionDenied(format!(
            "user {} cannot grant the requested permissions",
            user.name
        )))
    }
}

fn row_text(row: &[Variant], index: usize, table: &str) -> CResult<String> {
    match row.get(index) {
        Some(Variant::Text(v)) => Ok(v.clone()),
        other => Err(Error::Corrupt(format!(
            "{} row column {} holds {:?} instead of text",
            table, index, other
        ))),
    }
}

fn row_opt_text(row: &[Variant], index: usize) -> CResult<Option<String>> {
    match row.get(index) {
        Some(Variant::Text(v)) => Ok(Some(v.clone())),
        Some(Variant::Null) | None => Ok(None),
        Some(other) => Err(Error::Corrupt(format!(
            "row column {} holds {} instead of text or null",
            index,
            other.type_name()
        ))),
    }
}

fn row_u64(row: &[Variant], index: usize, table: &str) -> CResult<u64> {
    match row.get(index) {
        Some(Variant::UInt64(v)) => Ok(*v),
        other => Err(Error::Corrupt(format!(
            "{} row column {} holds {:?} instead of an unsigned integer",
            table, index, other
        ))),
    }
}

fn row_bool(row: &[Variant], index: usize, table: &str) -> CResult<bool> {
    match row.get(index) {
        Some(Variant::Bool(v)) => Ok(*v),
        other => Err(Error::Corrupt(format!(
            "{} row column {} holds {:?} instead of a boolean",
            table, index, other
        ))),
    }
}

fn row_binary(row: &[Variant], index: usize, table: &str) -> CResult<Vec<u8>> {
    match row.get(index) {
        Some(Variant::Binary(v)) => Ok(v.clone()),
        other => Err(Error::Corrupt(format!(
            "{} row column {} holds {:?} instead of binary",
            table, index, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    use super::*;

    fn options(data_dir: &Path) -> (InstanceOptions, SigningKey) {
        let signing_key = SigningKey::generate(&mut OsRng);
        let options = InstanceOptions {
            data_dir: data_dir.to_path_buf(),
            master_cipher_id: "aes128".into(),
            master_key: vec![0xef; 16],
            superuser_initial_access_key: hex::encode(signing_key.verifying_key().to_bytes()),
            data_area_size: crate::storage::DEFAULT_DATA_AREA_SIZE,
        };
        (options, signing_key)
    }

    fn new_instance(data_dir: &Path) -> (Instance, SigningKey) {
        let (opts, key) = options(data_dir);
        let instance =
            Instance::open_or_create(opts, Arc::new(CipherRegistry::with_builtin_ciphers()))
                .unwrap();
        (instance, key)
    }

    #[test]
    fn superuser_authenticates_after_restart() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let (opts, signing_key) = options(dir.path());
        {
            let instance = Instance::open_or_create(
                opts.clone(),
                Arc::new(CipherRegistry::with_builtin_ciphers()),
            )?;
            assert_eq!(instance.find_user_checked(SUPER_USER_NAME)?, SUPER_USER_ID);
        }
        // Restart: the bootstrap is read back from the system tables.
        let instance =
            Instance::open_or_create(opts, Arc::new(CipherRegistry::with_builtin_ciphers()))?;
        assert_eq!(instance.find_user_checked("ROOT")?, 1);

        instance.begin_user_authentication(SUPER_USER_NAME)?;
        let challenge = b"instance login challenge";
        let signature = signing_key.sign(challenge);
        let auth =
            instance.authenticate_user(SUPER_USER_NAME, &signature.to_bytes(), challenge)?;
        assert_eq!(auth.user_id, SUPER_USER_ID);
        assert_eq!(instance.active_session_count(), 1);
        instance.end_session(&auth.session_uuid)?;
        assert!(matches!(instance.end_session(&auth.session_uuid), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn authentication_failures_are_uniform() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let (instance, signing_key) = new_instance(dir.path());
        let challenge = b"challenge";
        let signature = signing_key.sign(challenge);

        // Unknown user and bad signature are indistinguishable.
        let unknown = instance.authenticate_user("NOBODY", &signature.to_bytes(), challenge);
        let bad_signature = instance.authenticate_user(SUPER_USER_NAME, b"junk", challenge);
        assert!(matches!(&unknown, Err(Error::Unauthenticated(m)) if m == "access denied"));
        assert!(matches!(&bad_signature, Err(Error::Unauthenticated(m)) if m == "access denied"));
        assert!(matches!(
            instance.begin_user_authentication("NOBODY"),
            Err(Error::Unauthenticated(_))
        ));
        Ok(())
    }

    #[test]
    fn token_lifecycle() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let (instance, _) = new_instance(dir.path());
        let value =
            instance.create_user_token(SUPER_USER_ID, SUPER_USER_NAME, "api", None, None, None)?;
        assert_eq!(value.len(), GENERATED_TOKEN_LENGTH);
        assert_eq!(
            instance.authenticate_user_with_token(SUPER_USER_NAME, &value)?,
            SUPER_USER_ID
        );
        assert!(matches!(
            instance.authenticate_user_with_token(SUPER_USER_NAME, b"wrong"),
            Err(Error::Unauthenticated(_))
        ));
        assert!(matches!(
            instance.create_user_token(SUPER_USER_ID, SUPER_USER_NAME, "api", None, None, None),
            Err(Error::Conflict(_))
        ));
        instance.drop_user_token(SUPER_USER_ID, SUPER_USER_NAME, "api")?;
        assert!(matches!(
            instance.authenticate_user_with_token(SUPER_USER_NAME, &value),
            Err(Error::Unauthenticated(_))
        ));
        Ok(())
    }

    #[test]
    fn databases_and_permissions_survive_restart() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let (opts, alice_signing_key) = options(dir.path());
        let alice_key_text = hex::encode(alice_signing_key.verifying_key().to_bytes());
        {
            let instance = Instance::open_or_create(
                opts.clone(),
                Arc::new(CipherRegistry::with_builtin_ciphers()),
            )?;
            instance.create_database(SUPER_USER_ID, "APPDB", "aes128", None)?;
            let alice =
                instance.create_user(SUPER_USER_ID, "ALICE", None, None, true)?;
            instance.create_user_access_key(
                SUPER_USER_ID,
                "ALICE",
                "main",
                &alice_key_text,
                None,
            )?;
            let db = instance.find_database_by_name("APPDB")?;
            let db_id = db.lock().unwrap().id();
            instance.grant_permissions(
                SUPER_USER_ID,
                "ALICE",
                db_id,
                DatabaseObjectType::Table,
                0,
                PermissionType::Select.mask(),
                false,
            )?;
            // Alice cannot create databases.
            assert!(matches!(
                instance.create_database(alice, "OTHER", "aes128", None),
                Err(Error::PermissionDenied(_))
            ));
        }
        let instance =
            Instance::open_or_create(opts, Arc::new(CipherRegistry::with_builtin_ciphers()))?;
        let alice = instance.find_user_checked("ALICE")?;
        let db = instance.find_database_by_name("APPDB")?;
        let db_id = db.lock().unwrap().id();
        instance.check_permission(
            alice,
            db_id,
            DatabaseObjectType::Table,
            42,
            PermissionType::Select.mask(),
        )?;
        assert!(matches!(
            instance.check_permission(
                alice,
                db_id,
                DatabaseObjectType::Table,
                42,
                PermissionType::Insert.mask()
            ),
            Err(Error::PermissionDenied(_))
        ));
        assert_eq!(instance.use_database(alice, "APPDB")?, db_id);
        assert!(matches!(
            instance.use_database(alice, "NOSUCH"),
            Err(Error::NotFound(_))
        ));

        // Revoking the last bits removes the record entirely.
        instance.revoke_permissions(
            SUPER_USER_ID,
            "ALICE",
            db_id,
            DatabaseObjectType::Table,
            0,
            PermissionType::Select.mask(),
        )?;
        assert!(matches!(
            instance.use_database(alice, "APPDB"),
            Err(Error::PermissionDenied(_))
        ));
        Ok(())
    }

    #[test]
    fn drop_and_rename_database() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let (instance, _) = new_instance(dir.path());
        let (_, db_uuid) = instance.create_database(SUPER_USER_ID, "TEMPDB", "none", None)?;
        let db_dir = dir.path().join(db_uuid.to_string());
        assert!(db_dir.exists());

        instance.rename_database(SUPER_USER_ID, "TEMPDB", "KEPTDB")?;
        assert!(instance.find_database_by_name("TEMPDB").is_err());
        instance.drop_database(SUPER_USER_ID, "KEPTDB")?;
        assert!(!db_dir.exists());
        assert!(matches!(
            instance.drop_database(SUPER_USER_ID, "SYS"),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn half_bootstrapped_directory_refuses_to_load() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let (opts, _) = options(dir.path());
        {
            let _instance = Instance::open_or_create(
                opts.clone(),
                Arc::new(CipherRegistry::with_builtin_ciphers()),
            )?;
        }
        // Unknown metadata version.
        fs::write(dir.path().join(INSTANCE_METADATA_FILE), 99u32.to_le_bytes())?;
        assert!(matches!(
            Instance::open_or_create(
                opts.clone(),
                Arc::new(CipherRegistry::with_builtin_ciphers())
            ),
            Err(Error::Corrupt(_))
        ));
        Ok(())
    }
}
