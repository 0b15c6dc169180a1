//! `strata` is the storage engine of a single-node SQL database.
//!
//! Each user table is persisted as a set of per-column append-only data
//! files, organised into fixed-size blocks tracked by a per-column block
//! registry. Rows are reconstructed through Master Column Records that pin,
//! per version, the exact address of each field across those per-column
//! files. Every persisted byte passes through a transparent block-encrypted
//! file substrate. A surrounding instance manages databases, users,
//! permissions, tokens and sessions, and executes typed requests on behalf
//! of authenticated users.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! use strata::crypto::CipherRegistry;
//! use strata::error::CResult;
//! use strata::instance::{Instance, InstanceOptions, SUPER_USER_ID};
//! use strata::request::DbeRequest;
//! use strata::handler::RequestHandler;
//! use strata::row::ColumnDataType;
//!
//! fn main() -> CResult<()> {
//!     let options = InstanceOptions {
//!         data_dir: PathBuf::from("/var/lib/strata/db1"),
//!         master_cipher_id: "aes128".to_string(),
//!         master_key: vec![0xef; 16],
//!         superuser_initial_access_key: "<hex ed25519 public key>".to_string(),
//!         data_area_size: strata::storage::DEFAULT_DATA_AREA_SIZE,
//!     };
//!     let instance = Arc::new(Instance::open_or_create(
//!         options,
//!         Arc::new(CipherRegistry::with_builtin_ciphers()),
//!     )?);
//!
//!     let handler = RequestHandler::new(instance, SUPER_USER_ID);
//!     let response = handler.execute(&DbeRequest::CreateDatabase {
//!         database: "APPDB".to_string(),
//!         cipher_id: None,
//!         description: None,
//!     });
//!     assert!(response.is_ok());
//!
//!     let response = handler.execute(&DbeRequest::CreateTable {
//!         database: Some("APPDB".to_string()),
//!         table: "EVENTS".to_string(),
//!         columns: vec![
//!             ("KIND".to_string(), ColumnDataType::Text),
//!             ("PAYLOAD".to_string(), ColumnDataType::Binary),
//!         ],
//!     });
//!     assert!(response.is_ok());
//!     Ok(())
//! }
//! ```

pub mod crypto;
pub mod encoding;
pub mod error;
pub mod handler;
pub mod instance;
pub mod io;
pub mod mvcc;
pub mod request;
pub mod row;
pub mod storage;
pub mod util;
