pub mod encrypted_file;

pub use encrypted_file::EncryptedFile;
