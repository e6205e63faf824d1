//! Platform collaborators: hash-chained audit log and versioned credential store.

pub mod audit;
pub mod credentials;

pub use audit::{AuditEntry, AuditKind, AuditLog, AuditQuery, AuditRecord, AuditSink, ChainVerification};
pub use credentials::{CredentialSecrets, CredentialStore, MemoryCredentialStore, StoredCredential};
