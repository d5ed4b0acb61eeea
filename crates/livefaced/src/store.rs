use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

use liveface_core::matcher::FaceProfile;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("descriptor encryption failed")]
    EncryptionFailed,
    #[error("descriptor decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid descriptor blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid descriptor dimension: {got} (expected {expected})")]
    InvalidDescriptorDim { expected: usize, got: usize },
    #[error("invalid descriptor value (NaN/Inf)")]
    InvalidDescriptorValue,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed known-faces registry with AES-256-GCM encrypted descriptors.
///
/// One row per username; registering an existing username replaces its
/// descriptor. A per-installation 32-byte key is generated at first use and
/// stored next to the database as `.key` (mode 0600).
#[derive(Clone)]
pub struct FaceStore {
    conn: Connection,
    enc_key: [u8; 32],
    dim: usize,
}

impl FaceStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path, dim: usize) -> Result<Self, StoreError> {
        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): fixed all-zeros key
            [0u8; 32]
        } else {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(StoreError::KeyIo)?;
            }
            let key_path = db_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS faces (
                     id TEXT PRIMARY KEY,
                     username TEXT NOT NULL UNIQUE,
                     descriptor BLOB NOT NULL,
                     created_at TEXT NOT NULL,
                     updated_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key, dim })
    }

    /// Insert or replace the descriptor for `username`. Returns the row id.
    pub async fn upsert(&self, username: &str, descriptor: &[f32]) -> Result<String, StoreError> {
        let blob = self.encrypt_descriptor(descriptor)?;
        let new_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let username = username.to_string();

        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO faces (id, username, descriptor, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(username) DO UPDATE SET
                         descriptor = excluded.descriptor,
                         updated_at = excluded.updated_at",
                    rusqlite::params![new_id, username, blob, now],
                )?;
                let id: String = conn.query_row(
                    "SELECT id FROM faces WHERE username = ?1",
                    [&username],
                    |row| row.get(0),
                )?;
                Ok(id)
            })
            .await?;

        Ok(id)
    }

    /// Every enrolled profile, oldest registration first.
    pub async fn all(&self) -> Result<Vec<FaceProfile>, StoreError> {
        // Fetch raw rows from SQLite; decrypt outside the blocking closure
        let rows: Vec<(String, Vec<u8>)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT username, descriptor FROM faces ORDER BY created_at, username",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        rows.into_iter()
            .map(|(username, blob)| {
                Ok(FaceProfile {
                    username,
                    descriptor: self.decrypt_descriptor(&blob)?,
                })
            })
            .collect()
    }

    pub async fn count_all(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Reject descriptors of the wrong dimension or with NaN/Inf values.
    pub fn validate(&self, values: &[f32]) -> Result<(), StoreError> {
        if values.len() != self.dim {
            return Err(StoreError::InvalidDescriptorDim {
                expected: self.dim,
                got: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(StoreError::InvalidDescriptorValue);
        }
        Ok(())
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_descriptor(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        self.validate(values)?;
        let plaintext = descriptor_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.enc_key));
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_descriptor(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.enc_key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        let values = bytes_to_descriptor(&plaintext)?;
        self.validate(&values)?;
        Ok(values)
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            ))
        })?;
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        return Ok(key);
    }

    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);

    use std::io::Write;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut f = options.open(key_path).map_err(StoreError::KeyIo)?;
    f.write_all(&key).map_err(StoreError::KeyIo)?;

    tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
    Ok(key)
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn descriptor_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_descriptor(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 128;

    fn descriptor(offset: f32) -> Vec<f32> {
        (0..DIM).map(|i| offset + i as f32 / DIM as f32).collect()
    }

    async fn memory_store() -> FaceStore {
        FaceStore::open(Path::new(":memory:"), DIM).await.unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let store = memory_store().await;
        let values = descriptor(0.0);

        let id = store.upsert("alice", &values).await.unwrap();
        assert!(!id.is_empty());

        let faces = store.all().await.unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].username, "alice");
        for (orig, rec) in values.iter().zip(&faces[0].descriptor) {
            assert_eq!(orig.to_bits(), rec.to_bits());
        }
    }

    #[tokio::test]
    async fn test_reregistering_replaces_descriptor() {
        let store = memory_store().await;
        let first = store.upsert("alice", &descriptor(0.0)).await.unwrap();
        store.upsert("bob", &descriptor(2.0)).await.unwrap();
        let second = store.upsert("alice", &descriptor(1.0)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.count_all().await.unwrap(), 2);

        let faces = store.all().await.unwrap();
        let alice = faces.iter().find(|f| f.username == "alice").unwrap();
        assert_eq!(alice.descriptor, descriptor(1.0));
    }

    #[tokio::test]
    async fn test_rejects_wrong_dimension_and_nan() {
        let store = memory_store().await;
        let err = store.upsert("alice", &[0.5; 64]).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidDescriptorDim {
                expected: 128,
                got: 64
            }
        ));

        let mut values = descriptor(0.0);
        values[42] = f32::NAN;
        let err = store.upsert("alice", &values).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidDescriptorValue));
        assert_eq!(store.count_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blob_is_not_plaintext() {
        let store = memory_store().await;
        let values = descriptor(0.0);
        let blob = store.encrypt_descriptor(&values).unwrap();
        assert_eq!(blob.len(), NONCE_LEN + DIM * 4 + 16);
        assert_ne!(&blob[NONCE_LEN..NONCE_LEN + DIM * 4], descriptor_to_bytes(&values).as_slice());
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let conn = Connection::open(Path::new(":memory:")).await.unwrap();
        let store1 = FaceStore {
            conn: conn.clone(),
            enc_key: [1u8; 32],
            dim: DIM,
        };
        let store2 = FaceStore {
            conn,
            enc_key: [2u8; 32],
            dim: DIM,
        };

        let blob = store1.encrypt_descriptor(&descriptor(0.0)).unwrap();
        assert!(matches!(
            store2.decrypt_descriptor(&blob),
            Err(StoreError::DecryptionFailed)
        ));
        assert!(matches!(
            store1.decrypt_descriptor(&blob[..8]),
            Err(StoreError::InvalidBlob(8))
        ));
    }

    #[test]
    fn test_byte_fidelity() {
        let values = vec![
            0.0,
            -0.0,
            1.0,
            -1.0,
            f32::MIN_POSITIVE,
            f32::EPSILON,
            std::f32::consts::PI,
        ];
        let recovered = bytes_to_descriptor(&descriptor_to_bytes(&values)).unwrap();
        for (orig, rec) in values.iter().zip(&recovered) {
            assert_eq!(orig.to_bits(), rec.to_bits());
        }
        assert!(matches!(bytes_to_descriptor(&[0u8; 7]), Err(StoreError::InvalidBlob(7))));
    }

    #[tokio::test]
    async fn test_key_file_persists() {
        let dir = std::env::temp_dir().join(format!("livefaced-test-{}", uuid::Uuid::new_v4()));
        let db_path = dir.join("faces.db");

        let store = FaceStore::open(&db_path, DIM).await.unwrap();
        store.upsert("alice", &descriptor(0.0)).await.unwrap();
        drop(store);

        let key = std::fs::read(dir.join(".key")).unwrap();
        assert_eq!(key.len(), 32);

        let reopened = FaceStore::open(&db_path, DIM).await.unwrap();
        let faces = reopened.all().await.unwrap();
        assert_eq!(faces[0].descriptor, descriptor(0.0));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
