//! Master key loading.
//!
//! The master key is 32 bytes, base64 encoded, and comes either from a key
//! file or from a [`SecretService`](super::SecretService). Key and token files
//! must not be accessible to group or other users.

use super::registry::{KeyStoreContext, KeyStoreRole};
use crate::error::{CoreError, CoreResult};
use base64::{engine::general_purpose, Engine as _};
use std::fs;
use std::path::Path;
use stratum_storage::{EncryptionKey, KEY_SIZE};
use tracing::info;
use zeroize::Zeroizing;

/// Permission bits a key file must not carry.
pub const PROHIBITED_MODE: u32 = 0o077;

/// Prohibited bits for root-owned files under relaxed checks: group read is
/// allowed.
pub const RELAXED_ROOT_PROHIBITED_MODE: u32 = 0o037;

/// Fails unless `path` exists and is private to its owner.
#[cfg(unix)]
pub fn check_permissions(path: &Path, relaxed: bool) -> CoreResult<()> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let metadata = fs::metadata(path).map_err(|e| {
        CoreError::key_file(path, format!("cannot read stats of the file: {e}"))
    })?;
    let prohibited = if relaxed && metadata.uid() == 0 {
        RELAXED_ROOT_PROHIBITED_MODE
    } else {
        PROHIBITED_MODE
    };
    if metadata.permissions().mode() & prohibited != 0 {
        return Err(CoreError::KeyFilePermissions {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Fails unless `path` exists.
#[cfg(not(unix))]
pub fn check_permissions(path: &Path, _relaxed: bool) -> CoreResult<()> {
    fs::metadata(path).map_err(|e| {
        CoreError::key_file(path, format!("cannot read stats of the file: {e}"))
    })?;
    Ok(())
}

/// Reads the first whitespace-delimited token of a permission-checked file.
pub fn read_first_token(path: &Path, relaxed: bool) -> CoreResult<Zeroizing<String>> {
    check_permissions(path, relaxed)?;
    let contents = Zeroizing::new(
        fs::read_to_string(path)
            .map_err(|e| CoreError::key_file(path, format!("cannot open the file: {e}")))?,
    );
    match contents.split_whitespace().next() {
        Some(token) => Ok(Zeroizing::new(token.to_string())),
        None => Err(CoreError::key_file(path, "the file is empty")),
    }
}

/// Decodes a base64 master key.
pub fn decode_master_key(encoded: &str) -> CoreResult<EncryptionKey> {
    let bytes = Zeroizing::new(
        general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| CoreError::invalid_master_key(e.to_string()))?,
    );
    if bytes.len() != KEY_SIZE {
        return Err(CoreError::invalid_master_key(format!(
            "encryption key length should be {KEY_SIZE} bytes"
        )));
    }
    EncryptionKey::from_bytes(&bytes).map_err(CoreError::from)
}

/// Encodes a master key as base64.
#[must_use]
pub fn encode_master_key(key: &EncryptionKey) -> Zeroizing<String> {
    Zeroizing::new(general_purpose::STANDARD.encode(key.as_bytes()))
}

/// Secret service token from the configuration or its token file.
pub(crate) fn secret_token(ctx: &KeyStoreContext) -> CoreResult<Zeroizing<String>> {
    let config = &ctx.encryption;
    if let Some(token) = &config.secret_token {
        return Ok(Zeroizing::new(token.clone()));
    }
    match &config.secret_token_file {
        Some(path) => read_first_token(path, config.relaxed_permission_checks),
        None => Ok(Zeroizing::new(String::new())),
    }
}

/// Loads the master key for a store opening in `role`.
///
/// A rotation store always gets a fresh key; it is written to the secret
/// service later by `store_master_key`. A main store whose secret is absent
/// generates and writes one only when its directory was just created.
pub(crate) fn load_master_key(
    ctx: &KeyStoreContext,
    role: KeyStoreRole,
    just_created: bool,
) -> CoreResult<EncryptionKey> {
    let config = &ctx.encryption;

    if let Some(name) = &config.secret_name {
        let service = ctx.secrets.as_ref().ok_or_else(|| {
            CoreError::invalid_operation("a secret name is configured but no secret service")
        })?;
        let token = secret_token(ctx)?;

        if role == KeyStoreRole::Rotation {
            return Ok(EncryptionKey::generate());
        }
        return match service.read_key(name, &token)? {
            Some(encoded) => decode_master_key(&Zeroizing::new(encoded)),
            None if just_created => {
                info!(secret = %name, "master key is absent in the secret service, generating one");
                let key = EncryptionKey::generate();
                service.write_key(name, &token, &encode_master_key(&key))?;
                Ok(key)
            }
            None => Err(CoreError::MasterKeyAbsent {
                secret: name.clone(),
            }),
        };
    }

    if let Some(path) = &config.key_file {
        if role == KeyStoreRole::Rotation {
            return Err(CoreError::invalid_operation(
                "master key rotation requires a secret service",
            ));
        }
        let encoded = read_first_token(path, config.relaxed_permission_checks)?;
        return decode_master_key(&encoded);
    }

    Err(CoreError::invalid_argument(
        "encryption requires a key file or a secret name",
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::EncryptionConfig;
    use crate::keystore::secret::{MemorySecretService, SecretService};
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Writes a fresh owner-only key file and returns its key.
    pub(crate) fn write_key_file(path: &Path) -> EncryptionKey {
        let key = EncryptionKey::generate();
        fs::write(path, format!("{}\n", encode_master_key(&key).as_str())).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).unwrap();
        }
        key
    }

    #[test]
    fn reads_key_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.key");
        let key = write_key_file(&path);
        let ctx = KeyStoreContext::new(EncryptionConfig::with_key_file(&path));
        assert_eq!(load_master_key(&ctx, KeyStoreRole::Main, false).unwrap(), key);
    }

    #[cfg(unix)]
    #[test]
    fn open_key_file_is_rejected() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.key");
        write_key_file(&path);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();

        let ctx = KeyStoreContext::new(EncryptionConfig::with_key_file(&path));
        assert!(matches!(
            load_master_key(&ctx, KeyStoreRole::Main, false),
            Err(CoreError::KeyFilePermissions { .. })
        ));
    }

    #[test]
    fn missing_key_file_names_the_file() {
        let ctx = KeyStoreContext::new(EncryptionConfig::with_key_file("/nonexistent/master.key"));
        match load_master_key(&ctx, KeyStoreRole::Main, false) {
            Err(CoreError::KeyFile { path, .. }) => {
                assert_eq!(path, Path::new("/nonexistent/master.key"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn short_key_is_rejected() {
        let encoded = general_purpose::STANDARD.encode([1u8; 16]);
        assert!(matches!(
            decode_master_key(&encoded),
            Err(CoreError::InvalidMasterKey { .. })
        ));
        assert!(decode_master_key("not base64!").is_err());
    }

    #[test]
    fn absent_secret_is_generated_only_for_new_stores() {
        let service = Arc::new(MemorySecretService::new());
        let ctx = KeyStoreContext::new(EncryptionConfig::with_secret("master"))
            .secret_service(Arc::clone(&service) as Arc<dyn SecretService>);

        assert!(matches!(
            load_master_key(&ctx, KeyStoreRole::Main, false),
            Err(CoreError::MasterKeyAbsent { .. })
        ));
        let key = load_master_key(&ctx, KeyStoreRole::Main, true).unwrap();
        assert_eq!(service.len(), 1);
        assert_eq!(load_master_key(&ctx, KeyStoreRole::Main, false).unwrap(), key);
    }

    #[test]
    fn rotation_role_generates_without_writing() {
        let service = Arc::new(MemorySecretService::new());
        let ctx = KeyStoreContext::new(EncryptionConfig::with_secret("master"))
            .secret_service(Arc::clone(&service) as Arc<dyn SecretService>);
        load_master_key(&ctx, KeyStoreRole::Rotation, false).unwrap();
        assert!(service.is_empty());
    }

    #[test]
    fn token_is_read_from_token_file() {
        let dir = tempdir().unwrap();
        let token_file = dir.path().join("token");
        fs::write(&token_file, "s3cret extra\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&token_file, fs::Permissions::from_mode(0o400)).unwrap();
        }
        let service = Arc::new(MemorySecretService::with_token("s3cret"));
        let ctx = KeyStoreContext::new(
            EncryptionConfig::with_secret("master").secret_token_file(&token_file),
        )
        .secret_service(service);
        assert_eq!(secret_token(&ctx).unwrap().as_str(), "s3cret");
        load_master_key(&ctx, KeyStoreRole::Main, true).unwrap();
    }
}
