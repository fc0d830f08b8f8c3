use argon2::{Algorithm, Argon2, Params, Version};

use crate::error::{ImgxError, Result};

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;

const VERIFY_CONTEXT: &[u8] = b"imgx password verification v1";

/// Argon2id cost parameters, stored in the container header so a reader
/// re-derives the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: Params::DEFAULT_M_COST,
            t_cost: Params::DEFAULT_T_COST,
            p_cost: Params::DEFAULT_P_COST,
        }
    }
}

/// Symmetric key derived once per opened container.
#[derive(Clone)]
pub struct ContainerKey(pub(crate) [u8; KEY_LEN]);

impl std::fmt::Debug for ContainerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContainerKey(..)")
    }
}

pub fn derive_key(password: &str, salt: &[u8; SALT_LEN], params: KdfParams) -> Result<ContainerKey> {
    let p = Params::new(params.m_cost, params.t_cost, params.p_cost, Some(KEY_LEN))
        .map_err(|e| ImgxError::format(format!("invalid KDF parameters: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, p);
    let mut out = [0u8; KEY_LEN];
    argon
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .map_err(|e| ImgxError::format(format!("key derivation failed: {e}")))?;
    Ok(ContainerKey(out))
}

/// Tag stored in the header; lets a reader reject a wrong password before
/// decrypting anything.
pub fn verification_tag(key: &ContainerKey) -> [u8; 32] {
    *blake3::keyed_hash(&key.0, VERIFY_CONTEXT).as_bytes()
}

pub fn check_password(key: &ContainerKey, stored_tag: &[u8; 32]) -> Result<()> {
    // blake3::Hash compares in constant time
    if blake3::keyed_hash(&key.0, VERIFY_CONTEXT) != blake3::Hash::from(*stored_tag) {
        return Err(ImgxError::Authentication);
    }
    Ok(())
}

pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut out = [0u8; N];
    getrandom::getrandom(&mut out)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("getrandom: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: KdfParams = KdfParams {
        m_cost: 8,
        t_cost: 1,
        p_cost: 1,
    };

    #[test]
    fn derivation_is_deterministic() {
        let salt = [7u8; SALT_LEN];
        let a = derive_key("hunter2", &salt, FAST).unwrap();
        let b = derive_key("hunter2", &salt, FAST).unwrap();
        assert_eq!(a.0, b.0);
        let c = derive_key("hunter3", &salt, FAST).unwrap();
        assert_ne!(a.0, c.0);
    }

    #[test]
    fn wrong_password_fails_tag_check() {
        let salt = [1u8; SALT_LEN];
        let key = derive_key("right", &salt, FAST).unwrap();
        let tag = verification_tag(&key);
        check_password(&key, &tag).unwrap();

        let wrong = derive_key("wrong", &salt, FAST).unwrap();
        assert!(matches!(
            check_password(&wrong, &tag),
            Err(ImgxError::Authentication)
        ));
    }

    #[test]
    fn bad_params_are_format_errors() {
        let bad = KdfParams {
            m_cost: 0,
            t_cost: 0,
            p_cost: 0,
        };
        assert!(matches!(
            derive_key("x", &[0u8; SALT_LEN], bad),
            Err(ImgxError::Format(_))
        ));
    }

    #[test]
    fn key_debug_is_redacted() {
        let key = ContainerKey([0xAA; KEY_LEN]);
        assert_eq!(format!("{key:?}"), "ContainerKey(..)");
    }
}
