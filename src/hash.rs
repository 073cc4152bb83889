use md5::Md5;
use sha2::{Digest, Sha256};

/// Hex SHA-256 of a string. Used for the per-record `unique_key`.
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hex MD5 of a string. Only used to anonymize remote image filenames,
/// never for anything security-relevant.
pub fn md5_hex(data: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn md5_known_vector() {
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn unique_key_is_deterministic() {
        let a = sha256_hex("CAM01777_1700000002");
        let b = sha256_hex("CAM01777_1700000002");
        assert_eq!(a, b);
        assert_ne!(a, sha256_hex("CAM02777_1700000002"));
    }
}
