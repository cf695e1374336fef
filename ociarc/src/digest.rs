use oci_spec::image::{Digest, DigestAlgorithm};
use sha2::Sha256;

use crate::error::Error;

pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    use sha2::Digest;
    hex::encode(Sha256::digest(data))
}

pub fn digest_from_data(data: impl AsRef<[u8]>) -> Digest {
    use std::str::FromStr;
    // the encoded output of Sha256 always parses
    oci_spec::image::Sha256Digest::from_str(&sha256_hex(data))
        .unwrap()
        .into()
}

/// Recomputes `data`'s digest with `expected`'s algorithm and compares.
/// Only sha256 is handled; other algorithms are an error rather than a
/// silent pass.
pub fn verify_data(expected: &Digest, data: &[u8]) -> Result<(), Error> {
    match expected.algorithm() {
        DigestAlgorithm::Sha256 => {
            let actual = sha256_hex(data);
            if actual == expected.digest() {
                Ok(())
            } else {
                Err(Error::DigestMismatch {
                    expected: expected.to_string(),
                    actual: format!("sha256:{actual}"),
                })
            }
        }
        algo => Err(Error::InvalidDescriptor(format!(
            "digest algorithm {algo} not handled"
        ))),
    }
}

pub fn verify_sized_data(expected: &Digest, expected_size: u64, data: &[u8]) -> Result<(), Error> {
    if data.len() as u64 != expected_size {
        return Err(Error::SizeMismatch {
            expected: expected_size,
            actual: data.len() as u64,
        });
    }
    verify_data(expected, data)
}
