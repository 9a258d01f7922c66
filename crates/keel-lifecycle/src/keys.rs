//! SSH keypair management for layers.
//!
//! Layers reach their nodes over SSH. When the owner does not bring a
//! keypair, a 2048-bit RSA one is generated here.

use rand::rngs::OsRng;
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::{LineEnding, PrivateKey, PublicKey};
use tracing::info;

use keel_state::SshKeypair;

use crate::error::{LifecycleError, LifecycleResult};

const RSA_BITS: usize = 2048;

/// Generate a fresh RSA keypair in OpenSSH encoding.
pub fn generate_ssh_keypair(comment: &str) -> LifecycleResult<SshKeypair> {
    let rsa = RsaKeypair::random(&mut OsRng, RSA_BITS).map_err(key_err)?;
    let private = PrivateKey::new(KeypairData::Rsa(rsa), comment).map_err(key_err)?;

    let private_key = private.to_openssh(LineEnding::LF).map_err(key_err)?;
    let public_key = private.public_key().to_openssh().map_err(key_err)?;

    info!(comment, bits = RSA_BITS, "generated layer ssh keypair");

    Ok(SshKeypair {
        private_key: private_key.as_str().to_owned(),
        public_key,
    })
}

/// Validate an owner-supplied keypair.
///
/// Both halves must parse, and the public half must belong to the private one.
pub fn keypair_from_parts(private_key: &str, public_key: &str) -> LifecycleResult<SshKeypair> {
    let private = PrivateKey::from_openssh(private_key).map_err(key_err)?;
    let public = PublicKey::from_openssh(public_key.trim()).map_err(key_err)?;

    if private.public_key().key_data() != public.key_data() {
        return Err(LifecycleError::InvalidKey(
            "public key does not match private key".to_string(),
        ));
    }

    Ok(SshKeypair {
        private_key: private_key.to_string(),
        public_key: public_key.trim().to_string(),
    })
}

fn key_err(e: ssh_key::Error) -> LifecycleError {
    LifecycleError::InvalidKey(e.to_string())
}
