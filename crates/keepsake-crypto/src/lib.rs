//! Encryption side of keepsake: the gpg-backed `EncryptionProvider` and the
//! key provisioning protocol that makes sure every recipient is on the keyring
//! before any bundle is encrypted.

pub mod gpg;
pub mod provisioner;
